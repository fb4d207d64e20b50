//! Pool configuration.
//!
//! [`PoolOptions`] is the operator-facing TOML model; every field is optional
//! and falls back to the runtime defaults in [`SessionPoolConfig`],
//! [`ClientPoolConfig`] and [`CallSettings`].
//!
//! ```toml
//! [session_pool]
//! max_active_sessions = 400
//! wait_on_resources_exhausted = false
//! eviction_delay_secs = 900
//!
//! [client_pool]
//! channel_count = 4
//!
//! [calls]
//! timeout_ms = 600000
//! max_attempts = 3
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default number of client handles per (credential, endpoint).
pub const DEFAULT_CHANNEL_COUNT: usize = 4;

/// Default bound on the option-matching scan of an MRU stack.
pub const DEFAULT_MAX_LINEAR_SEARCH_DEPTH: usize = 50;

/// Default delay before an idle session is evicted.
pub const DEFAULT_EVICTION_DELAY: Duration = Duration::from_secs(15 * 60);

/// Default per-call timeout.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolOptions {
    pub session_pool: Option<SessionPoolOptions>,
    pub client_pool: Option<ClientPoolOptions>,
    pub calls: Option<CallOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionPoolOptions {
    pub max_active_sessions: Option<usize>,
    pub max_pooled_sessions: Option<usize>,
    pub wait_on_resources_exhausted: Option<bool>,
    pub eviction_delay_secs: Option<u64>,
    pub transaction_warming: Option<bool>,
    pub max_linear_search_depth: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientPoolOptions {
    pub channel_count: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CallOptions {
    pub timeout_ms: Option<u64>,
    pub max_attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
}

impl PoolOptions {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let options: PoolOptions = toml::from_str(content)?;
        Ok(options)
    }
}

/// What `create_session` does when the active-session limit is reached.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ExhaustedBehavior {
    /// Fail immediately with `ResourceExhausted`.
    Fail,
    /// Queue FIFO until a release frees capacity.
    #[default]
    Block,
}

/// Runtime configuration for the session pool.
#[derive(Clone, Debug, PartialEq)]
pub struct SessionPoolConfig {
    /// Upper bound on checked-out plus in-creation sessions (default: unbounded).
    pub max_active_sessions: usize,
    /// Upper bound on idle sessions across all keys (default: unbounded).
    pub max_pooled_sessions: usize,
    pub exhausted_behavior: ExhaustedBehavior,
    /// Idle time after which a pooled session is deleted (default: 15 min).
    pub eviction_delay: Duration,
    /// Pre-warm read-write transactions on release (default: true).
    pub transaction_warming: bool,
    /// How deep to scan an MRU stack for matching options (default: 50).
    pub max_linear_search_depth: usize,
}

impl Default for SessionPoolConfig {
    fn default() -> Self {
        Self {
            max_active_sessions: usize::MAX,
            max_pooled_sessions: usize::MAX,
            exhausted_behavior: ExhaustedBehavior::Block,
            eviction_delay: DEFAULT_EVICTION_DELAY,
            transaction_warming: true,
            max_linear_search_depth: DEFAULT_MAX_LINEAR_SEARCH_DEPTH,
        }
    }
}

impl SessionPoolConfig {
    pub fn from_options(options: &SessionPoolOptions) -> Self {
        let defaults = Self::default();
        let exhausted_behavior = match options.wait_on_resources_exhausted {
            Some(false) => ExhaustedBehavior::Fail,
            Some(true) => ExhaustedBehavior::Block,
            None => defaults.exhausted_behavior,
        };
        Self {
            max_active_sessions: options
                .max_active_sessions
                .unwrap_or(defaults.max_active_sessions),
            max_pooled_sessions: options
                .max_pooled_sessions
                .unwrap_or(defaults.max_pooled_sessions),
            exhausted_behavior,
            eviction_delay: options
                .eviction_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.eviction_delay),
            transaction_warming: options
                .transaction_warming
                .unwrap_or(defaults.transaction_warming),
            max_linear_search_depth: options
                .max_linear_search_depth
                .unwrap_or(defaults.max_linear_search_depth),
        }
    }

    pub fn with_max_active_sessions(mut self, max: usize) -> Self {
        self.max_active_sessions = max;
        self
    }

    pub fn with_max_pooled_sessions(mut self, max: usize) -> Self {
        self.max_pooled_sessions = max;
        self
    }

    pub fn with_exhausted_behavior(mut self, behavior: ExhaustedBehavior) -> Self {
        self.exhausted_behavior = behavior;
        self
    }

    pub fn with_eviction_delay(mut self, delay: Duration) -> Self {
        self.eviction_delay = delay;
        self
    }

    pub fn with_transaction_warming(mut self, enabled: bool) -> Self {
        self.transaction_warming = enabled;
        self
    }
}

/// Runtime configuration for the client handle pool.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientPoolConfig {
    /// Handles per (credential, endpoint) key (default: 4, minimum 1).
    pub channel_count: usize,
}

impl Default for ClientPoolConfig {
    fn default() -> Self {
        Self {
            channel_count: DEFAULT_CHANNEL_COUNT,
        }
    }
}

impl ClientPoolConfig {
    pub fn from_options(options: &ClientPoolOptions) -> Self {
        Self {
            channel_count: options.channel_count.unwrap_or(DEFAULT_CHANNEL_COUNT).max(1),
        }
    }

    pub fn with_channel_count(mut self, count: usize) -> Self {
        self.channel_count = count.max(1);
        self
    }
}

/// Exponential backoff applied to idempotent stub calls.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first (default: 3).
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(250),
            max_backoff: Duration::from_secs(32),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Backoff to use after `current`, capped at `max_backoff`.
    pub fn next_backoff(&self, current: Duration) -> Duration {
        current.mul_f64(self.multiplier).min(self.max_backoff)
    }
}

/// Per-call timeout and retry settings.
#[derive(Clone, Debug, PartialEq)]
pub struct CallSettings {
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CALL_TIMEOUT,
            retry: RetryPolicy::default(),
        }
    }
}

impl CallSettings {
    pub fn from_options(options: &CallOptions) -> Self {
        let defaults = RetryPolicy::default();
        Self {
            timeout: options
                .timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CALL_TIMEOUT),
            retry: RetryPolicy {
                max_attempts: options.max_attempts.unwrap_or(defaults.max_attempts).max(1),
                initial_backoff: options
                    .initial_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.initial_backoff),
                max_backoff: options
                    .max_backoff_ms
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.max_backoff),
                multiplier: options.backoff_multiplier.unwrap_or(defaults.multiplier),
            },
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Everything needed to build a full set of pools.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PoolsConfig {
    pub session_pool: SessionPoolConfig,
    pub client_pool: ClientPoolConfig,
    pub calls: CallSettings,
}

impl PoolsConfig {
    pub fn from_options(options: &PoolOptions) -> Self {
        Self {
            session_pool: options
                .session_pool
                .as_ref()
                .map(SessionPoolConfig::from_options)
                .unwrap_or_default(),
            client_pool: options
                .client_pool
                .as_ref()
                .map(ClientPoolConfig::from_options)
                .unwrap_or_default(),
            calls: options
                .calls
                .as_ref()
                .map(CallSettings::from_options)
                .unwrap_or_default(),
        }
    }
}
