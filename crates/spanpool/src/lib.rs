//! spanpool: resource management for a session-oriented SQL database client.
//!
//! - **client_pool**: keyed pool of client handles, fanned out round robin
//! - **session_pool**: admission control, MRU session stacks, timed eviction
//! - **transaction_pool**: per-session transaction cache and pre-warming
//! - **stream_reader**: resumable streaming reads with chunk merging
//! - **lease**: one connection's shared implicit session and dedicated
//!   transactional sessions
//! - **registry**: `SpannerPools`, the injectable registry that wires it together

pub mod client_pool;
pub mod lease;
pub mod registry;
pub mod session_pool;
pub mod stream_reader;
pub mod transaction_pool;

pub use client_pool::{ClientHandle, ClientPool, ClientPoolKey, ClientPoolStats};
pub use lease::{ConnectionSessionLease, LeasedSession};
pub use registry::SpannerPools;
pub use session_pool::{ExpiredSessions, SessionPool, SessionPoolKey, SessionPoolStats};
pub use stream_reader::{ResumableStreamReader, StreamState};
pub use transaction_pool::TransactionPool;

pub use spanpool_core::{Error, ErrorCode, Result};
