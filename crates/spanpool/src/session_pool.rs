//! Session pool.
//!
//! Sessions are pooled per `(client handle, database)` key in an MRU stack.
//! A global active-or-creating count is bounded by admission control, and
//! the idle count across all keys is bounded by evicting from the least
//! valuable pool.
//!
//! ```text
//! create_session(client, db, options)
//!   → admission: active < max ─────────────→ admitted
//!                at max, Fail ─────────────→ ResourceExhausted
//!                at max, Block ────────────→ FIFO semaphore wait → admitted | Cancelled
//!   → scan MRU stack (≤ max_linear_search_depth) for matching options
//!   → else pop MRU front
//!   → else create on the client handle
//!
//! release(client, session)
//!   → expired / closed ───→ delete
//!   → pre-warm, push MRU front, arm eviction timer
//!   → idle > max_pooled ──→ evict LRU entry of the pool with the fewest idle
//!   → return the capacity permit
//! ```
//!
//! Capacity is a [`Semaphore`] sized to `max_active_sessions`. A permit is
//! forgotten when a session is checked out and added back when it is
//! released or deleted. Pool state lives behind one short critical section
//! that never spans an await. Timers and deletes run on a [`TaskTracker`]
//! joined by [`SessionPool::close_all`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use spanpool_core::{
    CallSettings, DatabaseName, Error, ErrorCode, ExhaustedBehavior, Result, Session,
    SessionPoolConfig, SpannerRpc, TransactionOptions, call_with_retry,
};

use crate::client_pool::ClientHandle;
use crate::transaction_pool::TransactionPool;

/// Sessions the server has reported dead. Shared between the pools and
/// stream readers; a listed session is deleted instead of pooled.
#[derive(Clone, Default)]
pub struct ExpiredSessions {
    inner: Arc<Mutex<HashSet<Session>>>,
}

impl ExpiredSessions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `session` expired. Idempotent.
    pub fn insert(&self, session: &Session) {
        if self.inner.lock().insert(session.clone()) {
            debug!(session = %session, "session marked expired");
        }
    }

    /// Whether `session` has been reported dead and not yet deleted.
    pub fn contains(&self, session: &Session) -> bool {
        self.inner.lock().contains(session)
    }

    /// Forget `session` once its delete has completed.
    pub fn remove(&self, session: &Session) {
        self.inner.lock().remove(session);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl fmt::Debug for ExpiredSessions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpiredSessions")
            .field("len", &self.len())
            .finish()
    }
}

/// Partitions pooled sessions; sessions of different keys never mix.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SessionPoolKey {
    pub client: u64,
    pub database: DatabaseName,
}

impl SessionPoolKey {
    pub fn new(client: &ClientHandle, database: &DatabaseName) -> Self {
        Self {
            client: client.id(),
            database: database.clone(),
        }
    }
}

/// An idle session plus the handle that cancels its eviction timer.
struct PoolEntry {
    id: u64,
    session: Session,
    options: Option<TransactionOptions>,
    evict: CancellationToken,
}

struct KeyedPool {
    client: ClientHandle,
    /// MRU at the front.
    entries: VecDeque<PoolEntry>,
    last_access: u64,
}

type Doomed = Vec<(Arc<dyn SpannerRpc>, Session)>;

#[derive(Default)]
struct PoolState {
    pools: HashMap<SessionPoolKey, KeyedPool>,
    checked_out: HashMap<Session, SessionPoolKey>,
    /// Permits held by callers between admission and checkout.
    admitted: usize,
    idle: usize,
    waiting: usize,
    next_id: u64,
    tick: u64,
    closed: bool,
    created: u64,
    reused: u64,
    evicted: u64,
}

impl PoolState {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    /// Take an idle session for `key`: the first entry within `depth` whose
    /// last-used options match, else the MRU entry. Expired entries met on
    /// the way are moved to `doomed`.
    fn pop_idle(
        &mut self,
        key: &SessionPoolKey,
        options: Option<&TransactionOptions>,
        depth: usize,
        expired: &ExpiredSessions,
        doomed: &mut Doomed,
    ) -> Option<Session> {
        let tick = self.next_tick();
        let pool = self.pools.get_mut(key)?;

        let mut found = None;
        let mut index = 0;
        let mut limit = depth;
        while index < limit && index < pool.entries.len() {
            if expired.contains(&pool.entries[index].session) {
                if let Some(entry) = pool.entries.remove(index) {
                    entry.evict.cancel();
                    doomed.push((Arc::clone(pool.client.rpc()), entry.session));
                    self.idle -= 1;
                }
                limit -= 1;
                continue;
            }
            if pool.entries[index].options.as_ref() == options {
                found = Some(index);
                break;
            }
            index += 1;
        }

        let entry = match found {
            Some(index) => pool.entries.remove(index)?,
            None => loop {
                let entry = pool.entries.pop_front()?;
                if !expired.contains(&entry.session) {
                    break entry;
                }
                entry.evict.cancel();
                doomed.push((Arc::clone(pool.client.rpc()), entry.session));
                self.idle -= 1;
            },
        };
        entry.evict.cancel();
        self.idle -= 1;
        pool.last_access = tick;
        Some(entry.session)
    }

    /// Remove the LRU entry of the pool with the fewest idle sessions,
    /// ties going to the pool accessed longest ago.
    fn evict_one(&mut self) -> Option<(Arc<dyn SpannerRpc>, Session)> {
        let (_, pool) = self
            .pools
            .iter_mut()
            .filter(|(_, pool)| !pool.entries.is_empty())
            .min_by_key(|(_, pool)| (pool.entries.len(), pool.last_access))?;
        let entry = pool.entries.pop_back()?;
        entry.evict.cancel();
        self.idle -= 1;
        self.evicted += 1;
        Some((Arc::clone(pool.client.rpc()), entry.session))
    }

    fn take_checked_out(&mut self, client: &ClientHandle, session: &Session) -> Result<SessionPoolKey> {
        match self.checked_out.remove(session) {
            Some(key) if key.client == client.id() => Ok(key),
            Some(key) => {
                self.checked_out.insert(session.clone(), key);
                Err(Error::new(
                    ErrorCode::InvalidArgument,
                    format!("session {session} belongs to a different client handle"),
                ))
            }
            None => Err(Error::new(
                ErrorCode::InvalidArgument,
                format!("session {session} is not checked out of this pool"),
            )),
        }
    }
}

/// Snapshot of pool-wide counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SessionPoolStats {
    /// Sessions checked out by callers.
    pub active: usize,
    /// Admitted callers still creating or popping a session.
    pub creating: usize,
    /// Idle sessions across all keys.
    pub pooled: usize,
    /// Callers queued for capacity.
    pub waiting: usize,
    pub keys: usize,
    pub created: u64,
    pub reused: u64,
    pub evicted: u64,
}

struct Inner {
    config: SessionPoolConfig,
    calls: CallSettings,
    transactions: TransactionPool,
    expired: ExpiredSessions,
    state: Mutex<PoolState>,
    /// One permit per session that may be active or being created.
    admission: Arc<Semaphore>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// Process-wide session pool.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<Inner>,
}

/// Capacity reserved for one caller. The permit goes back to the semaphore
/// on drop unless the caller checked a session out with it.
struct AdmissionPermit {
    inner: Arc<Inner>,
    permit: Option<OwnedSemaphorePermit>,
}

impl AdmissionPermit {
    fn check_out(&mut self, state: &mut PoolState, session: Session, key: SessionPoolKey) {
        state.admitted -= 1;
        state.checked_out.insert(session, key);
        // Stays acquired while the session is checked out.
        if let Some(permit) = self.permit.take() {
            permit.forget();
        }
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        if self.permit.is_some() {
            self.inner.state.lock().admitted -= 1;
        }
    }
}

/// Counts a caller queued on the semaphore.
struct WaitGuard<'a> {
    inner: &'a Inner,
}

impl<'a> WaitGuard<'a> {
    fn enter(inner: &'a Inner) -> Self {
        inner.state.lock().waiting += 1;
        Self { inner }
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.inner.state.lock().waiting -= 1;
    }
}

fn closed_error() -> Error {
    Error::new(ErrorCode::FailedPrecondition, "session pool is closed")
}

impl SessionPool {
    /// Create an empty pool. At most `config.max_active_sessions` sessions
    /// are checked out or being created at once; idle sessions of released
    /// read-write work are pre-warmed through `transactions`.
    pub fn new(
        config: SessionPoolConfig,
        calls: CallSettings,
        transactions: TransactionPool,
        expired: ExpiredSessions,
    ) -> Self {
        let permits = config.max_active_sessions.min(Semaphore::MAX_PERMITS);
        Self {
            inner: Arc::new(Inner {
                config,
                calls,
                transactions,
                expired,
                state: Mutex::new(PoolState::default()),
                admission: Arc::new(Semaphore::new(permits)),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &SessionPoolConfig {
        &self.inner.config
    }

    /// Check out a session for `database` on `client`, preferring an idle
    /// one last used with `options`.
    pub async fn create_session(
        &self,
        client: &ClientHandle,
        database: &DatabaseName,
        options: Option<&TransactionOptions>,
        cancel: &CancellationToken,
    ) -> Result<Session> {
        let mut permit = self.admit(cancel).await?;
        let key = SessionPoolKey::new(client, database);

        let mut doomed = Vec::new();
        let reused = {
            let mut state = self.inner.state.lock();
            let popped = state.pop_idle(
                &key,
                options,
                self.inner.config.max_linear_search_depth,
                &self.inner.expired,
                &mut doomed,
            );
            if let Some(session) = &popped {
                permit.check_out(&mut state, session.clone(), key.clone());
                state.reused += 1;
            }
            popped
        };
        for (rpc, session) in doomed {
            self.spawn_delete(rpc, session);
        }
        if let Some(session) = reused {
            debug!(session = %session, database = %database, client = client.id(), "reused pooled session");
            return Ok(session);
        }

        let rpc = client.rpc();
        let session = call_with_retry(&self.inner.calls, cancel, "create_session", || {
            rpc.create_session(database)
        })
        .await?;

        let mut state = self.inner.state.lock();
        permit.check_out(&mut state, session.clone(), key);
        state.created += 1;
        debug!(session = %session, database = %database, client = client.id(), "created session");
        Ok(session)
    }

    async fn admit(&self, cancel: &CancellationToken) -> Result<AdmissionPermit> {
        let max_active = self.inner.config.max_active_sessions;
        let semaphore = Arc::clone(&self.inner.admission);
        let permit = match self.inner.config.exhausted_behavior {
            ExhaustedBehavior::Fail => match semaphore.try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::Closed) => return Err(closed_error()),
                Err(TryAcquireError::NoPermits) => {
                    return Err(Error::new(
                        ErrorCode::ResourceExhausted,
                        format!("no session available (max_active_sessions = {max_active})"),
                    ));
                }
            },
            ExhaustedBehavior::Block => match semaphore.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::Closed) => return Err(closed_error()),
                Err(TryAcquireError::NoPermits) => {
                    let _waiting = WaitGuard::enter(&self.inner);
                    debug!(max_active = max_active, "waiting for session capacity");
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(Error::cancelled()),
                        acquired = semaphore.acquire_owned() => {
                            acquired.map_err(|_| closed_error())?
                        }
                    }
                }
            },
        };

        // A permit granted just before close_all must not reach a closed pool.
        let mut state = self.inner.state.lock();
        if state.closed {
            return Err(closed_error());
        }
        state.admitted += 1;
        Ok(AdmissionPermit {
            inner: Arc::clone(&self.inner),
            permit: Some(permit),
        })
    }

    /// Return a session to its key's MRU stack. Expired sessions, and any
    /// session released after [`SessionPool::close_all`], are deleted instead.
    pub fn release(&self, client: &ClientHandle, session: Session) -> Result<()> {
        let expired = self.inner.expired.contains(&session);
        let mut doomed = Vec::new();
        let mut timer = None;
        {
            let mut state = self.inner.state.lock();
            let key = state.take_checked_out(client, &session)?;
            if expired || state.closed {
                doomed.push((Arc::clone(client.rpc()), session.clone()));
            } else {
                if self.inner.config.transaction_warming {
                    self.inner.transactions.pre_warm(&session);
                }
                let options = self.inner.transactions.last_used_options(&session);
                let id = state.next_id();
                let tick = state.next_tick();
                let evict = self.inner.shutdown.child_token();
                let pool = state.pools.entry(key.clone()).or_insert_with(|| KeyedPool {
                    client: client.clone(),
                    entries: VecDeque::new(),
                    last_access: 0,
                });
                pool.entries.push_front(PoolEntry {
                    id,
                    session: session.clone(),
                    options,
                    evict: evict.clone(),
                });
                pool.last_access = tick;
                state.idle += 1;
                timer = Some((key, id, evict));

                if state.idle > self.inner.config.max_pooled_sessions {
                    if let Some(victim) = state.evict_one() {
                        debug!(session = %victim.1, pooled = state.idle, "evicting session over pool limit");
                        doomed.push(victim);
                    }
                }
            }
        }
        self.inner.admission.add_permits(1);

        if let Some((key, id, evict)) = timer {
            debug!(session = %session, "released session to pool");
            self.spawn_eviction_timer(key, id, evict);
        }
        for (rpc, session) in doomed {
            self.spawn_delete(rpc, session);
        }
        Ok(())
    }

    /// Delete a checked-out session outright instead of pooling it.
    pub async fn close_session(
        &self,
        client: &ClientHandle,
        session: Session,
        cancel: &CancellationToken,
    ) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            state.take_checked_out(client, &session)?;
        }
        self.inner.admission.add_permits(1);
        self.inner.transactions.remove_session(&session);

        let rpc = client.rpc();
        let result = call_with_retry(&self.inner.calls, cancel, "delete_session", || {
            rpc.delete_session(&session)
        })
        .await;
        self.inner.expired.remove(&session);
        match result {
            Err(err) if err.is_session_expired() => Ok(()),
            other => other,
        }
    }

    /// Record that the server no longer knows `session`. It is never handed
    /// out again; if it is idle it is removed and deleted now.
    pub fn mark_expired(&self, session: &Session) {
        self.inner.expired.insert(session);
        let removed = {
            let mut state = self.inner.state.lock();
            let mut removed = None;
            for pool in state.pools.values_mut() {
                if let Some(pos) = pool.entries.iter().position(|e| &e.session == session) {
                    if let Some(entry) = pool.entries.remove(pos) {
                        entry.evict.cancel();
                        removed = Some((Arc::clone(pool.client.rpc()), entry.session));
                    }
                    break;
                }
            }
            if removed.is_some() {
                state.idle -= 1;
            }
            removed
        };
        if let Some((rpc, session)) = removed {
            self.spawn_delete(rpc, session);
        }
    }

    pub fn is_expired(&self, session: &Session) -> bool {
        self.inner.expired.contains(session)
    }

    /// Idle sessions for a key, most recently used first.
    pub fn idle_sessions(&self, client: &ClientHandle, database: &DatabaseName) -> Vec<Session> {
        let key = SessionPoolKey::new(client, database);
        self.inner
            .state
            .lock()
            .pools
            .get(&key)
            .map(|pool| pool.entries.iter().map(|e| e.session.clone()).collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> SessionPoolStats {
        let state = self.inner.state.lock();
        SessionPoolStats {
            active: state.checked_out.len(),
            creating: state.admitted,
            pooled: state.idle,
            waiting: state.waiting,
            keys: state.pools.len(),
            created: state.created,
            reused: state.reused,
            evicted: state.evicted,
        }
    }

    /// Log pool statistics at `tracing::info` level.
    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            active = stats.active,
            creating = stats.creating,
            pooled = stats.pooled,
            waiting = stats.waiting,
            created = stats.created,
            reused = stats.reused,
            evicted = stats.evicted,
            "session pool statistics"
        );
        let state = self.inner.state.lock();
        for (key, pool) in state.pools.iter() {
            info!(
                client = key.client,
                database = %key.database,
                idle = pool.entries.len(),
                "session pool key"
            );
        }
    }

    /// Stop handing out sessions, fail queued waiters, delete every idle
    /// session and join all background work.
    pub async fn close_all(&self) {
        let doomed = {
            let mut state = self.inner.state.lock();
            state.closed = true;
            self.inner.admission.close();
            let mut doomed = Vec::new();
            for pool in state.pools.values_mut() {
                for entry in pool.entries.drain(..) {
                    entry.evict.cancel();
                    doomed.push((Arc::clone(pool.client.rpc()), entry.session));
                }
            }
            state.idle = 0;
            doomed
        };
        self.inner.shutdown.cancel();

        let deleted = doomed.len();
        for (rpc, session) in doomed {
            self.spawn_delete(rpc, session);
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!(deleted = deleted, "session pool closed");
    }

    /// Wait for background deletes spawned after [`SessionPool::close_all`].
    pub(crate) async fn join_background(&self) {
        self.inner.tracker.wait().await;
    }

    fn spawn_eviction_timer(&self, key: SessionPoolKey, id: u64, evict: CancellationToken) {
        let inner = Arc::downgrade(&self.inner);
        let delay = self.inner.config.eviction_delay;
        self.inner.tracker.spawn(async move {
            tokio::select! {
                _ = evict.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Some(inner) = inner.upgrade() {
                SessionPool { inner }.evict_entry(&key, id);
            }
        });
    }

    fn evict_entry(&self, key: &SessionPoolKey, id: u64) {
        let victim = {
            let mut state = self.inner.state.lock();
            let victim = state.pools.get_mut(key).and_then(|pool| {
                let pos = pool.entries.iter().position(|e| e.id == id)?;
                let entry = pool.entries.remove(pos)?;
                Some((Arc::clone(pool.client.rpc()), entry.session))
            });
            if victim.is_some() {
                state.idle -= 1;
                state.evicted += 1;
            }
            victim
        };
        if let Some((rpc, session)) = victim {
            debug!(session = %session, "evicting idle session");
            self.spawn_delete(rpc, session);
        }
    }

    /// Delete a session server-side in the background. Failures are logged;
    /// the server reclaims a leaked session on its own TTL.
    fn spawn_delete(&self, rpc: Arc<dyn SpannerRpc>, session: Session) {
        self.inner.transactions.remove_session(&session);
        let calls = self.inner.calls.clone();
        let expired = self.inner.expired.clone();
        self.inner.tracker.spawn(async move {
            let result = call_with_retry(&calls, &CancellationToken::new(), "delete_session", || {
                rpc.delete_session(&session)
            })
            .await;
            match result {
                Ok(()) => debug!(session = %session, "deleted session"),
                Err(err) => warn!(session = %session, error = %err, "failed to delete session"),
            }
            expired.remove(&session);
        });
    }
}

impl fmt::Debug for SessionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("config", &self.inner.config)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}
