//! Transaction pool.
//!
//! Caches the most recently begun transaction per session and, when a
//! session is released, speculatively begins a replacement read-write
//! transaction so the next user of the session finds it warm.
//!
//! Handles are only valid while registered in the active-transaction
//! registry. Commit and rollback always deregister, whatever the outcome.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use spanpool_core::{
    CallSettings, CommitResponse, Error, ErrorCode, Mutation, Result, Session, SpannerRpc,
    TransactionHandle, TransactionId, TransactionMode, TransactionOptions, call_once,
    call_with_retry,
};

use crate::client_pool::ClientHandle;
use crate::session_pool::ExpiredSessions;

type PreWarm = Shared<BoxFuture<'static, ()>>;

/// Per-session transaction cache.
struct SessionInfo {
    rpc: Arc<dyn SpannerRpc>,
    handle: Option<TransactionHandle>,
    /// Options of the last transaction requested on this session.
    options: Option<TransactionOptions>,
    pre_warm: Option<PreWarm>,
}

impl SessionInfo {
    fn new(rpc: Arc<dyn SpannerRpc>) -> Self {
        Self {
            rpc,
            handle: None,
            options: None,
            pre_warm: None,
        }
    }
}

#[derive(Default)]
struct TxState {
    sessions: HashMap<Session, SessionInfo>,
    /// Active-transaction registry.
    active: HashMap<TransactionId, Session>,
}

struct Inner {
    calls: CallSettings,
    expired: ExpiredSessions,
    state: Mutex<TxState>,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

/// Per-session transaction cache with background pre-warming.
#[derive(Clone)]
pub struct TransactionPool {
    inner: Arc<Inner>,
}

impl TransactionPool {
    pub fn new(calls: CallSettings, expired: ExpiredSessions) -> Self {
        Self {
            inner: Arc::new(Inner {
                calls,
                expired,
                state: Mutex::new(TxState::default()),
                tracker: TaskTracker::new(),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Return the session's cached transaction if it is still registered and
    /// was begun with `options`; otherwise invalidate it and begin a new one.
    pub async fn begin_or_reuse(
        &self,
        client: &ClientHandle,
        session: &Session,
        options: &TransactionOptions,
        cancel: &CancellationToken,
    ) -> Result<TransactionHandle> {
        self.wait_for_pre_warm(session, cancel).await?;

        let rpc = {
            let mut state = self.inner.state.lock();
            let TxState { sessions, active } = &mut *state;
            let info = sessions
                .entry(session.clone())
                .or_insert_with(|| SessionInfo::new(Arc::clone(client.rpc())));
            if let Some(handle) = &info.handle {
                if active.get(&handle.id) == Some(session) && handle.options == *options {
                    debug!(session = %session, "reusing cached transaction");
                    return Ok(handle.clone());
                }
            }
            if let Some(stale) = info.handle.take() {
                active.remove(&stale.id);
                debug!(session = %session, "invalidated cached transaction");
            }
            info.options = Some(options.clone());
            Arc::clone(&info.rpc)
        };

        let id = call_with_retry(&self.inner.calls, cancel, "begin_transaction", || {
            rpc.begin_transaction(session, options)
        })
        .await
        .inspect_err(|err| self.note_failure(session, err))?;

        let handle = TransactionHandle::new(id, options.clone());
        let mut state = self.inner.state.lock();
        let TxState { sessions, active } = &mut *state;
        active.insert(handle.id.clone(), session.clone());
        sessions
            .entry(session.clone())
            .or_insert_with(|| SessionInfo::new(rpc))
            .handle = Some(handle.clone());
        debug!(session = %session, mode = ?handle.mode, "began transaction");
        Ok(handle)
    }

    /// Start a replacement read-write transaction in the background.
    ///
    /// Registration of the in-flight begin is synchronous, so a caller that
    /// reuses the session right away waits for it instead of racing it.
    pub fn pre_warm(&self, session: &Session) {
        let mut state = self.inner.state.lock();
        let TxState { sessions, active } = &mut *state;
        let Some(info) = sessions.get_mut(session) else {
            return;
        };
        let Some(options) = info.options.clone() else {
            return;
        };
        if options.mode() != TransactionMode::ReadWrite {
            return;
        }
        if info.pre_warm.as_ref().is_some_and(|pending| pending.peek().is_none()) {
            return;
        }
        if let Some(handle) = &info.handle {
            if active.get(&handle.id) == Some(session) && handle.options == options {
                return;
            }
        }
        if let Some(stale) = info.handle.take() {
            active.remove(&stale.id);
        }

        let job = run_pre_warm(
            Arc::downgrade(&self.inner),
            Arc::clone(&info.rpc),
            session.clone(),
            options,
            self.inner.calls.clone(),
            self.inner.shutdown.clone(),
        )
        .boxed()
        .shared();
        info.pre_warm = Some(job.clone());
        drop(state);

        debug!(session = %session, "pre-warming transaction");
        self.inner.tracker.spawn(job);
    }

    /// Revert the session to implicit use, dropping its cached transaction.
    pub async fn set_implicit(&self, session: &Session, cancel: &CancellationToken) -> Result<()> {
        self.wait_for_pre_warm(session, cancel).await?;
        self.remove_session(session);
        Ok(())
    }

    /// Forget everything cached for a session that is going away.
    pub fn remove_session(&self, session: &Session) {
        let mut state = self.inner.state.lock();
        let TxState { sessions, active } = &mut *state;
        if let Some(info) = sessions.remove(session) {
            if let Some(handle) = info.handle {
                active.remove(&handle.id);
            }
        }
    }

    pub fn last_used_options(&self, session: &Session) -> Option<TransactionOptions> {
        self.inner
            .state
            .lock()
            .sessions
            .get(session)
            .and_then(|info| info.options.clone())
    }

    /// Commit `handle` on `session`. Never retried; the transaction is
    /// deregistered whether or not the commit succeeds.
    pub async fn commit(
        &self,
        handle: &TransactionHandle,
        session: &Session,
        mutations: Vec<Mutation>,
        cancel: &CancellationToken,
    ) -> Result<CommitResponse> {
        let rpc = self.checkout(handle, session)?;
        let _deregister = Deregister {
            inner: &self.inner,
            session,
            id: &handle.id,
        };
        call_once(
            &self.inner.calls,
            cancel,
            "commit",
            rpc.commit(session, &handle.id, mutations),
        )
        .await
        .inspect_err(|err| self.note_failure(session, err))
    }

    /// Roll back `handle`, retrying while the server is unavailable. The
    /// transaction is deregistered on every outcome.
    pub async fn rollback(
        &self,
        handle: &TransactionHandle,
        session: &Session,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let rpc = self.checkout(handle, session)?;
        let _deregister = Deregister {
            inner: &self.inner,
            session,
            id: &handle.id,
        };
        call_with_retry(&self.inner.calls, cancel, "rollback", || {
            rpc.rollback(session, &handle.id)
        })
        .await
        .inspect_err(|err| self.note_failure(session, err))
    }

    pub fn is_active(&self, id: &TransactionId) -> bool {
        self.inner.state.lock().active.contains_key(id)
    }

    pub fn active_transactions(&self) -> usize {
        self.inner.state.lock().active.len()
    }

    /// Cancel in-flight pre-warms and wait for them to finish.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        info!("transaction pool shut down");
    }

    /// Validate `handle` against the registry and the session's cache.
    /// A handle that fails validation is deregistered.
    fn checkout(&self, handle: &TransactionHandle, session: &Session) -> Result<Arc<dyn SpannerRpc>> {
        let mut state = self.inner.state.lock();
        let TxState { sessions, active } = &mut *state;
        let registered = active.get(&handle.id) == Some(session);
        let cached = sessions
            .get(session)
            .filter(|info| info.handle.as_ref().is_some_and(|h| h.id == handle.id));
        match cached {
            Some(info) if registered => Ok(Arc::clone(&info.rpc)),
            _ => {
                active.remove(&handle.id);
                Err(Error::new(
                    ErrorCode::FailedPrecondition,
                    "transaction not found in pool",
                ))
            }
        }
    }

    async fn wait_for_pre_warm(&self, session: &Session, cancel: &CancellationToken) -> Result<()> {
        let pending = self
            .inner
            .state
            .lock()
            .sessions
            .get(session)
            .and_then(|info| info.pre_warm.clone());
        if let Some(pending) = pending {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::cancelled()),
                _ = pending => {}
            }
        }
        Ok(())
    }

    fn note_failure(&self, session: &Session, err: &Error) {
        if err.is_session_expired() {
            self.inner.expired.insert(session);
        }
    }
}

async fn run_pre_warm(
    inner: Weak<Inner>,
    rpc: Arc<dyn SpannerRpc>,
    session: Session,
    options: TransactionOptions,
    calls: CallSettings,
    shutdown: CancellationToken,
) {
    let result = call_with_retry(&calls, &shutdown, "begin_transaction", || {
        rpc.begin_transaction(&session, &options)
    })
    .await;
    let Some(inner) = inner.upgrade() else {
        return;
    };

    match result {
        Ok(id) => {
            let mut state = inner.state.lock();
            let TxState { sessions, active } = &mut *state;
            match sessions.get_mut(&session) {
                Some(info) if info.handle.is_none() && info.options.as_ref() == Some(&options) => {
                    active.insert(id.clone(), session.clone());
                    info.handle = Some(TransactionHandle::new(id, options));
                    debug!(session = %session, "pre-warmed transaction ready");
                }
                _ => debug!(session = %session, "discarding pre-warmed transaction"),
            }
        }
        Err(err) => {
            if err.is_session_expired() {
                inner.expired.insert(&session);
            }
            warn!(session = %session, error = %err, "transaction pre-warm failed");
        }
    }
}

/// Removes a transaction from the registry and the session cache on drop.
struct Deregister<'a> {
    inner: &'a Inner,
    session: &'a Session,
    id: &'a TransactionId,
}

impl Drop for Deregister<'_> {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        let TxState { sessions, active } = &mut *state;
        active.remove(self.id);
        if let Some(info) = sessions.get_mut(self.session) {
            if info.handle.as_ref().is_some_and(|h| &h.id == self.id) {
                info.handle = None;
            }
        }
    }
}

impl fmt::Debug for TransactionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionPool")
            .field("active", &self.active_transactions())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanpool_core::testing::{MockClientFactory, MockSpanner, Op};
    use spanpool_core::{ClientPoolConfig, Credential, Endpoint, TimestampBound};

    use crate::client_pool::ClientPool;

    struct Fixture {
        pool: TransactionPool,
        client: ClientHandle,
        mock: Arc<MockSpanner>,
        expired: ExpiredSessions,
    }

    async fn fixture() -> Fixture {
        let factory = Arc::new(MockClientFactory::new());
        let clients = ClientPool::new(ClientPoolConfig::default(), factory.clone());
        let client = clients
            .acquire(&Credential::new("default"), &Endpoint::new("localhost", 9010))
            .await
            .unwrap();
        let expired = ExpiredSessions::new();
        Fixture {
            pool: TransactionPool::new(CallSettings::default(), expired.clone()),
            client,
            mock: factory.client(0).unwrap(),
            expired,
        }
    }

    fn session() -> Session {
        Session::new("projects/p/instances/i/databases/d/sessions/s1")
    }

    fn cancel() -> CancellationToken {
        CancellationToken::new()
    }

    // ── begin_or_reuse ──────────────────────────────────────────────

    #[tokio::test]
    async fn same_options_reuse_handle_without_network_call() {
        let f = fixture().await;
        let rw = TransactionOptions::ReadWrite;
        let first = f.pool.begin_or_reuse(&f.client, &session(), &rw, &cancel()).await.unwrap();
        let second = f.pool.begin_or_reuse(&f.client, &session(), &rw, &cancel()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(f.mock.transactions_begun(), 1);
    }

    #[tokio::test]
    async fn different_options_begin_new_and_invalidate_old() {
        let f = fixture().await;
        let first = f
            .pool
            .begin_or_reuse(&f.client, &session(), &TransactionOptions::ReadWrite, &cancel())
            .await
            .unwrap();
        let read = TransactionOptions::ReadOnly(TimestampBound::Strong);
        let second = f.pool.begin_or_reuse(&f.client, &session(), &read, &cancel()).await.unwrap();

        assert_ne!(first.id, second.id);
        assert_eq!(second.mode, TransactionMode::ReadOnly);
        assert!(!f.pool.is_active(&first.id));
        assert!(f.pool.is_active(&second.id));
        assert_eq!(f.mock.transactions_begun(), 2);
    }

    #[tokio::test]
    async fn committed_handle_is_not_reused() {
        let f = fixture().await;
        let rw = TransactionOptions::ReadWrite;
        let first = f.pool.begin_or_reuse(&f.client, &session(), &rw, &cancel()).await.unwrap();
        f.pool.commit(&first, &session(), vec![], &cancel()).await.unwrap();
        let second = f.pool.begin_or_reuse(&f.client, &session(), &rw, &cancel()).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(f.mock.transactions_begun(), 2);
    }

    #[tokio::test]
    async fn begin_on_expired_session_marks_it() {
        let f = fixture().await;
        f.mock.expire_session(&session());
        let err = f
            .pool
            .begin_or_reuse(&f.client, &session(), &TransactionOptions::ReadWrite, &cancel())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Aborted);
        assert!(f.expired.contains(&session()));
    }

    // ── commit / rollback ───────────────────────────────────────────

    #[tokio::test]
    async fn commit_deregisters_handle() {
        let f = fixture().await;
        let handle = f
            .pool
            .begin_or_reuse(&f.client, &session(), &TransactionOptions::ReadWrite, &cancel())
            .await
            .unwrap();
        f.pool.commit(&handle, &session(), vec![], &cancel()).await.unwrap();
        assert!(!f.pool.is_active(&handle.id));
        assert_eq!(f.mock.commits().len(), 1);

        let err = f.pool.commit(&handle, &session(), vec![], &cancel()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
        assert_eq!(err.message(), "transaction not found in pool");
    }

    #[tokio::test]
    async fn failed_commit_still_deregisters() {
        let f = fixture().await;
        let handle = f
            .pool
            .begin_or_reuse(&f.client, &session(), &TransactionOptions::ReadWrite, &cancel())
            .await
            .unwrap();
        f.mock.fail_next(Op::Commit, tonic::Status::aborted("lock conflict"));
        let err = f.pool.commit(&handle, &session(), vec![], &cancel()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Aborted);
        assert!(!f.pool.is_active(&handle.id));
        assert_eq!(f.pool.active_transactions(), 0);
    }

    #[tokio::test]
    async fn rollback_deregisters_handle() {
        let f = fixture().await;
        let handle = f
            .pool
            .begin_or_reuse(&f.client, &session(), &TransactionOptions::ReadWrite, &cancel())
            .await
            .unwrap();
        f.pool.rollback(&handle, &session(), &cancel()).await.unwrap();
        assert!(!f.pool.is_active(&handle.id));
        assert_eq!(f.mock.rollbacks(), vec![handle.id.clone()]);
    }

    #[tokio::test]
    async fn commit_with_handle_from_other_session_fails() {
        let f = fixture().await;
        let handle = f
            .pool
            .begin_or_reuse(&f.client, &session(), &TransactionOptions::ReadWrite, &cancel())
            .await
            .unwrap();
        let other = Session::new("projects/p/instances/i/databases/d/sessions/s2");
        let err = f.pool.commit(&handle, &other, vec![], &cancel()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::FailedPrecondition);
        assert!(!f.pool.is_active(&handle.id));
        assert!(f.mock.commits().is_empty());
    }

    // ── pre-warm / implicit ─────────────────────────────────────────

    #[tokio::test]
    async fn pre_warm_begins_read_write_replacement() {
        let f = fixture().await;
        let rw = TransactionOptions::ReadWrite;
        let handle = f.pool.begin_or_reuse(&f.client, &session(), &rw, &cancel()).await.unwrap();
        f.pool.commit(&handle, &session(), vec![], &cancel()).await.unwrap();

        f.pool.pre_warm(&session());
        let warmed = f.pool.begin_or_reuse(&f.client, &session(), &rw, &cancel()).await.unwrap();
        assert_ne!(warmed.id, handle.id);
        assert_eq!(f.mock.transactions_begun(), 2);
    }

    #[tokio::test]
    async fn pre_warm_skips_read_only() {
        let f = fixture().await;
        let read = TransactionOptions::read_only();
        let handle = f.pool.begin_or_reuse(&f.client, &session(), &read, &cancel()).await.unwrap();
        f.pool.commit(&handle, &session(), vec![], &cancel()).await.unwrap();

        f.pool.pre_warm(&session());
        f.pool.shutdown().await;
        assert_eq!(f.mock.transactions_begun(), 1);
    }

    #[tokio::test]
    async fn pre_warm_keeps_still_valid_handle() {
        let f = fixture().await;
        let rw = TransactionOptions::ReadWrite;
        let handle = f.pool.begin_or_reuse(&f.client, &session(), &rw, &cancel()).await.unwrap();
        f.pool.pre_warm(&session());
        let again = f.pool.begin_or_reuse(&f.client, &session(), &rw, &cancel()).await.unwrap();
        assert_eq!(handle, again);
        assert_eq!(f.mock.transactions_begun(), 1);
    }

    #[tokio::test]
    async fn failed_pre_warm_is_not_surfaced() {
        let f = fixture().await;
        let rw = TransactionOptions::ReadWrite;
        let handle = f.pool.begin_or_reuse(&f.client, &session(), &rw, &cancel()).await.unwrap();
        f.pool.commit(&handle, &session(), vec![], &cancel()).await.unwrap();

        f.mock.fail_next(Op::BeginTransaction, tonic::Status::internal("boom"));
        f.pool.pre_warm(&session());
        let next = f.pool.begin_or_reuse(&f.client, &session(), &rw, &cancel()).await.unwrap();
        assert!(f.pool.is_active(&next.id));
    }

    #[tokio::test]
    async fn set_implicit_drops_cache_and_registry() {
        let f = fixture().await;
        let handle = f
            .pool
            .begin_or_reuse(&f.client, &session(), &TransactionOptions::ReadWrite, &cancel())
            .await
            .unwrap();
        f.pool.set_implicit(&session(), &cancel()).await.unwrap();
        assert!(!f.pool.is_active(&handle.id));
        assert_eq!(f.pool.last_used_options(&session()), None);
    }

    #[tokio::test]
    async fn last_used_options_tracks_latest_request() {
        let f = fixture().await;
        assert_eq!(f.pool.last_used_options(&session()), None);
        f.pool
            .begin_or_reuse(&f.client, &session(), &TransactionOptions::ReadWrite, &cancel())
            .await
            .unwrap();
        assert_eq!(
            f.pool.last_used_options(&session()),
            Some(TransactionOptions::ReadWrite)
        );
    }
}
