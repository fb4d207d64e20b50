//! Per-connection session sharing.
//!
//! A connection multiplexes all of its non-transactional work over one
//! shared session and carves out dedicated sessions for transactions:
//!
//! | request       | shared slot                   | outcome                          |
//! |---------------|-------------------------------|----------------------------------|
//! | implicit      | `Ready`                       | refs += 1, shared                |
//! | implicit      | `Allocating`                  | refs += 1, await same allocation |
//! | implicit      | `Empty`                       | start allocation, refs = 1       |
//! | transactional | `Ready` with refs == 0        | steal: slot emptied, dedicated   |
//! | transactional | otherwise                     | new session from the pool        |
//!
//! The slot holds the shared session by value, so a session is either in
//! the slot or owned by a transaction, never both.

use std::fmt;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use spanpool_core::{
    CallSettings, CommitResponse, DatabaseName, Error, ErrorCode, ExecuteSqlRequest, Mutation,
    Result, Session, TransactionHandle, TransactionOptions,
};

use crate::client_pool::{ClientHandle, ClientPool};
use crate::session_pool::{ExpiredSessions, SessionPool};
use crate::stream_reader::ResumableStreamReader;
use crate::transaction_pool::TransactionPool;

type Allocation = Shared<BoxFuture<'static, Result<Session>>>;

enum SharedSlot {
    Empty,
    Allocating {
        generation: u64,
        job: Allocation,
        refs: usize,
    },
    Ready {
        generation: u64,
        session: Session,
        refs: usize,
    },
}

impl SharedSlot {
    fn refs(&self) -> Option<usize> {
        match self {
            SharedSlot::Empty => None,
            SharedSlot::Allocating { refs, .. } | SharedSlot::Ready { refs, .. } => Some(*refs),
        }
    }
}

struct LeaseState {
    slot: SharedSlot,
    next_generation: u64,
}

/// A session handed out by [`ConnectionSessionLease::acquire`]. The variant
/// records who owns it, so releasing needs no identity comparison.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LeasedSession {
    /// The connection's shared implicit session, reference counted.
    Shared(Session),
    /// Exclusively owned until released back to the session pool.
    Dedicated(Session),
}

impl LeasedSession {
    pub fn session(&self) -> &Session {
        match self {
            LeasedSession::Shared(session) | LeasedSession::Dedicated(session) => session,
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self, LeasedSession::Shared(_))
    }
}

struct LeaseInner {
    client: ClientHandle,
    database: DatabaseName,
    clients: ClientPool,
    sessions: SessionPool,
    transactions: TransactionPool,
    expired: ExpiredSessions,
    calls: CallSettings,
    state: Mutex<LeaseState>,
    /// Cancelled by close; aborts an in-flight shared allocation.
    closing: CancellationToken,
    /// Shared allocations, joined by the registry on shutdown.
    tasks: TaskTracker,
}

/// One logical connection's view of the pools.
#[derive(Clone)]
pub struct ConnectionSessionLease {
    inner: Arc<LeaseInner>,
}

impl ConnectionSessionLease {
    pub(crate) fn new(
        client: ClientHandle,
        database: DatabaseName,
        clients: ClientPool,
        sessions: SessionPool,
        transactions: TransactionPool,
        expired: ExpiredSessions,
        calls: CallSettings,
        tasks: TaskTracker,
    ) -> Self {
        Self {
            inner: Arc::new(LeaseInner {
                client,
                database,
                clients,
                sessions,
                transactions,
                expired,
                calls,
                state: Mutex::new(LeaseState {
                    slot: SharedSlot::Empty,
                    next_generation: 0,
                }),
                closing: CancellationToken::new(),
                tasks,
            }),
        }
    }

    pub fn client(&self) -> &ClientHandle {
        &self.inner.client
    }

    pub fn database(&self) -> &DatabaseName {
        &self.inner.database
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closing.is_cancelled()
    }

    /// Outstanding references on the shared session, or `None` when the
    /// connection holds no shared session.
    pub fn shared_refs(&self) -> Option<usize> {
        self.inner.state.lock().slot.refs()
    }

    /// The shared session, if one is allocated.
    pub fn shared_session(&self) -> Option<Session> {
        match &self.inner.state.lock().slot {
            SharedSlot::Ready { session, .. } => Some(session.clone()),
            _ => None,
        }
    }

    /// Eagerly allocate the shared session, leaving it unreferenced.
    pub async fn open(&self, cancel: &CancellationToken) -> Result<()> {
        let leased = self.acquire(None, cancel).await?;
        self.release(leased)
    }

    /// Lease a session. `None` asks for the shared implicit session; any
    /// transaction options ask for a dedicated one.
    pub async fn acquire(
        &self,
        options: Option<&TransactionOptions>,
        cancel: &CancellationToken,
    ) -> Result<LeasedSession> {
        if self.is_closed() {
            return Err(closed_error());
        }
        match options {
            None => self.acquire_shared(cancel).await,
            Some(options) => self.acquire_dedicated(options, cancel).await,
        }
    }

    async fn acquire_shared(&self, cancel: &CancellationToken) -> Result<LeasedSession> {
        let (generation, job) = {
            let mut state = self.inner.state.lock();
            let LeaseState {
                slot,
                next_generation,
            } = &mut *state;
            match &mut *slot {
                SharedSlot::Ready { session, refs, .. } => {
                    *refs += 1;
                    return Ok(LeasedSession::Shared(session.clone()));
                }
                SharedSlot::Allocating {
                    generation,
                    job,
                    refs,
                } => {
                    *refs += 1;
                    (*generation, job.clone())
                }
                SharedSlot::Empty => {
                    let generation = *next_generation;
                    *next_generation += 1;
                    let task = self
                        .inner
                        .tasks
                        .spawn(allocate_shared(Arc::clone(&self.inner), generation));
                    let job = async move {
                        task.await.map_err(|err| {
                            Error::new(ErrorCode::Internal, format!("shared session allocation failed: {err}"))
                        })?
                    }
                    .boxed()
                    .shared();
                    *slot = SharedSlot::Allocating {
                        generation,
                        job: job.clone(),
                        refs: 1,
                    };
                    debug!(database = %self.inner.database, "allocating shared session");
                    (generation, job)
                }
            }
        };

        let mut pending = PendingRef {
            inner: &self.inner,
            generation,
            armed: true,
        };
        let session = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled()),
            session = job => session?,
        };
        pending.armed = false;
        Ok(LeasedSession::Shared(session))
    }

    async fn acquire_dedicated(
        &self,
        options: &TransactionOptions,
        cancel: &CancellationToken,
    ) -> Result<LeasedSession> {
        let stolen = {
            let mut state = self.inner.state.lock();
            match std::mem::replace(&mut state.slot, SharedSlot::Empty) {
                SharedSlot::Ready {
                    session, refs: 0, ..
                } => Some(session),
                other => {
                    state.slot = other;
                    None
                }
            }
        };
        if let Some(session) = stolen {
            debug!(session = %session, "transaction took over the shared session");
            return Ok(LeasedSession::Dedicated(session));
        }

        let session = self
            .inner
            .sessions
            .create_session(&self.inner.client, &self.inner.database, Some(options), cancel)
            .await?;
        Ok(LeasedSession::Dedicated(session))
    }

    /// Give a leased session back. Shared references only decrement the
    /// count; the shared session returns to the pool when the connection is
    /// closed and the last reference is gone.
    pub fn release(&self, leased: LeasedSession) -> Result<()> {
        match leased {
            LeasedSession::Dedicated(session) => self.inner.sessions.release(&self.inner.client, session),
            LeasedSession::Shared(session) => {
                let returned = {
                    let mut state = self.inner.state.lock();
                    let held = match &mut state.slot {
                        SharedSlot::Ready {
                            session: shared,
                            refs,
                            ..
                        } if *shared == session => {
                            *refs = refs.saturating_sub(1);
                            true
                        }
                        _ => false,
                    };
                    if !held {
                        return Err(Error::new(
                            ErrorCode::FailedPrecondition,
                            format!("{session} is not this connection's shared session"),
                        ));
                    }
                    self.inner.take_if_unreferenced(&mut state.slot)
                };
                match returned {
                    Some(session) => self.inner.return_to_pool(session),
                    None => Ok(()),
                }
            }
        }
    }

    /// Lease a dedicated session and obtain a transaction on it, reusing a
    /// pre-warmed one when the options match. The session is released if
    /// the transaction cannot be begun.
    pub async fn begin_transaction(
        &self,
        options: &TransactionOptions,
        cancel: &CancellationToken,
    ) -> Result<(LeasedSession, TransactionHandle)> {
        let leased = self.acquire(Some(options), cancel).await?;
        let begun = self
            .inner
            .transactions
            .begin_or_reuse(&self.inner.client, leased.session(), options, cancel)
            .await;
        match begun {
            Ok(handle) => Ok((leased, handle)),
            Err(err) => {
                if let Err(release) = self.release(leased) {
                    warn!(error = %release, "failed to release session after begin failure");
                }
                Err(err)
            }
        }
    }

    /// Commit and give the transaction's session back.
    pub async fn commit(
        &self,
        leased: LeasedSession,
        handle: &TransactionHandle,
        mutations: Vec<Mutation>,
        cancel: &CancellationToken,
    ) -> Result<CommitResponse> {
        let result = self
            .inner
            .transactions
            .commit(handle, leased.session(), mutations, cancel)
            .await;
        self.finish(leased, result)
    }

    /// Roll back and give the transaction's session back.
    pub async fn rollback(
        &self,
        leased: LeasedSession,
        handle: &TransactionHandle,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let result = self
            .inner
            .transactions
            .rollback(handle, leased.session(), cancel)
            .await;
        self.finish(leased, result)
    }

    fn finish<T>(&self, leased: LeasedSession, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            if err.is_session_expired() {
                self.inner.sessions.mark_expired(leased.session());
            }
        }
        if let Err(err) = self.release(leased) {
            warn!(error = %err, "failed to release transaction session");
        }
        result
    }

    /// Stream a query on a leased session, inside `transaction` if given.
    pub fn execute_streaming(
        &self,
        leased: &LeasedSession,
        sql: &str,
        transaction: Option<&TransactionHandle>,
        cancel: &CancellationToken,
    ) -> ResumableStreamReader {
        let mut request = ExecuteSqlRequest::new(leased.session().clone(), sql);
        if let Some(handle) = transaction {
            request = request.with_transaction(handle.id.clone());
        }
        ResumableStreamReader::new(
            &self.inner.client,
            request,
            self.inner.calls.clone(),
            self.inner.expired.clone(),
            cancel.clone(),
        )
    }

    /// Stream a query outside any transaction on the shared session. The
    /// shared reference is released when the reader closes.
    pub async fn execute_implicit(
        &self,
        sql: &str,
        cancel: &CancellationToken,
    ) -> Result<ResumableStreamReader> {
        let leased = self.acquire(None, cancel).await?;
        let mut reader = self.execute_streaming(&leased, sql, None, cancel);
        let lease = self.clone();
        reader.on_closed(move || {
            if let Err(err) = lease.release(leased) {
                warn!(error = %err, "failed to release shared session");
            }
        });
        Ok(reader)
    }

    /// Close the connection. Idempotent. An unreferenced shared session is
    /// returned to the pool now; a referenced one on its last release.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl LeaseInner {
    fn close(&self) {
        if self.closing.is_cancelled() {
            return;
        }
        self.closing.cancel();
        let idle = {
            let mut state = self.state.lock();
            self.take_if_unreferenced(&mut state.slot)
        };
        if let Some(session) = idle {
            if let Err(err) = self.return_to_pool(session) {
                warn!(error = %err, "failed to return shared session on close");
            }
        }
        self.clients.release(&self.client);
        info!(database = %self.database, client = self.client.id(), "connection closed");
    }

    /// Empty the slot if the connection is closed and nobody references the
    /// shared session.
    fn take_if_unreferenced(&self, slot: &mut SharedSlot) -> Option<Session> {
        if !self.closing.is_cancelled() {
            return None;
        }
        match std::mem::replace(slot, SharedSlot::Empty) {
            SharedSlot::Ready {
                session, refs: 0, ..
            } => Some(session),
            other => {
                *slot = other;
                None
            }
        }
    }

    fn return_to_pool(&self, session: Session) -> Result<()> {
        debug!(session = %session, "returning shared session to pool");
        self.sessions.release(&self.client, session)
    }

    /// Drop one reference taken on a shared allocation of `generation`.
    fn drop_ref(&self, generation: u64) {
        let returned = {
            let mut state = self.state.lock();
            match &mut state.slot {
                SharedSlot::Allocating {
                    generation: current,
                    refs,
                    ..
                }
                | SharedSlot::Ready {
                    generation: current,
                    refs,
                    ..
                } if *current == generation => {
                    *refs = refs.saturating_sub(1);
                }
                _ => return,
            }
            self.take_if_unreferenced(&mut state.slot)
        };
        if let Some(session) = returned {
            if let Err(err) = self.return_to_pool(session) {
                warn!(error = %err, "failed to return shared session");
            }
        }
    }
}

impl Drop for LeaseInner {
    fn drop(&mut self) {
        self.close();
    }
}

/// Create the shared session and publish it in the slot, carrying over the
/// references taken while it was in flight.
async fn allocate_shared(inner: Arc<LeaseInner>, generation: u64) -> Result<Session> {
    let result = async {
        let session = inner
            .sessions
            .create_session(&inner.client, &inner.database, None, &inner.closing)
            .await?;
        if let Err(err) = inner.transactions.set_implicit(&session, &inner.closing).await {
            if let Err(release) = inner.sessions.release(&inner.client, session) {
                warn!(error = %release, "failed to release session after allocation failure");
            }
            return Err(err);
        }
        Ok(session)
    }
    .await;

    let returned = {
        let mut state = inner.state.lock();
        let refs = match &state.slot {
            SharedSlot::Allocating {
                generation: current,
                refs,
                ..
            } if *current == generation => Some(*refs),
            _ => None,
        };
        match (&result, refs) {
            (Ok(session), Some(refs)) => {
                state.slot = SharedSlot::Ready {
                    generation,
                    session: session.clone(),
                    refs,
                };
                inner.take_if_unreferenced(&mut state.slot)
            }
            (Ok(session), None) => Some(session.clone()),
            (Err(_), Some(_)) => {
                state.slot = SharedSlot::Empty;
                None
            }
            (Err(_), None) => None,
        }
    };

    match &result {
        Ok(session) => debug!(session = %session, "shared session ready"),
        Err(err) => warn!(database = %inner.database, error = %err, "shared session allocation failed"),
    }
    if let Some(session) = returned {
        if let Err(err) = inner.return_to_pool(session) {
            warn!(error = %err, "failed to return shared session");
        }
    }
    result
}

/// A reference taken on an in-flight shared allocation; dropped without
/// being disarmed (cancelled or failed wait) it gives the reference back.
struct PendingRef<'a> {
    inner: &'a LeaseInner,
    generation: u64,
    armed: bool,
}

impl Drop for PendingRef<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.inner.drop_ref(self.generation);
        }
    }
}

fn closed_error() -> Error {
    Error::new(ErrorCode::FailedPrecondition, "connection is closed")
}

impl fmt::Debug for ConnectionSessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSessionLease")
            .field("database", &self.inner.database)
            .field("client", &self.inner.client.id())
            .field("shared_refs", &self.shared_refs())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
