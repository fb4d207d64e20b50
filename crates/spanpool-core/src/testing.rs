//! In-memory service for tests.
//!
//! [`MockSpanner`] implements [`SpannerRpc`] with call counters, injectable
//! per-operation failures, expirable sessions and a scripted streaming
//! query that honours resume tokens the way the real service does: a
//! request carrying token `T` is answered starting with the message after
//! the one that carried `T`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, SystemTime};

use futures_util::StreamExt;
use parking_lot::Mutex;
use tonic::Status;

use crate::error::Result;
use crate::rpc::{ClientFactory, PartialResultStream, SpannerRpc};
use crate::types::{
    CommitResponse, Credential, DatabaseName, Endpoint, ExecuteSqlRequest, Mutation,
    PartialResultSet, Session, TransactionId, TransactionOptions,
};

/// Operations that can be made to fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    CreateSession,
    DeleteSession,
    BeginTransaction,
    Commit,
    Rollback,
    ExecuteStreamingSql,
}

#[derive(Default)]
struct MockState {
    failures: HashMap<Op, VecDeque<Status>>,
    expired: HashSet<Session>,
    deleted: Vec<Session>,
    begun: Vec<(Session, TransactionOptions)>,
    committed: Vec<(TransactionId, usize)>,
    rolled_back: Vec<TransactionId>,
    query: Vec<PartialResultSet>,
    /// Per-call cut-off: the n-th streaming call fails after this many messages.
    stream_breaks: VecDeque<(usize, Status)>,
    stream_requests: Vec<ExecuteSqlRequest>,
    create_delay: Option<Duration>,
}

pub struct MockSpanner {
    id: usize,
    next_session: AtomicU64,
    next_transaction: AtomicU64,
    creates: AtomicUsize,
    state: Mutex<MockState>,
}

impl MockSpanner {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            next_session: AtomicU64::new(0),
            next_transaction: AtomicU64::new(0),
            creates: AtomicUsize::new(0),
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Queue a failure for the next call of `op`.
    pub fn fail_next(&self, op: Op, status: Status) {
        self.state.lock().failures.entry(op).or_default().push_back(status);
    }

    /// Make every later call on `session` fail with "Session not found".
    pub fn expire_session(&self, session: &Session) {
        self.state.lock().expired.insert(session.clone());
    }

    /// Delay every `create_session` call (observable with paused time).
    pub fn set_create_delay(&self, delay: Duration) {
        self.state.lock().create_delay = Some(delay);
    }

    /// Script the messages every streaming query returns.
    pub fn script_query(&self, messages: Vec<PartialResultSet>) {
        self.state.lock().query = messages;
    }

    /// Make the next streaming call fail with `status` after delivering
    /// `after` messages.
    pub fn break_stream_after(&self, after: usize, status: Status) {
        self.state.lock().stream_breaks.push_back((after, status));
    }

    pub fn sessions_created(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn deleted_sessions(&self) -> Vec<Session> {
        self.state.lock().deleted.clone()
    }

    pub fn begun_transactions(&self) -> Vec<(Session, TransactionOptions)> {
        self.state.lock().begun.clone()
    }

    pub fn transactions_begun(&self) -> usize {
        self.state.lock().begun.len()
    }

    pub fn commits(&self) -> Vec<(TransactionId, usize)> {
        self.state.lock().committed.clone()
    }

    pub fn rollbacks(&self) -> Vec<TransactionId> {
        self.state.lock().rolled_back.clone()
    }

    pub fn stream_requests(&self) -> Vec<ExecuteSqlRequest> {
        self.state.lock().stream_requests.clone()
    }

    fn take_failure(&self, op: Op) -> std::result::Result<(), Status> {
        match self.state.lock().failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn check_session(&self, session: &Session) -> std::result::Result<(), Status> {
        if self.state.lock().expired.contains(session) {
            return Err(Status::not_found(format!("Session not found: {session}")));
        }
        Ok(())
    }
}

#[tonic::async_trait]
impl SpannerRpc for MockSpanner {
    async fn create_session(&self, database: &DatabaseName) -> std::result::Result<Session, Status> {
        let delay = self.state.lock().create_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.take_failure(Op::CreateSession)?;
        self.creates.fetch_add(1, Ordering::SeqCst);
        let n = self.next_session.fetch_add(1, Ordering::SeqCst);
        Ok(Session::new(&format!("{database}/sessions/c{}-s{n}", self.id)))
    }

    async fn delete_session(&self, session: &Session) -> std::result::Result<(), Status> {
        self.take_failure(Op::DeleteSession)?;
        self.state.lock().deleted.push(session.clone());
        Ok(())
    }

    async fn begin_transaction(
        &self,
        session: &Session,
        options: &TransactionOptions,
    ) -> std::result::Result<TransactionId, Status> {
        self.check_session(session)?;
        self.take_failure(Op::BeginTransaction)?;
        let n = self.next_transaction.fetch_add(1, Ordering::SeqCst);
        self.state.lock().begun.push((session.clone(), options.clone()));
        Ok(TransactionId::new(format!("c{}-tx{n}", self.id)))
    }

    async fn commit(
        &self,
        session: &Session,
        transaction: &TransactionId,
        mutations: Vec<Mutation>,
    ) -> std::result::Result<CommitResponse, Status> {
        self.check_session(session)?;
        self.take_failure(Op::Commit)?;
        self.state.lock().committed.push((transaction.clone(), mutations.len()));
        Ok(CommitResponse {
            commit_timestamp: SystemTime::now(),
        })
    }

    async fn rollback(
        &self,
        session: &Session,
        transaction: &TransactionId,
    ) -> std::result::Result<(), Status> {
        self.check_session(session)?;
        self.take_failure(Op::Rollback)?;
        self.state.lock().rolled_back.push(transaction.clone());
        Ok(())
    }

    async fn execute_streaming_sql(
        &self,
        request: ExecuteSqlRequest,
    ) -> std::result::Result<PartialResultStream, Status> {
        self.check_session(&request.session)?;
        self.take_failure(Op::ExecuteStreamingSql)?;

        let mut state = self.state.lock();
        let start = match &request.resume_token {
            Some(token) => state
                .query
                .iter()
                .position(|msg| msg.resume_token.as_ref() == Some(token))
                .map(|index| index + 1)
                .ok_or_else(|| Status::invalid_argument("unknown resume token"))?,
            None => 0,
        };
        let mut items: Vec<std::result::Result<PartialResultSet, Status>> =
            state.query[start..].iter().cloned().map(Ok).collect();
        if let Some((after, status)) = state.stream_breaks.pop_front() {
            items.truncate(after);
            items.push(Err(status));
        }
        state.stream_requests.push(request);

        Ok(futures_util::stream::iter(items).boxed())
    }
}

/// Factory handing out a fresh [`MockSpanner`] per client handle.
#[derive(Default)]
pub struct MockClientFactory {
    clients: Mutex<Vec<Arc<MockSpanner>>>,
    failures: Mutex<VecDeque<Status>>,
}

impl MockClientFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connects(&self) -> usize {
        self.clients.lock().len()
    }

    /// The `index`-th client created, in creation order.
    pub fn client(&self, index: usize) -> Option<Arc<MockSpanner>> {
        self.clients.lock().get(index).cloned()
    }

    pub fn clients(&self) -> Vec<Arc<MockSpanner>> {
        self.clients.lock().clone()
    }

    pub fn fail_next_connect(&self, status: Status) {
        self.failures.lock().push_back(status);
    }
}

#[tonic::async_trait]
impl ClientFactory for MockClientFactory {
    async fn connect(&self, _credential: &Credential, _endpoint: &Endpoint) -> Result<Arc<dyn SpannerRpc>> {
        if let Some(status) = self.failures.lock().pop_front() {
            return Err(status.into());
        }
        let mut clients = self.clients.lock();
        let client = Arc::new(MockSpanner::new(clients.len()));
        clients.push(client.clone());
        Ok(client)
    }
}
