//! The RPC stub seam.
//!
//! [`SpannerRpc`] is the boundary to the generated network stub; the pools
//! only ever talk to the service through it. [`ClientFactory`] creates one
//! stub per client handle and is injected so tests can substitute an
//! in-memory service.

use std::future::Future;
use std::sync::Arc;

use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tonic::Status;
use tracing::warn;

use crate::config::CallSettings;
use crate::error::{Error, ErrorCode, Result};
use crate::types::{
    CommitResponse, Credential, DatabaseName, Endpoint, ExecuteSqlRequest, Mutation,
    PartialResultSet, Session, TransactionId, TransactionOptions,
};

/// Message-by-message stream returned by a streaming read. Dropping it
/// cancels the underlying call.
pub type PartialResultStream = BoxStream<'static, std::result::Result<PartialResultSet, Status>>;

#[tonic::async_trait]
pub trait SpannerRpc: Send + Sync + 'static {
    async fn create_session(&self, database: &DatabaseName) -> std::result::Result<Session, Status>;

    async fn delete_session(&self, session: &Session) -> std::result::Result<(), Status>;

    async fn begin_transaction(
        &self,
        session: &Session,
        options: &TransactionOptions,
    ) -> std::result::Result<TransactionId, Status>;

    async fn commit(
        &self,
        session: &Session,
        transaction: &TransactionId,
        mutations: Vec<Mutation>,
    ) -> std::result::Result<CommitResponse, Status>;

    async fn rollback(
        &self,
        session: &Session,
        transaction: &TransactionId,
    ) -> std::result::Result<(), Status>;

    async fn execute_streaming_sql(
        &self,
        request: ExecuteSqlRequest,
    ) -> std::result::Result<PartialResultStream, Status>;
}

/// Creates the stub behind a new client handle.
#[tonic::async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(&self, credential: &Credential, endpoint: &Endpoint) -> Result<Arc<dyn SpannerRpc>>;
}

/// Run one stub call under the per-call timeout, without retrying.
pub async fn call_once<T, Fut>(
    settings: &CallSettings,
    cancel: &CancellationToken,
    operation: &'static str,
    call: Fut,
) -> Result<T>
where
    Fut: Future<Output = std::result::Result<T, Status>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::cancelled()),
        outcome = tokio::time::timeout(settings.timeout, call) => match outcome {
            Ok(result) => result.map_err(Error::from),
            Err(_) => Err(Error::new(
                ErrorCode::DeadlineExceeded,
                format!("{operation} timed out after {:?}", settings.timeout),
            )),
        },
    }
}

/// Run an idempotent stub call, retrying `Unavailable` with exponential
/// backoff up to `settings.retry.max_attempts` attempts.
pub async fn call_with_retry<T, F, Fut>(
    settings: &CallSettings,
    cancel: &CancellationToken,
    operation: &'static str,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, Status>>,
{
    let mut backoff = settings.retry.initial_backoff;
    let mut attempt = 1;
    loop {
        let err = match call_once(settings, cancel, operation, call()).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        if err.code() != ErrorCode::Unavailable || attempt >= settings.retry.max_attempts {
            return Err(err);
        }
        warn!(
            operation,
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "retrying unavailable call"
        );
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::cancelled()),
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = settings.retry.next_backoff(backoff);
        attempt += 1;
    }
}
