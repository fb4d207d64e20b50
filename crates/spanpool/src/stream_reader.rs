//! Resumable streaming reads.
//!
//! A [`ResumableStreamReader`] drives one streaming SQL call and survives a
//! transient failure mid-stream by reconnecting once with the last resume
//! token and fast-forwarding past the messages already consumed since it:
//!
//! ```text
//! Unconnected ──connect──→ Connected ──end──→ Finished
//!                             │  ▲
//!          retryable failure  ▼  │ connect(token), advance skip+1 times
//!                          Reconnecting
//! any state ──close / cancel / error──→ Closed
//! ```
//!
//! The skip count is reset to zero whenever a message carries a new resume
//! token and is incremented once per message otherwise, so it always equals
//! the number of messages delivered past the checkpoint.

mod chunk;

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use spanpool_core::{
    CallSettings, Error, ErrorCode, ExecuteSqlRequest, PartialResultSet, PartialResultStream,
    Result, ResultSetMetadata, Session, SpannerRpc, Value, call_once,
};

use crate::client_pool::ClientHandle;
use crate::session_pool::ExpiredSessions;

/// Lifecycle of a [`ResumableStreamReader`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// No call issued yet.
    Unconnected,
    /// Reading from a live stream.
    Connected,
    /// The stream broke; the next read reissues the call from the last token.
    Reconnecting,
    /// The server ended the stream and every value was handed out.
    Finished,
    /// Closed by the caller, by cancellation or after a terminal error.
    Closed,
}

type CloseCallback = Box<dyn FnOnce() + Send>;

/// Reads one streaming query, resuming from the last resume token when the
/// stream breaks and skipping values already handed out since that token.
pub struct ResumableStreamReader {
    rpc: Arc<dyn SpannerRpc>,
    request: ExecuteSqlRequest,
    calls: CallSettings,
    expired: ExpiredSessions,
    cancel: CancellationToken,
    state: StreamState,
    stream: Option<PartialResultStream>,
    resume_token: Option<Bytes>,
    skip: usize,
    metadata: Option<ResultSetMetadata>,
    /// Values received but not yet handed out.
    buffer: VecDeque<Value>,
    /// The last buffered value continues in the next message.
    chunk_pending: bool,
    on_close: Vec<CloseCallback>,
}

impl ResumableStreamReader {
    pub fn new(
        client: &ClientHandle,
        request: ExecuteSqlRequest,
        calls: CallSettings,
        expired: ExpiredSessions,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            rpc: Arc::clone(client.rpc()),
            request,
            calls,
            expired,
            cancel,
            state: StreamState::Unconnected,
            stream: None,
            resume_token: None,
            skip: 0,
            metadata: None,
            buffer: VecDeque::new(),
            chunk_pending: false,
            on_close: Vec::new(),
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    pub fn session(&self) -> &Session {
        &self.request.session
    }

    pub fn is_closed(&self) -> bool {
        self.state == StreamState::Closed
    }

    pub fn resume_token(&self) -> Option<&Bytes> {
        self.resume_token.as_ref()
    }

    pub fn skip_count(&self) -> usize {
        self.skip
    }

    /// Register a callback run exactly once when the reader closes; runs
    /// immediately if it already has.
    pub fn on_closed(&mut self, callback: impl FnOnce() + Send + 'static) {
        if self.is_closed() {
            callback();
        } else {
            self.on_close.push(Box::new(callback));
        }
    }

    /// Result metadata, connecting first if needed.
    pub async fn metadata(&mut self) -> Result<Option<&ResultSetMetadata>> {
        if self.metadata.is_none() && self.state != StreamState::Finished {
            self.fill().await?;
        }
        Ok(self.metadata.as_ref())
    }

    pub async fn has_data(&mut self) -> Result<bool> {
        self.fill().await
    }

    /// Next logical value, with chunked parts already merged.
    pub async fn next_value(&mut self) -> Result<Option<Value>> {
        if self.fill().await? {
            Ok(self.buffer.pop_front())
        } else {
            Ok(None)
        }
    }

    /// Next row, sized by the column count in the result metadata.
    pub async fn next_row(&mut self) -> Result<Option<Vec<Value>>> {
        let Some(first) = self.next_value().await? else {
            return Ok(None);
        };
        let columns = self.metadata.as_ref().map_or(0, |m| m.fields.len());
        if columns == 0 {
            self.close();
            return Err(Error::new(
                ErrorCode::Internal,
                "result set has values but no column metadata",
            ));
        }
        let mut row = Vec::with_capacity(columns);
        row.push(first);
        while row.len() < columns {
            match self.next_value().await? {
                Some(value) => row.push(value),
                None => {
                    self.close();
                    return Err(Error::new(ErrorCode::DataLoss, "stream ended in the middle of a row"));
                }
            }
        }
        Ok(Some(row))
    }

    /// Close the reader. Idempotent; close callbacks fire on the first call.
    pub fn close(&mut self) {
        if self.state == StreamState::Closed {
            return;
        }
        self.state = StreamState::Closed;
        self.stream = None;
        self.buffer.clear();
        self.chunk_pending = false;
        debug!(session = %self.request.session, "stream closed");
        for callback in self.on_close.drain(..) {
            callback();
        }
    }

    /// Make a complete value available in the buffer. Returns `false` at
    /// end of stream. Any error closes the reader.
    async fn fill(&mut self) -> Result<bool> {
        match self.fill_buffer().await {
            Ok(ready) => Ok(ready),
            Err(err) => {
                if err.is_session_expired() {
                    self.expired.insert(&self.request.session);
                }
                self.close();
                Err(err)
            }
        }
    }

    async fn fill_buffer(&mut self) -> Result<bool> {
        loop {
            if self.state == StreamState::Closed {
                return Err(Error::new(ErrorCode::FailedPrecondition, "stream reader is closed"));
            }
            if self.buffer.len() > 1 || (self.buffer.len() == 1 && !self.chunk_pending) {
                return Ok(true);
            }
            let Some(message) = self.next_message().await? else {
                if self.chunk_pending {
                    return Err(Error::new(
                        ErrorCode::DataLoss,
                        "stream ended inside a chunked value",
                    ));
                }
                return Ok(false);
            };
            self.absorb(message)?;
        }
    }

    fn absorb(&mut self, message: PartialResultSet) -> Result<()> {
        let mut values = VecDeque::from(message.values);
        if values.is_empty() {
            return Ok(());
        }
        if self.chunk_pending {
            if let (Some(head), Some(tail)) = (self.buffer.pop_back(), values.pop_front()) {
                values.push_front(chunk::merge(head, tail)?);
            }
        }
        self.buffer.extend(values);
        self.chunk_pending = message.chunked_value;
        Ok(())
    }

    /// One low-level message, reconnecting once on a transient failure.
    async fn next_message(&mut self) -> Result<Option<PartialResultSet>> {
        match self.state {
            StreamState::Closed => Err(Error::new(
                ErrorCode::FailedPrecondition,
                "stream reader is closed",
            )),
            StreamState::Finished => Ok(None),
            StreamState::Unconnected | StreamState::Reconnecting => {
                let message = self.connect().await?;
                Ok(self.observe(message))
            }
            StreamState::Connected => match self.advance().await {
                Ok(message) => Ok(self.observe(message)),
                Err(err) if err.is_retryable() && !err.is_session_expired() => {
                    warn!(
                        session = %self.request.session,
                        skip = self.skip,
                        error = %err,
                        "stream failed, resuming"
                    );
                    self.state = StreamState::Reconnecting;
                    self.stream = None;
                    let message = self.connect().await?;
                    Ok(self.observe(message))
                }
                Err(err) => Err(err),
            },
        }
    }

    /// Issue the streaming call from the held resume token and advance
    /// `skip + 1` times, returning only the last message. Counters are left
    /// for [`Self::observe`].
    async fn connect(&mut self) -> Result<Option<PartialResultSet>> {
        let mut request = self.request.clone();
        request.resume_token = self.resume_token.clone();
        let stream = call_once(
            &self.calls,
            &self.cancel,
            "execute_streaming_sql",
            self.rpc.execute_streaming_sql(request),
        )
        .await?;
        self.stream = Some(stream);
        self.state = StreamState::Connected;
        debug!(
            session = %self.request.session,
            resumed = self.resume_token.is_some(),
            skip = self.skip,
            "stream connected"
        );

        let mut last = None;
        for _ in 0..=self.skip {
            match self.advance().await? {
                Some(message) => {
                    self.capture_metadata(&message);
                    last = Some(message);
                }
                None => return Ok(None),
            }
        }
        Ok(last)
    }

    async fn advance(&mut self) -> Result<Option<PartialResultSet>> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::cancelled()),
            item = stream.next() => match item {
                Some(Ok(message)) => Ok(Some(message)),
                Some(Err(status)) => Err(status.into()),
                None => Ok(None),
            },
        }
    }

    /// Apply resume bookkeeping for a message about to be delivered.
    fn observe(&mut self, message: Option<PartialResultSet>) -> Option<PartialResultSet> {
        let Some(message) = message else {
            self.state = StreamState::Finished;
            self.stream = None;
            debug!(session = %self.request.session, "stream finished");
            return None;
        };
        self.capture_metadata(&message);
        match &message.resume_token {
            Some(token) if !token.is_empty() => {
                self.resume_token = Some(token.clone());
                self.skip = 0;
            }
            _ => self.skip += 1,
        }
        Some(message)
    }

    fn capture_metadata(&mut self, message: &PartialResultSet) {
        if self.metadata.is_none() {
            self.metadata = message.metadata.clone();
        }
    }
}

impl Drop for ResumableStreamReader {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ResumableStreamReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResumableStreamReader")
            .field("session", &self.request.session)
            .field("state", &self.state)
            .field("skip", &self.skip)
            .finish_non_exhaustive()
    }
}
