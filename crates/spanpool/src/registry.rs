//! SpannerPools: process-wide pool registry.
//!
//! Wires the client, session and transaction pools together around one
//! shared expired-session set. Construct one per process (or per test) and
//! clone it freely; clones share every pool.
//!
//! Shutdown order matters: sessions are closed first (their deletes need
//! live client handles), then in-flight shared allocations and pre-warms
//! are joined, then client handles are dropped.

use std::fmt;
use std::sync::Arc;

use tokio_util::task::TaskTracker;
use tracing::info;

use spanpool_core::{ClientFactory, Credential, DatabaseName, Endpoint, PoolsConfig, Result};

use crate::client_pool::ClientPool;
use crate::lease::ConnectionSessionLease;
use crate::session_pool::{ExpiredSessions, SessionPool};
use crate::transaction_pool::TransactionPool;

struct Inner {
    config: PoolsConfig,
    clients: ClientPool,
    sessions: SessionPool,
    transactions: TransactionPool,
    expired: ExpiredSessions,
    connections: TaskTracker,
}

#[derive(Clone)]
pub struct SpannerPools {
    inner: Arc<Inner>,
}

impl SpannerPools {
    pub fn new(factory: Arc<dyn ClientFactory>, config: PoolsConfig) -> Self {
        let expired = ExpiredSessions::new();
        let transactions = TransactionPool::new(config.calls.clone(), expired.clone());
        let sessions = SessionPool::new(
            config.session_pool.clone(),
            config.calls.clone(),
            transactions.clone(),
            expired.clone(),
        );
        let clients = ClientPool::new(config.client_pool.clone(), factory);
        Self {
            inner: Arc::new(Inner {
                config,
                clients,
                sessions,
                transactions,
                expired,
                connections: TaskTracker::new(),
            }),
        }
    }

    /// Open a logical connection to `database`. The connection holds one
    /// client handle until it is closed.
    pub async fn connect(
        &self,
        credential: &Credential,
        endpoint: &Endpoint,
        database: &DatabaseName,
    ) -> Result<ConnectionSessionLease> {
        let client = self.inner.clients.acquire(credential, endpoint).await?;
        info!(
            database = %database,
            endpoint = %endpoint,
            client = client.id(),
            "connection opened"
        );
        Ok(ConnectionSessionLease::new(
            client,
            database.clone(),
            self.inner.clients.clone(),
            self.inner.sessions.clone(),
            self.inner.transactions.clone(),
            self.inner.expired.clone(),
            self.inner.config.calls.clone(),
            self.inner.connections.clone(),
        ))
    }

    pub fn config(&self) -> &PoolsConfig {
        &self.inner.config
    }

    pub fn clients(&self) -> &ClientPool {
        &self.inner.clients
    }

    pub fn sessions(&self) -> &SessionPool {
        &self.inner.sessions
    }

    pub fn transactions(&self) -> &TransactionPool {
        &self.inner.transactions
    }

    pub fn expired(&self) -> &ExpiredSessions {
        &self.inner.expired
    }

    /// Delete all pooled sessions, join background work and drop every
    /// client handle.
    pub async fn shutdown(&self) {
        self.inner.sessions.log_stats();
        self.inner.sessions.close_all().await;
        self.inner.connections.close();
        self.inner.connections.wait().await;
        // Sessions released by allocations that finished after close_all.
        self.inner.sessions.join_background().await;
        self.inner.transactions.shutdown().await;
        self.inner.clients.shutdown();
        info!("spanner pools shut down");
    }
}

impl fmt::Debug for SpannerPools {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpannerPools")
            .field("config", &self.inner.config)
            .field("sessions", &self.inner.sessions.stats())
            .field("expired", &self.inner.expired.len())
            .finish_non_exhaustive()
    }
}
