//! End-to-end pool scenarios against the in-memory service.
//!
//! Covers admission limits in both exhausted modes, client-handle fan-out
//! under concurrent load, expired-session exclusion, stream resumption
//! through a connection and the shared-session handoff to transactions.

use std::collections::HashSet;
use std::sync::{Arc, Once};
use std::time::Duration;

use spanpool::{ConnectionSessionLease, SpannerPools};
use spanpool_core::testing::{MockClientFactory, MockSpanner};
use spanpool_core::{
    ClientPoolConfig, Credential, DatabaseName, Endpoint, ErrorCode, ExhaustedBehavior,
    PartialResultSet, PoolOptions, PoolsConfig, SessionPoolConfig, TransactionOptions, Value,
};
use tokio_util::sync::CancellationToken;
use tonic::Status;

// ── Tracing setup ───────────────────────────────────────────────────

static TRACING_INIT: Once = Once::new();

/// Controlled by `RUST_LOG` (e.g. `RUST_LOG=spanpool=debug`).
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

// ── Helpers ─────────────────────────────────────────────────────────

struct Harness {
    pools: SpannerPools,
    factory: Arc<MockClientFactory>,
    credential: Credential,
    endpoint: Endpoint,
    database: DatabaseName,
}

impl Harness {
    fn new(config: PoolsConfig) -> Self {
        init_tracing();
        let factory = Arc::new(MockClientFactory::new());
        Self {
            pools: SpannerPools::new(factory.clone(), config),
            factory,
            credential: Credential::new("service-account"),
            endpoint: Endpoint::new("spanner.example.com", 443),
            database: DatabaseName::new("proj", "inst", "db"),
        }
    }

    async fn connect(&self) -> ConnectionSessionLease {
        self.pools
            .connect(&self.credential, &self.endpoint, &self.database)
            .await
            .unwrap()
    }

    fn mock(&self) -> Arc<MockSpanner> {
        self.factory.client(0).unwrap()
    }
}

fn limited(max_active: usize, behavior: ExhaustedBehavior) -> PoolsConfig {
    PoolsConfig {
        session_pool: SessionPoolConfig::default()
            .with_max_active_sessions(max_active)
            .with_exhausted_behavior(behavior),
        ..Default::default()
    }
}

async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

// ── Admission control ───────────────────────────────────────────────

#[tokio::test]
async fn third_session_fails_fast_at_limit() {
    let h = Harness::new(limited(2, ExhaustedBehavior::Fail));
    let lease = h.connect().await;
    let cancel = CancellationToken::new();
    let rw = TransactionOptions::ReadWrite;

    let _a = lease.acquire(Some(&rw), &cancel).await.unwrap();
    let _b = lease.acquire(Some(&rw), &cancel).await.unwrap();
    let err = lease.acquire(Some(&rw), &cancel).await.unwrap_err();

    assert_eq!(err.code(), ErrorCode::ResourceExhausted);
    assert_eq!(h.mock().sessions_created(), 2);
}

#[tokio::test]
async fn third_session_waits_and_reuses_released_one() {
    let h = Harness::new(limited(2, ExhaustedBehavior::Block));
    let lease = h.connect().await;
    let cancel = CancellationToken::new();
    let rw = TransactionOptions::ReadWrite;

    let a = lease.acquire(Some(&rw), &cancel).await.unwrap();
    let _b = lease.acquire(Some(&rw), &cancel).await.unwrap();

    let third = {
        let lease = lease.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { lease.acquire(Some(&TransactionOptions::ReadWrite), &cancel).await })
    };
    settle().await;
    assert!(!third.is_finished());
    assert_eq!(h.pools.sessions().stats().waiting, 1);

    let released = a.session().clone();
    lease.release(a).unwrap();
    let c = third.await.unwrap().unwrap();

    assert_eq!(c.session(), &released);
    assert_eq!(h.mock().sessions_created(), 2);
}

#[tokio::test]
async fn active_count_never_exceeds_limit() {
    let h = Harness::new(limited(3, ExhaustedBehavior::Block));
    let lease = h.connect().await;
    let cancel = CancellationToken::new();

    let mut tasks = Vec::new();
    for _ in 0..12 {
        let lease = lease.clone();
        let cancel = cancel.clone();
        let pools = h.pools.clone();
        tasks.push(tokio::spawn(async move {
            let leased = lease
                .acquire(Some(&TransactionOptions::ReadWrite), &cancel)
                .await
                .unwrap();
            let stats = pools.sessions().stats();
            assert!(stats.active + stats.creating <= 3);
            tokio::task::yield_now().await;
            lease.release(leased).unwrap();
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    assert!(h.mock().sessions_created() <= 3);
    assert_eq!(h.pools.sessions().stats().active, 0);
}

// ── Client handle fan-out ───────────────────────────────────────────

#[tokio::test]
async fn concurrent_connections_fan_out_round_robin() {
    let config = PoolsConfig {
        client_pool: ClientPoolConfig::default().with_channel_count(4),
        ..Default::default()
    };
    let h = Harness::new(config);
    let cancel = CancellationToken::new();

    let leases = futures_util::future::join_all((0..10).map(|_| h.connect())).await;
    let sessions = futures_util::future::join_all(
        leases
            .iter()
            .map(|lease| lease.acquire(Some(&TransactionOptions::ReadWrite), &cancel)),
    )
    .await;

    let handles: HashSet<u64> = leases.iter().map(|lease| lease.client().id()).collect();
    assert_eq!(handles.len(), 4);
    assert_eq!(h.factory.connects(), 4);
    for (i, lease) in leases.iter().enumerate() {
        assert_eq!(lease.client().index(), i % 4);
    }
    assert!(sessions.iter().all(|s| s.is_ok()));
    assert_eq!(
        h.pools.clients().stats(&h.credential, &h.endpoint).in_use,
        vec![3, 3, 2, 2]
    );

    for lease in &leases {
        lease.close();
    }
    assert_eq!(
        h.pools.clients().stats(&h.credential, &h.endpoint).in_use,
        vec![0, 0, 0, 0]
    );
}

#[tokio::test]
async fn sequential_connections_stick_to_first_handle() {
    let h = Harness::new(PoolsConfig::default());
    for _ in 0..5 {
        let lease = h.connect().await;
        assert_eq!(lease.client().index(), 0);
        lease.close();
    }
    assert_eq!(h.factory.connects(), 1);
}

// ── Expiry ──────────────────────────────────────────────────────────

#[tokio::test]
async fn expired_session_is_never_handed_out_again() {
    let h = Harness::new(PoolsConfig::default());
    let lease = h.connect().await;
    let cancel = CancellationToken::new();

    let (leased, handle) = lease
        .begin_transaction(&TransactionOptions::ReadWrite, &cancel)
        .await
        .unwrap();
    let dead = leased.session().clone();
    h.mock().expire_session(&dead);

    let err = lease.commit(leased, &handle, Vec::new(), &cancel).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Aborted);
    assert!(err.is_session_expired());
    assert!(h.pools.expired().contains(&dead));

    for _ in 0..3 {
        let (leased, handle) = lease
            .begin_transaction(&TransactionOptions::ReadWrite, &cancel)
            .await
            .unwrap();
        assert_ne!(leased.session(), &dead);
        lease.rollback(leased, &handle, &cancel).await.unwrap();
    }

    h.pools.shutdown().await;
    assert!(h.mock().deleted_sessions().contains(&dead));
}

#[tokio::test]
async fn marking_idle_session_expired_removes_it() {
    let h = Harness::new(PoolsConfig::default());
    let lease = h.connect().await;
    let cancel = CancellationToken::new();
    let rw = TransactionOptions::ReadWrite;

    let leased = lease.acquire(Some(&rw), &cancel).await.unwrap();
    let session = leased.session().clone();
    lease.release(leased).unwrap();
    assert_eq!(h.pools.sessions().stats().pooled, 1);

    h.pools.sessions().mark_expired(&session);
    assert_eq!(h.pools.sessions().stats().pooled, 0);

    let next = lease.acquire(Some(&rw), &cancel).await.unwrap();
    assert_ne!(next.session(), &session);
}

// ── Streaming through a connection ──────────────────────────────────

#[tokio::test]
async fn implicit_query_resumes_without_duplicates_or_gaps() {
    let h = Harness::new(PoolsConfig::default());
    let lease = h.connect().await;
    let cancel = CancellationToken::new();
    lease.open(&cancel).await.unwrap();

    let rows: Vec<PartialResultSet> = (0..8)
        .map(|i| {
            let msg = PartialResultSet::new(vec![Value::Number(i as f64)]);
            if i % 3 == 2 {
                msg.with_resume_token(format!("t{i}"))
            } else {
                msg
            }
        })
        .collect();
    h.mock().script_query(rows);
    h.mock().break_stream_after(4, Status::unavailable("connection reset"));

    let mut reader = lease.execute_implicit("SELECT n FROM numbers", &cancel).await.unwrap();
    let mut seen = Vec::new();
    while let Some(value) = reader.next_value().await.unwrap() {
        seen.push(value);
    }

    let expected: Vec<Value> = (0..8).map(|i| Value::Number(i as f64)).collect();
    assert_eq!(seen, expected);
    assert_eq!(h.mock().stream_requests().len(), 2);
    assert_eq!(
        h.mock().stream_requests()[1].resume_token.as_deref(),
        Some(&b"t2"[..])
    );

    assert_eq!(lease.shared_refs(), Some(1));
    drop(reader);
    assert_eq!(lease.shared_refs(), Some(0));
}

// ── Shared session handoff ──────────────────────────────────────────

#[tokio::test]
async fn transaction_takes_over_idle_shared_session() {
    let h = Harness::new(PoolsConfig::default());
    let lease = h.connect().await;
    let cancel = CancellationToken::new();
    lease.open(&cancel).await.unwrap();
    let shared = lease.shared_session().unwrap();

    let (leased, handle) = lease
        .begin_transaction(&TransactionOptions::ReadWrite, &cancel)
        .await
        .unwrap();
    assert!(!leased.is_shared());
    assert_eq!(leased.session(), &shared);
    assert_eq!(lease.shared_refs(), None);

    lease.commit(leased, &handle, Vec::new(), &cancel).await.unwrap();

    // The committed session went back to the pool; the next implicit request
    // picks it up again instead of creating a new one.
    let implicit = lease.acquire(None, &cancel).await.unwrap();
    assert_eq!(implicit.session(), &shared);
    assert_eq!(h.mock().sessions_created(), 1);
}

#[tokio::test]
async fn pre_warmed_transaction_is_reused_by_next_transaction() {
    let h = Harness::new(PoolsConfig::default());
    let lease = h.connect().await;
    let cancel = CancellationToken::new();
    let rw = TransactionOptions::ReadWrite;

    let (leased, first) = lease.begin_transaction(&rw, &cancel).await.unwrap();
    lease.commit(leased, &first, Vec::new(), &cancel).await.unwrap();

    let (leased, second) = lease.begin_transaction(&rw, &cancel).await.unwrap();
    assert_ne!(second.id, first.id);
    // The initial begin plus the pre-warm; none on the second checkout.
    assert_eq!(h.mock().transactions_begun(), 2);
    assert!(h.pools.transactions().is_active(&second.id));
    lease.rollback(leased, &second, &cancel).await.unwrap();
}

// ── Configuration ───────────────────────────────────────────────────

#[tokio::test(start_paused = true)]
async fn toml_configured_pool_evicts_idle_sessions() {
    let options = PoolOptions::from_toml_str(
        r#"
        [session_pool]
        eviction_delay_secs = 5
        transaction_warming = false

        [client_pool]
        channel_count = 2
        "#,
    )
    .unwrap();
    let h = Harness::new(PoolsConfig::from_options(&options));
    let lease = h.connect().await;
    let cancel = CancellationToken::new();

    let leased = lease
        .acquire(Some(&TransactionOptions::ReadWrite), &cancel)
        .await
        .unwrap();
    let session = leased.session().clone();
    lease.release(leased).unwrap();
    assert_eq!(h.pools.sessions().stats().pooled, 1);

    tokio::time::sleep(Duration::from_secs(6)).await;
    settle().await;

    assert_eq!(h.pools.sessions().stats().pooled, 0);
    assert_eq!(h.mock().deleted_sessions(), vec![session]);
}
