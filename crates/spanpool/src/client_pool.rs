//! Client handle pool.
//!
//! Keeps up to `channel_count` client handles per `(credential, endpoint)`
//! key. Selection prefers the least-used handle in creation order, and a new
//! handle is only created while every existing one is in use:
//!
//! ```text
//! acquire(key)
//!   → some handle idle            → lowest-index idle handle
//!   → all busy, fewer than N      → create handle N (single-flight per slot)
//!   → all busy, N exist           → least-used handle, ties by creation order
//! ```
//!
//! Sequential callers that release before acquiring again therefore keep
//! hitting handle 0, while concurrent callers fan out over all N handles
//! round robin.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use spanpool_core::{
    ClientFactory, ClientPoolConfig, Credential, Endpoint, Error, Result, SpannerRpc,
};

/// Key identifying a set of interchangeable client handles.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientPoolKey {
    pub credential: Credential,
    pub endpoint: Endpoint,
}

/// A shared client handle. Equality is by identity.
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    /// Process-unique identity.
    id: u64,
    /// Position within its key's handles, in creation order.
    index: usize,
    key: ClientPoolKey,
    rpc: Arc<dyn SpannerRpc>,
}

impl ClientHandle {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn index(&self) -> usize {
        self.inner.index
    }

    pub fn key(&self) -> &ClientPoolKey {
        &self.inner.key
    }

    pub fn rpc(&self) -> &Arc<dyn SpannerRpc> {
        &self.inner.rpc
    }
}

impl PartialEq for ClientHandle {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for ClientHandle {}

impl Hash for ClientHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.id.hash(state);
    }
}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.inner.id)
            .field("index", &self.inner.index)
            .field("endpoint", &self.inner.key.endpoint)
            .finish_non_exhaustive()
    }
}

struct Slot {
    cell: Arc<OnceCell<ClientHandle>>,
    in_use: usize,
}

/// Per-key statistics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClientPoolStats {
    /// Handles created (or being created) for the key.
    pub handles: usize,
    /// Outstanding uses per handle, in creation order.
    pub in_use: Vec<usize>,
}

/// Pool of client handles keyed by `(credential, endpoint)`.
#[derive(Clone)]
pub struct ClientPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: ClientPoolConfig,
    factory: Arc<dyn ClientFactory>,
    entries: Mutex<HashMap<ClientPoolKey, Vec<Slot>>>,
    next_id: AtomicU64,
}

impl ClientPool {
    /// Create an empty pool. A `channel_count` of zero is treated as one.
    pub fn new(mut config: ClientPoolConfig, factory: Arc<dyn ClientFactory>) -> Self {
        config.channel_count = config.channel_count.max(1);
        Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                entries: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Hand out a client handle for the key, creating one if selection
    /// calls for it. Every successful acquire must be paired with
    /// [`ClientPool::release`].
    pub async fn acquire(&self, credential: &Credential, endpoint: &Endpoint) -> Result<ClientHandle> {
        let key = ClientPoolKey {
            credential: credential.clone(),
            endpoint: endpoint.clone(),
        };

        let (index, cell) = {
            let mut entries = self.inner.entries.lock();
            let slots = entries.entry(key.clone()).or_default();
            let index = select_slot(slots, self.inner.config.channel_count);
            slots[index].in_use += 1;
            (index, Arc::clone(&slots[index].cell))
        };

        let created = cell
            .get_or_try_init(|| async {
                let rpc = self.inner.factory.connect(credential, endpoint).await?;
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                info!(
                    handle = id,
                    index = index,
                    endpoint = %endpoint,
                    credential = credential.id(),
                    "created client handle"
                );
                Ok::<_, Error>(ClientHandle {
                    inner: Arc::new(HandleInner {
                        id,
                        index,
                        key: key.clone(),
                        rpc,
                    }),
                })
            })
            .await;

        match created {
            Ok(handle) => {
                debug!(handle = handle.id(), index = index, endpoint = %endpoint, "acquired client handle");
                Ok(handle.clone())
            }
            Err(err) => {
                self.release_slot(&key, index, &cell);
                Err(err)
            }
        }
    }

    /// Return one use of `handle`. Handles are never destroyed here.
    pub fn release(&self, handle: &ClientHandle) {
        let mut entries = self.inner.entries.lock();
        let Some(slots) = entries.get_mut(handle.key()) else {
            return;
        };
        if let Some(slot) = slots.get_mut(handle.index()) {
            let same = slot.cell.get().is_some_and(|current| current == handle);
            if same {
                slot.in_use = slot.in_use.saturating_sub(1);
            }
        }
    }

    fn release_slot(&self, key: &ClientPoolKey, index: usize, cell: &Arc<OnceCell<ClientHandle>>) {
        let mut entries = self.inner.entries.lock();
        if let Some(slot) = entries.get_mut(key).and_then(|slots| slots.get_mut(index)) {
            if Arc::ptr_eq(&slot.cell, cell) {
                slot.in_use = slot.in_use.saturating_sub(1);
            }
        }
    }

    pub fn stats(&self, credential: &Credential, endpoint: &Endpoint) -> ClientPoolStats {
        let key = ClientPoolKey {
            credential: credential.clone(),
            endpoint: endpoint.clone(),
        };
        let entries = self.inner.entries.lock();
        let in_use: Vec<usize> = entries
            .get(&key)
            .map(|slots| slots.iter().map(|slot| slot.in_use).collect())
            .unwrap_or_default();
        ClientPoolStats {
            handles: in_use.len(),
            in_use,
        }
    }

    /// Drop every handle and all pool state.
    pub fn shutdown(&self) {
        let mut entries = self.inner.entries.lock();
        let keys = entries.len();
        entries.clear();
        info!(keys = keys, "client pool shut down");
    }
}

/// Pick the slot for the next acquire, growing `slots` if needed.
fn select_slot(slots: &mut Vec<Slot>, channel_count: usize) -> usize {
    if let Some(index) = slots.iter().position(|slot| slot.in_use == 0) {
        return index;
    }
    if slots.len() < channel_count {
        slots.push(Slot {
            cell: Arc::new(OnceCell::new()),
            in_use: 0,
        });
        return slots.len() - 1;
    }
    // min_by_key keeps the first minimum, i.e. the oldest handle.
    slots
        .iter()
        .enumerate()
        .min_by_key(|(_, slot)| slot.in_use)
        .map(|(index, _)| index)
        .unwrap_or(0)
}

impl fmt::Debug for ClientPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientPool")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spanpool_core::ErrorCode;
    use spanpool_core::testing::MockClientFactory;

    fn make_pool(channel_count: usize) -> (ClientPool, Arc<MockClientFactory>) {
        let factory = Arc::new(MockClientFactory::new());
        let config = ClientPoolConfig::default().with_channel_count(channel_count);
        (ClientPool::new(config, factory.clone()), factory)
    }

    fn credential() -> Credential {
        Credential::new("default")
    }

    fn endpoint() -> Endpoint {
        Endpoint::new("spanner.example.com", 443)
    }

    // ── Selection ───────────────────────────────────────────────────

    #[tokio::test]
    async fn sequential_acquire_release_reuses_first_handle() {
        let (pool, factory) = make_pool(4);
        for _ in 0..10 {
            let handle = pool.acquire(&credential(), &endpoint()).await.unwrap();
            assert_eq!(handle.index(), 0);
            pool.release(&handle);
        }
        assert_eq!(factory.connects(), 1);
    }

    #[tokio::test]
    async fn held_handles_fan_out_then_wrap() {
        let (pool, factory) = make_pool(3);
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(pool.acquire(&credential(), &endpoint()).await.unwrap());
        }
        let indexes: Vec<usize> = held.iter().map(ClientHandle::index).collect();
        assert_eq!(indexes, vec![0, 1, 2]);
        assert_eq!(factory.connects(), 3);

        let fourth = pool.acquire(&credential(), &endpoint()).await.unwrap();
        assert_eq!(fourth, held[0]);
        let fifth = pool.acquire(&credential(), &endpoint()).await.unwrap();
        assert_eq!(fifth, held[1]);
        assert_eq!(factory.connects(), 3);
    }

    #[tokio::test]
    async fn after_releasing_all_next_acquire_gets_first_handle() {
        let (pool, _) = make_pool(3);
        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(pool.acquire(&credential(), &endpoint()).await.unwrap());
        }
        for handle in &held {
            pool.release(handle);
        }
        let next = pool.acquire(&credential(), &endpoint()).await.unwrap();
        assert_eq!(next, held[0]);
    }

    #[tokio::test]
    async fn zero_channel_count_still_hands_out_a_handle() {
        let factory = Arc::new(MockClientFactory::new());
        let pool = ClientPool::new(ClientPoolConfig { channel_count: 0 }, factory.clone());
        let first = pool.acquire(&credential(), &endpoint()).await.unwrap();
        let second = pool.acquire(&credential(), &endpoint()).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.index(), 0);
        assert_eq!(factory.connects(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_acquires_spread_evenly() {
        let (pool, factory) = make_pool(4);
        let mut tasks = Vec::new();
        for _ in 0..40 {
            let pool = pool.clone();
            tasks.push(tokio::spawn(async move {
                pool.acquire(&credential(), &endpoint()).await.unwrap()
            }));
        }
        let mut per_index = [0usize; 4];
        for task in tasks {
            per_index[task.await.unwrap().index()] += 1;
        }
        assert_eq!(per_index, [10, 10, 10, 10]);
        assert_eq!(factory.connects(), 4);
        assert_eq!(pool.stats(&credential(), &endpoint()).in_use, vec![10, 10, 10, 10]);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let (pool, factory) = make_pool(2);
        let a = pool.acquire(&credential(), &endpoint()).await.unwrap();
        let b = pool
            .acquire(&Credential::new("other"), &endpoint())
            .await
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(a.index(), 0);
        assert_eq!(b.index(), 0);
        assert_eq!(factory.connects(), 2);
    }

    // ── Failure and shutdown ────────────────────────────────────────

    #[tokio::test]
    async fn failed_connect_returns_use_and_retries_slot() {
        let (pool, factory) = make_pool(2);
        factory.fail_next_connect(tonic::Status::unavailable("dns failure"));

        let err = pool.acquire(&credential(), &endpoint()).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Unavailable);
        assert_eq!(pool.stats(&credential(), &endpoint()).in_use, vec![0]);

        let handle = pool.acquire(&credential(), &endpoint()).await.unwrap();
        assert_eq!(handle.index(), 0);
        assert_eq!(factory.connects(), 1);
    }

    #[tokio::test]
    async fn release_of_stale_handle_is_ignored() {
        let (pool, _) = make_pool(2);
        let old = pool.acquire(&credential(), &endpoint()).await.unwrap();
        pool.shutdown();
        let fresh = pool.acquire(&credential(), &endpoint()).await.unwrap();
        pool.release(&old);
        assert_ne!(old, fresh);
        assert_eq!(pool.stats(&credential(), &endpoint()).in_use, vec![1]);
    }

    #[tokio::test]
    async fn shutdown_clears_state() {
        let (pool, factory) = make_pool(2);
        pool.acquire(&credential(), &endpoint()).await.unwrap();
        pool.shutdown();
        assert_eq!(pool.stats(&credential(), &endpoint()).handles, 0);
        pool.acquire(&credential(), &endpoint()).await.unwrap();
        assert_eq!(factory.connects(), 2);
    }
}
