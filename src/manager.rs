//! Lifecycle of live limiters.
//!
//! The manager owns every limiter instance of this process. Limiters are built
//! lazily on first access, written back and evicted by a periodic
//! reconciliation pass, and drained on shutdown.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, trace, warn};

use crate::error::Result;
use crate::limiter::{
    duration_to_nanos, now_nanos, Configuration, Decision, Limiter, LimiterKey, Nanos,
};
use crate::registry::KeyRegistry;
use crate::store::{Fields, StoreGateway};
use crate::sync::{InstanceId, Synchronizer};

/// A limiter owned by the manager, wired to its synchronizer.
pub struct LiveLimiter {
    key: LimiterKey,
    storage_key: String,
    instance: InstanceId,
    state: Arc<Mutex<Limiter>>,
    last_used: AtomicI64,
    sync: Synchronizer,
}

impl std::fmt::Debug for LiveLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveLimiter")
            .field("key", &self.storage_key)
            .field("last_used", &self.last_used())
            .finish()
    }
}

impl LiveLimiter {
    /// The identity this limiter was derived from.
    pub fn key(&self) -> &LimiterKey {
        &self.key
    }

    /// Decide whether one unit of work is admitted.
    pub fn check(&self) -> Decision {
        self.check_at(now_nanos())
    }

    /// Decide at an explicit time. Runs in memory only; an admitted request
    /// queues a state update for peers without waiting for it.
    pub fn check_at(&self, now: Nanos) -> Decision {
        self.touch(now);
        let mut state = self.state.lock();
        let decision = state.check(now);
        if decision.allowed {
            match state.encode_update(&self.instance) {
                Ok(payload) => self.sync.publish(payload),
                Err(e) => warn!(key = %self.storage_key, error = %e, "Failed to encode update"),
            }
        }
        decision
    }

    /// Copy of the current state.
    pub fn snapshot(&self) -> Limiter {
        self.state.lock().clone()
    }

    /// Last time the limiter was accessed or checked.
    pub fn last_used(&self) -> Nanos {
        self.last_used.load(Ordering::SeqCst)
    }

    /// Whether the synchronizer has been released.
    pub fn is_released(&self) -> bool {
        self.sync.is_closed()
    }

    fn touch(&self, now: Nanos) {
        self.last_used.fetch_max(now, Ordering::SeqCst);
    }

    /// Idle past the algorithm's threshold, both by state and by last access.
    fn is_idle(&self, now: Nanos) -> bool {
        let state = self.state.lock();
        let threshold = duration_to_nanos(state.expiry_threshold());
        state.is_expired(now) && now.saturating_sub(self.last_used()) > threshold
    }

    fn persist_snapshot(&self) -> (Fields, Duration, Option<(&'static str, Nanos)>) {
        let state = self.state.lock();
        (state.to_fields(), state.persist_ttl(), state.write_guard())
    }

    fn release(&self) {
        self.sync.close();
    }
}

/// Owner of every live limiter of this process.
pub struct LimiterManager {
    store: Arc<dyn StoreGateway>,
    registry: KeyRegistry,
    instance: InstanceId,
    limiters: RwLock<HashMap<String, Arc<LiveLimiter>>>,
    last_reconciled: AtomicI64,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl LimiterManager {
    /// Create a manager for this process.
    pub fn new(store: Arc<dyn StoreGateway>, instance: InstanceId) -> Self {
        Self {
            registry: KeyRegistry::new(store.clone()),
            store,
            instance,
            limiters: RwLock::new(HashMap::new()),
            last_reconciled: AtomicI64::new(now_nanos()),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Identity used to tag updates published by this process.
    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    /// The tenant registry.
    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    /// Persist the configuration of `tenant`.
    ///
    /// Every limiter derived from the tenant afterwards starts from it. Live
    /// limiters keep running with the parameters they were built with.
    pub async fn configure(&self, tenant: &str, config: Configuration) -> Result<()> {
        let fields = config.to_fields(now_nanos());
        self.store
            .set_hash(&crate::limiter::configuration_key(tenant), &fields, None)
            .await?;
        self.registry.remember(tenant, config);

        info!(tenant = %tenant, kind = ?config.kind(), "Configured rate limiter");
        Ok(())
    }

    /// Get the live limiter for `tenant` and `args`, building it on first use.
    ///
    /// A new limiter reads the tenant's stored configuration, so a
    /// reconfiguration made by any instance applies to limiters built after it.
    pub async fn access(&self, tenant: &str, args: &[String]) -> Result<Arc<LiveLimiter>> {
        let kind = self.registry.resolve(tenant).await?;
        let now = now_nanos();
        if let Some(limiter) = self.live(&LimiterKey::new(kind, tenant, args).storage_key(), now) {
            return Ok(limiter);
        }

        let config = self.registry.configuration(tenant).await?;
        let key = LimiterKey::new(config.kind(), tenant, args);
        let storage_key = key.storage_key();
        if config.kind() != kind {
            // The tenant switched algorithm since its kind was cached.
            if let Some(limiter) = self.live(&storage_key, now) {
                return Ok(limiter);
            }
        }

        let state = Arc::new(Mutex::new(self.load(&key, &config, now).await));
        let sync = Synchronizer::start(
            self.store.clone(),
            key.channel(),
            self.instance.clone(),
            state.clone(),
            &self.tasks,
        )
        .await;
        let built = Arc::new(LiveLimiter {
            key,
            storage_key: storage_key.clone(),
            instance: self.instance.clone(),
            state,
            last_used: AtomicI64::new(now),
            sync,
        });

        let mut limiters = self.limiters.write();
        match limiters.entry(storage_key) {
            Entry::Occupied(entry) => {
                // Lost a race with a concurrent first access.
                built.release();
                let limiter = entry.get().clone();
                limiter.touch(now);
                Ok(limiter)
            }
            Entry::Vacant(entry) => {
                debug!(key = %entry.key(), "Created limiter");
                Ok(entry.insert(built).clone())
            }
        }
    }

    /// A live limiter, touched while the membership lock is held so eviction
    /// cannot remove it in between.
    fn live(&self, storage_key: &str, now: Nanos) -> Option<Arc<LiveLimiter>> {
        let limiters = self.limiters.read();
        let limiter = limiters.get(storage_key)?;
        limiter.touch(now);
        Some(limiter.clone())
    }

    /// Persisted state first, `config` second.
    ///
    /// Store failures while reading persisted state only degrade the limiter to
    /// a fresh one.
    async fn load(&self, key: &LimiterKey, config: &Configuration, now: Nanos) -> Limiter {
        match self.store.get_hash(&key.storage_key()).await {
            Ok(Some(fields)) => match Limiter::from_fields(key.kind, &fields) {
                Ok(limiter) => {
                    debug!(key = %key, "Restored persisted limiter state");
                    return limiter;
                }
                Err(e) => warn!(key = %key, error = %e, "Discarding unreadable limiter state"),
            },
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "Failed to load limiter state, starting fresh"),
        }

        Limiter::configure(config, now)
    }

    /// Number of live limiters.
    pub fn live_count(&self) -> usize {
        self.limiters.read().len()
    }

    /// Whether a limiter for `key` is live.
    pub fn is_live(&self, key: &LimiterKey) -> bool {
        self.limiters.read().contains_key(&key.storage_key())
    }

    /// One reconciliation pass: write back limiters used since the previous
    /// pass, evict limiters idle past their threshold.
    pub async fn reconcile(&self) {
        let now = now_nanos();
        let previous = self.last_reconciled.swap(now, Ordering::SeqCst);
        let live: Vec<Arc<LiveLimiter>> = self.limiters.read().values().cloned().collect();

        let mut writes = Vec::new();
        for limiter in live {
            if limiter.last_used() > previous {
                writes.push(self.persist(limiter.clone()));
            }
            if limiter.is_idle(now) {
                self.evict(&limiter);
            }
        }

        if !writes.is_empty() {
            trace!(count = writes.len(), "Writing back limiter state");
            join_all(writes).await;
        }
    }

    async fn persist(&self, limiter: Arc<LiveLimiter>) {
        let (fields, ttl, guard) = limiter.persist_snapshot();
        let key = &limiter.storage_key;

        if let Some((field, local)) = guard {
            match self.store.get_field(key, field).await {
                Ok(Some(stored)) if stored.parse::<Nanos>().map_or(false, |s| s >= local) => {
                    trace!(key = %key, "Stored state is newer, skipping write");
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to read stored limiter state");
                    return;
                }
            }
        }

        if let Err(e) = self.store.set_hash(key, &fields, Some(ttl)).await {
            warn!(key = %key, error = %e, "Failed to persist limiter state");
        }
    }

    fn evict(&self, limiter: &Arc<LiveLimiter>) {
        let removed = {
            let mut limiters = self.limiters.write();
            // Re-check under the lock, an access may have raced the pass.
            let still_idle = matches!(
                limiters.get(&limiter.storage_key),
                Some(current) if Arc::ptr_eq(current, limiter)
            ) && limiter.is_idle(now_nanos());
            if still_idle {
                limiters.remove(&limiter.storage_key)
            } else {
                None
            }
        };

        if let Some(limiter) = removed {
            limiter.release();
            debug!(key = %limiter.storage_key, "Evicted idle limiter");
        }
    }

    /// Run [`reconcile`](Self::reconcile) every `every` until shutdown.
    pub fn spawn_reconciler(self: &Arc<Self>, every: Duration) {
        let manager = Arc::clone(self);
        let cancel = self.shutdown.clone();

        self.tasks.spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            info!(interval_ms = every.as_millis() as u64, "Reconciler started");

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => manager.reconcile().await,
                }
            }
            info!("Reconciler stopped");
        });
    }

    /// Stop reconciliation, write back and release every live limiter, and
    /// wait for all background tasks to finish.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        let drained: Vec<Arc<LiveLimiter>> = self
            .limiters
            .write()
            .drain()
            .map(|(_, limiter)| limiter)
            .collect();
        info!(limiters = drained.len(), "Shutting down limiter manager");

        join_all(drained.iter().map(|limiter| self.persist(limiter.clone()))).await;
        for limiter in &drained {
            limiter.release();
        }

        self.tasks.close();
        self.tasks.wait().await;
        info!("Limiter manager stopped");
    }
}
