//! The offer registry: storage, aging, and listener notification.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use berthgrid_core::{DriverError, OfferDetails};
use berthgrid_metrics::OfferMetrics;
use berthgrid_queue::{DelayFifo, DelayQueue, Delayed, InsertPolicy, Keyed};

use crate::perishable::Perishable;

type BoxFuture<T> = std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send>>;

/// Callback declining an offer back to the resource manager.
pub type DeclineFn = Arc<dyn Fn(String) -> BoxFuture<Result<(), DriverError>> + Send + Sync>;

/// Predicate deciding whether an offer interests a listener.
pub type OfferFilter = Arc<dyn Fn(&OfferDetails) -> bool + Send + Sync>;

/// Notification sweeps a listener survives without a match before being
/// garbage-collected.
pub const LISTENER_MAX_AGE: u32 = 12;

/// TTL of the cached offer-id set used during listener notification.
pub const OFFER_ID_CACHE_TTL: Duration = Duration::from_secs(1);

/// The offer TTL multiplier deciding how long to wait before declining
/// a deleted-but-claimed offer; gives an in-flight launch time to
/// consume it.
pub const DEFERRED_DECLINE_TTL_FACTOR: u32 = 2;

/// Offer registry configuration.
pub struct RegistryConfig {
    /// Lifetime of a live offer from receipt.
    pub ttl: Duration,
    /// How long an expired offer id stays resolvable. Zero disables
    /// lingering: expired offers vanish immediately.
    pub linger_ttl: Duration,
    /// Delay between notification attempts for one listener.
    pub listener_delay: Duration,
    pub listener_max_age: u32,
    pub id_cache_ttl: Duration,
    pub decline: DeclineFn,
}

impl RegistryConfig {
    pub fn new(decline: DeclineFn) -> Self {
        let ttl = Duration::from_secs(30);
        Self {
            ttl,
            linger_ttl: ttl * DEFERRED_DECLINE_TTL_FACTOR,
            listener_delay: Duration::from_secs(1),
            listener_max_age: LISTENER_MAX_AGE,
            id_cache_ttl: OFFER_ID_CACHE_TTL,
            decline,
        }
    }
}

struct AgedOffer(Arc<Perishable>);

impl Delayed for AgedOffer {
    fn deadline(&self) -> Instant {
        self.0.age_deadline()
    }
}

struct OfferListener {
    pod_key: String,
    filter: OfferFilter,
    notify: watch::Sender<bool>,
    age: u32,
    saw_version: u64,
    deadline: Instant,
}

impl Keyed for OfferListener {
    fn key(&self) -> String {
        self.pod_key.clone()
    }
}

impl Delayed for OfferListener {
    fn deadline(&self) -> Instant {
        self.deadline
    }
}

/// Tracks live and lingering offers, declines what goes unused, and
/// wakes listeners when an acceptable offer arrives.
pub struct OfferRegistry {
    config: RegistryConfig,
    offers: Mutex<HashMap<String, Arc<Perishable>>>,
    delayed: DelayQueue<AgedOffer>,
    listeners: DelayFifo<OfferListener>,
    metrics: Arc<OfferMetrics>,
}

impl OfferRegistry {
    pub fn new(config: RegistryConfig, metrics: Arc<OfferMetrics>) -> Self {
        Self {
            config,
            offers: Mutex::new(HashMap::new()),
            delayed: DelayQueue::new(),
            listeners: DelayFifo::new(),
            metrics,
        }
    }

    /// Store newly received offers as live and schedule their aging.
    pub fn add(&self, details: Vec<OfferDetails>) {
        let expiration = Instant::now() + self.config.ttl;
        for d in details {
            debug!(offer_id = %d.offer_id, host = %d.hostname, "receiving offer");
            self.metrics.received.inc(&d.hostname);
            let offer = Perishable::live(d, expiration, self.metrics.clone());
            self.offers
                .lock()
                .unwrap()
                .insert(offer.offer_id().to_string(), offer.clone());
            self.delayed.add(AgedOffer(offer));
        }
    }

    pub fn get(&self, offer_id: &str) -> Option<Arc<Perishable>> {
        self.offers.lock().unwrap().get(offer_id).cloned()
    }

    /// Visit live, non-expired offers until the walker stops or errors.
    pub fn walk<E>(
        &self,
        mut f: impl FnMut(&Arc<Perishable>) -> Result<bool, E>,
    ) -> Result<(), E> {
        let snapshot: Vec<Arc<Perishable>> =
            self.offers.lock().unwrap().values().cloned().collect();
        for offer in snapshot {
            if offer.has_expired() {
                continue;
            }
            if f(&offer)? {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Expire an offer and decline it back to the resource manager.
    ///
    /// An unclaimed offer is declined immediately. A claimed offer may
    /// still be consumed by an in-flight launch, so its decline is
    /// deferred: after `DEFERRED_DECLINE_TTL_FACTOR × ttl` we try to
    /// acquire it, and decline only if the claimant released it.
    pub async fn delete(&self, offer_id: &str) {
        let Some(offer) = self.get(offer_id) else {
            return;
        };
        debug!(%offer_id, "deleting offer");
        let not_yet_claimed = offer.acquire();
        if offer.details().is_some() {
            if not_yet_claimed {
                self.decline(&offer).await;
            } else {
                let decline = self.config.decline.clone();
                let metrics = self.metrics.clone();
                let delay = self.config.ttl * DEFERRED_DECLINE_TTL_FACTOR;
                let deferred = offer.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    // A released claim means the launch fell through.
                    if deferred.acquire() {
                        let id = deferred.offer_id().to_string();
                        match decline(id.clone()).await {
                            Ok(()) => metrics.declined.inc(deferred.host()),
                            Err(e) => {
                                warn!(offer_id = %id, error = %e, "failed to decline previously claimed offer");
                            }
                        }
                    }
                });
            }
        }
        self.expire_offer(&offer);
    }

    /// Flag one offer as expired without declining it; the registry
    /// already knows it is dead (consumed by a launch or rescinded).
    pub fn invalidate_one(&self, offer_id: &str) {
        if let Some(offer) = self.get(offer_id) {
            offer.acquire(); // block other claimants
            self.expire_offer(&offer);
        }
    }

    /// Flag every known offer as expired without declining.
    pub fn invalidate_all(&self) {
        let snapshot: Vec<Arc<Perishable>> =
            self.offers.lock().unwrap().values().cloned().collect();
        for offer in snapshot {
            offer.acquire();
            self.expire_offer(&offer);
        }
    }

    /// Register a pod-level listener for acceptable offers. The returned
    /// watch flips to `true` at most once; a listener that ages out is
    /// dropped silently, so callers must also watch their own shutdown
    /// signal.
    pub fn listen(&self, pod_key: &str, filter: OfferFilter) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        debug!(%pod_key, "registering offer listener");
        self.listeners.add(
            OfferListener {
                pod_key: pod_key.to_string(),
                filter,
                notify: tx,
                age: 0,
                saw_version: 0,
                deadline: Instant::now() + self.config.listener_delay,
            },
            InsertPolicy::ReplaceExisting,
        );
        rx
    }

    /// Ids of every offer currently in storage, live or lingering.
    pub fn ids(&self) -> Vec<String> {
        self.offers.lock().unwrap().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.offers.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn decline(&self, offer: &Arc<Perishable>) {
        let id = offer.offer_id().to_string();
        debug!(offer_id = %id, "declining offer");
        match (self.config.decline)(id.clone()).await {
            Ok(()) => self.metrics.declined.inc(offer.host()),
            Err(e) => warn!(offer_id = %id, error = %e, "failed to decline offer"),
        }
    }

    /// Move a live offer into its post-expiry phase: linger when
    /// configured, vanish otherwise. Lingering offers pass through
    /// untouched until their linger deadline deletes them.
    fn expire_offer(&self, offer: &Arc<Perishable>) {
        if offer.details().is_none() {
            return; // still lingering
        }
        let offer_id = offer.offer_id();
        debug!(%offer_id, "expiring offer");
        if self.config.linger_ttl > Duration::ZERO {
            let lingering = Perishable::lingering(
                offer_id,
                offer.host(),
                Instant::now() + self.config.linger_ttl,
            );
            self.offers
                .lock()
                .unwrap()
                .insert(offer_id.to_string(), lingering.clone());
            self.delayed.add(AgedOffer(lingering));
        } else {
            self.offers.lock().unwrap().remove(offer_id);
        }
    }

    /// Spawn the aging and listener-notification loops.
    pub fn spawn_loops(
        self: &Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let aging = {
            let registry = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        aged = registry.delayed.pop() => registry.age_offer(aged.0).await,
                    }
                }
            })
        };
        let notifier = {
            let registry = self.clone();
            let mut shutdown = shutdown.clone();
            tokio::spawn(async move {
                let mut cache = IdCache::new(registry.config.id_cache_ttl);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        listener = registry.listeners.pop() => {
                            registry.notify_listener(listener, &mut cache);
                        }
                    }
                }
            })
        };
        vec![aging, notifier]
    }

    async fn age_offer(&self, offer: Arc<Perishable>) {
        if offer.details().is_some() && !offer.has_expired() {
            // Live offer timed out early; put it back.
            self.delayed.add(AgedOffer(offer));
        } else if offer.details().is_some() {
            self.delete(offer.offer_id()).await;
        } else {
            debug!(offer_id = %offer.offer_id(), "deleting lingering offer");
            self.offers.lock().unwrap().remove(offer.offer_id());
        }
    }

    fn notify_listener(&self, mut listener: OfferListener, cache: &mut IdCache) {
        let (ids, version) = cache.get(|| self.ids());

        if listener.saw_version == version {
            // Offer list unchanged; wait for arrivals without aging.
            listener.deadline = Instant::now() + self.config.listener_delay;
            self.listeners.add(listener, InsertPolicy::KeepExisting);
            return;
        }
        listener.saw_version = version;

        for id in &ids {
            let Some(offer) = self.get(id) else { continue };
            if offer.has_expired() {
                continue;
            }
            let Some(details) = offer.details() else {
                continue;
            };
            if (listener.filter)(details) {
                debug!(pod_key = %listener.pod_key, offer_id = %id, "notifying offer listener");
                let _ = listener.notify.send(true);
                return; // listener dropped; channel delivered once
            }
        }

        listener.age += 1;
        if listener.age < self.config.listener_max_age {
            listener.deadline = Instant::now() + self.config.listener_delay;
            self.listeners.add(listener, InsertPolicy::KeepExisting);
        } else {
            debug!(pod_key = %listener.pod_key, "garbage collecting offer listener");
        }
    }
}

/// Cached offer-id set with a monotonic version; the version bumps only
/// when a refill observes a different set.
struct IdCache {
    cached: Vec<String>,
    expires_at: Instant,
    version: u64,
    ttl: Duration,
}

impl IdCache {
    fn new(ttl: Duration) -> Self {
        Self {
            cached: Vec::new(),
            expires_at: Instant::now(),
            version: 0,
            ttl,
        }
    }

    fn get(&mut self, refill: impl FnOnce() -> Vec<String>) -> (Vec<String>, u64) {
        let now = Instant::now();
        if now >= self.expires_at {
            let mut fresh = refill();
            fresh.sort_unstable();
            if fresh != self.cached {
                self.version += 1;
                self.cached = fresh;
            }
            self.expires_at = now + self.ttl;
        }
        (self.cached.clone(), self.version)
    }
}
