//! In-memory TTL caches with single-flight coalescing.
//!
//! Caches are plain service objects owned by whoever owns the session; a new
//! session calls [`ResultCache::reset`].

use crate::types::{CompositeKey, CompositeResult, Cutout, CutoutKey, SourceKey};
use image::RgbaImage;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::OnceCell;

/// Lifetime of cached cutouts, composites, and avatar tasks.
pub const RESULT_TTL: Duration = Duration::from_secs(60 * 60);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panic while holding the lock leaves plain map data behind; keep using it.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct Entry<V> {
    value: V,
    inserted: Instant,
}

/// Key-value cache whose entries expire `ttl` after insertion.
pub struct TtlCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut entries = lock(&self.entries);
        match entries.get(key) {
            Some(e) if e.inserted.elapsed() < self.ttl => Some(e.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        lock(&self.entries).insert(
            key,
            Entry {
                value,
                inserted: Instant::now(),
            },
        );
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        lock(&self.entries).remove(key).map(|e| e.value)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Live entries; expired ones are purged first.
    pub fn len(&self) -> usize {
        let mut entries = lock(&self.entries);
        entries.retain(|_, e| e.inserted.elapsed() < self.ttl);
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn reset(&self) {
        lock(&self.entries).clear();
    }
}

/// Runs at most one computation per key at a time; concurrent callers share its result.
pub struct SingleFlight<K, V> {
    flights: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            flights: Mutex::new(HashMap::new()),
        }
    }
}

impl<K: Eq + Hash + Clone, V: Clone> SingleFlight<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the in-flight computation for `key`, or start one with `work`.
    ///
    /// Callers that need the result to outlive the flight must store it (in a
    /// [`TtlCache`]) inside `work`; the flight is forgotten once it completes.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        let cell = {
            let mut flights = lock(&self.flights);
            Arc::clone(flights.entry(key.clone()).or_default())
        };

        let value = cell.get_or_init(work).await.clone();

        let mut flights = lock(&self.flights);
        if flights.get(&key).is_some_and(|c| Arc::ptr_eq(c, &cell)) {
            flights.remove(&key);
        }
        value
    }

    pub fn in_flight(&self) -> usize {
        lock(&self.flights).len()
    }
}

/// Whether a cached composite may be served as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompositePolicy {
    pub avatar_enabled: bool,
    /// An avatarization result for this source image is already cached.
    pub avatar_cached: bool,
}

impl CompositePolicy {
    pub fn honors_cached_composite(&self) -> bool {
        !self.avatar_enabled || self.avatar_cached
    }
}

/// Two-tier memo of cutouts and composites for one session.
///
/// Composite work may fail with `E`; a failure is handed to every caller that
/// joined the flight and is not cached.
pub struct ResultCache<E> {
    cutouts: TtlCache<CutoutKey, Arc<Cutout>>,
    composites: TtlCache<CompositeKey, Arc<RgbaImage>>,
    cutout_flights: SingleFlight<CutoutKey, Arc<Cutout>>,
    composite_flights: SingleFlight<CompositeKey, Result<CompositeResult, E>>,
}

impl<E: Clone> Default for ResultCache<E> {
    fn default() -> Self {
        Self::new(RESULT_TTL)
    }
}

impl<E: Clone> ResultCache<E> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            cutouts: TtlCache::new(ttl),
            composites: TtlCache::new(ttl),
            cutout_flights: SingleFlight::new(),
            composite_flights: SingleFlight::new(),
        }
    }

    pub fn cutout(&self, key: &CutoutKey) -> Option<Arc<Cutout>> {
        self.cutouts.get(key)
    }

    /// Cached cutout for `key`, computing it once across concurrent callers.
    pub async fn cutout_or_compute<F, Fut>(&self, key: CutoutKey, compute: F) -> Arc<Cutout>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Cutout>,
    {
        if let Some(hit) = self.cutouts.get(&key) {
            return hit;
        }
        let store_key = key.clone();
        self.cutout_flights
            .run(key, || async move {
                let cutout = Arc::new(compute().await);
                self.cutouts.insert(store_key, Arc::clone(&cutout));
                cutout
            })
            .await
    }

    /// Cached composite, subject to `policy`.
    pub fn composite(&self, key: &CompositeKey, policy: CompositePolicy) -> Option<Arc<RgbaImage>> {
        if !policy.honors_cached_composite() {
            return None;
        }
        self.composites.get(key)
    }

    /// Cached composite for `key`, or the result of one shared `compute`.
    ///
    /// The computed result is stored under its own key, which may differ from
    /// the requested one (an avatar composite that fell back to the raw face
    /// is keyed as [`AvatarMode::Off`](crate::types::AvatarMode::Off)).
    pub async fn composite_or_try_compute<F, Fut>(
        &self,
        key: CompositeKey,
        policy: CompositePolicy,
        compute: F,
    ) -> Result<CompositeResult, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<CompositeResult, E>>,
    {
        if let Some(image) = self.composite(&key, policy) {
            return Ok(CompositeResult { image, key });
        }
        self.composite_flights
            .run(key, || async move {
                let result = compute().await?;
                self.composites
                    .insert(result.key.clone(), Arc::clone(&result.image));
                Ok(result)
            })
            .await
    }

    pub fn insert_composite(&self, key: CompositeKey, image: Arc<RgbaImage>) {
        self.composites.insert(key, image);
    }

    /// Whether any cutout for this source image is cached.
    pub fn has_source(&self, source: &SourceKey) -> bool {
        lock(&self.cutouts.entries)
            .iter()
            .any(|(k, e)| &k.source == source && e.inserted.elapsed() < self.cutouts.ttl)
    }

    pub fn reset(&self) {
        self.cutouts.reset();
        self.composites.reset();
    }
}
