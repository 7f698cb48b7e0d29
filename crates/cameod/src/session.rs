//! Session orchestration: fast preview plus refined composite per capture.
//!
//! Both paths publish into a [`LatestSlot`]. Versions are reserved before the
//! work starts, so the refined result always outranks the preview even when
//! the preview finishes last.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use cameo_core::{CompositeResult, SourceKey};
use image::RgbaImage;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::engine::{Pipeline, PipelineError};

pub const DEFAULT_CHARACTER: &str = "default";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// What the kiosk screen should show while a session is running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "message", rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    /// Preview is up; the refined composite is still being worked on.
    Processing,
    Ready,
    /// The refined composite could not be produced.
    Degraded(String),
}

/// Session state owned by the kiosk front end.
pub trait SessionStore: Send + Sync {
    fn shots(&self) -> Vec<Arc<RgbaImage>>;
    fn selected_character_id(&self) -> Option<String>;
    fn set_composite(&self, composite: CompositeResult);
    fn set_status(&self, _status: SessionStatus) {}
}

#[derive(Default)]
struct StoreState {
    shots: Vec<Arc<RgbaImage>>,
    character: Option<String>,
    composite: Option<CompositeResult>,
    status: Option<SessionStatus>,
}

#[derive(Default)]
pub struct InMemorySessionStore {
    state: Mutex<StoreState>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_shot(&self, shot: RgbaImage) {
        lock(&self.state).shots.push(Arc::new(shot));
    }

    pub fn select_character(&self, id: impl Into<String>) {
        lock(&self.state).character = Some(id.into());
    }

    pub fn composite(&self) -> Option<CompositeResult> {
        lock(&self.state).composite.clone()
    }

    pub fn status(&self) -> SessionStatus {
        lock(&self.state).status.clone().unwrap_or(SessionStatus::Idle)
    }

    pub fn clear(&self) {
        *lock(&self.state) = StoreState::default();
    }
}

impl SessionStore for InMemorySessionStore {
    fn shots(&self) -> Vec<Arc<RgbaImage>> {
        lock(&self.state).shots.clone()
    }

    fn selected_character_id(&self) -> Option<String> {
        lock(&self.state).character.clone()
    }

    fn set_composite(&self, composite: CompositeResult) {
        lock(&self.state).composite = Some(composite);
    }

    fn set_status(&self, status: SessionStatus) {
        lock(&self.state).status = Some(status);
    }
}

/// A composite together with the version it was published under.
#[derive(Debug, Clone)]
pub struct Published {
    pub version: u64,
    pub result: CompositeResult,
}

/// Single-value slot that only accepts newer versions.
pub struct LatestSlot {
    next_version: AtomicU64,
    tx: watch::Sender<Option<Arc<Published>>>,
}

impl Default for LatestSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl LatestSlot {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            next_version: AtomicU64::new(1),
            tx,
        }
    }

    /// Reserve the next version number.
    pub fn reserve(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::Relaxed)
    }

    /// Publish `result` under `version`; returns false if the slot already holds a newer one.
    pub fn publish(&self, version: u64, result: CompositeResult) -> bool {
        self.tx.send_if_modified(|current| {
            if current.as_ref().is_some_and(|p| p.version >= version) {
                return false;
            }
            *current = Some(Arc::new(Published { version, result }));
            true
        })
    }

    pub fn latest(&self) -> Option<Arc<Published>> {
        self.tx.borrow().clone()
    }
}

/// Resolves once the shutdown flag is set or its sender is gone.
async fn closed(mut rx: watch::Receiver<bool>) {
    loop {
        let flagged = *rx.borrow_and_update();
        if flagged || rx.changed().await.is_err() {
            return;
        }
    }
}

/// One kiosk session. Dropping it does not stop its tasks; call [`Session::teardown`].
pub struct Session {
    id: Uuid,
    pipeline: Arc<Pipeline>,
    store: Arc<dyn SessionStore>,
    slot: Arc<LatestSlot>,
    /// Set under this lock by teardown; publishers check it under the same lock.
    closed: Arc<Mutex<bool>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    pub fn start(pipeline: Arc<Pipeline>, store: Arc<dyn SessionStore>) -> Arc<Self> {
        let (shutdown, _rx) = watch::channel(false);
        let session = Arc::new(Self {
            id: Uuid::new_v4(),
            pipeline,
            store,
            slot: Arc::new(LatestSlot::new()),
            closed: Arc::new(Mutex::new(false)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        });
        session.store.set_status(SessionStatus::Idle);
        tracing::info!(session = %session.id, "session started");
        session
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn slot(&self) -> &LatestSlot {
        &self.slot
    }

    pub fn is_closed(&self) -> bool {
        *lock(&self.closed)
    }

    /// Start the fast and refined paths for the latest shot.
    ///
    /// Returns the version reserved for the refined result, or `None` when
    /// there is no shot or the session is closed.
    pub fn process(&self) -> Option<u64> {
        if self.is_closed() {
            return None;
        }
        let shot = self.store.shots().last().cloned()?;
        let character = self
            .store
            .selected_character_id()
            .unwrap_or_else(|| DEFAULT_CHARACTER.to_string());
        let source = SourceKey::of_image(&shot);

        let fast_version = self.slot.reserve();
        let refined_version = self.slot.reserve();
        self.store.set_status(SessionStatus::Processing);
        tracing::info!(
            session = %self.id,
            character = %character,
            source = %source,
            refined_version,
            "processing capture"
        );

        let fast = {
            let pipeline = Arc::clone(&self.pipeline);
            let (shot, source, character) = (Arc::clone(&shot), source.clone(), character.clone());
            let publisher = self.publisher();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                let work = tokio::task::spawn_blocking(move || pipeline.compose_fast(&shot, &source, &character));
                tokio::select! {
                    _ = closed(shutdown) => {}
                    joined = work => match joined {
                        Ok(Ok(result)) => {
                            publisher.publish(fast_version, result, false);
                        }
                        Ok(Err(err)) => tracing::warn!(error = %err, "fast preview failed"),
                        Err(err) => tracing::warn!(error = %err, "fast preview task panicked"),
                    },
                }
            })
        };

        let refined = {
            let pipeline = Arc::clone(&self.pipeline);
            let publisher = self.publisher();
            let shutdown = self.shutdown.subscribe();
            tokio::spawn(async move {
                let status_store = Arc::clone(&publisher.store);
                let work = pipeline.compose_with_retry(&shot, &source, &character, |err: &PipelineError| {
                    tracing::info!(error = %err, "refined composite retry scheduled");
                    status_store.set_status(SessionStatus::Processing);
                });
                tokio::select! {
                    _ = closed(shutdown) => {}
                    result = work => match result {
                        Ok(result) => {
                            publisher.publish(refined_version, result, true);
                        }
                        Err(err) => publisher.degrade(&err),
                    },
                }
            })
        };

        let mut tasks = lock(&self.tasks);
        tasks.retain(|h| !h.is_finished());
        tasks.push(fast);
        tasks.push(refined);
        Some(refined_version)
    }

    fn publisher(&self) -> Publisher {
        Publisher {
            session: self.id,
            slot: Arc::clone(&self.slot),
            store: Arc::clone(&self.store),
            closed: Arc::clone(&self.closed),
        }
    }

    /// Wait for every task started so far.
    pub async fn settle(&self) {
        let handles: Vec<JoinHandle<()>> = lock(&self.tasks).drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Stop the session. Results that arrive afterwards are discarded.
    pub async fn teardown(&self) {
        {
            let mut closed = lock(&self.closed);
            if *closed {
                return;
            }
            *closed = true;
        }
        self.shutdown.send_replace(true);
        self.settle().await;
        self.pipeline.reset();
        tracing::info!(session = %self.id, "session torn down");
    }
}

/// Writes results into the slot and the store unless the session is closed.
struct Publisher {
    session: Uuid,
    slot: Arc<LatestSlot>,
    store: Arc<dyn SessionStore>,
    closed: Arc<Mutex<bool>>,
}

impl Publisher {
    fn publish(&self, version: u64, result: CompositeResult, refined: bool) {
        let closed = lock(&self.closed);
        if *closed {
            tracing::debug!(session = %self.session, version, "session closed, result discarded");
            return;
        }
        if !self.slot.publish(version, result.clone()) {
            tracing::debug!(session = %self.session, version, "stale result ignored");
            return;
        }
        self.store.set_composite(result);
        if refined {
            self.store.set_status(SessionStatus::Ready);
        }
        tracing::info!(session = %self.session, version, refined, "composite published");
    }

    fn degrade(&self, err: &PipelineError) {
        let closed = lock(&self.closed);
        if *closed {
            return;
        }
        tracing::warn!(session = %self.session, error = %err, "refined composite unavailable");
        self.store.set_status(SessionStatus::Degraded(err.to_string()));
    }
}
