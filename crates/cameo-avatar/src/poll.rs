//! Backoff schedules for polling task status.

use std::time::{Duration, Instant};

use tracing::debug;

use crate::client::{AvatarClient, RemoteTask};
use crate::error::AvatarResult;

/// Geometric delay schedule: `initial`, then ×`factor` per step, never above `cap`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub initial: Duration,
    pub factor: f32,
    pub cap: Duration,
}

impl Backoff {
    /// Waiting on a fresh task while the submit request is still open.
    pub const SUBMIT: Backoff = Backoff {
        initial: Duration::from_millis(1200),
        factor: 1.4,
        cap: Duration::from_millis(3000),
    };

    /// Follow-up status rounds after the submit window has closed.
    pub const FOLLOW_UP: Backoff = Backoff {
        initial: Duration::from_millis(1500),
        factor: 1.35,
        cap: Duration::from_millis(5000),
    };

    /// Endless sequence of delays, rounded to whole milliseconds.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let cap = self.cap.as_millis() as u64;
        let factor = self.factor as f64;
        let first = (self.initial.as_millis() as u64).min(cap);
        std::iter::successors(Some(first), move |&ms| {
            Some(((ms as f64 * factor).round() as u64).min(cap))
        })
        .map(Duration::from_millis)
    }
}

/// Poll until the task is completed or failed, or `max_wait` has elapsed.
///
/// Neither a request nor a sleep may run past the deadline. Returns `Ok(None)`
/// when the task is still running at the deadline.
pub async fn wait_for_task(
    client: &AvatarClient,
    task_id: &str,
    backoff: Backoff,
    max_wait: Duration,
) -> AvatarResult<Option<RemoteTask>> {
    let deadline = Instant::now() + max_wait;
    let mut delays = backoff.delays();
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(None);
        }
        let Ok(fetched) = tokio::time::timeout(remaining, client.get_task(task_id)).await else {
            debug!(task_id, "status request outlived the wait window");
            return Ok(None);
        };
        let task = fetched?;
        if task.is_terminal() {
            return Ok(Some(task));
        }
        let Some(delay) = delays.next() else {
            return Ok(None);
        };
        let remaining = deadline.saturating_duration_since(Instant::now());
        debug!(
            task_id,
            status = task.status.as_deref().unwrap_or("unknown"),
            next_ms = delay.min(remaining).as_millis() as u64,
            "avatar task not done yet"
        );
        tokio::time::sleep(delay.min(remaining)).await;
    }
}
