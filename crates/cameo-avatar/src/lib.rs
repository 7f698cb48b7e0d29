//! cameo-avatar — Remote avatarization for face cutouts.
//!
//! Talks to a task-based stylization API: create a task with the face
//! attached, poll it with backoff, and inline the output image as a data URI.

pub mod avatarizer;
pub mod client;
pub mod error;
pub mod poll;

pub use avatarizer::{
    task_key, AvatarOutcome, AvatarSettings, AvatarTask, Avatarizer, SharedError, TaskState,
    DEFAULT_PROMPT,
};
pub use client::{ApiConfig, AvatarClient, DataUri};
pub use error::{AvatarError, AvatarResult};
pub use poll::Backoff;
