//! Avatarization error types.

use thiserror::Error;

/// Longest error text carried from a remote response body.
pub const ERROR_SNIPPET_MAX: usize = 200;

pub type AvatarResult<T> = Result<T, AvatarError>;

#[derive(Debug, Error)]
pub enum AvatarError {
    #[error("avatar API key missing")]
    MissingApiKey,

    #[error("invalid imageData format")]
    InvalidDataUri,

    #[error("invalid taskId")]
    InvalidTaskId,

    #[error("{what} failed ({status}): {body}")]
    Http {
        what: String,
        status: u16,
        body: String,
    },

    #[error("failed to create file record")]
    FileRecord,

    #[error("task creation failed")]
    TaskCreation,

    #[error("no output file found")]
    NoOutputFile { task_id: String },

    #[error("task {task_id} failed: {message}")]
    TaskFailed { task_id: String, message: String },

    #[error("task {task_id} still pending")]
    TimedOut { task_id: String },

    #[error("avatar image could not be decoded: {0}")]
    Decode(#[from] image::ImageError),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl AvatarError {
    pub fn http(what: impl Into<String>, status: u16, body: &str) -> Self {
        Self::Http {
            what: what.into(),
            status,
            body: snippet(body),
        }
    }

    /// Errors the remote side caused while creating a task or extracting its output.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            AvatarError::FileRecord | AvatarError::TaskCreation | AvatarError::NoOutputFile { .. }
        )
    }

    /// Transport-level failure (no usable HTTP response).
    pub fn is_network(&self) -> bool {
        matches!(self, AvatarError::Network(_))
    }

    /// One-line message safe to hand to a client.
    pub fn sanitized(&self) -> String {
        snippet(&self.to_string())
    }
}

/// First [`ERROR_SNIPPET_MAX`] characters of `text`.
pub fn snippet(text: &str) -> String {
    text.chars().take(ERROR_SNIPPET_MAX).collect()
}
