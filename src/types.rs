use base64::{engine::general_purpose, Engine};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SdError};

/// Progress computed from one streamed `{"step": .., "total_steps": ..}` fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    /// Step within the current batch, as reported by the server.
    pub step: u64,
    /// Steps per batch, as reported by the server.
    pub total_steps: u64,
    /// Step across all batches of the task.
    pub overall_step: u64,
    /// Whole-task completion, 0..=100.
    pub percent: u8,
    pub steps_remaining: u64,
    /// Estimate from the gap between the last two chunks. 0 on the first chunk.
    pub time_remaining_ms: u64,
}

/// One image from the final payload's `output` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedImage {
    /// Image bytes as a data URI.
    pub data: String,
    #[serde(default)]
    pub seed: i64,
}

impl GeneratedImage {
    /// Decode the base64 body of the data URI into raw image bytes.
    pub fn decode(&self) -> Result<Vec<u8>> {
        let encoded = match self.data.split_once(";base64,") {
            Some((_, body)) => body,
            None => self.data.as_str(),
        };
        general_purpose::STANDARD
            .decode(encoded.trim())
            .map_err(|e| SdError::InvalidResponse(format!("Bad image data: {}", e)))
    }

    /// The MIME type declared by the data URI, if any (e.g. `image/png`).
    pub fn mime_type(&self) -> Option<&str> {
        self.data
            .strip_prefix("data:")
            .and_then(|rest| rest.split(';').next())
            .filter(|mime| !mime.is_empty())
    }
}

/// Images from one successful batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationOutput {
    pub images: Vec<GeneratedImage>,
    /// Entries of `output` that could not be read and were skipped.
    pub invalid_entries: usize,
}

/// Task lifecycle: Enqueued -> Running -> Completed/Cancelled/Errored.
/// A queued task may also go straight to Cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TaskStatus {
    Enqueued,
    Running,
    Completed,
    Cancelled,
    Errored,
}

impl TaskStatus {
    pub fn as_str(&self) -> &str {
        match self {
            TaskStatus::Enqueued => "enqueued",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Errored => "errored",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Errored
        )
    }
}

/// Server liveness as last observed. Assumed online until a probe says otherwise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ServerStatus {
    #[default]
    Online,
    Offline,
}

impl ServerStatus {
    pub fn message(&self) -> &'static str {
        match self {
            ServerStatus::Online => "Stable Diffusion is ready",
            ServerStatus::Offline => "Stable Diffusion has stopped",
        }
    }
}

/// Severity of a user-facing status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    Info,
    Error,
}

/// A user-facing status line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub kind: MessageKind,
    pub msg: String,
}

impl StatusMessage {
    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Error,
            msg: msg.into(),
        }
    }

    pub fn info(msg: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Info,
            msg: msg.into(),
        }
    }
}
