use serde::{Deserialize, Serialize};

use crate::queue::TaskId;
use crate::types::{GeneratedImage, ProgressUpdate, ServerStatus, StatusMessage, TaskStatus};

/// Everything the runner reports while draining the queue.
///
/// Serialized with a `type` tag so a presentation layer can forward
/// events verbatim (e.g. `{"type":"progress","taskId":..,"progress":{..}}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RunnerEvent {
    /// A task was added; `queued` is the number of waiting tasks.
    TaskQueued {
        task_id: TaskId,
        batch_count: u32,
        queued: usize,
    },

    TaskStarted {
        task_id: TaskId,
        batch_count: u32,
    },

    /// A batch request is about to be sent.
    BatchStarted {
        task_id: TaskId,
        batch: u32,
        seed: Option<i64>,
    },

    Progress {
        task_id: TaskId,
        progress: ProgressUpdate,
    },

    /// A finished image, also published as the current preview result.
    Image {
        task_id: TaskId,
        image: GeneratedImage,
    },

    /// Entries of a batch's output that were unreadable and skipped.
    InvalidImage {
        task_id: TaskId,
        skipped: usize,
    },

    Message {
        task_id: Option<TaskId>,
        message: StatusMessage,
    },

    TaskFinished {
        task_id: TaskId,
        status: TaskStatus,
        successful_batches: u32,
        batches_done: u32,
        elapsed_ms: u64,
    },

    /// The queue drained and the runner is waiting for work.
    Idle,

    ServerStatus {
        status: ServerStatus,
    },
}

/// Latest runner state, for callers that poll instead of subscribing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunnerState {
    /// Data URI of the most recent image.
    pub result: Option<String>,
    pub process_percent: u8,
    pub is_processing: bool,
    pub message: Option<StatusMessage>,
    pub server_status: ServerStatus,
    /// Waiting tasks, the running one excluded.
    pub queued: usize,
    pub current_task: Option<TaskId>,
}
