use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::QueueOrder;
use crate::request::PreparedTask;
use crate::types::TaskStatus;

/// Task identity: the request's millisecond session id.
pub type TaskId = i64;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One submitted generation request, possibly spanning several batches.
///
/// Shared between the queue, the runner and callers; the counters and
/// flags are updated in place while the task runs.
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    prepared: PreparedTask,
    stopped: AtomicBool,
    is_processing: AtomicBool,
    batches_done: AtomicU32,
    status: Mutex<TaskStatus>,
    created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(prepared: PreparedTask) -> Self {
        Self {
            id: prepared.request.session_id,
            prepared,
            stopped: AtomicBool::new(false),
            is_processing: AtomicBool::new(false),
            batches_done: AtomicU32::new(0),
            status: Mutex::new(TaskStatus::Enqueued),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn prepared(&self) -> &PreparedTask {
        &self.prepared
    }

    pub fn batch_count(&self) -> u32 {
        self.prepared.batch_count
    }

    pub fn batches_done(&self) -> u32 {
        self.batches_done.load(Ordering::SeqCst)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> TaskStatus {
        *lock(&self.status)
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Request a stop. Observed by the runner between batches only.
    pub fn cancel(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.is_processing.store(false, Ordering::SeqCst);
    }

    pub(crate) fn mark_running(&self) {
        self.is_processing.store(true, Ordering::SeqCst);
        *lock(&self.status) = TaskStatus::Running;
    }

    /// Count a finished batch. Returns the new total.
    pub(crate) fn finish_batch(&self) -> u32 {
        self.batches_done.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub(crate) fn finish(&self, status: TaskStatus) {
        self.is_processing.store(false, Ordering::SeqCst);
        *lock(&self.status) = status;
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            id: self.id,
            prompt: self.prepared.request.prompt.clone(),
            seed: self.prepared.seed,
            batch_count: self.batch_count(),
            batches_done: self.batches_done(),
            status: self.status(),
            created_at: self.created_at.to_rfc3339(),
        }
    }
}

/// Serializable view of a task for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub prompt: String,
    pub seed: Option<i64>,
    pub batch_count: u32,
    pub batches_done: u32,
    pub status: TaskStatus,
    pub created_at: String,
}

/// In-memory task queue with a single running slot.
///
/// New tasks are inserted at the front. [`QueueOrder::NewestFirst`] takes
/// from the front as well, so the latest submission runs next;
/// [`QueueOrder::OldestFirst`] takes from the back.
#[derive(Debug, Default)]
pub struct TaskQueue {
    order: QueueOrder,
    pending: Mutex<VecDeque<Arc<Task>>>,
    running: Mutex<Option<Arc<Task>>>,
}

impl TaskQueue {
    pub fn new(order: QueueOrder) -> Self {
        Self {
            order,
            pending: Mutex::new(VecDeque::new()),
            running: Mutex::new(None),
        }
    }

    pub fn order(&self) -> QueueOrder {
        self.order
    }

    /// Insert a task at the front. Returns the number of waiting tasks.
    pub fn enqueue(&self, task: Arc<Task>) -> usize {
        let mut pending = lock(&self.pending);
        pending.push_front(task);
        pending.len()
    }

    /// Move the next task into the running slot.
    ///
    /// Returns `None` when nothing is waiting or a task is already running.
    pub fn take_next(&self) -> Option<Arc<Task>> {
        let mut running = lock(&self.running);
        if running.is_some() {
            return None;
        }

        let task = {
            let mut pending = lock(&self.pending);
            match self.order {
                QueueOrder::NewestFirst => pending.pop_front(),
                QueueOrder::OldestFirst => pending.pop_back(),
            }
        }?;

        task.mark_running();
        *running = Some(Arc::clone(&task));
        Some(task)
    }

    /// Clear the running slot, returning the task that occupied it.
    pub fn finish_current(&self) -> Option<Arc<Task>> {
        lock(&self.running).take()
    }

    /// Remove a waiting task by id. Running tasks are not affected.
    pub fn remove(&self, id: TaskId) -> Option<Arc<Task>> {
        let mut pending = lock(&self.pending);
        let idx = pending.iter().position(|t| t.id() == id)?;
        pending.remove(idx)
    }

    pub fn running(&self) -> Option<Arc<Task>> {
        lock(&self.running).clone()
    }

    /// Look up a waiting or running task.
    pub fn get(&self, id: TaskId) -> Option<Arc<Task>> {
        if let Some(task) = self.running().filter(|t| t.id() == id) {
            return Some(task);
        }
        lock(&self.pending).iter().find(|t| t.id() == id).cloned()
    }

    /// Number of waiting tasks (the running one excluded).
    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Waiting tasks in the order they will run.
    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        let pending = lock(&self.pending);
        let snapshots = pending.iter().map(|t| t.snapshot());
        match self.order {
            QueueOrder::NewestFirst => snapshots.collect(),
            QueueOrder::OldestFirst => {
                let mut all: Vec<_> = snapshots.collect();
                all.reverse();
                all
            }
        }
    }
}
