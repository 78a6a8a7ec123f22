use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::client::SdClient;
use crate::config::{RunnerConfig, DEFAULT_HEALTH_PING_INTERVAL};
use crate::events::{RunnerEvent, RunnerState};
use crate::form::{self, FormConfig};
use crate::queue::{Task, TaskId, TaskQueue, TaskSnapshot};
use crate::request::{self, PreparedTask};
use crate::types::{ProgressUpdate, ServerStatus, StatusMessage, TaskStatus};
use crate::GenerationBackend;

/// Single-worker executor that drains the [`TaskQueue`].
///
/// One task runs at a time. Its batches run sequentially and a stop request
/// is honoured only between batches. Progress is published both as
/// [`RunnerEvent`]s on a broadcast channel and as a [`RunnerState`] snapshot
/// on a watch channel.
pub struct TaskRunner<B> {
    backend: Arc<B>,
    config: RunnerConfig,
    queue: TaskQueue,
    wake: Notify,
    events: broadcast::Sender<RunnerEvent>,
    state: watch::Sender<RunnerState>,
}

impl TaskRunner<SdClient> {
    /// Runner backed by an [`SdClient`] for `config.endpoint`.
    pub fn connect(config: RunnerConfig) -> Self {
        let client = SdClient::new(config.endpoint.clone())
            .with_request_timeout(config.request_timeout);
        Self::new(client, config)
    }
}

impl<B: GenerationBackend> TaskRunner<B> {
    pub fn new(backend: B, config: RunnerConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (state, _) = watch::channel(RunnerState::default());
        Self {
            backend: Arc::new(backend),
            queue: TaskQueue::new(config.queue_order),
            config,
            wake: Notify::new(),
            events,
            state,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    // ── Submission ──────────────────────────────────────────────────

    /// Normalize the form, build the request and enqueue it.
    pub fn make_image(&self, form: &FormConfig) -> TaskId {
        let config = form::normalize(form);
        self.enqueue(request::prepare(&config))
    }

    /// Enqueue an already built task and wake the drain loop.
    pub fn enqueue(&self, prepared: PreparedTask) -> TaskId {
        let task = Arc::new(Task::new(prepared));
        let task_id = task.id();
        let batch_count = task.batch_count();

        let queued = self.queue.enqueue(task);
        self.sync_queued();
        debug!(task_id, batch_count, queued, "task queued");
        self.emit(RunnerEvent::TaskQueued {
            task_id,
            batch_count,
            queued,
        });

        self.wake.notify_one();
        task_id
    }

    // ── Cancellation ────────────────────────────────────────────────

    /// Stop the running task after its current batch and ask the server to
    /// abort. Returns the id of the task that was asked to stop.
    pub async fn stop_task(&self) -> Option<TaskId> {
        let task = self.queue.running()?;
        task.cancel();
        info!(task_id = task.id(), "stop requested");
        self.emit(RunnerEvent::Message {
            task_id: Some(task.id()),
            message: StatusMessage::info("Stopping after the current batch"),
        });

        if let Err(e) = self.backend.request_stop().await {
            warn!(task_id = task.id(), error = %e, "remote stop request failed");
        }
        Some(task.id())
    }

    /// Cancel a task by id.
    ///
    /// A waiting task is removed without any network call. The running
    /// task is stopped as in [`stop_task`](Self::stop_task). Returns `false`
    /// for unknown ids.
    pub async fn cancel(&self, task_id: TaskId) -> bool {
        if let Some(task) = self.queue.remove(task_id) {
            task.cancel();
            task.finish(TaskStatus::Cancelled);
            self.sync_queued();
            info!(task_id, "queued task cancelled");
            self.emit(RunnerEvent::TaskFinished {
                task_id,
                status: TaskStatus::Cancelled,
                successful_batches: 0,
                batches_done: 0,
                elapsed_ms: 0,
            });
            return true;
        }

        match self.queue.running() {
            Some(task) if task.id() == task_id => self.stop_task().await.is_some(),
            _ => false,
        }
    }

    // ── Inspection ──────────────────────────────────────────────────

    /// Waiting tasks in the order they will run.
    pub fn queued_tasks(&self) -> Vec<TaskSnapshot> {
        self.queue.snapshot()
    }

    pub fn current_task(&self) -> Option<TaskSnapshot> {
        self.queue.running().map(|t| t.snapshot())
    }

    pub fn state(&self) -> RunnerState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<RunnerState> {
        self.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RunnerEvent> {
        self.events.subscribe()
    }

    /// Resolve once nothing is running and nothing is waiting.
    pub async fn wait_idle(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx
            .wait_for(|s| !s.is_processing && s.queued == 0)
            .await;
    }

    // ── Execution ───────────────────────────────────────────────────

    /// Spawn the drain loop as a background tokio task.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let runner = Arc::clone(self);
        tokio::spawn(async move { runner.run().await })
    }

    /// Spawn a task that probes the server every `health_ping_interval`
    /// and publishes liveness changes. A zero interval uses the default.
    pub fn spawn_health_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let runner = Arc::clone(self);
        let period = match runner.config.health_ping_interval {
            p if p.is_zero() => DEFAULT_HEALTH_PING_INTERVAL,
            p => p,
        };
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let status = runner.backend.check_health().await;
                runner.record_server_status(status);
            }
        })
    }

    /// Record an observed server status, emitting an event when it changes.
    pub fn record_server_status(&self, status: ServerStatus) {
        let changed = self.state.send_if_modified(|s| {
            if s.server_status == status {
                return false;
            }
            s.server_status = status;
            true
        });
        if changed {
            info!(?status, "{}", status.message());
            self.emit(RunnerEvent::ServerStatus { status });
        }
    }

    /// Drain the queue forever, one task at a time.
    ///
    /// When the queue is empty an [`RunnerEvent::Idle`] is published once
    /// and the loop sleeps until the next enqueue.
    pub async fn run(&self) {
        let mut idle_reported = false;
        loop {
            match self.queue.take_next() {
                Some(task) => {
                    idle_reported = false;
                    self.process_task(task).await;
                }
                None => {
                    if !idle_reported {
                        debug!("queue drained");
                        self.emit(RunnerEvent::Idle);
                        idle_reported = true;
                    }
                    self.wake.notified().await;
                }
            }
        }
    }

    async fn process_task(&self, task: Arc<Task>) {
        let started = Instant::now();
        let task_id = task.id();
        let batch_count = task.batch_count();

        self.state.send_modify(|s| {
            s.is_processing = true;
            s.process_percent = 0;
            s.current_task = Some(task_id);
            s.message = None;
            s.queued = self.queue.len();
        });
        info!(task_id, batch_count, "task started");
        self.emit(RunnerEvent::TaskStarted {
            task_id,
            batch_count,
        });

        let mut successful_batches = 0u32;
        let mut any_failed = false;

        for batch in 0..batch_count {
            if task.is_stopped() {
                break;
            }

            let request = task.prepared().request_for_batch(batch);
            debug!(task_id, batch, seed = ?request.seed, "batch started");
            self.emit(RunnerEvent::BatchStarted {
                task_id,
                batch,
                seed: request.seed,
            });

            let events = self.events.clone();
            let state = &self.state;
            let on_progress = move |progress: ProgressUpdate| {
                state.send_modify(|s| s.process_percent = progress.percent);
                let _ = events.send(RunnerEvent::Progress { task_id, progress });
            };

            match self
                .backend
                .run_batch(&request, task.batches_done(), batch_count, on_progress)
                .await
            {
                Ok(output) => {
                    successful_batches += 1;
                    if output.invalid_entries > 0 {
                        warn!(task_id, batch, skipped = output.invalid_entries, "invalid image entries skipped");
                        self.emit(RunnerEvent::InvalidImage {
                            task_id,
                            skipped: output.invalid_entries,
                        });
                    }
                    for image in output.images {
                        self.state
                            .send_modify(|s| s.result = Some(image.data.clone()));
                        self.emit(RunnerEvent::Image { task_id, image });
                    }
                }
                Err(e) => {
                    any_failed = true;
                    error!(task_id, batch, error = %e, "batch failed");
                    let message = StatusMessage::error(e.to_string());
                    self.state.send_modify(|s| {
                        s.process_percent = 0;
                        s.message = Some(message.clone());
                    });
                    self.emit(RunnerEvent::Message {
                        task_id: Some(task_id),
                        message,
                    });
                }
            }

            task.finish_batch();
        }

        // A stop that lands during the last batch skipped nothing.
        let skipped_batches = task.batches_done() < batch_count;
        let status = if task.is_stopped() && skipped_batches {
            TaskStatus::Cancelled
        } else if any_failed {
            TaskStatus::Errored
        } else {
            TaskStatus::Completed
        };
        task.finish(status);
        self.queue.finish_current();

        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.state.send_modify(|s| {
            s.is_processing = false;
            s.current_task = None;
            s.queued = self.queue.len();
        });
        info!(
            task_id,
            status = status.as_str(),
            successful_batches,
            elapsed_ms,
            "task finished"
        );
        self.emit(RunnerEvent::TaskFinished {
            task_id,
            status,
            successful_batches,
            batches_done: task.batches_done(),
            elapsed_ms,
        });
    }

    fn sync_queued(&self) {
        self.state.send_modify(|s| s.queued = self.queue.len());
    }

    fn emit(&self, event: RunnerEvent) {
        // Err only means nobody is subscribed.
        let _ = self.events.send(event);
    }
}
