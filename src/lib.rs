//! # diffusion-queue
//!
//! Client-side generation queue for Stable Diffusion UI servers.
//!
//! ## Features
//!
//! - Form normalization with the UI's defaults
//! - Request building (init image, face correction, upscaling, disk save)
//! - Incremental parsing of the streamed `POST /image` response
//! - Single-worker task queue, newest task first by default
//! - Multi-batch tasks with per-batch seeds and cooperative cancellation
//! - Progress via broadcast events and a watchable state snapshot
//! - Server liveness probing
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use diffusion_queue::{FormConfig, RunnerConfig, RunnerEvent, TaskRunner};
//!
//! # async fn example() -> diffusion_queue::Result<()> {
//! let runner = Arc::new(TaskRunner::connect(RunnerConfig::from_env()?));
//! let mut events = runner.subscribe();
//! runner.spawn();
//!
//! runner.make_image(&FormConfig::new("a lighthouse at dusk").with_outputs(2, 1));
//!
//! while let Ok(event) = events.recv().await {
//!     match event {
//!         RunnerEvent::Progress { progress, .. } => println!("{}%", progress.percent),
//!         RunnerEvent::Idle => break,
//!         _ => {}
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod form;
pub mod queue;
pub mod request;
pub mod runner;
pub mod session;
pub mod stream;
pub mod types;

pub use client::SdClient;
pub use config::{QueueOrder, RunnerConfig, RunnerConfigBuilder};
pub use error::{Result, SdError};
pub use events::{RunnerEvent, RunnerState};
pub use form::{FormConfig, FormValue, GenerationConfig};
pub use queue::{Task, TaskId, TaskQueue, TaskSnapshot};
pub use request::{GenerationRequest, PreparedTask};
pub use runner::TaskRunner;
pub use session::{SessionStatus, UserSession};
pub use stream::StreamParser;
pub use types::{
    GeneratedImage, GenerationOutput, MessageKind, ProgressUpdate, ServerStatus, StatusMessage,
    TaskStatus,
};

use std::future::Future;

/// The service that actually renders a batch.
///
/// [`SdClient`] talks to a real server; tests and alternative transports
/// implement this directly.
pub trait GenerationBackend: Send + Sync + 'static {
    /// Run one batch of `request`, calling `on_progress` for each progress
    /// fragment. `batches_done`/`batch_count` describe the owning task.
    fn run_batch<F>(
        &self,
        request: &GenerationRequest,
        batches_done: u32,
        batch_count: u32,
        on_progress: F,
    ) -> impl Future<Output = Result<GenerationOutput>> + Send
    where
        F: FnMut(ProgressUpdate) + Send;

    /// Ask the service to abort the batch in flight. Best effort.
    fn request_stop(&self) -> impl Future<Output = Result<()>> + Send;

    fn check_health(&self) -> impl Future<Output = ServerStatus> + Send {
        async { ServerStatus::Online }
    }
}
