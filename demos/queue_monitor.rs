//! Queue several prompts, watch the runner state, and cancel one while it
//! waits. Server liveness is probed in the background.
//!
//! ```sh
//! SD_API_URL=http://localhost:9000 cargo run --example queue_monitor
//! ```

use diffusion_queue::{FormConfig, RunnerConfig, TaskRunner};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runner = Arc::new(TaskRunner::connect(RunnerConfig::from_env()?));
    runner.spawn_health_monitor();

    for prompt in ["a foggy harbor", "a desert caravan", "a neon alley"] {
        runner.make_image(&FormConfig::new(prompt).with_outputs(2, 1));
    }

    // Newest first: the harbor prompt would run last, so drop it.
    if let Some(oldest) = runner.queued_tasks().last() {
        println!("Cancelling {:?} before it starts", oldest.prompt);
        runner.cancel(oldest.id).await;
    }

    let mut state = runner.watch_state();
    runner.spawn();

    loop {
        state.changed().await?;
        let snapshot = state.borrow_and_update().clone();
        println!(
            "server={:?} processing={} percent={:>3} queued={}",
            snapshot.server_status, snapshot.is_processing, snapshot.process_percent, snapshot.queued
        );
        if let Some(message) = &snapshot.message {
            eprintln!("  {}", message.msg);
        }
        if !snapshot.is_processing && snapshot.queued == 0 {
            break;
        }
    }

    println!("All tasks finished");
    Ok(())
}
