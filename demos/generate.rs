//! Queue a prompt against a running Stable Diffusion UI server and save
//! the resulting images.
//!
//! ```sh
//! cargo run --example generate -- "a lighthouse at dusk" --total 4 --parallel 2 --out ./renders
//! ```

use anyhow::Context;
use clap::Parser;
use diffusion_queue::{FormConfig, RunnerConfig, RunnerEvent, TaskRunner, TaskStatus};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Generate images with a Stable Diffusion UI server")]
struct Args {
    prompt: String,

    /// Server URL. Falls back to SD_API_URL, then http://localhost:9000.
    #[arg(long)]
    endpoint: Option<String>,

    #[arg(long, default_value_t = 1)]
    total: i64,

    #[arg(long, default_value_t = 1)]
    parallel: i64,

    /// Fixed seed. A random one is drawn when omitted.
    #[arg(long)]
    seed: Option<i64>,

    #[arg(long, default_value_t = 50)]
    steps: i64,

    #[arg(long, default_value_t = 512)]
    width: i64,

    #[arg(long, default_value_t = 512)]
    height: i64,

    #[arg(long)]
    negative: Option<String>,

    #[arg(long, default_value = "renders")]
    out: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let mut config = RunnerConfig::from_env().context("reading SD_* environment")?;
    if let Some(endpoint) = args.endpoint {
        config.endpoint = endpoint;
    }

    let mut form = FormConfig::new(args.prompt)
        .with_outputs(args.total, args.parallel)
        .with_steps(args.steps)
        .with_size(args.width, args.height);
    if let Some(seed) = args.seed {
        form = form.with_seed(seed);
    }
    if let Some(negative) = args.negative {
        form = form.with_negative_prompt(negative);
    }

    std::fs::create_dir_all(&args.out)
        .with_context(|| format!("creating {}", args.out.display()))?;

    let runner = Arc::new(TaskRunner::connect(config));
    let mut events = runner.subscribe();
    runner.spawn();
    let task_id = runner.make_image(&form);
    println!("Queued task {}", task_id);

    let mut saved = 0usize;
    loop {
        match events.recv().await? {
            RunnerEvent::Progress { progress, .. } => {
                println!(
                    "  {:>3}%  ~{:.1}s left",
                    progress.percent,
                    progress.time_remaining_ms as f64 / 1000.0
                );
            }
            RunnerEvent::Image { image, .. } => {
                let ext = image
                    .mime_type()
                    .and_then(|m| m.strip_prefix("image/"))
                    .unwrap_or("png");
                let file = args.out.join(format!("{}_{}.{}", task_id, image.seed, ext));
                std::fs::write(&file, image.decode()?)
                    .with_context(|| format!("writing {}", file.display()))?;
                saved += 1;
                println!("Saved {}", file.display());
            }
            RunnerEvent::Message { message, .. } => eprintln!("{}", message.msg),
            RunnerEvent::TaskFinished {
                status,
                elapsed_ms,
                ..
            } => {
                println!(
                    "Task {} in {:.1}s, {} image(s) saved",
                    status.as_str(),
                    elapsed_ms as f64 / 1000.0,
                    saved
                );
                if status != TaskStatus::Completed {
                    std::process::exit(1);
                }
                break;
            }
            _ => {}
        }
    }

    Ok(())
}
