//! Generation request body construction.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;

use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::form::{FormValue, GenerationConfig};

/// Random seeds are drawn from `0..RANDOM_SEED_LIMIT`.
pub const RANDOM_SEED_LIMIT: i64 = 10_000_000;

/// Total outputs above which streamed image previews are switched off.
pub const STREAM_IMAGE_PROGRESS_LIMIT: i64 = 50;

/// Sampler forced whenever an init image is attached.
pub const INIT_IMAGE_SAMPLER: &str = "ddim";

/// Model identifier sent when face correction is enabled.
pub const FACE_CORRECTION_MODEL: &str = "GFPGANv1.3";

fn image_regex() -> &'static Regex {
    static IMAGE_REGEX: OnceLock<Regex> = OnceLock::new();
    IMAGE_REGEX.get_or_init(|| {
        Regex::new(r"data:image/[A-Za-z]+;base64").expect("image data-URI pattern is valid")
    })
}

/// Whether `s` contains an embedded `data:image/<format>;base64` payload.
pub fn is_embedded_image(s: &str) -> bool {
    image_regex().is_match(s)
}

/// Body of `POST /image`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub session_id: i64,
    pub prompt: String,
    pub negative_prompt: String,
    /// Images per batch. `None` when the form value was not a number.
    pub num_outputs: Option<i64>,
    pub num_inference_steps: FormValue,
    pub guidance_scale: FormValue,
    pub width: FormValue,
    pub height: FormValue,
    pub allow_nsfw: bool,
    pub turbo: bool,
    pub use_cpu: bool,
    pub use_full_precision: bool,
    pub stream_progress_updates: bool,
    pub stream_image_progress: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub show_only_filtered_image: Option<bool>,
    /// Set per batch by the runner.
    pub seed: Option<i64>,
    pub sampler: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub init_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_strength: Option<FormValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub save_to_disk_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_face_correction: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub use_upscale: Option<String>,
}

/// A request plus the batching plan derived from the same settings.
#[derive(Debug, Clone, PartialEq)]
pub struct PreparedTask {
    pub request: GenerationRequest,
    /// Seed of the first batch.
    pub seed: Option<i64>,
    /// `ceil(total / parallel)`, or 0 when either count is unusable.
    pub batch_count: u32,
    pub num_outputs_total: Option<i64>,
}

impl PreparedTask {
    /// Seed for batch `index`: `seed + index * images_per_batch`.
    pub fn batch_seed(&self, index: u32) -> Option<i64> {
        let seed = self.seed?;
        let per_batch = self.request.num_outputs?;
        i64::from(index)
            .checked_mul(per_batch)
            .and_then(|offset| seed.checked_add(offset))
    }

    /// The request body for batch `index`, with its seed filled in.
    pub fn request_for_batch(&self, index: u32) -> GenerationRequest {
        let mut request = self.request.clone();
        request.seed = self.batch_seed(index);
        request
    }
}

/// Number of sequential batches needed for `total` images, `parallel` at a time.
pub fn batch_count(total: Option<i64>, parallel: Option<i64>) -> u32 {
    match (total, parallel) {
        (Some(total), Some(parallel)) if total > 0 && parallel > 0 => {
            let count = (total - 1) / parallel + 1;
            u32::try_from(count).unwrap_or(u32::MAX)
        }
        _ => 0,
    }
}

/// Resolve the starting seed: a random draw when `random_seed` is set,
/// otherwise the parsed seed field.
pub fn resolve_seed<R: Rng + ?Sized>(config: &GenerationConfig, rng: &mut R) -> Option<i64> {
    if config.random_seed {
        Some(rng.random_range(0..RANDOM_SEED_LIMIT))
    } else {
        config.seed.parse_int()
    }
}

/// Build a task from normalized settings, drawing a random seed if requested.
pub fn prepare(config: &GenerationConfig) -> PreparedTask {
    let seed = resolve_seed(config, &mut rand::rng());
    build(config, seed, next_session_id())
}

/// Build a task from normalized settings and an already resolved seed.
pub fn build(config: &GenerationConfig, seed: Option<i64>, session_id: i64) -> PreparedTask {
    let total = config.num_outputs_total.parse_int();
    let parallel = config.num_outputs_parallel.parse_int();

    let stream_image_progress = match total {
        Some(n) if n > STREAM_IMAGE_PROGRESS_LIMIT => false,
        _ => config.stream_image_progress,
    };

    let mut request = GenerationRequest {
        session_id,
        prompt: config.prompt.clone(),
        negative_prompt: config.negative_prompt.trim().to_string(),
        num_outputs: parallel,
        num_inference_steps: config.num_inference_steps.clone(),
        guidance_scale: config.guidance_scale.clone(),
        width: config.width.clone(),
        height: config.height.clone(),
        allow_nsfw: true,
        turbo: config.turbo,
        use_cpu: config.use_cpu,
        use_full_precision: config.use_full_precision,
        stream_progress_updates: true,
        stream_image_progress,
        show_only_filtered_image: config.show_only_filtered_image,
        seed,
        sampler: config.sampler.clone(),
        init_image: None,
        prompt_strength: None,
        save_to_disk_path: None,
        use_face_correction: None,
        use_upscale: None,
    };

    if is_embedded_image(&config.init_image) {
        request.init_image = Some(config.init_image.clone());
        request.prompt_strength = Some(config.prompt_strength.clone());
        request.sampler = INIT_IMAGE_SAMPLER.to_string();
    }

    if config.save_to_disk {
        request.save_to_disk_path = config.disk_path.clone();
    }

    if config.use_face_correction {
        request.use_face_correction = Some(FACE_CORRECTION_MODEL.to_string());
    }

    if config.use_upscaling {
        request.use_upscale = Some(config.upscale_model.clone());
    }

    PreparedTask {
        request,
        seed,
        batch_count: batch_count(total, parallel),
        num_outputs_total: total,
    }
}

/// Millisecond timestamp used as the session/task id, strictly increasing
/// within the process.
pub fn next_session_id() -> i64 {
    static LAST: AtomicI64 = AtomicI64::new(0);
    let now = chrono::Utc::now().timestamp_millis();
    let mut last = LAST.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST.compare_exchange_weak(last, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}
