//! Form-shaped generation settings and default filling.
//!
//! The UI hands over whatever its inputs currently hold, which is mostly
//! text. [`FormConfig`] mirrors that sparse shape (field names match the
//! UI's camelCase keys) and [`normalize`] fills every unset field with its
//! default, producing a [`GenerationConfig`].

use serde::{Deserialize, Serialize};

pub const DEFAULT_SEED: i64 = 1;
pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;
pub const DEFAULT_INFERENCE_STEPS: i64 = 50;
pub const DEFAULT_DIMENSION: i64 = 512;
pub const DEFAULT_PROMPT_STRENGTH: i64 = 80;
pub const DEFAULT_SAMPLER: &str = "plms";
pub const DEFAULT_UPSCALE_MODEL: &str = "RealESRGAN_x4plus";

/// A numeric form input as the UI delivered it.
///
/// Values are passed through to the server untouched; only the seed and
/// output counts are parsed, using [`FormValue::parse_int`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FormValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl FormValue {
    /// Parse the leading integer the way form inputs are read: skip leading
    /// whitespace, accept an optional sign, keep the longest run of digits.
    /// Returns `None` when there is no number to read.
    pub fn parse_int(&self) -> Option<i64> {
        match self {
            FormValue::Int(n) => Some(*n),
            FormValue::Float(f) if f.is_finite() => Some(f.trunc() as i64),
            FormValue::Float(_) => None,
            FormValue::Text(s) => parse_int_prefix(s),
        }
    }
}

impl From<i64> for FormValue {
    fn from(n: i64) -> Self {
        FormValue::Int(n)
    }
}

impl From<f64> for FormValue {
    fn from(f: f64) -> Self {
        FormValue::Float(f)
    }
}

impl From<&str> for FormValue {
    fn from(s: &str) -> Self {
        FormValue::Text(s.to_string())
    }
}

impl From<String> for FormValue {
    fn from(s: String) -> Self {
        FormValue::Text(s)
    }
}

fn parse_int_prefix(s: &str) -> Option<i64> {
    let s = s.trim_start();
    let (negative, rest) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    let digits_end = rest
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(rest.len());
    if digits_end == 0 {
        return None;
    }
    let value: i64 = rest[..digits_end].parse().ok()?;
    Some(if negative { -value } else { value })
}

/// Sparse settings as read from the generation form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FormConfig {
    #[serde(rename = "randomSeed", default)]
    pub random_seed: Option<bool>,
    #[serde(rename = "seedField", default)]
    pub seed: Option<FormValue>,
    #[serde(rename = "numOutputsTotalField", default)]
    pub num_outputs_total: Option<FormValue>,
    #[serde(rename = "numOutputsParallelField", default)]
    pub num_outputs_parallel: Option<FormValue>,
    #[serde(rename = "streamImageProgressField", default)]
    pub stream_image_progress: Option<bool>,
    #[serde(rename = "promptField", default)]
    pub prompt: Option<String>,
    #[serde(rename = "negativePromptField", default)]
    pub negative_prompt: Option<String>,
    #[serde(rename = "guidanceScaleField", default)]
    pub guidance_scale: Option<FormValue>,
    #[serde(rename = "numInferenceStepsField", default)]
    pub num_inference_steps: Option<FormValue>,
    #[serde(rename = "widthField", default)]
    pub width: Option<FormValue>,
    #[serde(rename = "heightField", default)]
    pub height: Option<FormValue>,
    #[serde(rename = "turboField", default)]
    pub turbo: Option<bool>,
    #[serde(rename = "useCPUField", default)]
    pub use_cpu: Option<bool>,
    #[serde(rename = "useFullPrecisionField", default)]
    pub use_full_precision: Option<bool>,
    #[serde(rename = "showOnlyFilteredImageField", default)]
    pub show_only_filtered_image: Option<bool>,
    #[serde(rename = "initImagePreview", default)]
    pub init_image: Option<String>,
    #[serde(rename = "promptStrengthField", default)]
    pub prompt_strength: Option<FormValue>,
    #[serde(rename = "samplerField", default)]
    pub sampler: Option<String>,
    #[serde(rename = "saveToDisk", default)]
    pub save_to_disk: Option<bool>,
    #[serde(rename = "diskPathField", default)]
    pub disk_path: Option<String>,
    #[serde(rename = "useFaceCorrectionField", default)]
    pub use_face_correction: Option<bool>,
    #[serde(rename = "useUpscalingField", default)]
    pub use_upscaling: Option<bool>,
    #[serde(rename = "upscaleModelField", default)]
    pub upscale_model: Option<String>,
}

impl FormConfig {
    /// Start from a prompt with everything else unset.
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Self::default()
        }
    }

    /// Use a fixed seed instead of a random one.
    pub fn with_seed(mut self, seed: impl Into<FormValue>) -> Self {
        self.random_seed = Some(false);
        self.seed = Some(seed.into());
        self
    }

    /// Set the total number of images and how many to render per batch.
    pub fn with_outputs(mut self, total: impl Into<FormValue>, parallel: impl Into<FormValue>) -> Self {
        self.num_outputs_total = Some(total.into());
        self.num_outputs_parallel = Some(parallel.into());
        self
    }

    pub fn with_negative_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.negative_prompt = Some(prompt.into());
        self
    }

    pub fn with_size(mut self, width: impl Into<FormValue>, height: impl Into<FormValue>) -> Self {
        self.width = Some(width.into());
        self.height = Some(height.into());
        self
    }

    pub fn with_steps(mut self, steps: impl Into<FormValue>) -> Self {
        self.num_inference_steps = Some(steps.into());
        self
    }

    pub fn with_sampler(mut self, sampler: impl Into<String>) -> Self {
        self.sampler = Some(sampler.into());
        self
    }

    /// Attach an init image (a `data:image/...;base64,...` URI) and its strength.
    pub fn with_init_image(mut self, data_uri: impl Into<String>, strength: impl Into<FormValue>) -> Self {
        self.init_image = Some(data_uri.into());
        self.prompt_strength = Some(strength.into());
        self
    }

    pub fn with_disk_path(mut self, path: impl Into<String>) -> Self {
        self.save_to_disk = Some(true);
        self.disk_path = Some(path.into());
        self
    }

    pub fn with_face_correction(mut self, enabled: bool) -> Self {
        self.use_face_correction = Some(enabled);
        self
    }

    pub fn with_upscaling(mut self, model: impl Into<String>) -> Self {
        self.use_upscaling = Some(true);
        self.upscale_model = Some(model.into());
        self
    }
}

/// Fully populated generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationConfig {
    pub random_seed: bool,
    pub seed: FormValue,
    pub num_outputs_total: FormValue,
    pub num_outputs_parallel: FormValue,
    pub stream_image_progress: bool,
    pub prompt: String,
    pub negative_prompt: String,
    pub guidance_scale: FormValue,
    pub num_inference_steps: FormValue,
    pub width: FormValue,
    pub height: FormValue,
    pub turbo: bool,
    pub use_cpu: bool,
    pub use_full_precision: bool,
    pub show_only_filtered_image: Option<bool>,
    pub init_image: String,
    pub prompt_strength: FormValue,
    pub sampler: String,
    pub save_to_disk: bool,
    pub disk_path: Option<String>,
    pub use_face_correction: bool,
    pub use_upscaling: bool,
    pub upscale_model: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        normalize(&FormConfig::default())
    }
}

/// Fill unset form fields with their defaults. Pure; never fails.
pub fn normalize(form: &FormConfig) -> GenerationConfig {
    GenerationConfig {
        random_seed: form.random_seed.unwrap_or(true),
        seed: form.seed.clone().unwrap_or(FormValue::Int(DEFAULT_SEED)),
        num_outputs_total: form.num_outputs_total.clone().unwrap_or(FormValue::Int(1)),
        num_outputs_parallel: form.num_outputs_parallel.clone().unwrap_or(FormValue::Int(1)),
        stream_image_progress: form.stream_image_progress.unwrap_or(false),
        prompt: form.prompt.clone().unwrap_or_default(),
        negative_prompt: form.negative_prompt.clone().unwrap_or_default(),
        guidance_scale: form
            .guidance_scale
            .clone()
            .unwrap_or(FormValue::Float(DEFAULT_GUIDANCE_SCALE)),
        num_inference_steps: form
            .num_inference_steps
            .clone()
            .unwrap_or(FormValue::Int(DEFAULT_INFERENCE_STEPS)),
        width: form.width.clone().unwrap_or(FormValue::Int(DEFAULT_DIMENSION)),
        height: form.height.clone().unwrap_or(FormValue::Int(DEFAULT_DIMENSION)),
        turbo: form.turbo.unwrap_or(true),
        use_cpu: form.use_cpu.unwrap_or(false),
        use_full_precision: form.use_full_precision.unwrap_or(false),
        show_only_filtered_image: form.show_only_filtered_image,
        init_image: form.init_image.clone().unwrap_or_default(),
        prompt_strength: form
            .prompt_strength
            .clone()
            .unwrap_or(FormValue::Int(DEFAULT_PROMPT_STRENGTH)),
        sampler: form
            .sampler
            .clone()
            .unwrap_or_else(|| DEFAULT_SAMPLER.to_string()),
        save_to_disk: form.save_to_disk.unwrap_or(false),
        disk_path: form.disk_path.clone(),
        use_face_correction: form.use_face_correction.unwrap_or(false),
        use_upscaling: form.use_upscaling.unwrap_or(false),
        upscale_model: form
            .upscale_model
            .clone()
            .unwrap_or_else(|| DEFAULT_UPSCALE_MODEL.to_string()),
    }
}
