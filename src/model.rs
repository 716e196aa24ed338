use crate::error::{StudioError, StudioResult};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub const MIN_DIMENSION: u32 = 256;
pub const MAX_DIMENSION: u32 = 2048;
pub const DIMENSION_STEP: u32 = 64;
pub const DEFAULT_DENOISE_STRENGTH: f32 = 0.75;
pub const MIN_LORA_WEIGHT: f32 = -1.0;
pub const MAX_LORA_WEIGHT: f32 = 2.0;

#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub enum Scheduler {
    #[default]
    #[serde(rename = "DDIM")]
    Ddim,
    #[serde(rename = "DPMSolverMultistep")]
    DpmSolverMultistep,
    #[serde(rename = "EulerDiscrete")]
    Euler,
    #[serde(rename = "EulerAncestralDiscrete")]
    EulerAncestral,
    #[serde(rename = "PNDM")]
    Pndm,
    #[serde(rename = "LMSDiscrete")]
    Lms,
    #[serde(rename = "HeunDiscrete")]
    Heun,
    #[serde(rename = "UniPCMultistep")]
    UniPc,
}

impl Scheduler {
    pub fn all() -> &'static [Scheduler] {
        use Scheduler::*;
        &[
            Ddim,
            DpmSolverMultistep,
            Euler,
            EulerAncestral,
            Pndm,
            Lms,
            Heun,
            UniPc,
        ]
    }

    /// Identifier understood by the inference service.
    pub const fn identifier(self) -> &'static str {
        match self {
            Scheduler::Ddim => "DDIM",
            Scheduler::DpmSolverMultistep => "DPMSolverMultistep",
            Scheduler::Euler => "EulerDiscrete",
            Scheduler::EulerAncestral => "EulerAncestralDiscrete",
            Scheduler::Pndm => "PNDM",
            Scheduler::Lms => "LMSDiscrete",
            Scheduler::Heun => "HeunDiscrete",
            Scheduler::UniPc => "UniPCMultistep",
        }
    }

    pub fn from_identifier(id: &str) -> Option<Self> {
        Self::all()
            .iter()
            .copied()
            .find(|scheduler| scheduler.identifier().eq_ignore_ascii_case(id.trim()))
    }
}

impl std::fmt::Display for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.identifier())
    }
}

impl FromStr for Scheduler {
    type Err = StudioError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scheduler::from_identifier(s)
            .ok_or_else(|| StudioError::validation(format!("unknown scheduler `{s}`")))
    }
}

/// Everything the user entered for one generation request.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationParameters {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance_scale: f32,
    pub image_count: u32,
    /// `None` lets the service pick a random seed.
    pub seed: Option<i64>,
    pub scheduler: Scheduler,
    pub denoise_strength: Option<f32>,
    /// Encoded source image for image-to-image runs.
    pub input_image: Option<Vec<u8>>,
    pub disable_nsfw_filter: bool,
    pub clip_skip: Option<u8>,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            negative_prompt: String::new(),
            width: 512,
            height: 512,
            steps: 30,
            guidance_scale: 7.5,
            image_count: 1,
            seed: None,
            scheduler: Scheduler::default(),
            denoise_strength: None,
            input_image: None,
            disable_nsfw_filter: false,
            clip_skip: None,
        }
    }
}

impl GenerationParameters {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_size(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    pub fn with_steps(mut self, steps: u32) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_guidance(mut self, guidance_scale: f32) -> Self {
        self.guidance_scale = guidance_scale;
        self
    }

    pub fn with_image_count(mut self, image_count: u32) -> Self {
        self.image_count = image_count;
        self
    }

    pub fn with_seed(mut self, seed: Option<i64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_input_image(mut self, bytes: Vec<u8>, strength: Option<f32>) -> Self {
        self.input_image = Some(bytes);
        self.denoise_strength = strength;
        self
    }

    pub fn validate(&self) -> StudioResult<()> {
        if self.prompt.trim().is_empty() {
            return Err(StudioError::validation("Please enter a prompt"));
        }
        for (label, value) in [("width", self.width), ("height", self.height)] {
            if !(MIN_DIMENSION..=MAX_DIMENSION).contains(&value) || value % DIMENSION_STEP != 0 {
                return Err(StudioError::validation(format!(
                    "{label} must be a multiple of {DIMENSION_STEP} between {MIN_DIMENSION} and {MAX_DIMENSION}, got {value}"
                )));
            }
        }
        if self.steps == 0 {
            return Err(StudioError::validation("steps must be at least 1"));
        }
        if !self.guidance_scale.is_finite() || self.guidance_scale < 0.0 {
            return Err(StudioError::validation("guidance scale must not be negative"));
        }
        if self.image_count == 0 {
            return Err(StudioError::validation("at least one image must be requested"));
        }
        if let Some(strength) = self.denoise_strength {
            if !(0.0..=1.0).contains(&strength) {
                return Err(StudioError::validation(format!(
                    "denoise strength must be within 0..=1, got {strength}"
                )));
            }
        }
        Ok(())
    }

    /// Builds the wire payload. Image-to-image fields are only present when
    /// an input image is attached.
    pub fn to_request(&self, loras: Vec<LoraWeight>) -> GenerateRequest {
        let (input_image, denoise_strength) = match &self.input_image {
            Some(bytes) => (
                Some(STANDARD.encode(bytes)),
                Some(self.denoise_strength.unwrap_or(DEFAULT_DENOISE_STRENGTH)),
            ),
            None => (None, None),
        };

        GenerateRequest {
            prompt: self.prompt.clone(),
            negative_prompt: self.negative_prompt.clone(),
            width: self.width,
            height: self.height,
            num_inference_steps: self.steps,
            guidance_scale: self.guidance_scale,
            num_images: self.image_count,
            seed: self.seed,
            scheduler: Some(self.scheduler),
            denoise_strength,
            input_image,
            disable_nsfw_filter: self.disable_nsfw_filter,
            clip_skip: self.clip_skip,
            loras,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GenerateRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub num_images: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduler: Option<Scheduler>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub denoise_strength: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_image: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub disable_nsfw_filter: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clip_skip: Option<u8>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub loras: Vec<LoraWeight>,
}

#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub struct LoraWeight {
    pub id: i64,
    pub weight: f32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct GenerateResponse {
    pub success: bool,
    #[serde(default)]
    pub images: Vec<ImagePayload>,
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ImagePayload {
    pub filename: String,
    #[serde(default)]
    pub path: String,
    pub base64: String,
}

impl GenerateResponse {
    /// Decodes every image or none: a single malformed payload fails the batch.
    pub fn into_images(self) -> StudioResult<Vec<GeneratedImage>> {
        if !self.success {
            return Err(StudioError::PartialData(
                "service reported an unsuccessful generation".to_string(),
            ));
        }
        self.images
            .into_iter()
            .map(GeneratedImage::try_from)
            .collect()
    }
}

/// A realized image. Immutable once created.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeneratedImage {
    filename: String,
    path: String,
    bytes: Vec<u8>,
}

impl GeneratedImage {
    pub fn new(filename: impl Into<String>, path: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            path: path.into(),
            bytes,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl TryFrom<ImagePayload> for GeneratedImage {
    type Error = StudioError;

    fn try_from(payload: ImagePayload) -> Result<Self, Self::Error> {
        let bytes = STANDARD.decode(payload.base64.trim()).map_err(|err| {
            StudioError::PartialData(format!(
                "image {} is not valid base64: {err}",
                payload.filename
            ))
        })?;
        Ok(GeneratedImage::new(payload.filename, payload.path, bytes))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct ModelInfo {
    pub key: String,
    pub name: String,
    #[serde(rename = "type")]
    pub model_type: String,
    #[serde(default)]
    pub loaded: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ModelList {
    pub models: Vec<ModelInfo>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct CurrentModel {
    #[serde(default)]
    pub loaded: bool,
    #[serde(default)]
    pub key: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoadModelResponse {
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DeviceMemory {
    pub total_gb: f64,
    pub allocated_gb: f64,
    #[serde(default)]
    pub reserved_gb: f64,
    #[serde(default)]
    pub free_gb: f64,
    pub utilization_percent: f64,
}

/// Snapshot reported by `GET /gpu/info`. Read-only on the client.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub available: bool,
    #[serde(default)]
    pub device: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub memory: Option<DeviceMemory>,
    #[serde(default)]
    pub compute_capability: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl DeviceStatus {
    pub fn summary(&self) -> String {
        match (self.available, &self.memory) {
            (true, Some(mem)) => format!(
                "{} VRAM {:.1}GB / {:.1}GB ({:.0}%)",
                self.name.as_deref().unwrap_or("GPU"),
                mem.allocated_gb,
                mem.total_gb,
                mem.utilization_percent
            ),
            (true, None) => self.name.clone().unwrap_or_else(|| "GPU".to_string()),
            (false, _) => "No GPU".to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct Lora {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub file_path: String,
    pub model_type: String,
    #[serde(default)]
    pub trigger_words: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub weight: f32,
    #[serde(default)]
    pub is_active: bool,
}

#[derive(Clone, Debug, Deserialize)]
pub struct LoraList {
    pub loras: Vec<Lora>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct NewLora {
    pub name: String,
    pub file_path: String,
    pub model_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_words: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub weight: f32,
}

/// Partial edit of a registered adapter. Unset fields are left as they are.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LoraUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_words: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub weight: Option<f32>,
}

impl LoraUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.trigger_words.is_none()
            && self.description.is_none()
            && self.weight.is_none()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct LoraActivation {
    pub is_active: bool,
    pub weight: f32,
}

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub id: i64,
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    pub model_key: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance_scale: f32,
    #[serde(default)]
    pub seed: Option<i64>,
    pub file_path: String,
    #[serde(default)]
    pub thumbnail_path: Option<String>,
    pub created_at: String,
    #[serde(default)]
    pub metadata: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct HistoryPage {
    pub generations: Vec<HistoryEntry>,
    #[serde(default)]
    pub count: usize,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
pub struct GenerationStats {
    #[serde(default)]
    pub total_generations: u64,
    #[serde(default)]
    pub models_used: u64,
    #[serde(default)]
    pub avg_steps: f64,
    #[serde(default)]
    pub avg_guidance: f64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct StudioStats {
    pub stats: GenerationStats,
    pub gpu: DeviceStatus,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Health {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub version: Option<String>,
}

/// Generic acknowledgement body (`{"success": true, "message": ...}`).
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Ack {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
}
