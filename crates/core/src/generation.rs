//! Generation request configuration and validation.
//!
//! [`GenerationConfig`] carries everything one dispatch call needs. The
//! precondition checks here run before any network call so that invalid
//! input never reaches the backend.

use serde::Serialize;

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Default output width in pixels.
pub const DEFAULT_WIDTH: u32 = 1024;
/// Default output height in pixels.
pub const DEFAULT_HEIGHT: u32 = 1024;
/// Default number of denoising steps.
pub const DEFAULT_STEPS: u32 = 28;
/// Default classifier-free guidance scale.
pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Parameters for one batched generation request.
///
/// The effective number of requested images is
/// `batch_size * inference_count` (see [`requested_count`](Self::requested_count)).
#[derive(Debug, Clone, Serialize)]
pub struct GenerationConfig {
    /// Positive prompt. Must not be empty.
    pub prompt: String,
    /// Negative prompt. May be empty.
    pub negative_prompt: String,
    /// Output width in pixels.
    pub width: u32,
    /// Output height in pixels.
    pub height: u32,
    /// Number of denoising steps.
    pub steps: u32,
    /// Classifier-free guidance scale.
    pub guidance_scale: f64,
    /// Fixed seed, or `None` to let the backend pick one per image.
    pub seed: Option<u64>,
    /// Images generated per inference call. Must be >= 1.
    pub batch_size: u32,
    /// Number of inference calls. Must be >= 1.
    pub inference_count: u32,
}

impl GenerationConfig {
    /// Create a config with the given prompt and the usual defaults for
    /// everything else (one image, random seed).
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: String::new(),
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            steps: DEFAULT_STEPS,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
            seed: None,
            batch_size: 1,
            inference_count: 1,
        }
    }

    /// Total number of images this config requests.
    pub fn requested_count(&self) -> usize {
        (self.batch_size as usize) * (self.inference_count as usize)
    }

    /// Check all dispatch preconditions.
    ///
    /// Rules:
    /// - The prompt must not be empty (whitespace-only counts as empty).
    /// - Width and height must be positive.
    /// - Step count must be positive.
    /// - Batch size and inference count must each be >= 1.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.prompt.trim().is_empty() {
            return Err(CoreError::Validation(
                "Prompt must not be empty".to_string(),
            ));
        }
        if self.width == 0 || self.height == 0 {
            return Err(CoreError::Validation(format!(
                "Dimensions must be positive, got {}x{}",
                self.width, self.height
            )));
        }
        if self.steps == 0 {
            return Err(CoreError::Validation(
                "Step count must be positive".to_string(),
            ));
        }
        if self.batch_size == 0 {
            return Err(CoreError::Validation(
                "Batch size must be at least 1".to_string(),
            ));
        }
        if self.inference_count == 0 {
            return Err(CoreError::Validation(
                "Inference count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}
