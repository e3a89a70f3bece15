// ============================================================================
// Image service contract - generate and inpaint calls made by the service
// ============================================================================
//
// The HTTP client for the upstream image API lives outside this crate. The
// service only sees this trait, so any backend (remote API, local model,
// test double) can be plugged in.

use image::{Rgba, RgbaImage};

use crate::error::MapError;

/// Errors reported by an image backend.
#[derive(Debug, Clone, PartialEq)]
pub enum GeneratorError {
    /// Credentials are missing; no request was sent.
    NotConfigured(String),
    /// Non-success response to a generate request.
    Generation(String),
    /// Non-success response to an inpaint request.
    Inpaint(String),
}

impl std::fmt::Display for GeneratorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GeneratorError::NotConfigured(e) => write!(f, "not configured: {}", e),
            GeneratorError::Generation(e) => write!(f, "generate failed: {}", e),
            GeneratorError::Inpaint(e) => write!(f, "inpaint failed: {}", e),
        }
    }
}

impl std::error::Error for GeneratorError {}

impl From<GeneratorError> for MapError {
    fn from(e: GeneratorError) -> Self {
        match e {
            GeneratorError::NotConfigured(msg) => MapError::NotConfigured(msg),
            GeneratorError::Generation(msg) => MapError::Generation(msg),
            GeneratorError::Inpaint(msg) => MapError::Inpaint(msg),
        }
    }
}

/// Backend that turns prompts (and optionally an existing image) into
/// bitmaps. Calls may block for a network round trip; timeouts and retries
/// are the backend's business.
pub trait ImageGenerator: Send + Sync {
    /// `Err(NotConfigured)` when the backend cannot make calls at all.
    /// Checked before any work starts.
    fn check_configured(&self) -> Result<(), GeneratorError> {
        Ok(())
    }

    /// A new `width x height` image for `prompt`.
    fn generate(&self, width: u32, height: u32, prompt: &str) -> Result<RgbaImage, GeneratorError>;

    /// Repaint the areas of `init` selected by `mask` (opaque white = repaint).
    fn inpaint(&self, init: &RgbaImage, mask: &RgbaImage, prompt: &str) -> Result<RgbaImage, GeneratorError>;
}

/// Placeholder backend used when no credentials are available.
#[derive(Clone, Debug)]
pub struct Unconfigured {
    pub hint: String,
}

impl Default for Unconfigured {
    fn default() -> Self {
        Self {
            hint: "set PIXELAB_API_KEY in .env at project root".to_string(),
        }
    }
}

impl ImageGenerator for Unconfigured {
    fn check_configured(&self) -> Result<(), GeneratorError> {
        Err(GeneratorError::NotConfigured(self.hint.clone()))
    }

    fn generate(&self, _width: u32, _height: u32, _prompt: &str) -> Result<RgbaImage, GeneratorError> {
        Err(GeneratorError::NotConfigured(self.hint.clone()))
    }

    fn inpaint(&self, _init: &RgbaImage, _mask: &RgbaImage, _prompt: &str) -> Result<RgbaImage, GeneratorError> {
        Err(GeneratorError::NotConfigured(self.hint.clone()))
    }
}

/// Mask that selects every pixel of a `width x height` image.
pub fn full_mask(width: u32, height: u32) -> RgbaImage {
    RgbaImage::from_pixel(width, height, Rgba([255, 255, 255, 255]))
}
