use image::ImageError;

use crate::grid::CellRect;

/// Errors surfaced by map operations.
#[derive(Debug)]
pub enum MapError {
    /// Region with a zero/negative extent, or one that leaves the grid.
    /// Always raised before any external call or store mutation.
    InvalidRegion(String),
    /// The image service has no credentials; nothing was attempted.
    NotConfigured(String),
    /// The image service rejected a generate call.
    Generation(String),
    /// The image service rejected an inpaint call.
    Inpaint(String),
    /// A patch references an image the storage backend cannot find.
    ResourceMissing(String),
    Io(std::io::Error),
    Image(ImageError),
    Json(serde_json::Error),
    InvalidFormat(String),
}

impl MapError {
    pub fn invalid_region(rect: CellRect, reason: &str) -> Self {
        MapError::InvalidRegion(format!("{} {}", rect, reason))
    }
}

impl std::fmt::Display for MapError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MapError::InvalidRegion(e) => write!(f, "Invalid region: {}", e),
            MapError::NotConfigured(e) => write!(f, "Image service not configured: {}", e),
            MapError::Generation(e) => write!(f, "Generate failed: {}", e),
            MapError::Inpaint(e) => write!(f, "Inpaint failed: {}", e),
            MapError::ResourceMissing(e) => write!(f, "Patch image not found: {}", e),
            MapError::Io(e) => write!(f, "I/O error: {}", e),
            MapError::Image(e) => write!(f, "Image error: {}", e),
            MapError::Json(e) => write!(f, "JSON error: {}", e),
            MapError::InvalidFormat(e) => write!(f, "Invalid format: {}", e),
        }
    }
}

impl std::error::Error for MapError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MapError::Io(e) => Some(e),
            MapError::Image(e) => Some(e),
            MapError::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for MapError {
    fn from(e: std::io::Error) -> Self {
        MapError::Io(e)
    }
}

impl From<ImageError> for MapError {
    fn from(e: ImageError) -> Self {
        MapError::Image(e)
    }
}

impl From<serde_json::Error> for MapError {
    fn from(e: serde_json::Error) -> Self {
        MapError::Json(e)
    }
}

/// A patch image that could not be released after its patch was removed.
/// Advisory only: the removal itself has already happened.
#[derive(Clone, Debug, PartialEq)]
pub struct ReleaseWarning {
    pub file: String,
    pub reason: String,
}

impl std::fmt::Display for ReleaseWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "could not release '{}': {}", self.file, self.reason)
    }
}

pub type MapResult<T> = Result<T, MapError>;
