// ============================================================================
// Patches - generated images placed on the map, kept in paint order
// ============================================================================

use std::sync::{Arc, OnceLock};

use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::error::MapResult;
use crate::grid::CellRect;
use crate::storage::ImageStorage;

/// Handle to a patch's pixels. Identity is the storage key; the decoded
/// bitmap is fetched from the storage backend on first use and shared by
/// every clone of the handle.
#[derive(Clone, Default)]
pub struct ImageRef {
    key: String,
    pixels: Arc<OnceLock<Arc<RgbaImage>>>,
}

impl ImageRef {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            pixels: Arc::new(OnceLock::new()),
        }
    }

    /// Handle whose pixels are already known (freshly generated images).
    pub fn with_pixels(key: impl Into<String>, pixels: RgbaImage) -> Self {
        let handle = Self::new(key);
        let _ = handle.pixels.set(Arc::new(pixels));
        handle
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn is_loaded(&self) -> bool {
        self.pixels.get().is_some()
    }

    /// Native-resolution pixels, loading them through `storage` once.
    pub fn pixels(&self, storage: &dyn ImageStorage) -> MapResult<Arc<RgbaImage>> {
        if let Some(img) = self.pixels.get() {
            return Ok(Arc::clone(img));
        }
        let loaded = Arc::new(storage.load(&self.key)?);
        // A racing loader may have won; either copy is the same image.
        let _ = self.pixels.set(Arc::clone(&loaded));
        Ok(self.pixels.get().cloned().unwrap_or(loaded))
    }
}

impl std::fmt::Debug for ImageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageRef")
            .field("key", &self.key)
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl PartialEq for ImageRef {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for ImageRef {}

impl From<String> for ImageRef {
    fn from(key: String) -> Self {
        ImageRef::new(key)
    }
}

impl From<ImageRef> for String {
    fn from(r: ImageRef) -> Self {
        r.key
    }
}

impl Serialize for ImageRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.key)
    }
}

impl<'de> Deserialize<'de> for ImageRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(ImageRef::new)
    }
}

/// One generated/inpainted image and the cells it covers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    #[serde(rename = "file")]
    pub image: ImageRef,
    /// Public address of the image for web clients.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(flatten)]
    pub bounds: CellRect,
}

impl Patch {
    pub fn new(image: ImageRef, bounds: CellRect) -> Self {
        Self {
            image,
            url: None,
            bounds,
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn file(&self) -> &str {
        self.image.key()
    }
}

/// Patches in insertion order. Later patches paint over earlier ones.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PatchStore {
    patches: Vec<Patch>,
}

impl PatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add to the top of the paint order. Overlaps are allowed.
    pub fn append(&mut self, patch: Patch) {
        self.patches.push(patch);
    }

    /// Every patch overlapping `region` with positive area, oldest first.
    pub fn query_intersecting(&self, region: &CellRect) -> Vec<&Patch> {
        self.patches
            .iter()
            .filter(|p| p.bounds.intersects(region))
            .collect()
    }

    /// Remove every patch overlapping `region`, keeping survivors in order.
    /// Releasing the removed images is up to the caller.
    pub fn remove_intersecting(&mut self, region: &CellRect) -> Vec<Patch> {
        let (removed, kept): (Vec<Patch>, Vec<Patch>) = std::mem::take(&mut self.patches)
            .into_iter()
            .partition(|p| p.bounds.intersects(region));
        self.patches = kept;
        removed
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Patch> {
        self.patches.iter()
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn clear(&mut self) {
        self.patches.clear();
    }

    pub fn as_slice(&self) -> &[Patch] {
        &self.patches
    }
}

impl FromIterator<Patch> for PatchStore {
    fn from_iter<I: IntoIterator<Item = Patch>>(iter: I) -> Self {
        Self {
            patches: iter.into_iter().collect(),
        }
    }
}
