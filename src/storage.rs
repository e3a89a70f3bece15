// ============================================================================
// Patch image storage backends
// ============================================================================

use std::collections::HashMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use image::{ImageFormat, ImageOutputFormat, RgbaImage};
use uuid::Uuid;

use crate::error::{MapError, MapResult};
use crate::grid::CellRect;

/// Where a freshly stored image ended up.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredImage {
    pub key: String,
    pub url: Option<String>,
}

/// Backend that owns patch pixels. Keys are opaque to everything else.
pub trait ImageStorage: Send + Sync {
    /// Decode the image behind `key` at its native resolution.
    fn load(&self, key: &str) -> MapResult<RgbaImage>;

    /// Persist a new patch image covering `bounds`.
    fn store(&self, image: &RgbaImage, bounds: CellRect) -> MapResult<StoredImage>;

    /// Drop the image behind `key`. Callers treat failures as advisory.
    fn release(&self, key: &str) -> MapResult<()>;
}

/// Encode to PNG bytes.
pub fn encode_png(image: &RgbaImage) -> MapResult<Vec<u8>> {
    let mut bytes = Vec::new();
    image.write_to(&mut Cursor::new(&mut bytes), ImageOutputFormat::Png)?;
    Ok(bytes)
}

/// Decode any supported format into RGBA.
pub fn decode_image(bytes: &[u8]) -> MapResult<RgbaImage> {
    Ok(image::load_from_memory(bytes)?.to_rgba8())
}

fn patch_file_name(bounds: CellRect) -> String {
    format!(
        "patch_{}_{}_{}_{}_{}.png",
        Uuid::new_v4().simple(),
        bounds.x,
        bounds.y,
        bounds.w,
        bounds.h
    )
}

// -- Local directory ------------------------------------------------------

/// PNG files in one directory. Keys are file paths; keys that no longer
/// resolve as given (maps moved between machines) are looked up by file name
/// inside the directory.
#[derive(Clone, Debug)]
pub struct DirStorage {
    root: PathBuf,
    url_prefix: Option<String>,
}

impl DirStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            url_prefix: None,
        }
    }

    /// Also record a public URL (`{prefix}/{file name}`) for stored images.
    pub fn with_url_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.url_prefix = Some(prefix.into().trim_end_matches('/').to_string());
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, key: &str) -> PathBuf {
        let given = PathBuf::from(key);
        if given.exists() {
            return given;
        }
        match given.file_name() {
            Some(name) => self.root.join(name),
            None => given,
        }
    }
}

impl ImageStorage for DirStorage {
    fn load(&self, key: &str) -> MapResult<RgbaImage> {
        let path = self.resolve(key);
        if !path.exists() {
            return Err(MapError::ResourceMissing(key.to_string()));
        }
        Ok(image::open(&path)?.to_rgba8())
    }

    fn store(&self, image: &RgbaImage, bounds: CellRect) -> MapResult<StoredImage> {
        std::fs::create_dir_all(&self.root)?;
        let name = patch_file_name(bounds);
        let path = self.root.join(&name);
        image.save_with_format(&path, ImageFormat::Png)?;
        Ok(StoredImage {
            key: path.to_string_lossy().into_owned(),
            url: self.url_prefix.as_ref().map(|p| format!("{}/{}", p, name)),
        })
    }

    fn release(&self, key: &str) -> MapResult<()> {
        let path = self.resolve(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MapError::Io(e)),
        }
    }
}

// -- In-memory ------------------------------------------------------------

/// Images held in a map. Used by tests and by callers that persist pixels
/// elsewhere. Releasing an unknown key is reported as missing.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    images: Mutex<HashMap<String, RgbaImage>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: impl Into<String>, image: RgbaImage) {
        if let Ok(mut images) = self.images.lock() {
            images.insert(key.into(), image);
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.images.lock().map(|m| m.contains_key(key)).unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.images.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> MapError {
    MapError::Io(std::io::Error::other("memory storage lock poisoned"))
}

impl ImageStorage for MemoryStorage {
    fn load(&self, key: &str) -> MapResult<RgbaImage> {
        let images = self.images.lock().map_err(|_| poisoned())?;
        images
            .get(key)
            .cloned()
            .ok_or_else(|| MapError::ResourceMissing(key.to_string()))
    }

    fn store(&self, image: &RgbaImage, bounds: CellRect) -> MapResult<StoredImage> {
        let key = patch_file_name(bounds);
        self.images
            .lock()
            .map_err(|_| poisoned())?
            .insert(key.clone(), image.clone());
        Ok(StoredImage { key, url: None })
    }

    fn release(&self, key: &str) -> MapResult<()> {
        match self.images.lock().map_err(|_| poisoned())?.remove(key) {
            Some(_) => Ok(()),
            None => Err(MapError::ResourceMissing(key.to_string())),
        }
    }
}
