// ============================================================================
// MAP SERVICE - the operations behind the web front end
// ============================================================================
//
// One service owns one document behind a mutex: every mutation (patch
// append/removal, layer edits, state replacement, save) takes the lock, so
// concurrent request handlers cannot interleave writes. Image-service calls
// run without the lock held.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use image::RgbaImage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::compositor::Compositor;
use crate::document::MapDocument;
use crate::error::{MapError, MapResult, ReleaseWarning};
use crate::generator::{ImageGenerator, full_mask};
use crate::grid::{Cell, CellRect};
use crate::layers::{LayerId, LayerKind, TYPE_RANGE};
use crate::patch::{ImageRef, Patch};
use crate::settings::Settings;
use crate::storage::{DirStorage, ImageStorage, encode_png};
use crate::tiler::tile_region;
use crate::{log_err, log_info, log_warn};

/// URL prefix under which the web front end serves `patch_dir`.
pub const GENERATED_URL_PREFIX: &str = "/generated";

// -- Request / response bodies ----------------------------------------------

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GenerateBody {
    pub x: i64,
    pub y: i64,
    pub w: i64,
    pub h: i64,
    pub prompt: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct InpaintBody {
    pub x: i64,
    pub y: i64,
    pub w: i64,
    pub h: i64,
    #[serde(default)]
    pub prompt: Option<String>,
}

/// Region-only body used by delete and render.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct RegionBody {
    pub x: i64,
    pub y: i64,
    pub w: i64,
    pub h: i64,
}

#[derive(Clone, Debug, Deserialize)]
pub struct SetStateBody {
    pub data: Value,
}

#[derive(Clone, Debug, Serialize)]
pub struct PatchesResponse {
    pub patches: Vec<Patch>,
}

#[derive(Clone, Debug, Serialize)]
pub struct DeleteResponse {
    pub removed: Vec<String>,
    pub left: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

#[derive(Clone, Copy, Debug, Serialize)]
pub struct OkResponse {
    pub ok: bool,
}

/// Result of a region delete.
#[derive(Clone, Debug)]
pub struct DeleteOutcome {
    pub removed: Vec<Patch>,
    /// Patches still in the store.
    pub left: usize,
    /// Images that could not be released. The patches are gone regardless.
    pub warnings: Vec<ReleaseWarning>,
}

impl From<DeleteOutcome> for DeleteResponse {
    fn from(outcome: DeleteOutcome) -> Self {
        DeleteResponse {
            removed: outcome.removed.iter().map(|p| p.file().to_string()).collect(),
            left: outcome.left,
            warnings: outcome.warnings.iter().map(ToString::to_string).collect(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum FillMode {
    Generate,
    Inpaint,
}

// -- Service ----------------------------------------------------------------

pub struct MapService {
    doc: Mutex<MapDocument>,
    storage: Arc<dyn ImageStorage>,
    generator: Arc<dyn ImageGenerator>,
    state_path: Option<PathBuf>,
    gen_max_px: u32,
    inp_max_px: u32,
}

impl MapService {
    /// In-memory service with the default caps and no state file.
    pub fn new(doc: MapDocument, storage: Arc<dyn ImageStorage>, generator: Arc<dyn ImageGenerator>) -> Self {
        let defaults = Settings::default();
        Self {
            doc: Mutex::new(doc),
            storage,
            generator,
            state_path: None,
            gen_max_px: defaults.gen_max_px,
            inp_max_px: defaults.inp_max_px,
        }
    }

    /// Save the document to `path` after every mutation.
    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    /// Pixel caps for generate and inpaint requests.
    pub fn with_caps(mut self, gen_max_px: u32, inp_max_px: u32) -> Self {
        self.gen_max_px = gen_max_px.max(1);
        self.inp_max_px = inp_max_px.max(1);
        self
    }

    /// Service configured from `settings`: document loaded from
    /// `state_path` (or a fresh one), images kept under `patch_dir`.
    pub fn from_settings(settings: &Settings, generator: Arc<dyn ImageGenerator>) -> MapResult<Self> {
        let doc = match MapDocument::load(&settings.state_path)? {
            Some(doc) => doc,
            None => MapDocument::new(settings.tile_size, settings.grid_width, settings.grid_height),
        };
        let storage = DirStorage::new(&settings.patch_dir).with_url_prefix(GENERATED_URL_PREFIX);
        log_info!(
            "Service: {}x{} grid, tile {}, {} patches, state {}",
            doc.grid_width,
            doc.grid_height,
            doc.tile_size,
            doc.patches.len(),
            settings.state_path.display()
        );
        Ok(Self::new(doc, Arc::new(storage), generator)
            .with_state_path(&settings.state_path)
            .with_caps(settings.gen_max_px, settings.inp_max_px))
    }

    pub fn state_path(&self) -> Option<&Path> {
        self.state_path.as_deref()
    }

    pub fn storage(&self) -> &dyn ImageStorage {
        self.storage.as_ref()
    }

    fn lock(&self) -> MutexGuard<'_, MapDocument> {
        // A panicking writer leaves a fully formed document behind; keep serving it.
        self.doc.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, doc: &MapDocument) -> MapResult<()> {
        match &self.state_path {
            Some(path) => doc.save(path),
            None => Ok(()),
        }
    }

    /// Copy of the current document.
    pub fn snapshot(&self) -> MapDocument {
        self.lock().clone()
    }

    /// Run `f` with read access to the document.
    pub fn with_document<R>(&self, f: impl FnOnce(&MapDocument) -> R) -> R {
        f(&self.lock())
    }

    // -- generate / inpaint ----------------------------------------------------

    /// Fill a region with newly generated images, one patch per capped
    /// sub-rectangle, in row-major order.
    pub fn generate(&self, body: &GenerateBody) -> MapResult<PatchesResponse> {
        let patches = self.fill(FillMode::Generate, body.x, body.y, body.w, body.h, &body.prompt)?;
        Ok(PatchesResponse { patches })
    }

    /// Repaint a region from its current composite, one patch per capped
    /// sub-rectangle, in row-major order.
    pub fn inpaint(&self, body: &InpaintBody) -> MapResult<PatchesResponse> {
        let prompt = body.prompt.as_deref().unwrap_or("");
        let patches = self.fill(FillMode::Inpaint, body.x, body.y, body.w, body.h, prompt)?;
        Ok(PatchesResponse { patches })
    }

    /// Region and credentials are checked before anything happens. After
    /// that, each sub-rectangle is committed as soon as its image arrives; a
    /// failure stops the walk but keeps the patches already placed.
    fn fill(&self, mode: FillMode, x: i64, y: i64, w: i64, h: i64, prompt: &str) -> MapResult<Vec<Patch>> {
        let (region, tile_size) = {
            let doc = self.lock();
            (doc.region(x, y, w, h)?, doc.tile_size)
        };
        self.generator.check_configured()?;

        let cap_px = match mode {
            FillMode::Generate => self.gen_max_px,
            FillMode::Inpaint => self.inp_max_px,
        };
        let tiles = tile_region(region, tile_size, cap_px);
        let total = tiles.len();
        let mut placed = Vec::with_capacity(total);

        for (i, sub) in tiles.enumerate() {
            let (pw, ph) = sub.pixel_size(tile_size);
            let result = match mode {
                FillMode::Generate => {
                    log_info!("Generate {}x{} for {} ({}/{})", pw, ph, sub, i + 1, total);
                    self.generator.generate(pw, ph, prompt)
                }
                FillMode::Inpaint => {
                    let init = {
                        let doc = self.lock();
                        still_fits(&doc, sub, tile_size)?;
                        Compositor::new(tile_size, self.storage.as_ref()).render(&doc.patches, sub)?
                    };
                    log_info!("Inpaint {}x{} for {} ({}/{})", pw, ph, sub, i + 1, total);
                    self.generator.inpaint(&init, &full_mask(pw, ph), prompt)
                }
            };
            let image = match result {
                Ok(image) => image,
                Err(e) => {
                    log_err!(
                        "Fill of {} stopped at {} after {} of {} patches: {}",
                        region,
                        sub,
                        placed.len(),
                        total,
                        e
                    );
                    return Err(e.into());
                }
            };
            placed.push(self.place(image, sub, tile_size)?);
        }
        Ok(placed)
    }

    /// Store `image`, append it as a patch over `bounds`, and save. The
    /// document may have been replaced while the image was being made; if
    /// `bounds` no longer fits it, or the tile size changed, the image is
    /// released again and nothing is appended.
    fn place(&self, image: RgbaImage, bounds: CellRect, tile_size: u32) -> MapResult<Patch> {
        let stored = self.storage.store(&image, bounds)?;
        let mut patch = Patch::new(ImageRef::with_pixels(stored.key, image), bounds);
        patch.url = stored.url;

        let mut doc = self.lock();
        if let Err(e) = still_fits(&doc, bounds, tile_size) {
            drop(doc);
            log_err!("Dropping patch '{}': {}", patch.file(), e);
            if let Err(release) = self.storage.release(patch.file()) {
                log_warn!("{}", ReleaseWarning { file: patch.file().to_string(), reason: release.to_string() });
            }
            return Err(e);
        }
        doc.patches.append(patch.clone());
        log_info!("Placed patch '{}' at {} ({} total)", patch.file(), bounds, doc.patches.len());
        self.persist(&doc)?;
        Ok(patch)
    }

    // -- delete ---------------------------------------------------------------

    /// Remove every patch overlapping the region, then release their images.
    /// Release failures are logged and reported, never raised.
    pub fn delete(&self, body: &RegionBody) -> MapResult<DeleteOutcome> {
        let (removed, left) = {
            let mut doc = self.lock();
            let region = doc.region(body.x, body.y, body.w, body.h)?;
            let before = doc.patches.clone();
            let removed = doc.patches.remove_intersecting(&region);
            if let Err(e) = self.persist(&doc) {
                // Unsaved removals are undone so memory, file and images agree.
                doc.patches = before;
                log_err!("Delete of {} rolled back: {}", region, e);
                return Err(e);
            }
            log_info!("Deleted {} patches intersecting {}", removed.len(), region);
            (removed, doc.patches.len())
        };

        let mut warnings = Vec::new();
        for patch in &removed {
            if let Err(e) = self.storage.release(patch.file()) {
                let warning = ReleaseWarning {
                    file: patch.file().to_string(),
                    reason: e.to_string(),
                };
                log_warn!("Delete: {}", warning);
                warnings.push(warning);
            }
        }
        Ok(DeleteOutcome {
            removed,
            left,
            warnings,
        })
    }

    // -- render ---------------------------------------------------------------

    /// Composite of the region at the document's tile size.
    pub fn render(&self, body: &RegionBody) -> MapResult<RgbaImage> {
        let doc = self.lock();
        let region = doc.region(body.x, body.y, body.w, body.h)?;
        Compositor::new(doc.tile_size, self.storage.as_ref()).render(&doc.patches, region)
    }

    pub fn render_png(&self, body: &RegionBody) -> MapResult<Vec<u8>> {
        encode_png(&self.render(body)?)
    }

    // -- state ----------------------------------------------------------------

    pub fn get_state(&self) -> MapResult<Value> {
        self.lock().to_json_value()
    }

    /// Replace the whole document. Any known schema is accepted; the current
    /// one is what gets saved.
    pub fn set_state(&self, body: &SetStateBody) -> MapResult<OkResponse> {
        let new_doc = MapDocument::from_json_value(&body.data)?;
        for issue in new_doc.validate() {
            log_warn!("set-state: {}", issue);
        }
        let mut doc = self.lock();
        *doc = new_doc;
        self.persist(&doc)?;
        Ok(OkResponse { ok: true })
    }

    // -- layer edits ------------------------------------------------------------

    /// Set one cell of a sparse layer. Type codes outside the nominal range
    /// are stored but logged.
    pub fn set_cell(&self, layer: LayerId, x: i64, y: i64, value: u32) -> MapResult<()> {
        let mut doc = self.lock();
        let cell = checked_cell(&doc, x, y)?;
        if layer.kind() == LayerKind::Typed && !TYPE_RANGE.contains(&value) {
            log_warn!(
                "{} ({},{}) set to type {} outside {:?}",
                layer.name(),
                cell.x,
                cell.y,
                value,
                TYPE_RANGE
            );
        }
        doc.layers.set(layer, cell, value);
        self.persist(&doc)
    }

    pub fn unset_cell(&self, layer: LayerId, x: i64, y: i64) -> MapResult<()> {
        let mut doc = self.lock();
        let cell = checked_cell(&doc, x, y)?;
        doc.layers.unset(layer, cell);
        self.persist(&doc)
    }

    /// Write the document to the state file now.
    pub fn save(&self) -> MapResult<()> {
        let doc = self.lock();
        self.persist(&doc)
    }
}

/// `InvalidRegion` unless `bounds` still lies in `doc` at `tile_size`.
fn still_fits(doc: &MapDocument, bounds: CellRect, tile_size: u32) -> MapResult<()> {
    if doc.tile_size != tile_size {
        return Err(MapError::invalid_region(
            bounds,
            &format!("was requested at tile {} but the map now uses {}", tile_size, doc.tile_size),
        ));
    }
    if !bounds.fits_grid(doc.grid_width, doc.grid_height) {
        return Err(MapError::invalid_region(
            bounds,
            &format!("no longer fits the {}x{} grid", doc.grid_width, doc.grid_height),
        ));
    }
    Ok(())
}

fn checked_cell(doc: &MapDocument, x: i64, y: i64) -> MapResult<Cell> {
    let rect = doc.region(x, y, 1, 1)?;
    Ok(Cell::new(rect.x, rect.y))
}

impl std::fmt::Debug for MapService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapService")
            .field("state_path", &self.state_path)
            .field("gen_max_px", &self.gen_max_px)
            .field("inp_max_px", &self.inp_max_px)
            .finish_non_exhaustive()
    }
}
