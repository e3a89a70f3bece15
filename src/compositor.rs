// ============================================================================
// Compositor - flatten the patches under a region into one bitmap
// ============================================================================

use image::imageops::{self, FilterType};
use image::{Rgba, RgbaImage};
use rayon::prelude::*;

use crate::error::{MapError, MapResult};
use crate::grid::CellRect;
use crate::patch::{Patch, PatchStore};
use crate::storage::ImageStorage;
use crate::log_warn;

/// Filter used when a stored bitmap is not already `w*tile x h*tile`.
/// Generated tiles are routinely upscaled, so this must be a smooth filter.
pub const RESAMPLE_FILTER: FilterType = FilterType::Triangle;

/// One patch, resampled and cropped to its overlap with the render region.
struct Layer {
    /// Top-left offset inside the output, in pixels.
    dst_x: u32,
    dst_y: u32,
    pixels: RgbaImage,
}

/// Renders regions of a patch store at a fixed tile size.
pub struct Compositor<'a> {
    tile_size: u32,
    storage: &'a dyn ImageStorage,
}

impl<'a> Compositor<'a> {
    pub fn new(tile_size: u32, storage: &'a dyn ImageStorage) -> Self {
        Self {
            tile_size: tile_size.max(1),
            storage,
        }
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    /// Render `region` to a `w*tile x h*tile` bitmap. Patches are painted
    /// oldest first with source-over blending; uncovered pixels stay fully
    /// transparent. Patches whose image has gone missing are skipped.
    pub fn render(&self, patches: &PatchStore, region: CellRect) -> MapResult<RgbaImage> {
        let (out_w, out_h) = region.pixel_size(self.tile_size);
        let mut out = RgbaImage::new(out_w, out_h);
        if region.is_empty() {
            return Ok(out);
        }

        let hits = patches.query_intersecting(&region);

        // Decode + resample in parallel; `collect` keeps insertion order.
        let prepared: Vec<MapResult<Option<Layer>>> = hits
            .par_iter()
            .map(|patch| self.prepare(patch, region))
            .collect();

        for layer in prepared {
            if let Some(layer) = layer? {
                paint_over(&mut out, &layer);
            }
        }
        Ok(out)
    }

    fn prepare(&self, patch: &Patch, region: CellRect) -> MapResult<Option<Layer>> {
        let Some(overlap) = patch.bounds.intersection(&region) else {
            return Ok(None);
        };
        let native = match patch.image.pixels(self.storage) {
            Ok(img) => img,
            Err(MapError::ResourceMissing(key)) => {
                log_warn!("Compositor: skipping patch {} with missing image '{}'", patch.bounds, key);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let tile = self.tile_size;
        let (crop_w, crop_h) = overlap.pixel_size(tile);
        let (native_w, native_h) = native.dimensions();
        if native_w == 0 || native_h == 0 {
            return Ok(None);
        }
        let off_x = overlap.x - patch.bounds.x;
        let off_y = overlap.y - patch.bounds.y;

        // Only the overlapping part of the source is ever resampled, so the
        // cost follows the render region, not the patch's declared size.
        let full = (patch.bounds.w as u64 * tile as u64, patch.bounds.h as u64 * tile as u64);
        let pixels = if (native_w as u64, native_h as u64) == full {
            imageops::crop_imm(&*native, off_x * tile, off_y * tile, crop_w, crop_h).to_image()
        } else {
            let (sx, sw) = source_span(off_x, overlap.w, patch.bounds.w, native_w);
            let (sy, sh) = source_span(off_y, overlap.h, patch.bounds.h, native_h);
            let source = imageops::crop_imm(&*native, sx, sy, sw, sh).to_image();
            if source.dimensions() == (crop_w, crop_h) {
                source
            } else {
                imageops::resize(&source, crop_w, crop_h, RESAMPLE_FILTER)
            }
        };

        Ok(Some(Layer {
            dst_x: (overlap.x - region.x) * tile,
            dst_y: (overlap.y - region.y) * tile,
            pixels,
        }))
    }
}

/// Native pixel span `(start, len)` behind cells `offset..offset + count` of a
/// patch `cells` wide whose bitmap is `native` pixels wide. Never empty.
fn source_span(offset: u32, count: u32, cells: u32, native: u32) -> (u32, u32) {
    let cells = cells.max(1) as u64;
    let native64 = native as u64;
    let start = (offset as u64 * native64 / cells).min(native64 - 1);
    let end = ((offset as u64 + count as u64) * native64).div_ceil(cells).clamp(start + 1, native64);
    (start as u32, (end - start) as u32)
}

fn paint_over(out: &mut RgbaImage, layer: &Layer) {
    let (w, h) = layer.pixels.dimensions();
    for ly in 0..h {
        for lx in 0..w {
            let (x, y) = (layer.dst_x + lx, layer.dst_y + ly);
            if x >= out.width() || y >= out.height() {
                continue;
            }
            let top = *layer.pixels.get_pixel(lx, ly);
            let base = *out.get_pixel(x, y);
            out.put_pixel(x, y, blend_over(base, top));
        }
    }
}

/// Straight-alpha source-over.
pub fn blend_over(base: Rgba<u8>, top: Rgba<u8>) -> Rgba<u8> {
    if top[3] == 0 {
        return base;
    }
    if top[3] == 255 || base[3] == 0 {
        return top;
    }

    let top_a = top[3] as f32 / 255.0;
    let base_a = base[3] as f32 / 255.0;
    let out_a = top_a + base_a * (1.0 - top_a);

    let channel = |i: usize| {
        let t = top[i] as f32 / 255.0;
        let b = base[i] as f32 / 255.0;
        let v = (t * top_a + b * base_a * (1.0 - top_a)) / out_a;
        (v * 255.0).round().clamp(0.0, 255.0) as u8
    };

    Rgba([
        channel(0),
        channel(1),
        channel(2),
        (out_a * 255.0).round().clamp(0.0, 255.0) as u8,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::ImageRef;
    use crate::storage::MemoryStorage;

    const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
    const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);
    const CLEAR: Rgba<u8> = Rgba([0, 0, 0, 0]);

    fn solid(storage: &MemoryStorage, key: &str, w: u32, h: u32, color: Rgba<u8>) -> ImageRef {
        storage.insert(key, RgbaImage::from_pixel(w, h, color));
        ImageRef::new(key)
    }

    #[test]
    fn test_later_patch_wins_overlap() {
        let storage = MemoryStorage::new();
        let mut store = PatchStore::new();
        store.append(Patch::new(solid(&storage, "p1", 8, 8, RED), CellRect::new(0, 0, 2, 2)));
        store.append(Patch::new(solid(&storage, "p2", 8, 8, BLUE), CellRect::new(1, 1, 2, 2)));

        let img = Compositor::new(4, &storage).render(&store, CellRect::new(0, 0, 3, 3)).unwrap();
        assert_eq!(img.dimensions(), (12, 12));
        assert_eq!(*img.get_pixel(1, 1), RED); // cell (0,0): P1 only
        assert_eq!(*img.get_pixel(5, 5), BLUE); // cell (1,1): both, P2 on top
        assert_eq!(*img.get_pixel(9, 9), BLUE); // cell (2,2): P2 only
        assert_eq!(*img.get_pixel(9, 1), CLEAR); // cell (2,0): nothing
    }

    #[test]
    fn test_unaligned_region_crops_patch() {
        let storage = MemoryStorage::new();
        let mut quadrants = RgbaImage::new(4, 4);
        for (x, y, px) in quadrants.enumerate_pixels_mut() {
            *px = Rgba([(x * 60) as u8, (y * 60) as u8, 0, 255]);
        }
        storage.insert("q", quadrants.clone());
        let mut store = PatchStore::new();
        store.append(Patch::new(ImageRef::new("q"), CellRect::new(2, 2, 2, 2)));

        // Region covers cells (3,3)..(4,4); only the patch's bottom-right cell overlaps.
        let img = Compositor::new(2, &storage).render(&store, CellRect::new(3, 3, 2, 2)).unwrap();
        assert_eq!(img.dimensions(), (4, 4));
        assert_eq!(*img.get_pixel(0, 0), *quadrants.get_pixel(2, 2));
        assert_eq!(*img.get_pixel(1, 1), *quadrants.get_pixel(3, 3));
        assert_eq!(*img.get_pixel(2, 2), CLEAR);
    }

    #[test]
    fn test_native_resolution_is_resampled() {
        let storage = MemoryStorage::new();
        let mut store = PatchStore::new();
        // 3x3 source stretched over a 2x1-cell patch at 8px tiles -> 16x8.
        store.append(Patch::new(solid(&storage, "small", 3, 3, BLUE), CellRect::new(0, 0, 2, 1)));

        let img = Compositor::new(8, &storage).render(&store, CellRect::new(0, 0, 2, 1)).unwrap();
        assert_eq!(img.dimensions(), (16, 8));
        assert!(img.pixels().all(|p| *p == BLUE));
    }

    #[test]
    fn test_oversized_patch_only_resamples_overlap() {
        let storage = MemoryStorage::new();
        let mut store = PatchStore::new();
        store.append(Patch::new(solid(&storage, "huge", 4, 4, RED), CellRect::new(0, 0, 100_000, 100_000)));

        let img = Compositor::new(32, &storage).render(&store, CellRect::new(0, 0, 1, 1)).unwrap();
        assert_eq!(img.dimensions(), (32, 32));
        assert!(img.pixels().all(|p| *p == RED));
    }

    #[test]
    fn test_low_res_patch_crops_before_resampling() {
        let storage = MemoryStorage::new();
        let mut quadrants = RgbaImage::new(2, 2);
        quadrants.put_pixel(0, 0, RED);
        quadrants.put_pixel(1, 0, BLUE);
        quadrants.put_pixel(0, 1, BLUE);
        quadrants.put_pixel(1, 1, Rgba([0, 255, 0, 255]));
        storage.insert("q", quadrants);
        let mut store = PatchStore::new();
        store.append(Patch::new(ImageRef::new("q"), CellRect::new(0, 0, 2, 2)));

        let img = Compositor::new(4, &storage).render(&store, CellRect::new(1, 1, 1, 1)).unwrap();
        assert!(img.pixels().all(|p| *p == Rgba([0, 255, 0, 255])));
        let img = Compositor::new(4, &storage).render(&store, CellRect::new(0, 0, 1, 1)).unwrap();
        assert!(img.pixels().all(|p| *p == RED));
    }

    #[test]
    fn test_source_span() {
        assert_eq!(source_span(0, 2, 2, 3), (0, 3));
        assert_eq!(source_span(1, 1, 2, 2), (1, 1));
        assert_eq!(source_span(0, 1, 100_000, 4), (0, 1));
        assert_eq!(source_span(99_999, 1, 100_000, 4), (3, 1));
    }

    #[test]
    fn test_render_is_repeatable() {
        let storage = MemoryStorage::new();
        let mut store = PatchStore::new();
        let mut gradient = RgbaImage::new(5, 7);
        for (x, y, px) in gradient.enumerate_pixels_mut() {
            *px = Rgba([(x * 40) as u8, (y * 30) as u8, 90, 200]);
        }
        storage.insert("g", gradient);
        store.append(Patch::new(solid(&storage, "base", 4, 4, RED), CellRect::new(0, 0, 4, 4)));
        store.append(Patch::new(ImageRef::new("g"), CellRect::new(1, 0, 2, 3)));

        let compositor = Compositor::new(4, &storage);
        let region = CellRect::new(1, 1, 3, 2);
        let first = compositor.render(&store, region).unwrap();
        let second = compositor.render(&store, region).unwrap();
        assert_eq!(first, second);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_missing_image_is_skipped() {
        let storage = MemoryStorage::new();
        let mut store = PatchStore::new();
        store.append(Patch::new(ImageRef::new("gone"), CellRect::new(0, 0, 1, 1)));
        store.append(Patch::new(solid(&storage, "here", 2, 2, RED), CellRect::new(1, 0, 1, 1)));

        let img = Compositor::new(2, &storage).render(&store, CellRect::new(0, 0, 2, 1)).unwrap();
        assert_eq!(*img.get_pixel(0, 0), CLEAR);
        assert_eq!(*img.get_pixel(2, 0), RED);
    }

    #[test]
    fn test_blend_over() {
        assert_eq!(blend_over(RED, CLEAR), RED);
        assert_eq!(blend_over(RED, BLUE), BLUE);
        assert_eq!(blend_over(CLEAR, Rgba([9, 9, 9, 100])), Rgba([9, 9, 9, 100]));

        let half_blue = Rgba([0, 0, 255, 128]);
        let mixed = blend_over(RED, half_blue);
        assert_eq!(mixed[3], 255);
        assert!(mixed[0] > 120 && mixed[0] < 135);
        assert!(mixed[2] > 120 && mixed[2] < 135);
    }
}
