// ============================================================================
// Region tiling - split a request into generator-sized pieces
// ============================================================================

use crate::grid::CellRect;

/// Largest square window, in cells, whose pixel edge stays within `cap_px`.
/// Never less than one cell.
pub fn cap_cells(cap_px: u32, tile_size: u32) -> u32 {
    (cap_px / tile_size.max(1)).max(1)
}

/// Row-major walk of `cap x cap` windows over a rectangle. The last row and
/// column are clipped to the rectangle, so the windows partition it exactly.
#[derive(Clone, Debug)]
pub struct RegionTiles {
    region: CellRect,
    cap: u32,
    next_x: u32,
    next_y: u32,
}

impl RegionTiles {
    /// Tile `region` with windows of `cap` cells per edge.
    pub fn with_cap_cells(region: CellRect, cap: u32) -> Self {
        Self {
            region,
            cap: cap.max(1),
            next_x: region.x,
            next_y: region.y,
        }
    }

    /// Window edge in cells.
    pub fn cap(&self) -> u32 {
        self.cap
    }
}

impl Iterator for RegionTiles {
    type Item = CellRect;

    fn next(&mut self) -> Option<CellRect> {
        if self.region.is_empty() || self.next_y >= self.region.bottom() {
            return None;
        }
        let x = self.next_x;
        let y = self.next_y;
        let w = self.cap.min(self.region.right() - x);
        let h = self.cap.min(self.region.bottom() - y);

        self.next_x += self.cap;
        if self.next_x >= self.region.right() {
            self.next_x = self.region.x;
            self.next_y += self.cap;
        }
        Some(CellRect::new(x, y, w, h))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let n = self.len();
        (n, Some(n))
    }
}

impl ExactSizeIterator for RegionTiles {
    fn len(&self) -> usize {
        if self.region.is_empty() || self.next_y >= self.region.bottom() {
            return 0;
        }
        let per_row = self.region.w.div_ceil(self.cap) as usize;
        let rows_left = (self.region.bottom() - self.next_y).div_ceil(self.cap) as usize;
        let done_in_row = ((self.next_x - self.region.x) / self.cap) as usize;
        rows_left * per_row - done_in_row
    }
}

/// Split `region` into sub-rectangles no larger than `cap_px` pixels per edge
/// at `tile_size` pixels per cell.
pub fn tile_region(region: CellRect, tile_size: u32, cap_px: u32) -> RegionTiles {
    RegionTiles::with_cap_cells(region, cap_cells(cap_px, tile_size))
}
