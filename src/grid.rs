// ============================================================================
// Grid coordinates - cells, cell rectangles, screen <-> cell transforms
// ============================================================================

use serde::{Deserialize, Serialize};

use crate::error::{MapError, MapResult};

/// Smallest zoom used when inverting the view transform.
const MIN_ZOOM: f32 = 1e-6;

/// One grid cell. Orders lexicographically by `(x, y)`, which is the
/// persisted order of every layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Cell {
    pub x: u32,
    pub y: u32,
}

impl Cell {
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

impl From<(u32, u32)> for Cell {
    fn from((x, y): (u32, u32)) -> Self {
        Self { x, y }
    }
}

/// Axis-aligned rectangle in cell units. `x, y` is the top-left cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellRect {
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
}

impl CellRect {
    pub const fn new(x: u32, y: u32, w: u32, h: u32) -> Self {
        Self { x, y, w, h }
    }

    /// Build a rectangle from untrusted signed input (service bodies, CLI),
    /// rejecting non-positive extents and anything outside the grid.
    pub fn checked(x: i64, y: i64, w: i64, h: i64, grid_w: u32, grid_h: u32) -> MapResult<Self> {
        let describe = || format!("({},{},{},{})", x, y, w, h);
        if w <= 0 || h <= 0 {
            return Err(MapError::InvalidRegion(format!(
                "{} has a non-positive extent",
                describe()
            )));
        }
        let past = |start: i64, extent: i64, limit: u32| {
            start < 0 || start.checked_add(extent).is_none_or(|end| end > limit as i64)
        };
        if past(x, w, grid_w) || past(y, h, grid_h) {
            return Err(MapError::InvalidRegion(format!(
                "{} leaves the {}x{} grid",
                describe(),
                grid_w,
                grid_h
            )));
        }
        Ok(Self::new(x as u32, y as u32, w as u32, h as u32))
    }

    /// Exclusive right edge, saturating at `u32::MAX`.
    pub fn right(&self) -> u32 {
        self.x.saturating_add(self.w)
    }

    /// Exclusive bottom edge, saturating at `u32::MAX`.
    pub fn bottom(&self) -> u32 {
        self.y.saturating_add(self.h)
    }

    /// False when `x + w` or `y + h` does not fit in a `u32`.
    pub fn is_representable(&self) -> bool {
        self.x.checked_add(self.w).is_some() && self.y.checked_add(self.h).is_some()
    }

    pub fn area(&self) -> u64 {
        self.w as u64 * self.h as u64
    }

    pub fn is_empty(&self) -> bool {
        self.w == 0 || self.h == 0
    }

    /// Positive-area overlap. Rectangles that only share an edge do not
    /// intersect.
    pub fn intersects(&self, other: &CellRect) -> bool {
        !(self.right() <= other.x
            || other.right() <= self.x
            || self.bottom() <= other.y
            || other.bottom() <= self.y)
    }

    /// The overlapping rectangle, if the overlap has positive area.
    pub fn intersection(&self, other: &CellRect) -> Option<CellRect> {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(CellRect::new(x0, y0, x1 - x0, y1 - y0))
    }

    pub fn contains(&self, cell: Cell) -> bool {
        cell.x >= self.x && cell.x < self.right() && cell.y >= self.y && cell.y < self.bottom()
    }

    /// True when the whole rectangle lies in `[0, grid_w) x [0, grid_h)`.
    pub fn fits_grid(&self, grid_w: u32, grid_h: u32) -> bool {
        !self.is_empty() && self.is_representable() && self.right() <= grid_w && self.bottom() <= grid_h
    }

    /// Size in pixels at `tile_size` pixels per cell edge.
    pub fn pixel_size(&self, tile_size: u32) -> (u32, u32) {
        (self.w.saturating_mul(tile_size), self.h.saturating_mul(tile_size))
    }

    pub fn cells(&self) -> impl Iterator<Item = Cell> + '_ {
        (self.y..self.bottom()).flat_map(move |y| (self.x..self.right()).map(move |x| Cell::new(x, y)))
    }
}

impl std::fmt::Display for CellRect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{},{},{})", self.x, self.y, self.w, self.h)
    }
}

/// Cell -> screen pixel: `(cell * tile - camera) * zoom`, truncated toward zero.
pub fn world_to_screen(cell_x: i64, cell_y: i64, tile_size: u32, camera: (f32, f32), zoom: f32) -> (i32, i32) {
    let px = (cell_x as f32 * tile_size as f32 - camera.0) * zoom;
    let py = (cell_y as f32 * tile_size as f32 - camera.1) * zoom;
    (px as i32, py as i32)
}

/// Screen pixel -> cell, floor-divided by `tile_size` and clamped into the
/// grid so pointer input outside the map never yields an out-of-range cell.
pub fn screen_to_cell(
    px: f32,
    py: f32,
    tile_size: u32,
    camera: (f32, f32),
    zoom: f32,
    grid_w: u32,
    grid_h: u32,
) -> Cell {
    let zoom = zoom.max(MIN_ZOOM);
    let tile = tile_size.max(1) as f32;
    let wx = camera.0 + px / zoom;
    let wy = camera.1 + py / zoom;
    let cx = (wx / tile).floor() as i64;
    let cy = (wy / tile).floor() as i64;
    Cell::new(
        cx.clamp(0, grid_w.saturating_sub(1) as i64) as u32,
        cy.clamp(0, grid_h.saturating_sub(1) as i64) as u32,
    )
}

/// Cells covered by a `viewport_w x viewport_h` screen viewport, clamped to
/// the grid.
pub fn visible_cells(
    viewport_w: u32,
    viewport_h: u32,
    tile_size: u32,
    camera: (f32, f32),
    zoom: f32,
    grid_w: u32,
    grid_h: u32,
) -> CellRect {
    let top_left = screen_to_cell(0.0, 0.0, tile_size, camera, zoom, grid_w, grid_h);
    let bottom_right = screen_to_cell(
        viewport_w.saturating_sub(1) as f32,
        viewport_h.saturating_sub(1) as f32,
        tile_size,
        camera,
        zoom,
        grid_w,
        grid_h,
    );
    CellRect::new(
        top_left.x,
        top_left.y,
        bottom_right.x.saturating_sub(top_left.x) + 1,
        bottom_right.y.saturating_sub(top_left.y) + 1,
    )
}

/// Parse a `WxH` grid size such as `120x68`.
pub fn parse_grid(s: &str) -> MapResult<(u32, u32)> {
    let lower = s.to_lowercase();
    let parts: Vec<&str> = lower.split('x').collect();
    if parts.len() != 2 {
        return Err(MapError::InvalidFormat(format!("grid must be WxH, got '{}'", s)));
    }
    let parse = |p: &str| -> MapResult<u32> {
        match p.trim().parse::<u32>() {
            Ok(v) if v > 0 => Ok(v),
            _ => Err(MapError::InvalidFormat(format!("grid must be WxH, got '{}'", s))),
        }
    };
    Ok((parse(parts[0])?, parse(parts[1])?))
}

// -- Drag selection -------------------------------------------------------

/// Rubber-band selection in cell space.
#[derive(Clone, Debug, Default)]
pub struct Selection {
    pub active: bool,
    pub start: Option<Cell>,
    pub end: Option<Cell>,
}

impl Selection {
    pub fn begin(&mut self, cell: Cell) {
        self.active = true;
        self.start = Some(cell);
        self.end = Some(cell);
    }

    /// Move the free corner towards `cell`, keeping the selection at most
    /// `cap_cells` cells wide and tall whichever way the pointer moves.
    pub fn drag_to(&mut self, cell: Cell, cap_cells: u32) {
        let start = *self.start.get_or_insert(cell);
        let reach = cap_cells.max(1) as i64 - 1;
        let dx = (cell.x as i64 - start.x as i64).clamp(-reach, reach);
        let dy = (cell.y as i64 - start.y as i64).clamp(-reach, reach);
        self.end = Some(Cell::new(
            (start.x as i64 + dx) as u32,
            (start.y as i64 + dy) as u32,
        ));
    }

    pub fn finish(&mut self) {
        self.active = false;
    }

    /// Normalised rectangle spanning both corners (inclusive).
    pub fn rect(&self) -> Option<CellRect> {
        let (a, b) = (self.start?, self.end?);
        let (x0, x1) = (a.x.min(b.x), a.x.max(b.x));
        let (y0, y1) = (a.y.min(b.y), a.y.max(b.y));
        Some(CellRect::new(x0, y0, x1 - x0 + 1, y1 - y0 + 1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_world_to_screen_applies_camera_then_zoom() {
        assert_eq!(world_to_screen(3, 2, 32, (16.0, 0.0), 2.0), (160, 128));
        assert_eq!(world_to_screen(0, 0, 32, (0.0, 0.0), 1.0), (0, 0));
    }

    #[test]
    fn test_screen_to_cell_inverts_transform() {
        let cam = (40.0, 8.0);
        let zoom = 1.5;
        let (px, py) = world_to_screen(5, 7, 32, cam, zoom);
        // Nudge into the cell interior so truncation cannot land on the edge.
        let cell = screen_to_cell(px as f32 + 1.0, py as f32 + 1.0, 32, cam, zoom, 20, 20);
        assert_eq!(cell, Cell::new(5, 7));
    }

    #[test]
    fn test_screen_to_cell_clamps_outside_pointer() {
        assert_eq!(screen_to_cell(-500.0, -3.0, 32, (0.0, 0.0), 1.0, 10, 10), Cell::new(0, 0));
        assert_eq!(screen_to_cell(9999.0, 9999.0, 32, (0.0, 0.0), 1.0, 10, 8), Cell::new(9, 7));
    }

    #[test]
    fn test_screen_to_cell_survives_zero_zoom() {
        let cell = screen_to_cell(10.0, 10.0, 32, (0.0, 0.0), 0.0, 4, 4);
        assert_eq!(cell, Cell::new(3, 3));
    }

    #[test]
    fn test_touching_edges_do_not_intersect() {
        let a = CellRect::new(0, 0, 2, 2);
        assert!(!a.intersects(&CellRect::new(2, 0, 2, 2)));
        assert!(!a.intersects(&CellRect::new(0, 2, 2, 2)));
        assert!(a.intersects(&CellRect::new(1, 1, 2, 2)));
        assert_eq!(a.intersection(&CellRect::new(1, 1, 2, 2)), Some(CellRect::new(1, 1, 1, 1)));
        assert_eq!(a.intersection(&CellRect::new(2, 2, 1, 1)), None);
    }

    #[test]
    fn test_checked_rejects_bad_regions() {
        assert!(matches!(CellRect::checked(0, 0, 0, 3, 10, 10), Err(MapError::InvalidRegion(_))));
        assert!(matches!(CellRect::checked(0, 0, 3, -1, 10, 10), Err(MapError::InvalidRegion(_))));
        assert!(matches!(CellRect::checked(-1, 0, 3, 3, 10, 10), Err(MapError::InvalidRegion(_))));
        assert!(matches!(CellRect::checked(8, 0, 3, 3, 10, 10), Err(MapError::InvalidRegion(_))));
        assert_eq!(CellRect::checked(7, 7, 3, 3, 10, 10).ok(), Some(CellRect::new(7, 7, 3, 3)));
    }

    #[test]
    fn test_checked_rejects_overflowing_regions() {
        for (x, y, w, h) in [
            (i64::MAX, 0, 1, 1),
            (0, i64::MAX, 1, 1),
            (1, 0, i64::MAX, 1),
            (0, 0, 1, i64::MAX),
            (4_294_967_295, 0, 1, 1),
        ] {
            assert!(
                matches!(CellRect::checked(x, y, w, h, 10, 10), Err(MapError::InvalidRegion(_))),
                "({},{},{},{}) accepted",
                x,
                y,
                w,
                h
            );
        }
    }

    #[test]
    fn test_edges_saturate_near_u32_max() {
        let far = CellRect::new(u32::MAX, 0, 2, 1);
        assert!(!far.is_representable());
        assert_eq!(far.right(), u32::MAX);
        assert!(!far.fits_grid(10, 10));
        assert!(!far.intersects(&CellRect::new(0, 0, 10, 10)));
        assert_eq!(far.intersection(&CellRect::new(0, 0, 10, 10)), None);
        assert_eq!(CellRect::new(0, 0, u32::MAX, 1).pixel_size(32), (u32::MAX, 32));
    }

    #[test]
    fn test_parse_grid() {
        assert_eq!(parse_grid("120x68").ok(), Some((120, 68)));
        assert_eq!(parse_grid("10X4").ok(), Some((10, 4)));
        assert!(parse_grid("120").is_err());
        assert!(parse_grid("0x5").is_err());
        assert!(parse_grid("axb").is_err());
    }

    #[test]
    fn test_selection_normalises_corners() {
        let mut sel = Selection::default();
        sel.begin(Cell::new(5, 5));
        sel.drag_to(Cell::new(2, 7), 10);
        assert_eq!(sel.rect(), Some(CellRect::new(2, 5, 4, 3)));
    }

    #[test]
    fn test_selection_drag_is_capped() {
        let mut sel = Selection::default();
        sel.begin(Cell::new(10, 10));
        sel.drag_to(Cell::new(30, 0), 4);
        assert_eq!(sel.rect(), Some(CellRect::new(10, 7, 4, 4)));
    }

    #[test]
    fn test_visible_cells_clamped_to_grid() {
        let rect = visible_cells(320, 320, 32, (0.0, 0.0), 1.0, 6, 20);
        assert_eq!(rect, CellRect::new(0, 0, 6, 10));
    }
}
