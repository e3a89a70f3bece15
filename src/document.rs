// ============================================================================
// MAP DOCUMENT - grid metadata, sparse layers and patches, plus the JSON file
// ============================================================================

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{MapError, MapResult};
use crate::grid::{Cell, CellRect};
use crate::layers::{LayerId, LayerKind, LayerSet};
use crate::log_warn;
use crate::patch::{ImageRef, Patch, PatchStore};

/// Schema version written by [`MapDocument::save`].
pub const SCHEMA_VERSION: u32 = 3;

pub const DEFAULT_TILE_SIZE: u32 = 32;
pub const DEFAULT_GRID_WIDTH: u32 = 120;
pub const DEFAULT_GRID_HEIGHT: u32 = 68;

/// Key of the patch list inside `layers`.
const PATCHES_KEY: &str = "patches";

/// A whole map. Layer keys and patch bounds are expected to lie inside the
/// grid already; producers clip before inserting.
#[derive(Clone, Debug, PartialEq)]
pub struct MapDocument {
    /// Version found on load. Advisory only; saves always write
    /// [`SCHEMA_VERSION`].
    pub version: u32,
    pub tile_size: u32,
    pub grid_width: u32,
    pub grid_height: u32,
    pub layers: LayerSet,
    pub patches: PatchStore,
}

impl Default for MapDocument {
    fn default() -> Self {
        Self::new(DEFAULT_TILE_SIZE, DEFAULT_GRID_WIDTH, DEFAULT_GRID_HEIGHT)
    }
}

// -- Persisted shape --------------------------------------------------------

#[derive(Serialize)]
struct PersistedDocument<'a> {
    version: u32,
    tile_size: u32,
    grid_width: u32,
    grid_height: u32,
    layers: PersistedLayers<'a>,
}

#[derive(Serialize)]
struct PersistedLayers<'a> {
    blocks: Vec<Vec<u32>>,
    pickups: Vec<Vec<u32>>,
    collision_layer_1: Vec<Vec<u32>>,
    collision_layer_2: Vec<Vec<u32>>,
    patches: &'a [Patch],
}

impl MapDocument {
    pub fn new(tile_size: u32, grid_width: u32, grid_height: u32) -> Self {
        Self {
            version: SCHEMA_VERSION,
            tile_size: tile_size.max(1),
            grid_width: grid_width.max(1),
            grid_height: grid_height.max(1),
            layers: LayerSet::new(),
            patches: PatchStore::new(),
        }
    }

    /// The whole grid as a rectangle.
    pub fn bounds(&self) -> CellRect {
        CellRect::new(0, 0, self.grid_width, self.grid_height)
    }

    /// Validate untrusted signed region input against this grid.
    pub fn region(&self, x: i64, y: i64, w: i64, h: i64) -> MapResult<CellRect> {
        CellRect::checked(x, y, w, h, self.grid_width, self.grid_height)
    }

    fn persisted(&self) -> PersistedDocument<'_> {
        PersistedDocument {
            version: SCHEMA_VERSION,
            tile_size: self.tile_size,
            grid_width: self.grid_width,
            grid_height: self.grid_height,
            layers: PersistedLayers {
                blocks: self.layers.to_sorted_list(LayerId::Blocks),
                pickups: self.layers.to_sorted_list(LayerId::Pickups),
                collision_layer_1: self.layers.to_sorted_list(LayerId::Collision1),
                collision_layer_2: self.layers.to_sorted_list(LayerId::Collision2),
                patches: self.patches.as_slice(),
            },
        }
    }

    /// Compact JSON in the current schema. Unchanged documents always
    /// produce identical bytes.
    pub fn to_json_bytes(&self) -> MapResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.persisted())?)
    }

    /// The current schema as a JSON tree.
    pub fn to_json_value(&self) -> MapResult<Value> {
        Ok(serde_json::to_value(self.persisted())?)
    }

    /// Write the document to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> MapResult<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &self.persisted())?;
        writer.flush()?;
        Ok(())
    }

    /// Read a document from `path`. `Ok(None)` when there is no such file.
    pub fn load(path: &Path) -> MapResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let file = File::open(path)?;
        let value: Value = serde_json::from_reader(BufReader::new(file))?;
        let doc = Self::from_json_value(&value)?;
        for issue in doc.validate() {
            log_warn!("Map {}: {}", path.display(), issue);
        }
        Ok(Some(doc))
    }

    /// Build a document from any of the known schemas. Missing metadata falls
    /// back to the defaults; missing layers are empty.
    pub fn from_json_value(value: &Value) -> MapResult<Self> {
        let root = value
            .as_object()
            .ok_or_else(|| MapError::InvalidFormat("map document must be a JSON object".into()))?;

        let dim = |key: &str, default: u32| {
            root.get(key)
                .and_then(as_u32)
                .filter(|v| *v > 0)
                .unwrap_or(default)
        };
        let mut doc = Self::new(
            dim("tile_size", DEFAULT_TILE_SIZE),
            dim("grid_width", DEFAULT_GRID_WIDTH),
            dim("grid_height", DEFAULT_GRID_HEIGHT),
        );
        doc.version = root.get("version").and_then(as_u32).unwrap_or(0);

        if let Some(adapter) = SCHEMA_ADAPTERS.iter().find(|a| a.matches(root)) {
            adapter.read(root, &mut doc.layers);
        }
        if let Some(patches) = layers_object(root).and_then(|l| l.get(PATCHES_KEY)) {
            doc.patches = read_patches(patches);
        }
        Ok(doc)
    }

    /// Invariant violations: entries or patches outside the grid, and typed
    /// values outside the nominal range. Reported, never repaired.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();
        for (id, cell) in self.layers.out_of_bounds_entries(self.grid_width, self.grid_height) {
            issues.push(format!("{} entry ({},{}) lies outside the grid", id.name(), cell.x, cell.y));
        }
        for (id, cell, value) in self.layers.out_of_range_entries() {
            issues.push(format!(
                "{} entry ({},{}) has type {} outside the nominal range",
                id.name(),
                cell.x,
                cell.y,
                value
            ));
        }
        for patch in self.patches.iter() {
            if !patch.bounds.fits_grid(self.grid_width, self.grid_height) {
                issues.push(format!("patch '{}' at {} lies outside the grid", patch.file(), patch.bounds));
            }
        }
        issues
    }
}

// -- Schema adapters --------------------------------------------------------

/// Reader for one historical layout of the `layers` data.
trait SchemaAdapter: Sync {
    fn name(&self) -> &'static str;
    fn matches(&self, root: &Map<String, Value>) -> bool;
    fn read(&self, root: &Map<String, Value>, layers: &mut LayerSet);
}

/// Tried in order; the first match wins.
static SCHEMA_ADAPTERS: &[&dyn SchemaAdapter] = &[
    &CurrentSchema,
    &StackedBlocksSchema,
    &SemanticSchema,
    &FlatSchema,
];

/// Name of the adapter that would read `value`, if any.
pub fn detect_schema(value: &Value) -> Option<&'static str> {
    let root = value.as_object()?;
    SCHEMA_ADAPTERS.iter().find(|a| a.matches(root)).map(|a| a.name())
}

/// `layers.{blocks, pickups, collision_layer_1, collision_layer_2, patches}`
struct CurrentSchema;

impl SchemaAdapter for CurrentSchema {
    fn name(&self) -> &'static str {
        "current"
    }

    fn matches(&self, root: &Map<String, Value>) -> bool {
        layers_object(root).is_some_and(|l| {
            l.contains_key(PATCHES_KEY) || LayerId::all().iter().any(|id| l.contains_key(id.name()))
        })
    }

    fn read(&self, root: &Map<String, Value>, layers: &mut LayerSet) {
        let Some(obj) = layers_object(root) else { return };
        for id in LayerId::all() {
            if let Some(rows) = obj.get(id.name()) {
                read_rows(rows, *id, layers, None);
            }
        }
    }
}

/// `layers.blocks_l1 .. blocks_l4`, merged into `blocks`; higher levels win.
struct StackedBlocksSchema;

const STACKED_BLOCK_KEYS: [&str; 4] = ["blocks_l1", "blocks_l2", "blocks_l3", "blocks_l4"];

impl SchemaAdapter for StackedBlocksSchema {
    fn name(&self) -> &'static str {
        "stacked-blocks"
    }

    fn matches(&self, root: &Map<String, Value>) -> bool {
        layers_object(root).is_some_and(|l| STACKED_BLOCK_KEYS.iter().any(|k| l.contains_key(*k)))
    }

    fn read(&self, root: &Map<String, Value>, layers: &mut LayerSet) {
        let Some(obj) = layers_object(root) else { return };
        for key in STACKED_BLOCK_KEYS {
            if let Some(rows) = obj.get(key) {
                read_rows(rows, LayerId::Blocks, layers, Some(1));
            }
        }
    }
}

/// Named gameplay layers from the web editor.
struct SemanticSchema;

const SEMANTIC_LAYERS: [(&str, LayerId, Option<u32>); 5] = [
    ("block (coll)", LayerId::Collision1, None),
    ("blue spawn", LayerId::Pickups, Some(1)),
    ("red spawn", LayerId::Pickups, Some(2)),
    ("health refill", LayerId::Pickups, Some(3)),
    ("attack refill", LayerId::Pickups, Some(4)),
];

impl SchemaAdapter for SemanticSchema {
    fn name(&self) -> &'static str {
        "semantic"
    }

    fn matches(&self, root: &Map<String, Value>) -> bool {
        layers_object(root).is_some_and(|l| SEMANTIC_LAYERS.iter().any(|(k, _, _)| l.contains_key(*k)))
    }

    fn read(&self, root: &Map<String, Value>, layers: &mut LayerSet) {
        let Some(obj) = layers_object(root) else { return };
        for (key, id, forced) in SEMANTIC_LAYERS {
            let Some(rows) = obj.get(key).and_then(Value::as_array) else { continue };
            for row in rows {
                if let Some((cell, _)) = parse_row(row, 2) {
                    layers.set(id, cell, forced.unwrap_or(1));
                }
            }
        }
    }
}

/// Exported game maps: layer lists at the top level, no `layers` object.
struct FlatSchema;

impl SchemaAdapter for FlatSchema {
    fn name(&self) -> &'static str {
        "flat"
    }

    fn matches(&self, root: &Map<String, Value>) -> bool {
        layers_object(root).is_none()
            && ["visual_blocks", "collision_layer_1", "collision_layer_2", "pickups"]
                .iter()
                .any(|k| root.contains_key(*k))
    }

    fn read(&self, root: &Map<String, Value>, layers: &mut LayerSet) {
        if let Some(rows) = root.get("visual_blocks") {
            read_rows(rows, LayerId::Blocks, layers, Some(1));
        }
        for id in [LayerId::Pickups, LayerId::Collision1, LayerId::Collision2] {
            if let Some(rows) = root.get(id.name()) {
                read_rows(rows, id, layers, None);
            }
        }
    }
}

fn layers_object(root: &Map<String, Value>) -> Option<&Map<String, Value>> {
    root.get("layers").and_then(Value::as_object)
}

fn as_u32(v: &Value) -> Option<u32> {
    if let Some(n) = v.as_u64() {
        return u32::try_from(n).ok();
    }
    let f = v.as_f64()?;
    if f >= 0.0 && f.fract() == 0.0 && f <= u32::MAX as f64 {
        Some(f as u32)
    } else {
        None
    }
}

/// `[x, y, ...]` with at least `min_len` non-negative integers. Returns the
/// cell and the third element, if any.
fn parse_row(row: &Value, min_len: usize) -> Option<(Cell, Option<u32>)> {
    let items = row.as_array()?;
    if items.len() < min_len {
        return None;
    }
    let x = as_u32(items.first()?)?;
    let y = as_u32(items.get(1)?)?;
    let value = match items.get(2) {
        Some(v) => Some(as_u32(v)?),
        None => None,
    };
    Some((Cell::new(x, y), value))
}

/// Read rows into `id`. Typed layers need triples unless `pair_type` gives
/// the type for bare pairs; flag layers take exact pairs only.
fn read_rows(rows: &Value, id: LayerId, layers: &mut LayerSet, pair_type: Option<u32>) {
    let Some(rows) = rows.as_array() else { return };
    for row in rows {
        match id.kind() {
            LayerKind::Typed => {
                let Some((cell, value)) = parse_row(row, 2) else { continue };
                if let Some(v) = value.or(pair_type) {
                    layers.set(id, cell, v);
                }
            }
            LayerKind::Flag => {
                if row.as_array().is_some_and(|a| a.len() == 2)
                    && let Some((cell, _)) = parse_row(row, 2)
                {
                    layers.set(id, cell, 1);
                }
            }
        }
    }
}

fn read_patches(value: &Value) -> PatchStore {
    let Some(items) = value.as_array() else {
        return PatchStore::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let obj = item.as_object()?;
            let field = |k: &str, default: u32| match obj.get(k) {
                Some(v) => as_u32(v),
                None => Some(default),
            };
            let bounds = CellRect::new(field("x", 0)?, field("y", 0)?, field("w", 1)?, field("h", 1)?);
            if bounds.is_empty() || !bounds.is_representable() {
                return None;
            }
            let file = obj.get("file").and_then(Value::as_str).unwrap_or_default();
            let mut patch = Patch::new(ImageRef::new(file), bounds);
            patch.url = obj.get("url").and_then(Value::as_str).map(str::to_string);
            Some(patch)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    fn sample() -> MapDocument {
        let mut doc = MapDocument::new(32, 10, 10);
        doc.layers.set(LayerId::Blocks, Cell::new(3, 1), 2);
        doc.layers.set(LayerId::Blocks, Cell::new(0, 4), 5);
        doc.layers.set(LayerId::Pickups, Cell::new(2, 2), 1);
        doc.layers.set(LayerId::Collision1, Cell::new(9, 9), 1);
        doc.layers.set(LayerId::Collision2, Cell::new(0, 0), 1);
        doc.patches.append(Patch::new(ImageRef::new("b.png"), CellRect::new(1, 1, 2, 2)));
        doc.patches.append(Patch::new(ImageRef::new("a.png"), CellRect::new(0, 0, 2, 2)).with_url("/generated/a.png"));
        doc
    }

    #[test]
    fn test_writes_current_schema_in_fixed_order() {
        let bytes = sample().to_json_bytes().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert_eq!(
            text,
            concat!(
                r#"{"version":3,"tile_size":32,"grid_width":10,"grid_height":10,"layers":{"#,
                r#""blocks":[[0,4,5],[3,1,2]],"pickups":[[2,2,1]],"#,
                r#""collision_layer_1":[[9,9]],"collision_layer_2":[[0,0]],"#,
                r#""patches":[{"file":"b.png","x":1,"y":1,"w":2,"h":2},"#,
                r#"{"file":"a.png","url":"/generated/a.png","x":0,"y":0,"w":2,"h":2}]}}"#
            )
        );
    }

    #[test]
    fn test_save_load_save_is_byte_identical() {
        let path = std::env::temp_dir()
            .join(format!("pixelmap-doc-{}", Uuid::new_v4()))
            .join("map.json");
        let doc = sample();
        doc.save(&path).unwrap();
        let first = std::fs::read(&path).unwrap();

        let loaded = MapDocument::load(&path).unwrap().unwrap();
        assert_eq!(loaded, doc);
        loaded.save(&path).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), first);

        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn test_load_missing_file_is_none() {
        let path = std::env::temp_dir().join(format!("pixelmap-none-{}.json", Uuid::new_v4()));
        assert!(MapDocument::load(&path).unwrap().is_none());
    }

    #[test]
    fn test_missing_keys_default() {
        let doc = MapDocument::from_json_value(&json!({})).unwrap();
        assert_eq!((doc.tile_size, doc.grid_width, doc.grid_height), (32, 120, 68));
        assert!(doc.layers.is_empty());
        assert!(doc.patches.is_empty());
        assert!(MapDocument::from_json_value(&json!([1, 2])).is_err());
    }

    #[test]
    fn test_current_schema_skips_malformed_rows() {
        let value = json!({
            "version": 3, "tile_size": 16, "grid_width": 8, "grid_height": 6,
            "layers": {
                "blocks": [[1, 1, 2], [2, 2], [-1, 0, 3], "x", [4, 4, 7]],
                "collision_layer_1": [[0, 1], [0, 2, 9]],
                "patches": [
                    {"file": "p.png", "x": 1, "y": 2, "w": 3, "h": 1},
                    {"file": "defaults.png"},
                    {"file": "bad.png", "x": -4},
                    {"file": "empty.png", "w": 0},
                    7
                ]
            }
        });
        let doc = MapDocument::from_json_value(&value).unwrap();
        assert_eq!(detect_schema(&value), Some("current"));
        assert_eq!(doc.tile_size, 16);
        assert_eq!(doc.layers.to_sorted_list(LayerId::Blocks), vec![vec![1, 1, 2], vec![4, 4, 7]]);
        assert_eq!(doc.layers.to_sorted_list(LayerId::Collision1), vec![vec![0, 1]]);
        let files: Vec<&str> = doc.patches.iter().map(Patch::file).collect();
        assert_eq!(files, vec!["p.png", "defaults.png"]);
        assert_eq!(doc.patches.as_slice()[1].bounds, CellRect::new(0, 0, 1, 1));
    }

    #[test]
    fn test_stacked_blocks_schema() {
        let value = json!({
            "version": 2,
            "layers": {
                "blocks_l1": [[0, 0, 1], [1, 0]],
                "blocks_l3": [[0, 0, 4]]
            }
        });
        assert_eq!(detect_schema(&value), Some("stacked-blocks"));
        let doc = MapDocument::from_json_value(&value).unwrap();
        assert_eq!(doc.layers.to_sorted_list(LayerId::Blocks), vec![vec![0, 0, 4], vec![1, 0, 1]]);
    }

    #[test]
    fn test_semantic_schema() {
        let value = json!({
            "version": 2, "tile_size": 32, "grid_width": 120, "grid_height": 68,
            "layers": {
                "block (coll)": [[5, 5]],
                "blue spawn": [[1, 1]],
                "red spawn": [[2, 1]],
                "health refill": [[3, 1]],
                "attack refill": [[4, 1, 9]]
            }
        });
        assert_eq!(detect_schema(&value), Some("semantic"));
        let doc = MapDocument::from_json_value(&value).unwrap();
        assert_eq!(doc.layers.to_sorted_list(LayerId::Collision1), vec![vec![5, 5]]);
        assert_eq!(
            doc.layers.to_sorted_list(LayerId::Pickups),
            vec![vec![1, 1, 1], vec![2, 1, 2], vec![3, 1, 3], vec![4, 1, 4]]
        );
        // Always written back in the current schema.
        let written: Value = serde_json::from_slice(&doc.to_json_bytes().unwrap()).unwrap();
        assert_eq!(written["version"], json!(3));
        assert!(written["layers"].get("blue spawn").is_none());
        assert_eq!(detect_schema(&written), Some("current"));
    }

    #[test]
    fn test_flat_schema() {
        let value = json!({
            "version": 1, "tile_size": 32, "grid_width": 50, "grid_height": 30,
            "visual_blocks": [[1, 2], [0, 0]],
            "collision_layer_2": [[3, 3]],
            "pickups": [[4, 4, 2]]
        });
        assert_eq!(detect_schema(&value), Some("flat"));
        let doc = MapDocument::from_json_value(&value).unwrap();
        assert_eq!(doc.layers.to_sorted_list(LayerId::Blocks), vec![vec![0, 0, 1], vec![1, 2, 1]]);
        assert_eq!(doc.layers.to_sorted_list(LayerId::Collision2), vec![vec![3, 3]]);
        assert_eq!(doc.layers.to_sorted_list(LayerId::Pickups), vec![vec![4, 4, 2]]);
        assert_eq!(doc.grid_width, 50);
    }

    #[test]
    fn test_validate_reports_without_repairing() {
        let mut doc = MapDocument::new(32, 4, 4);
        doc.layers.set(LayerId::Blocks, Cell::new(7, 0), 1);
        doc.layers.set(LayerId::Pickups, Cell::new(0, 0), 12);
        doc.patches.append(Patch::new(ImageRef::new("wide.png"), CellRect::new(3, 0, 2, 1)));
        let issues = doc.validate();
        assert_eq!(issues.len(), 3);
        assert_eq!(doc.layers.get(LayerId::Blocks, Cell::new(7, 0)), Some(1));
        assert_eq!(doc.patches.len(), 1);
    }

    #[test]
    fn test_patches_with_overflowing_edges_are_dropped() {
        let value = json!({
            "grid_width": 10, "grid_height": 10,
            "layers": {"patches": [
                {"file": "a.png", "x": 4294967295u64, "y": 0, "w": 2, "h": 1},
                {"file": "b.png", "x": 0, "y": 4294967290u64, "w": 1, "h": 100},
                {"file": "c.png", "x": 1, "y": 1, "w": 1, "h": 1}
            ]}
        });
        let doc = MapDocument::from_json_value(&value).unwrap();
        assert_eq!(doc.patches.len(), 1);
        assert_eq!(doc.patches.as_slice()[0].file(), "c.png");
        assert!(doc.validate().is_empty());
    }
}
