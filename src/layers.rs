// ============================================================================
// Sparse layers - per-cell block types, pickups and collision flags
// ============================================================================

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;

use crate::grid::Cell;

/// Nominal type codes for typed layers. Values outside this range are still
/// stored; see [`LayerSet::out_of_range_entries`].
pub const TYPE_RANGE: RangeInclusive<u32> = 1..=5;

/// Identity of one sparse layer in the current schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LayerId {
    Blocks,
    Pickups,
    Collision1,
    Collision2,
}

/// Whether a layer stores a type code per cell or just presence.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LayerKind {
    Typed,
    Flag,
}

impl LayerId {
    pub fn all() -> &'static [LayerId] {
        &[
            LayerId::Blocks,
            LayerId::Pickups,
            LayerId::Collision1,
            LayerId::Collision2,
        ]
    }

    /// Key used in the persisted `layers` object.
    pub fn name(&self) -> &'static str {
        match self {
            LayerId::Blocks => "blocks",
            LayerId::Pickups => "pickups",
            LayerId::Collision1 => "collision_layer_1",
            LayerId::Collision2 => "collision_layer_2",
        }
    }

    pub fn from_name(name: &str) -> Option<LayerId> {
        LayerId::all().iter().copied().find(|id| id.name() == name)
    }

    pub fn kind(&self) -> LayerKind {
        match self {
            LayerId::Blocks | LayerId::Pickups => LayerKind::Typed,
            LayerId::Collision1 | LayerId::Collision2 => LayerKind::Flag,
        }
    }
}

/// One sparse overlay. Absent cells are empty; nothing is stored for them.
#[derive(Clone, Debug, PartialEq)]
pub enum SparseLayer {
    Typed(BTreeMap<Cell, u32>),
    Flag(BTreeSet<Cell>),
}

impl SparseLayer {
    pub fn new(kind: LayerKind) -> Self {
        match kind {
            LayerKind::Typed => SparseLayer::Typed(BTreeMap::new()),
            LayerKind::Flag => SparseLayer::Flag(BTreeSet::new()),
        }
    }

    /// Insert or overwrite. Flag layers ignore `value`.
    pub fn set(&mut self, cell: Cell, value: u32) {
        match self {
            SparseLayer::Typed(map) => {
                map.insert(cell, value);
            }
            SparseLayer::Flag(set) => {
                set.insert(cell);
            }
        }
    }

    /// Remove `cell`; a no-op when it is not present.
    pub fn unset(&mut self, cell: Cell) {
        match self {
            SparseLayer::Typed(map) => {
                map.remove(&cell);
            }
            SparseLayer::Flag(set) => {
                set.remove(&cell);
            }
        }
    }

    /// Type code at `cell`. Flag layers report `1` for a set cell.
    pub fn get(&self, cell: Cell) -> Option<u32> {
        match self {
            SparseLayer::Typed(map) => map.get(&cell).copied(),
            SparseLayer::Flag(set) => set.contains(&cell).then_some(1),
        }
    }

    pub fn contains(&self, cell: Cell) -> bool {
        match self {
            SparseLayer::Typed(map) => map.contains_key(&cell),
            SparseLayer::Flag(set) => set.contains(&cell),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            SparseLayer::Typed(map) => map.len(),
            SparseLayer::Flag(set) => set.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        match self {
            SparseLayer::Typed(map) => map.clear(),
            SparseLayer::Flag(set) => set.clear(),
        }
    }

    /// Entries ordered by `(x, y)`. Flag layers yield `None` as the value.
    pub fn iter(&self) -> Box<dyn Iterator<Item = (Cell, Option<u32>)> + '_> {
        match self {
            SparseLayer::Typed(map) => Box::new(map.iter().map(|(c, v)| (*c, Some(*v)))),
            SparseLayer::Flag(set) => Box::new(set.iter().map(|c| (*c, None))),
        }
    }

    /// Serialisable rows: `[x, y]` for flags, `[x, y, type]` for typed
    /// layers, in lexicographic `(x, y)` order.
    pub fn to_sorted_list(&self) -> Vec<Vec<u32>> {
        self.iter()
            .map(|(cell, value)| match value {
                Some(v) => vec![cell.x, cell.y, v],
                None => vec![cell.x, cell.y],
            })
            .collect()
    }
}

/// All sparse layers of a map.
#[derive(Clone, Debug, PartialEq)]
pub struct LayerSet {
    layers: BTreeMap<LayerId, SparseLayer>,
}

impl Default for LayerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl LayerSet {
    pub fn new() -> Self {
        let layers = LayerId::all()
            .iter()
            .map(|id| (*id, SparseLayer::new(id.kind())))
            .collect();
        Self { layers }
    }

    pub fn layer(&self, id: LayerId) -> &SparseLayer {
        // Every id is inserted by `new`, so the lookup cannot miss.
        &self.layers[&id]
    }

    fn layer_mut(&mut self, id: LayerId) -> &mut SparseLayer {
        self.layers
            .entry(id)
            .or_insert_with(|| SparseLayer::new(id.kind()))
    }

    /// Store `value` at `cell` as given. Range checks belong to the caller.
    pub fn set(&mut self, id: LayerId, cell: Cell, value: u32) {
        self.layer_mut(id).set(cell, value);
    }

    pub fn unset(&mut self, id: LayerId, cell: Cell) {
        self.layer_mut(id).unset(cell);
    }

    pub fn get(&self, id: LayerId, cell: Cell) -> Option<u32> {
        self.layer(id).get(cell)
    }

    pub fn to_sorted_list(&self, id: LayerId) -> Vec<Vec<u32>> {
        self.layer(id).to_sorted_list()
    }

    pub fn iter(&self) -> impl Iterator<Item = (LayerId, &SparseLayer)> {
        self.layers.iter().map(|(id, layer)| (*id, layer))
    }

    pub fn clear(&mut self) {
        for layer in self.layers.values_mut() {
            layer.clear();
        }
    }

    /// Total stored entries across all layers.
    pub fn len(&self) -> usize {
        self.layers.values().map(SparseLayer::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Typed entries whose code lies outside [`TYPE_RANGE`].
    pub fn out_of_range_entries(&self) -> Vec<(LayerId, Cell, u32)> {
        let mut out = Vec::new();
        for (id, layer) in self.iter() {
            for (cell, value) in layer.iter() {
                if let Some(v) = value
                    && !TYPE_RANGE.contains(&v)
                {
                    out.push((id, cell, v));
                }
            }
        }
        out
    }

    /// Entries whose cell lies outside `[0, grid_w) x [0, grid_h)`.
    pub fn out_of_bounds_entries(&self, grid_w: u32, grid_h: u32) -> Vec<(LayerId, Cell)> {
        self.iter()
            .flat_map(|(id, layer)| layer.iter().map(move |(cell, _)| (id, cell)))
            .filter(|(_, cell)| cell.x >= grid_w || cell.y >= grid_h)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_overwrites_and_unset_is_idempotent() {
        let mut layers = LayerSet::new();
        layers.set(LayerId::Blocks, Cell::new(1, 2), 3);
        layers.set(LayerId::Blocks, Cell::new(1, 2), 4);
        assert_eq!(layers.get(LayerId::Blocks, Cell::new(1, 2)), Some(4));
        assert_eq!(layers.layer(LayerId::Blocks).len(), 1);

        layers.unset(LayerId::Blocks, Cell::new(1, 2));
        layers.unset(LayerId::Blocks, Cell::new(1, 2));
        assert!(layers.layer(LayerId::Blocks).is_empty());
    }

    #[test]
    fn test_sorted_list_is_lexicographic() {
        let mut layers = LayerSet::new();
        layers.set(LayerId::Pickups, Cell::new(3, 0), 2);
        layers.set(LayerId::Pickups, Cell::new(0, 9), 1);
        layers.set(LayerId::Pickups, Cell::new(0, 1), 5);
        assert_eq!(
            layers.to_sorted_list(LayerId::Pickups),
            vec![vec![0, 1, 5], vec![0, 9, 1], vec![3, 0, 2]]
        );
    }

    #[test]
    fn test_flag_layers_store_pairs() {
        let mut layers = LayerSet::new();
        layers.set(LayerId::Collision2, Cell::new(4, 4), 99);
        layers.set(LayerId::Collision2, Cell::new(1, 0), 1);
        assert_eq!(
            layers.to_sorted_list(LayerId::Collision2),
            vec![vec![1, 0], vec![4, 4]]
        );
        assert_eq!(layers.get(LayerId::Collision2, Cell::new(4, 4)), Some(1));
        assert!(layers.layer(LayerId::Collision1).is_empty());
    }

    #[test]
    fn test_out_of_range_values_are_kept_but_reported() {
        let mut layers = LayerSet::new();
        layers.set(LayerId::Blocks, Cell::new(0, 0), 9);
        layers.set(LayerId::Blocks, Cell::new(1, 0), 2);
        assert_eq!(layers.get(LayerId::Blocks, Cell::new(0, 0)), Some(9));
        assert_eq!(
            layers.out_of_range_entries(),
            vec![(LayerId::Blocks, Cell::new(0, 0), 9)]
        );
    }

    #[test]
    fn test_layer_names_round_trip() {
        for id in LayerId::all() {
            assert_eq!(LayerId::from_name(id.name()), Some(*id));
        }
        assert_eq!(LayerId::from_name("patches"), None);
    }
}
