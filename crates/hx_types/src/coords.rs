//! # Coordinates
//!
//! Axial hex math, square-grid cells, and the opaque location references
//! carried in command/event payloads.
//!
//! ## Determinism
//! Cell rounding and neighbor orderings are fixed; never reorder the
//! direction tables, they are part of the serialized contract.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topology tag used by every hex-plane location reference.
pub const OVERWORLD_HEX_TOPOLOGY: &str = "overworld_hex";
/// Topology tag used by tactical square-grid spaces.
pub const SQUARE_GRID_TOPOLOGY: &str = "square_grid";

const SQRT3: f64 = 1.7320508075688772;

/// Hex neighbor offsets, indexed by facing direction 0..=5.
pub const HEX_DIRECTIONS: [(i64, i64); 6] = [(1, 0), (1, -1), (0, -1), (-1, 0), (-1, 1), (0, 1)];

// ============================================================================
// HexCoord
// ============================================================================

/// Axial hex coordinate (q, r).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct HexCoord {
    pub q: i64,
    pub r: i64,
}

impl HexCoord {
    #[inline]
    pub fn new(q: i64, r: i64) -> Self {
        HexCoord { q, r }
    }
}

impl std::fmt::Display for HexCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.q, self.r)
    }
}

/// Pointy-top axial to continuous world coordinates.
pub fn axial_to_world_xy(coord: HexCoord) -> (f64, f64) {
    let x = SQRT3 * (coord.q as f64 + coord.r as f64 / 2.0);
    let y = 1.5 * coord.r as f64;
    (x, y)
}

/// Deterministic nearest-hex conversion for pointy-top axial coordinates.
pub fn world_xy_to_axial(x: f64, y: f64) -> HexCoord {
    let q = (SQRT3 / 3.0 * x) - (1.0 / 3.0 * y);
    let r = (2.0 / 3.0) * y;

    let cube_x = q;
    let cube_z = r;
    let cube_y = -cube_x - cube_z;

    let mut rounded_x = cube_x.round();
    let rounded_y = cube_y.round();
    let mut rounded_z = cube_z.round();

    let dx = (rounded_x - cube_x).abs();
    let dy = (rounded_y - cube_y).abs();
    let dz = (rounded_z - cube_z).abs();

    // The axis with the largest rounding error absorbs the correction; when
    // that axis is y, the (x, z) pair is already consistent.
    if dx > dy && dx > dz {
        rounded_x = -rounded_y - rounded_z;
    } else if dy <= dz {
        rounded_z = -rounded_x - rounded_y;
    }

    HexCoord::new(rounded_x as i64, rounded_z as i64)
}

/// The six axial neighbors of a hex, in facing-direction order.
pub fn hex_neighbors(coord: HexCoord) -> [HexCoord; 6] {
    let mut out = [coord; 6];
    for (index, (dq, dr)) in HEX_DIRECTIONS.iter().enumerate() {
        out[index] = HexCoord::new(coord.q + dq, coord.r + dr);
    }
    out
}

/// Axial hex distance.
pub fn hex_distance(a: HexCoord, b: HexCoord) -> i64 {
    let dq = a.q - b.q;
    let dr = a.r - b.r;
    let ds = (a.q + a.r) - (b.q + b.r);
    (dq.abs() + dr.abs() + ds.abs()) / 2
}

/// Direction index 0..=5 if `target` is an immediate hex neighbor of `attacker`.
pub fn hex_neighbor_direction(attacker: HexCoord, target: HexCoord) -> Option<usize> {
    let delta = (target.q - attacker.q, target.r - attacker.r);
    HEX_DIRECTIONS.iter().position(|d| *d == delta)
}

// ============================================================================
// Square grid
// ============================================================================

/// Square-grid cell center in continuous world coordinates.
pub fn square_cell_to_world_xy(x: i64, y: i64) -> (f64, f64) {
    (x as f64, y as f64)
}

/// Deterministic containing-cell conversion for square grids.
pub fn world_xy_to_square_cell(x: f64, y: f64) -> (i64, i64) {
    (x.floor() as i64, y.floor() as i64)
}

/// Normalize a 2D vector; the zero vector stays zero.
pub fn normalized_vector(x: f64, y: f64) -> (f64, f64) {
    let length_sq = x * x + y * y;
    if length_sq == 0.0 {
        return (0.0, 0.0);
    }
    let length = length_sq.sqrt();
    (x / length, y / length)
}

/// Normalize a facing token to 0..=5. Accepts integers and integer strings.
pub fn normalize_facing_token(value: &Value) -> Option<u8> {
    let raw = match value {
        Value::Number(n) => n.as_i64()?,
        Value::String(s) => s.trim().parse::<i64>().ok()?,
        _ => return None,
    };
    if (0..6).contains(&raw) {
        Some(raw as u8)
    } else {
        None
    }
}

// ============================================================================
// CellCoord
// ============================================================================

/// A discrete cell address in either supported topology.
///
/// The derived `Ord` (hex before square, then lexicographic components) is
/// the canonical sort key for occlusion-edge canonicalization and affected
/// ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellCoord {
    Hex { q: i64, r: i64 },
    Square { x: i64, y: i64 },
}

impl CellCoord {
    pub fn hex(q: i64, r: i64) -> Self {
        CellCoord::Hex { q, r }
    }

    pub fn square(x: i64, y: i64) -> Self {
        CellCoord::Square { x, y }
    }

    pub fn as_hex(&self) -> Option<HexCoord> {
        match self {
            CellCoord::Hex { q, r } => Some(HexCoord::new(*q, *r)),
            CellCoord::Square { .. } => None,
        }
    }

    pub fn as_square(&self) -> Option<(i64, i64)> {
        match self {
            CellCoord::Square { x, y } => Some((*x, *y)),
            CellCoord::Hex { .. } => None,
        }
    }

    /// True when both coords address the same topology family.
    pub fn same_topology(&self, other: &CellCoord) -> bool {
        matches!(
            (self, other),
            (CellCoord::Hex { .. }, CellCoord::Hex { .. })
                | (CellCoord::Square { .. }, CellCoord::Square { .. })
        )
    }

    /// Parse from a free-form JSON value; `None` on shape mismatch.
    pub fn from_value(value: &Value) -> Option<CellCoord> {
        let map = value.as_object()?;
        if map.contains_key("q") || map.contains_key("r") {
            return Some(CellCoord::Hex {
                q: map.get("q")?.as_i64()?,
                r: map.get("r")?.as_i64()?,
            });
        }
        if map.contains_key("x") || map.contains_key("y") {
            return Some(CellCoord::Square {
                x: map.get("x")?.as_i64()?,
                y: map.get("y")?.as_i64()?,
            });
        }
        None
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("cell coord serialization is infallible")
    }
}

impl From<HexCoord> for CellCoord {
    fn from(coord: HexCoord) -> Self {
        CellCoord::Hex {
            q: coord.q,
            r: coord.r,
        }
    }
}

// ============================================================================
// LocationRef
// ============================================================================

/// Opaque, serializable location reference for event contracts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationRef {
    pub space_id: String,
    pub topology_type: String,
    pub coord: CellCoord,
}

impl LocationRef {
    pub fn new(space_id: impl Into<String>, topology_type: impl Into<String>, coord: CellCoord) -> Self {
        LocationRef {
            space_id: space_id.into(),
            topology_type: topology_type.into(),
            coord,
        }
    }

    pub fn from_overworld_hex(coord: HexCoord) -> Self {
        LocationRef::new(super::DEFAULT_OVERWORLD_SPACE_ID, OVERWORLD_HEX_TOPOLOGY, coord.into())
    }

    /// Topology tag and coord shape agree.
    pub fn is_coherent(&self) -> bool {
        match self.topology_type.as_str() {
            OVERWORLD_HEX_TOPOLOGY => matches!(self.coord, CellCoord::Hex { .. }),
            SQUARE_GRID_TOPOLOGY => matches!(self.coord, CellCoord::Square { .. }),
            _ => true,
        }
    }

    /// Parse from a free-form JSON value; `None` on shape mismatch.
    pub fn from_value(value: &Value) -> Option<LocationRef> {
        let map = value.as_object()?;
        let space_id = map.get("space_id")?.as_str()?;
        let topology_type = map.get("topology_type")?.as_str()?;
        if space_id.is_empty() || topology_type.is_empty() {
            return None;
        }
        let coord = CellCoord::from_value(map.get("coord")?)?;
        let location = LocationRef::new(space_id, topology_type, coord);
        if location.is_coherent() {
            Some(location)
        } else {
            None
        }
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).expect("location serialization is infallible")
    }
}

/// Topology-aware distance. `None` on space or topology mismatch.
pub fn distance_between_locations(a: &LocationRef, b: &LocationRef) -> Option<i64> {
    if a.space_id != b.space_id || a.topology_type != b.topology_type {
        return None;
    }
    match (a.coord, b.coord) {
        (CellCoord::Hex { .. }, CellCoord::Hex { .. })
            if a.topology_type == OVERWORLD_HEX_TOPOLOGY =>
        {
            Some(hex_distance(a.coord.as_hex()?, b.coord.as_hex()?))
        }
        (CellCoord::Square { x: ax, y: ay }, CellCoord::Square { x: bx, y: by })
            if a.topology_type == SQUARE_GRID_TOPOLOGY =>
        {
            Some((ax - bx).abs() + (ay - by).abs())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn axial_world_round_trip() {
        for q in -6..=6 {
            for r in -6..=6 {
                let coord = HexCoord::new(q, r);
                let (x, y) = axial_to_world_xy(coord);
                assert_eq!(world_xy_to_axial(x, y), coord);
            }
        }
    }

    #[test]
    fn hex_distance_symmetric() {
        let a = HexCoord::new(0, 0);
        let b = HexCoord::new(3, -1);
        assert_eq!(hex_distance(a, b), hex_distance(b, a));
        assert_eq!(hex_distance(a, a), 0);
    }

    #[test]
    fn neighbor_direction_matches_table() {
        let origin = HexCoord::new(2, 2);
        for (index, neighbor) in hex_neighbors(origin).iter().enumerate() {
            assert_eq!(hex_neighbor_direction(origin, *neighbor), Some(index));
        }
        assert_eq!(hex_neighbor_direction(origin, HexCoord::new(5, 5)), None);
    }

    #[test]
    fn cell_coord_parses_both_shapes() {
        assert_eq!(
            CellCoord::from_value(&json!({"q": 1, "r": -2})),
            Some(CellCoord::hex(1, -2))
        );
        assert_eq!(
            CellCoord::from_value(&json!({"x": 4, "y": 9})),
            Some(CellCoord::square(4, 9))
        );
        assert_eq!(CellCoord::from_value(&json!({"lat": 3.0})), None);
    }

    #[test]
    fn cell_coord_sort_key_orders_hex_before_square() {
        let mut cells = vec![
            CellCoord::square(0, 0),
            CellCoord::hex(1, 0),
            CellCoord::hex(0, 5),
        ];
        cells.sort();
        assert_eq!(
            cells,
            vec![CellCoord::hex(0, 5), CellCoord::hex(1, 0), CellCoord::square(0, 0)]
        );
    }

    #[test]
    fn location_distance_rejects_mismatches() {
        let a = LocationRef::from_overworld_hex(HexCoord::new(0, 0));
        let b = LocationRef::from_overworld_hex(HexCoord::new(1, -1));
        assert_eq!(distance_between_locations(&a, &b), Some(1));

        let other_space = LocationRef::new("crypt", OVERWORLD_HEX_TOPOLOGY, CellCoord::hex(0, 0));
        assert_eq!(distance_between_locations(&a, &other_space), None);

        let square = LocationRef::new("overworld", SQUARE_GRID_TOPOLOGY, CellCoord::square(0, 0));
        assert_eq!(distance_between_locations(&a, &square), None);
    }

    #[test]
    fn facing_token_normalization() {
        assert_eq!(normalize_facing_token(&json!(4)), Some(4));
        assert_eq!(normalize_facing_token(&json!("2")), Some(2));
        assert_eq!(normalize_facing_token(&json!(6)), None);
        assert_eq!(normalize_facing_token(&json!(-1)), None);
        assert_eq!(normalize_facing_token(&json!(null)), None);
    }
}
