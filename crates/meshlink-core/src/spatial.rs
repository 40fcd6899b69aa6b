//! Grid-based spatial hash for approximate nearest-neighbour lookups
//!
//! Points are bucketed by floor-dividing each axis by the cell size and folding
//! the three cell coordinates into a single key. All key arithmetic wraps, so
//! the same instance must be used to build and to probe a bucket map.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Default grid cell edge length
pub const DEFAULT_CELL_SIZE: f32 = 0.1;

const PRIME_Y: i64 = 73_856_093;
const PRIME_Z: i64 = 19_349_663;

/// Folded cell coordinate
pub type CellKey = i64;

/// Cell key -> indices of the points falling into that cell
pub type SpatialBuckets = FxHashMap<CellKey, Vec<u32>>;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SpatialHash {
    cell_size: f32,
}

impl Default for SpatialHash {
    fn default() -> Self {
        Self {
            cell_size: DEFAULT_CELL_SIZE,
        }
    }
}

impl SpatialHash {
    /// Create a hash with the given cell size. Non-positive or non-finite
    /// sizes fall back to [`DEFAULT_CELL_SIZE`].
    pub fn new(cell_size: f32) -> Self {
        if cell_size.is_finite() && cell_size > 0.0 {
            Self { cell_size }
        } else {
            tracing::warn!(cell_size, "Invalid spatial hash cell size, using default");
            Self::default()
        }
    }

    pub fn cell_size(&self) -> f32 {
        self.cell_size
    }

    /// Integer cell coordinates of a point
    pub fn cell_coords(&self, point: [f32; 3]) -> [i64; 3] {
        [
            (point[0] / self.cell_size).floor() as i64,
            (point[1] / self.cell_size).floor() as i64,
            (point[2] / self.cell_size).floor() as i64,
        ]
    }

    /// Bucket key of the cell containing `point`
    pub fn cell_key(&self, point: [f32; 3]) -> CellKey {
        let [x, y, z] = self.cell_coords(point);
        fold(x, y, z)
    }

    /// Key offsets of the 3x3x3 block of cells around a cell, the cell itself
    /// included. Adding an offset to a cell key (wrapping) yields the key of
    /// the neighbouring cell.
    pub fn neighbor_offsets() -> [CellKey; 27] {
        let mut offsets = [0; 27];
        let mut i = 0;
        for dx in -1..=1 {
            for dy in -1..=1 {
                for dz in -1..=1 {
                    offsets[i] = fold(dx, dy, dz);
                    i += 1;
                }
            }
        }
        offsets
    }

    /// Bucket every point by its cell key
    pub fn build(&self, points: &[[f32; 3]]) -> SpatialBuckets {
        let mut buckets = SpatialBuckets::default();
        for (index, point) in points.iter().enumerate() {
            buckets
                .entry(self.cell_key(*point))
                .or_default()
                .push(index as u32);
        }
        buckets
    }

    /// Indices of every bucketed point in the 27 cells around `point`
    pub fn candidates<'a>(
        &self,
        buckets: &'a SpatialBuckets,
        point: [f32; 3],
    ) -> impl Iterator<Item = u32> + 'a {
        let key = self.cell_key(point);
        Self::neighbor_offsets()
            .into_iter()
            .filter_map(move |offset| buckets.get(&key.wrapping_add(offset)))
            .flat_map(|indices| indices.iter().copied())
    }
}

fn fold(x: i64, y: i64, z: i64) -> CellKey {
    x.wrapping_add(y.wrapping_mul(PRIME_Y))
        .wrapping_add(z.wrapping_mul(PRIME_Z))
}

/// Squared Euclidean distance
pub fn distance_sq(a: [f32; 3], b: [f32; 3]) -> f32 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    dx * dx + dy * dy + dz * dz
}
