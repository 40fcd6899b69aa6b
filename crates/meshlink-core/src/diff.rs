//! Incremental mesh differencing against a bounded cache of prior snapshots
//!
//! Every processed snapshot is cached under its own id together with its
//! spatial buckets. A later snapshot names the id it supersedes and receives a
//! [`MeshDelta`] describing which vertices were added, moved or removed, plus
//! the triangles touching them. The cache holds at most `cache_capacity`
//! entries; the entries with the oldest capture time are evicted first.

use chrono::{DateTime, Utc};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::mesh::{MeshData, MeshId};
use crate::spatial::{distance_sq, SpatialBuckets, SpatialHash, DEFAULT_CELL_SIZE};

/// Estimated wire cost of one vertex position
pub const VERTEX_BYTES: usize = 12;
/// Estimated wire cost of one vertex index
pub const INDEX_BYTES: usize = 4;

#[derive(Error, Debug, PartialEq)]
pub enum DiffError {
    #[error("Vertex {index} is unchanged but the base mesh only has {base_len} vertices")]
    IndexOutOfBase { index: u32, base_len: usize },
    #[error("Malformed delta: {0}")]
    Malformed(String),
}

/// Differencing engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffConfig {
    /// Maximum distance at which a new vertex matches a base vertex
    #[serde(default = "default_vertex_tolerance")]
    pub vertex_tolerance: f32,
    /// Matches closer than this are unchanged and left out of the delta
    #[serde(default = "default_unchanged_tolerance")]
    pub unchanged_tolerance: f32,
    /// Spatial hash cell size
    #[serde(default = "default_cell_size")]
    pub cell_size: f32,
    /// Number of snapshots kept for differencing
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    /// Radius of the second pass that pairs leftover vertices as moved.
    /// Capped at `cell_size`; 0 disables the pass.
    #[serde(default = "default_max_displacement")]
    pub max_displacement: f32,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            vertex_tolerance: default_vertex_tolerance(),
            unchanged_tolerance: default_unchanged_tolerance(),
            cell_size: default_cell_size(),
            cache_capacity: default_cache_capacity(),
            max_displacement: default_max_displacement(),
        }
    }
}

fn default_vertex_tolerance() -> f32 {
    0.001
}

fn default_unchanged_tolerance() -> f32 {
    0.0001
}

fn default_cell_size() -> f32 {
    DEFAULT_CELL_SIZE
}

fn default_cache_capacity() -> usize {
    10
}

fn default_max_displacement() -> f32 {
    DEFAULT_CELL_SIZE
}

/// A new vertex paired with the base vertex it moved from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VertexMatch {
    pub new_index: u32,
    pub base_index: u32,
}

/// Difference between a new snapshot and the base snapshot it supersedes
#[derive(Debug, Clone, PartialEq)]
pub struct MeshDelta {
    /// Id of the new snapshot
    pub mesh_id: MeshId,
    /// Id of the base snapshot, absent when no base was cached
    pub base_mesh_id: Option<MeshId>,
    /// Vertex count of the new snapshot
    pub vertex_count: u32,
    /// New-mesh indices with no counterpart in the base
    pub added_vertices: Vec<u32>,
    /// Positions of `added_vertices`, same order
    pub added_positions: Vec<[f32; 3]>,
    /// New vertices paired with the base vertex they moved from
    pub modified_vertices: Vec<VertexMatch>,
    /// New positions of `modified_vertices`, same order
    pub modified_positions: Vec<[f32; 3]>,
    /// Base-mesh indices no new vertex matched
    pub removed_vertices: Vec<u32>,
    /// New-mesh triangles touching an added or modified vertex
    pub faces: Vec<u32>,
    /// Estimated delta size over estimated full size
    pub compression_ratio: f32,
}

impl MeshDelta {
    /// Delta describing a snapshot with no usable base: everything is added
    pub fn full(mesh: &MeshData) -> Self {
        Self {
            mesh_id: mesh.id.clone(),
            base_mesh_id: None,
            vertex_count: mesh.vertices.len() as u32,
            added_vertices: (0..mesh.vertices.len() as u32).collect(),
            added_positions: mesh.vertices.clone(),
            modified_vertices: Vec::new(),
            modified_positions: Vec::new(),
            removed_vertices: Vec::new(),
            faces: mesh.faces.clone(),
            compression_ratio: 1.0,
        }
    }

    /// True when no base was found and the delta carries the whole mesh
    pub fn is_full(&self) -> bool {
        self.base_mesh_id.is_none()
    }

    /// True when nothing changed relative to the base
    pub fn is_empty(&self) -> bool {
        self.added_vertices.is_empty()
            && self.modified_vertices.is_empty()
            && self.removed_vertices.is_empty()
            && self.faces.is_empty()
    }

    /// Check that the parallel position arrays line up with their indices
    pub fn validate(&self) -> Result<(), DiffError> {
        if self.added_positions.len() != self.added_vertices.len() {
            return Err(DiffError::Malformed(format!(
                "{} added vertices but {} positions",
                self.added_vertices.len(),
                self.added_positions.len()
            )));
        }
        if self.modified_positions.len() != self.modified_vertices.len() {
            return Err(DiffError::Malformed(format!(
                "{} modified vertices but {} positions",
                self.modified_vertices.len(),
                self.modified_positions.len()
            )));
        }
        if self.faces.len() % 3 != 0 {
            return Err(DiffError::Malformed(format!(
                "face index count {} is not a multiple of 3",
                self.faces.len()
            )));
        }
        Ok(())
    }
}

/// Ratio of the estimated delta size to the estimated full-mesh size
pub fn estimate_compression_ratio(
    vertex_count: usize,
    face_index_count: usize,
    added: usize,
    modified: usize,
    removed: usize,
    delta_face_indices: usize,
) -> f32 {
    let original = vertex_count * VERTEX_BYTES + face_index_count * INDEX_BYTES;
    let delta = (added + modified) * VERTEX_BYTES + (removed + delta_face_indices) * INDEX_BYTES;
    if original == 0 {
        return if delta == 0 { 0.0 } else { 1.0 };
    }
    delta as f32 / original as f32
}

/// A retained snapshot with its precomputed buckets
#[derive(Debug, Clone)]
struct CachedMesh {
    vertices: Vec<[f32; 3]>,
    faces: Vec<u32>,
    buckets: SpatialBuckets,
    timestamp: DateTime<Utc>,
}

/// Differencing engine owning the snapshot cache
#[derive(Debug)]
pub struct MeshDiffer {
    config: DiffConfig,
    hash: SpatialHash,
    cache: HashMap<MeshId, CachedMesh>,
}

impl Default for MeshDiffer {
    fn default() -> Self {
        Self::new(DiffConfig::default())
    }
}

impl MeshDiffer {
    pub fn new(config: DiffConfig) -> Self {
        let hash = SpatialHash::new(config.cell_size);
        Self {
            config,
            hash,
            cache: HashMap::new(),
        }
    }

    pub fn config(&self) -> &DiffConfig {
        &self.config
    }

    /// Whether a snapshot is cached under `id`
    pub fn contains(&self, id: &MeshId) -> bool {
        self.cache.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    /// Diff `new_mesh` against the snapshot cached under `base_mesh_id`.
    ///
    /// On a cache miss the whole mesh is reported as added with a ratio of 1.0.
    /// Either way `new_mesh` is cached under its own id and the cache is
    /// trimmed back to capacity.
    pub fn compute_diff(&mut self, base_mesh_id: &MeshId, new_mesh: &MeshData) -> MeshDelta {
        let buckets = self.hash.build(&new_mesh.vertices);

        let delta = match self.cache.get(base_mesh_id) {
            Some(base) => {
                let delta = self.diff_against(base_mesh_id, base, new_mesh);
                debug!(
                    mesh = %new_mesh.id,
                    base = %base_mesh_id,
                    added = delta.added_vertices.len(),
                    modified = delta.modified_vertices.len(),
                    removed = delta.removed_vertices.len(),
                    ratio = delta.compression_ratio,
                    "Computed mesh delta"
                );
                delta
            }
            None => {
                debug!(
                    mesh = %new_mesh.id,
                    base = %base_mesh_id,
                    vertices = new_mesh.vertices.len(),
                    "Base mesh not cached, treating snapshot as new"
                );
                MeshDelta::full(new_mesh)
            }
        };

        self.cache.insert(
            new_mesh.id.clone(),
            CachedMesh {
                vertices: new_mesh.vertices.clone(),
                faces: new_mesh.faces.clone(),
                buckets,
                timestamp: new_mesh.timestamp,
            },
        );
        self.evict();

        delta
    }

    fn diff_against(&self, base_id: &MeshId, base: &CachedMesh, new_mesh: &MeshData) -> MeshDelta {
        let tolerance_sq = self.config.vertex_tolerance * self.config.vertex_tolerance;
        let unchanged_sq = self.config.unchanged_tolerance * self.config.unchanged_tolerance;

        let mut base_matched = vec![false; base.vertices.len()];
        let mut added = Vec::new();
        let mut modified: Vec<(VertexMatch, [f32; 3])> = Vec::new();
        let mut unmatched = Vec::new();

        for (index, &position) in new_mesh.vertices.iter().enumerate() {
            let found = self
                .hash
                .candidates(&base.buckets, position)
                .map(|b| (b, distance_sq(position, base.vertices[b as usize])))
                .find(|&(_, d)| d <= tolerance_sq);

            match found {
                Some((base_index, d)) => {
                    base_matched[base_index as usize] = true;
                    if d > unchanged_sq {
                        modified.push((
                            VertexMatch {
                                new_index: index as u32,
                                base_index,
                            },
                            position,
                        ));
                    }
                }
                None => unmatched.push(index as u32),
            }
        }

        let displacement = self.config.max_displacement.min(self.hash.cell_size());
        if displacement > 0.0 {
            // Slack keeps a move of exactly `displacement` inside the radius
            let limit_sq = displacement * displacement * 1.0001;
            for index in unmatched {
                let position = new_mesh.vertices[index as usize];
                let nearest = self
                    .hash
                    .candidates(&base.buckets, position)
                    .filter(|&b| !base_matched[b as usize])
                    .map(|b| (b, distance_sq(position, base.vertices[b as usize])))
                    .filter(|&(_, d)| d <= limit_sq)
                    .min_by(|a, b| a.1.total_cmp(&b.1));

                match nearest {
                    Some((base_index, _)) => {
                        base_matched[base_index as usize] = true;
                        trace!(new = index, base = base_index, "Paired displaced vertex");
                        modified.push((
                            VertexMatch {
                                new_index: index,
                                base_index,
                            },
                            position,
                        ));
                    }
                    None => added.push(index),
                }
            }
        } else {
            added = unmatched;
        }

        modified.sort_unstable_by_key(|(m, _)| m.new_index);
        let (modified_vertices, modified_positions): (Vec<_>, Vec<_>) = modified.into_iter().unzip();

        let removed_vertices: Vec<u32> = base_matched
            .iter()
            .enumerate()
            .filter(|&(_, &matched)| !matched)
            .map(|(i, _)| i as u32)
            .collect();

        let mut changed = vec![false; new_mesh.vertices.len()];
        for &i in &added {
            changed[i as usize] = true;
        }
        for m in &modified_vertices {
            changed[m.new_index as usize] = true;
        }

        let faces: Vec<u32> = new_mesh
            .faces
            .chunks_exact(3)
            .filter(|tri| tri.iter().any(|&i| changed.get(i as usize).copied().unwrap_or(false)))
            .flatten()
            .copied()
            .collect();

        let compression_ratio = estimate_compression_ratio(
            new_mesh.vertices.len(),
            new_mesh.faces.len(),
            added.len(),
            modified_vertices.len(),
            removed_vertices.len(),
            faces.len(),
        );

        let added_positions = added.iter().map(|&i| new_mesh.vertices[i as usize]).collect();

        MeshDelta {
            mesh_id: new_mesh.id.clone(),
            base_mesh_id: Some(base_id.clone()),
            vertex_count: new_mesh.vertices.len() as u32,
            added_vertices: added,
            added_positions,
            modified_vertices,
            modified_positions,
            removed_vertices,
            faces,
            compression_ratio,
        }
    }

    /// Rebuild a snapshot from the cached base and a delta.
    ///
    /// Vertices the delta does not mention are taken from the base at the same
    /// index; the delta does not record where unchanged vertices came from, so
    /// reconstruction is exact only when unchanged vertices kept their index.
    /// Base triangles touching no changed or removed vertex are kept, followed
    /// by the delta's triangles. Normals are not reconstructed. The rebuilt
    /// snapshot is stamped with `timestamp`, normally the capture time carried
    /// alongside the delta.
    /// Returns `Ok(None)` when the base is not cached.
    pub fn apply_delta(
        &self,
        base_mesh_id: &MeshId,
        delta: &MeshDelta,
        timestamp: DateTime<Utc>,
    ) -> Result<Option<MeshData>, DiffError> {
        let Some(base) = self.cache.get(base_mesh_id) else {
            return Ok(None);
        };
        delta.validate()?;

        let mut carried: FxHashMap<u32, [f32; 3]> = FxHashMap::default();
        carried.extend(
            delta
                .added_vertices
                .iter()
                .copied()
                .zip(delta.added_positions.iter().copied()),
        );
        carried.extend(
            delta
                .modified_vertices
                .iter()
                .map(|m| m.new_index)
                .zip(delta.modified_positions.iter().copied()),
        );

        let mut vertices = Vec::with_capacity(delta.vertex_count as usize);
        for index in 0..delta.vertex_count {
            let position = match carried.get(&index) {
                Some(p) => *p,
                None => *base.vertices.get(index as usize).ok_or(DiffError::IndexOutOfBase {
                    index,
                    base_len: base.vertices.len(),
                })?,
            };
            vertices.push(position);
        }

        let mut faces = Vec::with_capacity(base.faces.len() + delta.faces.len());
        if !delta.is_full() {
            let removed: FxHashSet<u32> = delta.removed_vertices.iter().copied().collect();
            let keep = |i: u32| i < delta.vertex_count && !carried.contains_key(&i) && !removed.contains(&i);
            faces.extend(
                base.faces
                    .chunks_exact(3)
                    .filter(|tri| tri.iter().all(|&i| keep(i)))
                    .flatten()
                    .copied(),
            );
        }
        faces.extend_from_slice(&delta.faces);

        Ok(Some(MeshData {
            id: delta.mesh_id.clone(),
            vertices,
            faces,
            normals: Vec::new(),
            timestamp,
        }))
    }

    /// Drop the oldest snapshots by capture time until within capacity
    fn evict(&mut self) {
        while self.cache.len() > self.config.cache_capacity {
            let oldest = self
                .cache
                .iter()
                .min_by_key(|(_, cached)| cached.timestamp)
                .map(|(id, _)| id.clone());
            match oldest {
                Some(id) => {
                    self.cache.remove(&id);
                    debug!(mesh = %id, "Evicted cached mesh");
                }
                None => break,
            }
        }
    }
}
