//! meshlink core - mesh types, spatial hashing, differencing and codec
//!
//! This crate provides the CPU-bound half of the meshlink pipeline:
//! - Captured mesh and pose types handed over by the capture layer
//! - A grid spatial hash for approximate nearest-neighbour lookups
//! - A differencing engine computing deltas against cached snapshots
//! - A gzip-framed binary codec for full meshes and deltas

pub mod codec;
pub mod diff;
pub mod mesh;
pub mod spatial;

pub use codec::{CodecConfig, CodecError, CompressedMeshData, CompressionLevel, CompressionStats, MeshCodec};
pub use diff::{DiffConfig, DiffError, MeshDelta, MeshDiffer, VertexMatch};
pub use mesh::{MeshData, MeshError, MeshId, PoseData};
pub use spatial::{SpatialBuckets, SpatialHash};
