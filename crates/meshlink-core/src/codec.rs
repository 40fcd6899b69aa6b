//! Binary mesh codec
//!
//! Full meshes are laid out as an 8-byte header (vertex count, face index
//! count; both little-endian u32) followed by the vertex positions as LE f32
//! triples and the face indices as LE u32. Deltas use a 24-byte header
//! (vertex count, added, modified, removed, face index count, ratio as f32)
//! followed by the added indices and positions, the modified index pairs and
//! positions, the removed indices and the face indices. Normals always travel
//! in a separate buffer. Every buffer is wrapped in a gzip container.

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, trace};

use crate::diff::{MeshDelta, VertexMatch};
use crate::mesh::{MeshData, MeshError, MeshId};

const MESH_HEADER_LEN: usize = 8;
const DELTA_HEADER_LEN: usize = 24;

/// Largest buffer a single gzip member may inflate to
pub const MAX_DECOMPRESSED_LEN: u64 = 256 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid mesh data: {0}")]
    InvalidData(String),
    #[error("Mesh failed validation: {0}")]
    InvalidMesh(#[from] MeshError),
    #[error("Payload is a {0}, expected the other kind")]
    WrongPayload(&'static str),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Compression effort, mapped onto deflate levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionLevel {
    None,
    Low,
    #[default]
    Medium,
    High,
    Maximum,
}

impl CompressionLevel {
    pub const ALL: [CompressionLevel; 5] = [
        CompressionLevel::None,
        CompressionLevel::Low,
        CompressionLevel::Medium,
        CompressionLevel::High,
        CompressionLevel::Maximum,
    ];

    /// Numeric level as carried on the wire
    pub fn level(self) -> u32 {
        match self {
            CompressionLevel::None => 0,
            CompressionLevel::Low => 3,
            CompressionLevel::Medium => 5,
            CompressionLevel::High => 7,
            CompressionLevel::Maximum => 9,
        }
    }

    /// Nearest named level for a numeric level; ties go to the lower level
    pub fn from_level(level: u32) -> Self {
        Self::ALL
            .into_iter()
            .min_by_key(|l| l.level().abs_diff(level))
            .unwrap_or_default()
    }

    fn compression(self) -> Compression {
        Compression::new(self.level())
    }
}

/// Codec configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CodecConfig {
    #[serde(default)]
    pub level: CompressionLevel,
}

/// Wire-ready compressed mesh or delta
#[derive(Debug, Clone, PartialEq)]
pub struct CompressedMeshData {
    /// Id of the encoded snapshot
    pub mesh_id: MeshId,
    /// Base snapshot id; present exactly when `data` holds a delta
    pub base_mesh_id: Option<MeshId>,
    /// Compressed vertex and face buffer
    pub data: Vec<u8>,
    /// Compressed normal buffer
    pub normals: Option<Vec<u8>>,
    pub level: CompressionLevel,
    pub timestamp: DateTime<Utc>,
    /// Uncompressed size of all buffers
    pub original_size: usize,
    /// Compressed size of all buffers
    pub compressed_size: usize,
}

impl CompressedMeshData {
    pub fn is_delta(&self) -> bool {
        self.base_mesh_id.is_some()
    }

    /// Compressed size over original size
    pub fn ratio(&self) -> f32 {
        if self.original_size == 0 {
            1.0
        } else {
            self.compressed_size as f32 / self.original_size as f32
        }
    }
}

/// Snapshot of the running compression counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CompressionStats {
    pub original_bytes: u64,
    pub compressed_bytes: u64,
    pub operations: u64,
}

impl CompressionStats {
    pub fn ratio(&self) -> f32 {
        if self.original_bytes == 0 {
            1.0
        } else {
            self.compressed_bytes as f32 / self.original_bytes as f32
        }
    }
}

/// Mesh encoder/decoder with running compression statistics
#[derive(Debug, Default)]
pub struct MeshCodec {
    original_bytes: AtomicU64,
    compressed_bytes: AtomicU64,
    operations: AtomicU64,
}

impl MeshCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> CompressionStats {
        CompressionStats {
            original_bytes: self.original_bytes.load(Ordering::Relaxed),
            compressed_bytes: self.compressed_bytes.load(Ordering::Relaxed),
            operations: self.operations.load(Ordering::Relaxed),
        }
    }

    pub fn reset_stats(&self) {
        self.original_bytes.store(0, Ordering::Relaxed);
        self.compressed_bytes.store(0, Ordering::Relaxed);
        self.operations.store(0, Ordering::Relaxed);
    }

    /// Serialize and compress a complete mesh
    pub fn encode_full(
        &self,
        mesh: &MeshData,
        level: CompressionLevel,
    ) -> Result<CompressedMeshData, CodecError> {
        mesh.validate()?;

        let mut raw = Vec::with_capacity(MESH_HEADER_LEN + mesh.vertices.len() * 12 + mesh.faces.len() * 4);
        put_u32(&mut raw, mesh.vertices.len() as u32);
        put_u32(&mut raw, mesh.faces.len() as u32);
        put_positions(&mut raw, &mesh.vertices);
        put_indices(&mut raw, &mesh.faces);

        let data = self.compress(&raw, level)?;
        let mut original_size = raw.len();
        let mut compressed_size = data.len();

        let normals = if mesh.has_normals() {
            let mut raw_normals = Vec::with_capacity(mesh.normals.len() * 12);
            put_positions(&mut raw_normals, &mesh.normals);
            let compressed = self.compress(&raw_normals, level)?;
            original_size += raw_normals.len();
            compressed_size += compressed.len();
            Some(compressed)
        } else {
            None
        };

        debug!(
            mesh = %mesh.id,
            vertices = mesh.vertices.len(),
            faces = mesh.triangle_count(),
            original = original_size,
            compressed = compressed_size,
            level = level.level(),
            "Encoded full mesh"
        );

        Ok(CompressedMeshData {
            mesh_id: mesh.id.clone(),
            base_mesh_id: None,
            data,
            normals,
            level,
            timestamp: mesh.timestamp,
            original_size,
            compressed_size,
        })
    }

    /// Decompress and deserialize a full mesh
    pub fn decode(&self, compressed: &CompressedMeshData) -> Result<MeshData, CodecError> {
        if compressed.is_delta() {
            return Err(CodecError::WrongPayload("delta"));
        }

        let raw = decompress(&compressed.data)?;
        if raw.len() < MESH_HEADER_LEN {
            return Err(CodecError::InvalidData(format!(
                "buffer of {} bytes is shorter than the {MESH_HEADER_LEN}-byte header",
                raw.len()
            )));
        }

        let mut reader = ByteReader::new(&raw);
        let vertex_count = reader.u32()? as usize;
        let face_count = reader.u32()? as usize;

        let required = (MESH_HEADER_LEN as u64)
            + vertex_count as u64 * 12
            + face_count as u64 * 4;
        if (raw.len() as u64) < required {
            return Err(CodecError::InvalidData(format!(
                "buffer of {} bytes too short for {vertex_count} vertices and {face_count} indices ({required} bytes)",
                raw.len()
            )));
        }

        let vertices = reader.positions(vertex_count)?;
        let faces = reader.indices(face_count)?;

        let normals = match &compressed.normals {
            Some(buffer) => {
                let raw_normals = decompress(buffer)?;
                if raw_normals.len() < vertex_count * 12 {
                    return Err(CodecError::InvalidData(format!(
                        "normal buffer of {} bytes too short for {vertex_count} normals",
                        raw_normals.len()
                    )));
                }
                ByteReader::new(&raw_normals).positions(vertex_count)?
            }
            None => Vec::new(),
        };

        trace!(mesh = %compressed.mesh_id, vertices = vertex_count, "Decoded mesh");

        Ok(MeshData {
            id: compressed.mesh_id.clone(),
            vertices,
            faces,
            normals,
            timestamp: compressed.timestamp,
        })
    }

    /// Serialize and compress a delta computed against a cached base.
    /// Deltas without a base are sent as full meshes instead.
    pub fn encode_delta(
        &self,
        delta: &MeshDelta,
        timestamp: DateTime<Utc>,
        level: CompressionLevel,
    ) -> Result<CompressedMeshData, CodecError> {
        let Some(base_mesh_id) = delta.base_mesh_id.clone() else {
            return Err(CodecError::WrongPayload("full mesh"));
        };
        delta
            .validate()
            .map_err(|e| CodecError::InvalidData(e.to_string()))?;

        let mut raw = Vec::with_capacity(
            DELTA_HEADER_LEN
                + delta.added_vertices.len() * 16
                + delta.modified_vertices.len() * 20
                + (delta.removed_vertices.len() + delta.faces.len()) * 4,
        );
        put_u32(&mut raw, delta.vertex_count);
        put_u32(&mut raw, delta.added_vertices.len() as u32);
        put_u32(&mut raw, delta.modified_vertices.len() as u32);
        put_u32(&mut raw, delta.removed_vertices.len() as u32);
        put_u32(&mut raw, delta.faces.len() as u32);
        raw.extend_from_slice(&delta.compression_ratio.to_le_bytes());

        put_indices(&mut raw, &delta.added_vertices);
        put_positions(&mut raw, &delta.added_positions);
        for m in &delta.modified_vertices {
            put_u32(&mut raw, m.new_index);
            put_u32(&mut raw, m.base_index);
        }
        put_positions(&mut raw, &delta.modified_positions);
        put_indices(&mut raw, &delta.removed_vertices);
        put_indices(&mut raw, &delta.faces);

        let data = self.compress(&raw, level)?;

        debug!(
            mesh = %delta.mesh_id,
            base = %base_mesh_id,
            original = raw.len(),
            compressed = data.len(),
            "Encoded mesh delta"
        );

        Ok(CompressedMeshData {
            mesh_id: delta.mesh_id.clone(),
            base_mesh_id: Some(base_mesh_id),
            original_size: raw.len(),
            compressed_size: data.len(),
            data,
            normals: None,
            level,
            timestamp,
        })
    }

    /// Decompress and deserialize a delta
    pub fn decode_delta(&self, compressed: &CompressedMeshData) -> Result<MeshDelta, CodecError> {
        let Some(base_mesh_id) = compressed.base_mesh_id.clone() else {
            return Err(CodecError::WrongPayload("full mesh"));
        };

        let raw = decompress(&compressed.data)?;
        if raw.len() < DELTA_HEADER_LEN {
            return Err(CodecError::InvalidData(format!(
                "buffer of {} bytes is shorter than the {DELTA_HEADER_LEN}-byte delta header",
                raw.len()
            )));
        }

        let mut reader = ByteReader::new(&raw);
        let vertex_count = reader.u32()?;
        let added = reader.u32()? as usize;
        let modified = reader.u32()? as usize;
        let removed = reader.u32()? as usize;
        let face_count = reader.u32()? as usize;
        let compression_ratio = f32::from_bits(reader.u32()?);

        let required = DELTA_HEADER_LEN as u64
            + added as u64 * 16
            + modified as u64 * 20
            + (removed as u64 + face_count as u64) * 4;
        if (raw.len() as u64) < required {
            return Err(CodecError::InvalidData(format!(
                "delta buffer of {} bytes too short, header requires {required}",
                raw.len()
            )));
        }

        let added_vertices = reader.indices(added)?;
        let added_positions = reader.positions(added)?;
        let mut modified_vertices = Vec::with_capacity(modified);
        for _ in 0..modified {
            modified_vertices.push(VertexMatch {
                new_index: reader.u32()?,
                base_index: reader.u32()?,
            });
        }
        let modified_positions = reader.positions(modified)?;
        let removed_vertices = reader.indices(removed)?;
        let faces = reader.indices(face_count)?;

        Ok(MeshDelta {
            mesh_id: compressed.mesh_id.clone(),
            base_mesh_id: Some(base_mesh_id),
            vertex_count,
            added_vertices,
            added_positions,
            modified_vertices,
            modified_positions,
            removed_vertices,
            faces,
            compression_ratio,
        })
    }

    fn compress(&self, raw: &[u8], level: CompressionLevel) -> Result<Vec<u8>, CodecError> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(raw.len() / 2 + 32), level.compression());
        encoder.write_all(raw)?;
        let compressed = encoder.finish()?;

        self.original_bytes.fetch_add(raw.len() as u64, Ordering::Relaxed);
        self.compressed_bytes
            .fetch_add(compressed.len() as u64, Ordering::Relaxed);
        self.operations.fetch_add(1, Ordering::Relaxed);

        Ok(compressed)
    }
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    decompress_bounded(data, MAX_DECOMPRESSED_LEN)
}

fn decompress_bounded(data: &[u8], limit: u64) -> Result<Vec<u8>, CodecError> {
    let mut raw = Vec::new();
    GzDecoder::new(data)
        .take(limit.saturating_add(1))
        .read_to_end(&mut raw)
        .map_err(|e| CodecError::InvalidData(format!("gzip: {e}")))?;
    if raw.len() as u64 > limit {
        return Err(CodecError::InvalidData(format!(
            "decompressed buffer exceeds {limit} bytes"
        )));
    }
    Ok(raw)
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_indices(buf: &mut Vec<u8>, indices: &[u32]) {
    for &i in indices {
        put_u32(buf, i);
    }
}

fn put_positions(buf: &mut Vec<u8>, positions: &[[f32; 3]]) {
    for p in positions {
        for c in p {
            buf.extend_from_slice(&c.to_le_bytes());
        }
    }
}

/// Little-endian cursor over a decompressed buffer
struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let end = self.pos + 4;
        let bytes: [u8; 4] = self
            .data
            .get(self.pos..end)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| CodecError::InvalidData(format!("unexpected end of buffer at byte {}", self.pos)))?;
        self.pos = end;
        Ok(u32::from_le_bytes(bytes))
    }

    fn f32(&mut self) -> Result<f32, CodecError> {
        self.u32().map(f32::from_bits)
    }

    fn indices(&mut self, count: usize) -> Result<Vec<u32>, CodecError> {
        (0..count).map(|_| self.u32()).collect()
    }

    fn positions(&mut self, count: usize) -> Result<Vec<[f32; 3]>, CodecError> {
        (0..count)
            .map(|_| -> Result<[f32; 3], CodecError> { Ok([self.f32()?, self.f32()?, self.f32()?]) })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::MeshDiffer;

    fn wave_mesh(n: u32) -> MeshData {
        let mut vertices = Vec::new();
        for y in 0..n {
            for x in 0..n {
                let (fx, fy) = (x as f32 * 0.05, y as f32 * 0.05);
                vertices.push([fx, fy, (fx * 3.0).sin() * (fy * 2.0).cos() * 0.1]);
            }
        }
        let mut faces = Vec::new();
        for y in 0..n.saturating_sub(1) {
            for x in 0..n - 1 {
                let i = y * n + x;
                faces.extend_from_slice(&[i, i + 1, i + n, i + 1, i + n + 1, i + n]);
            }
        }
        MeshData::new(vertices, faces)
    }

    fn assert_round_trip(original: &MeshData, decoded: &MeshData) {
        assert_eq!(decoded.id, original.id);
        assert_eq!(decoded.vertices.len(), original.vertices.len());
        for (a, b) in original.vertices.iter().zip(&decoded.vertices) {
            for axis in 0..3 {
                assert!((a[axis] - b[axis]).abs() < 1e-4);
            }
        }
        assert_eq!(decoded.faces, original.faces);
    }

    fn gzip(raw: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(raw).unwrap();
        encoder.finish().unwrap()
    }

    fn full_payload(data: Vec<u8>) -> CompressedMeshData {
        CompressedMeshData {
            mesh_id: MeshId::new("crafted"),
            base_mesh_id: None,
            data,
            normals: None,
            level: CompressionLevel::Medium,
            timestamp: Utc::now(),
            original_size: 0,
            compressed_size: 0,
        }
    }

    #[test]
    fn test_round_trip_every_level() {
        let codec = MeshCodec::new();
        let mesh = wave_mesh(100);
        assert_eq!(mesh.vertices.len(), 10_000);

        for level in CompressionLevel::ALL {
            let compressed = codec.encode_full(&mesh, level).unwrap();
            assert_eq!(compressed.level, level);
            assert!(!compressed.is_delta());
            let decoded = codec.decode(&compressed).unwrap();
            assert_round_trip(&mesh, &decoded);
        }
    }

    #[test]
    fn test_round_trip_with_normals() {
        let codec = MeshCodec::new();
        let mesh = wave_mesh(8);
        let normals = vec![[0.0, 0.0, 1.0]; mesh.vertices.len()];
        let mesh = mesh.with_normals(normals.clone());

        let compressed = codec.encode_full(&mesh, CompressionLevel::High).unwrap();
        assert!(compressed.normals.is_some());
        let decoded = codec.decode(&compressed).unwrap();
        assert_round_trip(&mesh, &decoded);
        assert_eq!(decoded.normals, normals);
    }

    #[test]
    fn test_empty_mesh_round_trip() {
        let codec = MeshCodec::new();
        let mesh = MeshData::new(Vec::new(), Vec::new());
        let compressed = codec.encode_full(&mesh, CompressionLevel::Maximum).unwrap();
        assert!(compressed.normals.is_none());
        let decoded = codec.decode(&compressed).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn test_gzip_container_and_header_layout() {
        let codec = MeshCodec::new();
        let mesh = wave_mesh(3);
        let compressed = codec.encode_full(&mesh, CompressionLevel::Low).unwrap();
        assert_eq!(&compressed.data[..3], &[0x1f, 0x8b, 0x08]);

        let raw = decompress(&compressed.data).unwrap();
        assert_eq!(&raw[..4], &9u32.to_le_bytes());
        assert_eq!(&raw[4..8], &24u32.to_le_bytes());
        assert_eq!(raw.len(), 8 + 9 * 12 + 24 * 4);
        assert_eq!(&raw[8..12], &mesh.vertices[0][0].to_le_bytes());
    }

    #[test]
    fn test_higher_levels_do_not_grow_output() {
        // Degenerate surface: every position and index is zero, so each
        // deflate level finds the same maximal matches
        let codec = MeshCodec::new();
        let mesh = MeshData::new(vec![[0.0; 3]; 4096], vec![0; 3 * 4096]);
        let sizes: Vec<usize> = CompressionLevel::ALL
            .iter()
            .map(|&level| codec.encode_full(&mesh, level).unwrap().compressed_size)
            .collect();

        assert!(sizes[0] > sizes[1], "sizes {sizes:?}");
        for pair in sizes.windows(2) {
            assert!(pair[1] <= pair[0], "sizes {sizes:?}");
        }
    }

    #[test]
    fn test_higher_levels_on_curved_surface() {
        let codec = MeshCodec::new();
        let mesh = wave_mesh(60);
        let sizes: Vec<usize> = CompressionLevel::ALL
            .iter()
            .map(|&level| codec.encode_full(&mesh, level).unwrap().compressed_size)
            .collect();

        assert!(sizes[0] > sizes[1]);
        assert!(sizes[1] >= sizes[4]);
        // deflate match search is heuristic on real geometry; neighbours may
        // differ by a sliver
        for pair in sizes.windows(2) {
            assert!(pair[1] <= pair[0] + pair[0] / 100, "sizes {sizes:?}");
        }
    }

    #[test]
    fn test_decompression_is_bounded() {
        let bomb = gzip(&vec![0u8; 1 << 20]);
        assert!(bomb.len() < 4096);
        assert!(matches!(
            decompress_bounded(&bomb, 64 * 1024),
            Err(CodecError::InvalidData(_))
        ));
        assert_eq!(decompress_bounded(&bomb, 1 << 20).unwrap().len(), 1 << 20);
    }

    #[test]
    fn test_invalid_mesh_rejected() {
        let codec = MeshCodec::new();
        let mesh = MeshData::new(vec![[0.0; 3]], vec![0, 0, 1]);
        assert!(matches!(
            codec.encode_full(&mesh, CompressionLevel::Low),
            Err(CodecError::InvalidMesh(_))
        ));
    }

    #[test]
    fn test_short_header_rejected() {
        let codec = MeshCodec::new();
        let result = codec.decode(&full_payload(gzip(&[1, 0, 0])));
        assert!(matches!(result, Err(CodecError::InvalidData(_))));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let codec = MeshCodec::new();
        let mut raw = Vec::new();
        put_u32(&mut raw, 5);
        put_u32(&mut raw, 3);
        put_positions(&mut raw, &[[0.0; 3]; 2]);
        let result = codec.decode(&full_payload(gzip(&raw)));
        assert!(matches!(result, Err(CodecError::InvalidData(_))));
    }

    #[test]
    fn test_not_gzip_rejected() {
        let codec = MeshCodec::new();
        let result = codec.decode(&full_payload(vec![0, 1, 2, 3, 4, 5, 6, 7, 8, 9]));
        assert!(matches!(result, Err(CodecError::InvalidData(_))));
    }

    #[test]
    fn test_short_normals_rejected() {
        let codec = MeshCodec::new();
        let mesh = wave_mesh(4);
        let mut compressed = codec.encode_full(&mesh, CompressionLevel::Low).unwrap();
        compressed.normals = Some(gzip(&[0u8; 12]));
        assert!(matches!(
            codec.decode(&compressed),
            Err(CodecError::InvalidData(_))
        ));
    }

    #[test]
    fn test_stats_accumulate_and_reset() {
        let codec = MeshCodec::new();
        let mesh = wave_mesh(10).with_normals(vec![[0.0, 1.0, 0.0]; 100]);
        let compressed = codec.encode_full(&mesh, CompressionLevel::Medium).unwrap();

        let stats = codec.stats();
        assert_eq!(stats.operations, 2);
        assert_eq!(stats.original_bytes, compressed.original_size as u64);
        assert_eq!(stats.compressed_bytes, compressed.compressed_size as u64);
        assert!(stats.ratio() < 1.0);

        codec.reset_stats();
        assert_eq!(codec.stats(), CompressionStats::default());
        assert_eq!(codec.stats().ratio(), 1.0);
    }

    #[test]
    fn test_level_mapping() {
        assert_eq!(CompressionLevel::None.level(), 0);
        assert_eq!(CompressionLevel::Maximum.level(), 9);
        assert_eq!(CompressionLevel::from_level(5), CompressionLevel::Medium);
        assert_eq!(CompressionLevel::from_level(6), CompressionLevel::Medium);
        assert_eq!(CompressionLevel::from_level(8), CompressionLevel::High);
        assert_eq!(CompressionLevel::from_level(1), CompressionLevel::None);
        assert_eq!(CompressionLevel::from_level(42), CompressionLevel::Maximum);
        assert!(CompressionLevel::Low < CompressionLevel::High);
    }

    #[test]
    fn test_delta_round_trip() {
        let codec = MeshCodec::new();
        let mut differ = MeshDiffer::default();
        let base = wave_mesh(10).with_id("base");
        differ.compute_diff(&MeshId::new("none"), &base);

        let mut update = base.clone().with_id("update");
        update.vertices[7][2] += 0.05;
        update.vertices.push([3.0, 3.0, 3.0]);
        update.faces.extend_from_slice(&[98, 99, 100]);
        let delta = differ.compute_diff(&MeshId::new("base"), &update);

        let compressed = codec
            .encode_delta(&delta, update.timestamp, CompressionLevel::High)
            .unwrap();
        assert!(compressed.is_delta());
        assert_eq!(compressed.base_mesh_id, Some(MeshId::new("base")));

        let decoded = codec.decode_delta(&compressed).unwrap();
        assert_eq!(decoded, delta);
        assert!(matches!(
            codec.decode(&compressed),
            Err(CodecError::WrongPayload(_))
        ));
    }

    #[test]
    fn test_full_delta_is_not_encoded_as_delta() {
        let codec = MeshCodec::new();
        let delta = MeshDelta::full(&wave_mesh(3));
        assert!(matches!(
            codec.encode_delta(&delta, Utc::now(), CompressionLevel::Low),
            Err(CodecError::WrongPayload(_))
        ));
    }
}
