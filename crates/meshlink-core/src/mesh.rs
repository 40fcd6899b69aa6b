//! Captured surface and pose types handed over by the capture layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, PartialEq)]
pub enum MeshError {
    #[error("Face index buffer length {0} is not a multiple of 3")]
    PartialTriangle(usize),
    #[error("Face index {index} out of range for {vertex_count} vertices")]
    IndexOutOfRange { index: u32, vertex_count: usize },
    #[error("Normal count {normals} does not match vertex count {vertices}")]
    NormalCountMismatch { normals: usize, vertices: usize },
}

/// Opaque identifier of a captured mesh snapshot
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MeshId(pub String);

impl MeshId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh identifier for a new snapshot
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MeshId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for MeshId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A captured surface snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct MeshData {
    /// Identifier of this snapshot (each snapshot gets a new one)
    pub id: MeshId,
    /// Vertex positions
    pub vertices: Vec<[f32; 3]>,
    /// Triangle indices, stride 3
    pub faces: Vec<u32>,
    /// Per-vertex normals, either empty or one per vertex
    pub normals: Vec<[f32; 3]>,
    /// Capture time
    pub timestamp: DateTime<Utc>,
}

impl MeshData {
    /// Create a snapshot with a generated id captured now
    pub fn new(vertices: Vec<[f32; 3]>, faces: Vec<u32>) -> Self {
        Self {
            id: MeshId::generate(),
            vertices,
            faces,
            normals: Vec::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<MeshId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_normals(mut self, normals: Vec<[f32; 3]>) -> Self {
        self.normals = normals;
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn triangle_count(&self) -> usize {
        self.faces.len() / 3
    }

    pub fn has_normals(&self) -> bool {
        !self.normals.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty() && self.faces.is_empty()
    }

    /// Check the structural invariants of the snapshot
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.faces.len() % 3 != 0 {
            return Err(MeshError::PartialTriangle(self.faces.len()));
        }
        let vertex_count = self.vertices.len();
        if let Some(&index) = self.faces.iter().find(|&&i| i as usize >= vertex_count) {
            return Err(MeshError::IndexOutOfRange {
                index,
                vertex_count,
            });
        }
        if self.has_normals() && self.normals.len() != vertex_count {
            return Err(MeshError::NormalCountMismatch {
                normals: self.normals.len(),
                vertices: vertex_count,
            });
        }
        Ok(())
    }
}

impl From<String> for MeshId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Tracked pose of an anchor
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PoseData {
    /// Position (x, y, z)
    pub position: [f32; 3],
    /// Orientation quaternion (x, y, z, w)
    pub rotation: [f32; 4],
    /// Capture time
    pub timestamp: DateTime<Utc>,
}

impl PoseData {
    pub fn new(position: [f32; 3], rotation: [f32; 4]) -> Self {
        Self {
            position,
            rotation,
            timestamp: Utc::now(),
        }
    }

    pub fn identity() -> Self {
        Self::new([0.0, 0.0, 0.0], [0.0, 0.0, 0.0, 1.0])
    }
}
