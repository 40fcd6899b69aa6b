//! Synthetic capture source
//!
//! Produces a flat grid surface with a raised band sweeping across it and an
//! anchor orbiting the origin. Used by the command line tool to exercise a
//! server without capture hardware.

use std::collections::HashMap;

use meshlink_core::{MeshData, PoseData};

use crate::pipeline::CaptureEvent;

const BAND_HEIGHT: f32 = 0.05;
const ORBIT_RADIUS: f32 = 1.5;

#[derive(Debug, Clone)]
pub struct SyntheticCapture {
    anchor_id: String,
    mesh_id: String,
    size: u32,
    spacing: f32,
    frame: u64,
}

impl SyntheticCapture {
    /// `size` x `size` vertex grid, `spacing` apart
    pub fn new(anchor_id: impl Into<String>, size: u32, spacing: f32) -> Self {
        let anchor_id = anchor_id.into();
        Self {
            mesh_id: format!("{anchor_id}-surface"),
            anchor_id,
            size: size.max(2),
            spacing,
            frame: 0,
        }
    }

    pub fn frame(&self) -> u64 {
        self.frame
    }

    /// Mesh and pose events for the next frame
    pub fn next_events(&mut self) -> [CaptureEvent; 2] {
        let mesh = self.mesh_at(self.frame);
        let pose = self.pose_at(self.frame);
        self.frame += 1;
        [
            CaptureEvent::Mesh {
                anchor_id: self.anchor_id.clone(),
                mesh,
            },
            CaptureEvent::Pose {
                anchor_id: self.anchor_id.clone(),
                pose,
                metadata: HashMap::from([("source".to_string(), "synthetic".to_string())]),
            },
        ]
    }

    fn mesh_at(&self, frame: u64) -> MeshData {
        let size = self.size;
        let band = (frame % size as u64) as u32;

        let mut vertices = Vec::with_capacity((size * size) as usize);
        for y in 0..size {
            for x in 0..size {
                let z = if x == band { BAND_HEIGHT } else { 0.0 };
                vertices.push([x as f32 * self.spacing, y as f32 * self.spacing, z]);
            }
        }

        let mut faces = Vec::with_capacity(((size - 1) * (size - 1) * 6) as usize);
        for y in 0..size - 1 {
            for x in 0..size - 1 {
                let i = y * size + x;
                faces.extend_from_slice(&[i, i + 1, i + size, i + 1, i + size + 1, i + size]);
            }
        }

        MeshData::new(vertices, faces).with_id(self.mesh_id.as_str())
    }

    fn pose_at(&self, frame: u64) -> PoseData {
        let angle = frame as f32 * 0.1;
        let half = angle / 2.0;
        PoseData::new(
            [ORBIT_RADIUS * angle.cos(), 0.0, ORBIT_RADIUS * angle.sin()],
            [0.0, half.sin(), 0.0, half.cos()],
        )
    }
}
