//! Capture-to-wire streaming pipeline
//!
//! A single worker task owns the differ and consumes capture events from a
//! bounded queue, so the snapshot cache is only ever touched from one place.
//! Diffing and compression run on the blocking pool; the encoded result is
//! wrapped in an envelope and handed to the transport.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use meshlink_core::{
    CodecError, CompressedMeshData, CompressionLevel, CompressionStats, MeshCodec, MeshData,
    MeshDiffer, MeshId, PoseData,
};
use meshlink_transport::{
    AnchorUpdate, Envelope, EnvelopeError, MeshUpdate, StreamingTransport, TransportError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::Config;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Pipeline has shut down")]
    Closed,
    #[error("Pipeline work queue is full")]
    Full,
    #[error("Pipeline worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Deltas at or above this estimated ratio are sent as full meshes
    #[serde(default = "default_delta_threshold")]
    pub delta_threshold: f32,
    /// Capture events buffered ahead of the worker
    #[serde(default = "default_work_queue")]
    pub work_queue: usize,
}

fn default_delta_threshold() -> f32 {
    0.5
}

fn default_work_queue() -> usize {
    64
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            delta_threshold: default_delta_threshold(),
            work_queue: default_work_queue(),
        }
    }
}

/// Input from the capture layer
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    /// New snapshot of an anchor's surface mesh
    Mesh { anchor_id: String, mesh: MeshData },
    /// New pose of an anchor
    Pose {
        anchor_id: String,
        pose: PoseData,
        metadata: HashMap<String, String>,
    },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
    pub meshes_full: u64,
    pub meshes_delta: u64,
    /// Snapshots identical to their base, not sent
    pub meshes_unchanged: u64,
    pub poses: u64,
    /// Events dropped because they could not be encoded or sent
    pub failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    meshes_full: AtomicU64,
    meshes_delta: AtomicU64,
    meshes_unchanged: AtomicU64,
    poses: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> PipelineStats {
        PipelineStats {
            meshes_full: self.meshes_full.load(Ordering::Relaxed),
            meshes_delta: self.meshes_delta.load(Ordering::Relaxed),
            meshes_unchanged: self.meshes_unchanged.load(Ordering::Relaxed),
            poses: self.poses.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// Handle to a running pipeline worker
pub struct MeshStreamer {
    events: mpsc::Sender<CaptureEvent>,
    shutdown_tx: oneshot::Sender<()>,
    worker: JoinHandle<Result<(), PipelineError>>,
    counters: Arc<Counters>,
    codec: Arc<MeshCodec>,
}

impl MeshStreamer {
    /// Start the worker. Envelopes go out on `transport`, which the caller
    /// connects and stops.
    pub fn spawn(config: &Config, transport: StreamingTransport) -> Self {
        let (events, rx) = mpsc::channel(config.pipeline.work_queue.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let counters = Arc::new(Counters::default());
        let codec = Arc::new(MeshCodec::new());

        let worker = Worker {
            delta_threshold: config.pipeline.delta_threshold,
            level: config.codec.level,
            differ: MeshDiffer::new(config.diff.clone()),
            codec: codec.clone(),
            transport,
            counters: counters.clone(),
            last_mesh: HashMap::new(),
        };
        let worker = tokio::spawn(worker.run(rx, shutdown_rx));

        Self {
            events,
            shutdown_tx,
            worker,
            counters,
            codec,
        }
    }

    /// Queue an event, waiting for room
    pub async fn submit(&self, event: CaptureEvent) -> Result<(), PipelineError> {
        self.events
            .send(event)
            .await
            .map_err(|_| PipelineError::Closed)
    }

    /// Queue an event without waiting
    pub fn try_submit(&self, event: CaptureEvent) -> Result<(), PipelineError> {
        self.events.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PipelineError::Full,
            mpsc::error::TrySendError::Closed(_) => PipelineError::Closed,
        })
    }

    /// Sender for capture producers living on other tasks
    pub fn sender(&self) -> mpsc::Sender<CaptureEvent> {
        self.events.clone()
    }

    pub fn stats(&self) -> PipelineStats {
        self.counters.snapshot()
    }

    pub fn compression_stats(&self) -> CompressionStats {
        self.codec.stats()
    }

    /// Stop accepting events, process what is already queued and wait for
    /// the worker to finish
    pub async fn shutdown(self) -> Result<PipelineStats, PipelineError> {
        let _ = self.shutdown_tx.send(());
        drop(self.events);
        self.worker.await??;
        Ok(self.counters.snapshot())
    }
}

struct Worker {
    delta_threshold: f32,
    level: CompressionLevel,
    differ: MeshDiffer,
    codec: Arc<MeshCodec>,
    transport: StreamingTransport,
    counters: Arc<Counters>,
    /// Last mesh id seen per anchor, the base for that anchor's next diff
    last_mesh: HashMap<String, MeshId>,
}

impl Worker {
    async fn run(
        mut self,
        mut rx: mpsc::Receiver<CaptureEvent>,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> Result<(), PipelineError> {
        info!("Mesh pipeline started");
        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(event) => self.process(event).await?,
                    None => break,
                },
                _ = &mut shutdown_rx => {
                    rx.close();
                    while let Some(event) = rx.recv().await {
                        self.process(event).await?;
                    }
                    break;
                }
            }
        }
        info!(stats = ?self.counters.snapshot(), "Mesh pipeline stopped");
        Ok(())
    }

    /// Handle one event. Only a lost worker thread is fatal.
    async fn process(&mut self, event: CaptureEvent) -> Result<(), PipelineError> {
        let result = match event {
            CaptureEvent::Mesh { anchor_id, mesh } => self.handle_mesh(anchor_id, mesh).await,
            CaptureEvent::Pose {
                anchor_id,
                pose,
                metadata,
            } => self.handle_pose(anchor_id, pose, metadata).await,
        };

        match result {
            Err(PipelineError::Worker(e)) => {
                error!(error = %e, "Diff worker thread failed, stopping pipeline");
                Err(PipelineError::Worker(e))
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Dropping capture event");
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    async fn handle_mesh(&mut self, anchor_id: String, mesh: MeshData) -> Result<(), PipelineError> {
        mesh.validate().map_err(CodecError::from)?;

        let mesh_id = mesh.id.clone();
        let base = self
            .last_mesh
            .get(&anchor_id)
            .cloned()
            .unwrap_or_else(|| mesh_id.clone());
        self.last_mesh.insert(anchor_id.clone(), mesh_id.clone());

        let mut differ = std::mem::take(&mut self.differ);
        let codec = self.codec.clone();
        let threshold = self.delta_threshold;
        let level = self.level;
        let (differ, encoded) = tokio::task::spawn_blocking(move || {
            let encoded = encode_mesh(&mut differ, &codec, &base, &mesh, threshold, level);
            (differ, encoded)
        })
        .await?;
        self.differ = differ;

        let Some(compressed) = encoded? else {
            self.counters.meshes_unchanged.fetch_add(1, Ordering::Relaxed);
            debug!(anchor = %anchor_id, mesh = %mesh_id, "Mesh unchanged, nothing to send");
            return Ok(());
        };

        let update = MeshUpdate::from_compressed(anchor_id.as_str(), &compressed);
        let envelope = Envelope::mesh_update(self.transport.session_id().await, &update)?;
        self.transport.send(envelope).await?;

        if compressed.is_delta() {
            self.counters.meshes_delta.fetch_add(1, Ordering::Relaxed);
        } else {
            self.counters.meshes_full.fetch_add(1, Ordering::Relaxed);
        }
        debug!(
            anchor = %anchor_id,
            mesh = %mesh_id,
            delta = compressed.is_delta(),
            bytes = compressed.compressed_size,
            "Queued mesh update"
        );
        Ok(())
    }

    async fn handle_pose(
        &self,
        anchor_id: String,
        pose: PoseData,
        metadata: HashMap<String, String>,
    ) -> Result<(), PipelineError> {
        let update = AnchorUpdate {
            anchor_id,
            pose,
            metadata,
        };
        let envelope = Envelope::anchor_update(self.transport.session_id().await, &update)?;
        self.transport.send(envelope).await?;
        self.counters.poses.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Diff `mesh` against `base` and encode the cheaper representation.
/// `None` when the snapshot is identical to a cached version of itself.
fn encode_mesh(
    differ: &mut MeshDiffer,
    codec: &MeshCodec,
    base: &MeshId,
    mesh: &MeshData,
    delta_threshold: f32,
    level: CompressionLevel,
) -> Result<Option<CompressedMeshData>, CodecError> {
    let delta = differ.compute_diff(base, mesh);
    if delta.is_full() || delta.compression_ratio >= delta_threshold {
        return codec.encode_full(mesh, level).map(Some);
    }
    if delta.is_empty() && *base == mesh.id {
        return Ok(None);
    }
    codec.encode_delta(&delta, mesh.timestamp, level).map(Some)
}
