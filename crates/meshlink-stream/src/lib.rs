//! meshlink stream - configuration, logging and the streaming pipeline
//!
//! Glues the differ and codec from `meshlink-core` to the transport from
//! `meshlink-transport`:
//! - TOML configuration covering every component
//! - Logging initialisation for host binaries
//! - The capture-to-wire pipeline worker
//! - A synthetic capture source for testing against a live server

pub mod config;
pub mod logging;
pub mod pipeline;
pub mod synthetic;

pub use config::{load_config, save_default_config, Config, LoggingConfig};
pub use pipeline::{CaptureEvent, MeshStreamer, PipelineConfig, PipelineError, PipelineStats};
pub use synthetic::SyntheticCapture;
