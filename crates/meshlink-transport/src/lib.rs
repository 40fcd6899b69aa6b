//! meshlink transport - resilient streaming of envelopes to the server
//!
//! This crate provides:
//! - The CBOR wire envelope and its typed payloads
//! - A connector abstraction over WebSockets (plus an in-memory one)
//! - A streaming transport with queueing, backoff and keep-alive

pub mod config;
pub mod connector;
pub mod envelope;
pub mod memory;
pub mod queue;
pub mod transport;

pub use config::{backoff_delay, stream_url, TransportConfig};
pub use connector::{ConnectRequest, Connection, Connector, Frame, WebSocketConnector};
pub use envelope::{
    message_type, AnchorUpdate, Envelope, EnvelopeError, ErrorPayload, MeshUpdate, MessageKind,
};
pub use memory::{MemoryConnector, MemoryPeer};
pub use queue::OutboundQueue;
pub use transport::{
    ConnectionState, StreamingTransport, TransportError, TransportEvent, TransportStats,
};
