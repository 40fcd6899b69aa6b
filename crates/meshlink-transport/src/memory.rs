//! In-process connector for tests and local loopback
//!
//! Every successful connect hands the server end of the connection to the
//! receiver returned by [`MemoryConnector::new`] as a [`MemoryPeer`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use futures_util::{sink, stream};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::connector::{ConnectRequest, Connection, Connector, Frame};
use crate::envelope::Envelope;
use crate::transport::TransportError;

pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    refuse: AtomicBool,
    attempts: Mutex<Vec<(Instant, ConnectRequest)>>,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let connector = Self {
            peers,
            refuse: AtomicBool::new(false),
            attempts: Mutex::new(Vec::new()),
        };
        (connector, rx)
    }

    /// Make subsequent connects fail (or succeed again)
    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Time and request of every connect call so far
    pub fn attempts(&self) -> Vec<(Instant, ConnectRequest)> {
        self.attempts
            .lock()
            .map(|attempts| attempts.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, request: &ConnectRequest) -> Result<Connection, TransportError> {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push((Instant::now(), request.clone()));
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(TransportError::Refused(request.url.clone()));
        }

        let (client_tx, server_rx) = mpsc::unbounded_channel::<Frame>();
        let (server_tx, client_rx) = mpsc::unbounded_channel::<Result<Frame, TransportError>>();

        let sink = sink::unfold(client_tx, |tx, frame: Frame| async move {
            tx.send(frame).map_err(|_| TransportError::Closed)?;
            Ok::<_, TransportError>(tx)
        });
        let stream = stream::unfold(client_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });

        self.peers
            .send(MemoryPeer {
                request: request.clone(),
                frames: server_rx,
                inbound: server_tx,
            })
            .map_err(|_| TransportError::Refused(request.url.clone()))?;

        Ok(Connection {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// Server end of an in-memory connection
pub struct MemoryPeer {
    pub request: ConnectRequest,
    frames: mpsc::UnboundedReceiver<Frame>,
    inbound: mpsc::UnboundedSender<Result<Frame, TransportError>>,
}

impl MemoryPeer {
    /// Next frame written by the client
    pub async fn recv(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }

    /// Next binary frame written by the client, decoded
    pub async fn recv_envelope(&mut self) -> Option<Envelope> {
        loop {
            match self.frames.recv().await? {
                Frame::Binary(bytes) => return Envelope::decode(&bytes).ok(),
                _ => continue,
            }
        }
    }

    pub fn send_frame(&self, frame: Frame) -> bool {
        self.inbound.send(Ok(frame)).is_ok()
    }

    pub fn send_envelope(&self, envelope: &Envelope) -> bool {
        match envelope.encode() {
            Ok(bytes) => self.send_frame(Frame::Binary(bytes)),
            Err(_) => false,
        }
    }

    /// Fail the client's read side with an error
    pub fn fail(&self, error: TransportError) -> bool {
        self.inbound.send(Err(error)).is_ok()
    }

    pub fn close(self) {
        let _ = self.inbound.send(Ok(Frame::Close));
    }
}
