//! Resilient streaming transport
//!
//! Owns one socket to the streaming server at a time. Outbound envelopes go
//! through a bounded queue. While a connection is open a writer task owns the
//! socket sink and drains that queue in order; while it is down the queue
//! holds them until the next connection opens. Connection errors schedule
//! reconnects with exponential backoff until the attempt budget runs out.
//!
//! Session state lives behind one async mutex that is only ever held for
//! bookkeeping, never across a socket write. Background tasks (connect,
//! reader, writer, keep-alive, reconnect timer) capture the connection
//! generation they were started for and do nothing once it is stale.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::config::{backoff_delay, TransportConfig};
use crate::connector::{
    ConnectRequest, Connection, Connector, Frame, FrameSink, FrameStream, WebSocketConnector,
};
use crate::envelope::{Envelope, EnvelopeError, ErrorPayload, MessageKind};
use crate::queue::OutboundQueue;

/// Subscriber channel capacity
const EVENT_CAPACITY: usize = 256;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("Invalid server URL: {0}")]
    InvalidUrl(String),
    #[error("Invalid authorization header: {0}")]
    InvalidHeader(String),
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("Socket write stalled for {0:?}")]
    WriteTimeout(Duration),
    #[error("Connection refused by {0}")]
    Refused(String),
    #[error("Connection closed")]
    Closed,
    #[error("Not connected")]
    NotConnected,
    #[error("No session to connect")]
    NoSession,
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::WebSocket(Box::new(err))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Events published to subscribers
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    /// Message of a server `error` envelope
    ServerError(String),
    /// Connection level failure
    Error(Arc<TransportError>),
    /// Inbound anchor_update, mesh_update or ack
    Message(Envelope),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransportStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Messages evicted from a full outbound queue
    pub messages_dropped: u64,
}

/// Lock-free counters behind [`TransportStats`]
#[derive(Default)]
struct Counters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_dropped: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> TransportStats {
        TransportStats {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_dropped: self.messages_dropped.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        for counter in [
            &self.messages_sent,
            &self.messages_received,
            &self.bytes_sent,
            &self.bytes_received,
            &self.messages_dropped,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Default)]
struct Tasks {
    connect: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    keepalive: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for handle in [
            self.connect.take(),
            self.reader.take(),
            self.keepalive.take(),
            self.reconnect.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

struct Session {
    state: ConnectionState,
    session_id: Option<String>,
    queue: OutboundQueue,
    attempts: u32,
    /// Envelope the writer has taken off the queue but not yet confirmed
    in_flight: Option<Envelope>,
    /// Tells the current writer to close its socket and exit
    writer_close: Option<oneshot::Sender<()>>,
    tasks: Tasks,
    /// Bumped whenever the current connection is replaced or torn down
    generation: u64,
}

struct Inner {
    config: TransportConfig,
    connector: Arc<dyn Connector>,
    session: Mutex<Session>,
    stats: Counters,
    /// Wakes the writer when the queue gains an envelope
    outbound_ready: Notify,
    event_tx: broadcast::Sender<TransportEvent>,
}

/// Handle to the streaming transport. Clones share the same connection.
#[derive(Clone)]
pub struct StreamingTransport {
    inner: Arc<Inner>,
}

impl StreamingTransport {
    /// Transport over real WebSockets
    pub fn new(config: TransportConfig) -> Self {
        Self::with_connector(config, Arc::new(WebSocketConnector))
    }

    pub fn with_connector(config: TransportConfig, connector: Arc<dyn Connector>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let session = Session {
            state: ConnectionState::Disconnected,
            session_id: None,
            queue: OutboundQueue::new(config.queue_capacity),
            attempts: 0,
            in_flight: None,
            writer_close: None,
            tasks: Tasks::default(),
            generation: 0,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                session: Mutex::new(session),
                stats: Counters::default(),
                outbound_ready: Notify::new(),
                event_tx,
            }),
        }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.event_tx.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.session.lock().await.state
    }

    pub async fn stats(&self) -> TransportStats {
        self.inner.stats.snapshot()
    }

    pub async fn session_id(&self) -> Option<String> {
        self.inner.session.lock().await.session_id.clone()
    }

    /// Envelopes waiting for the writer, excluding one currently being written
    pub async fn queued_len(&self) -> usize {
        self.inner.session.lock().await.queue.len()
    }

    /// Copy of the envelopes waiting to be sent, oldest first
    pub async fn pending(&self) -> Vec<Envelope> {
        self.inner.session.lock().await.queue.iter().cloned().collect()
    }

    /// Start connecting for `session_id`. Returns once the attempt is under
    /// way; completion is reported through [`TransportEvent::StateChanged`].
    /// A no-op while already connecting or connected.
    pub async fn connect(&self, session_id: impl Into<String>) -> Result<(), TransportError> {
        let session_id = session_id.into();
        self.inner.config.stream_url(&session_id)?;

        let mut session = self.inner.session.lock().await;
        if matches!(
            session.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            warn!(state = %session.state, "Connect requested while already active, ignoring");
            return Ok(());
        }

        info!(session_id = %session_id, "Connecting streaming transport");
        session.session_id = Some(session_id);
        session.attempts = 0;
        Inner::begin_connect(&self.inner, &mut session);
        Ok(())
    }

    /// Close the socket and stop all timers. The queue and counters stay.
    pub async fn disconnect(&self) {
        let mut session = self.inner.session.lock().await;
        self.inner.release_connection(&mut session);
        self.inner.set_state(&mut session, ConnectionState::Disconnected);
    }

    /// Drop the current connection and connect again with a fresh attempt budget
    pub async fn reconnect(&self) -> Result<(), TransportError> {
        let mut session = self.inner.session.lock().await;
        if session.session_id.is_none() {
            return Err(TransportError::NoSession);
        }
        info!("Manual reconnect requested");
        session.attempts = 0;
        Inner::begin_connect(&self.inner, &mut session);
        Ok(())
    }

    /// Tear the session down: disconnect, clear the queue and reset counters
    pub async fn stop(&self) {
        let mut session = self.inner.session.lock().await;
        self.inner.release_connection(&mut session);
        session.queue.clear();
        self.inner.stats.reset();
        session.attempts = 0;
        session.session_id = None;
        self.inner.set_state(&mut session, ConnectionState::Disconnected);
    }

    /// Queue an envelope for sending. While connected the writer picks it up
    /// straight away. From the disconnected or failed state a send also
    /// starts a new connection attempt for the last session.
    pub async fn send(&self, envelope: Envelope) -> Result<(), TransportError> {
        let mut session = self.inner.session.lock().await;
        self.inner.enqueue(&mut session, envelope);

        match session.state {
            ConnectionState::Connected => self.inner.outbound_ready.notify_one(),
            ConnectionState::Disconnected | ConnectionState::Failed
                if session.session_id.is_some() =>
            {
                debug!(state = %session.state, "Send while offline, starting connection");
                session.attempts = 0;
                Inner::begin_connect(&self.inner, &mut session);
            }
            _ => {}
        }
        Ok(())
    }
}

impl Inner {
    fn emit(&self, event: TransportEvent) {
        let _ = self.event_tx.send(event);
    }

    fn set_state(&self, session: &mut Session, state: ConnectionState) {
        if session.state == state {
            return;
        }
        info!(from = %session.state, to = %state, "Transport state changed");
        session.state = state;
        self.emit(TransportEvent::StateChanged(state));
    }

    fn enqueue(&self, session: &mut Session, envelope: Envelope) {
        if let Some(dropped) = session.queue.push(envelope) {
            self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(
                message_type = %dropped.message_type,
                capacity = session.queue.capacity(),
                "Outbound queue full, dropped oldest message"
            );
        }
    }

    fn requeue(&self, session: &mut Session, envelope: Envelope) {
        if let Some(dropped) = session.queue.push_front(envelope) {
            self.stats.messages_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(message_type = %dropped.message_type, "Outbound queue full, dropped unsent message");
        }
    }

    /// Detach the current connection. Its tasks go stale, the writer is told
    /// to close the socket on its own time and an unconfirmed write returns
    /// to the head of the queue.
    fn release_connection(&self, session: &mut Session) {
        session.generation += 1;
        session.tasks.abort_all();
        if let Some(close) = session.writer_close.take() {
            let _ = close.send(());
        }
        if let Some(envelope) = session.in_flight.take() {
            self.requeue(session, envelope);
        }
    }

    /// Replace any current connection with a new attempt
    fn begin_connect(this: &Arc<Self>, session: &mut Session) {
        this.release_connection(session);

        let Some(session_id) = session.session_id.clone() else {
            return;
        };
        let url = match this.config.stream_url(&session_id) {
            Ok(url) => url,
            Err(e) => {
                error!(error = %e, "Cannot build stream URL");
                this.emit(TransportEvent::Error(Arc::new(e)));
                this.set_state(session, ConnectionState::Failed);
                return;
            }
        };
        this.set_state(session, ConnectionState::Connecting);

        let request = ConnectRequest {
            url,
            api_key: this.config.api_key.clone(),
        };
        let generation = session.generation;
        let timeout = this.config.connect_timeout();
        let inner = this.clone();
        session.tasks.connect = Some(tokio::spawn(async move {
            debug!(url = %request.url, "Opening connection");
            let result = match tokio::time::timeout(timeout, inner.connector.connect(&request)).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::ConnectTimeout(timeout)),
            };

            let mut session = inner.session.lock().await;
            if session.generation != generation {
                return;
            }
            session.tasks.connect.take();
            match result {
                Ok(connection) => Inner::on_open(&inner, &mut session, connection),
                Err(e) => Inner::on_connection_error(&inner, &mut session, e),
            }
        }));
    }

    fn on_open(this: &Arc<Self>, session: &mut Session, connection: Connection) {
        let Connection { sink, stream } = connection;
        session.attempts = 0;
        this.set_state(session, ConnectionState::Connected);

        let generation = session.generation;
        let (close_tx, close_rx) = oneshot::channel();
        session.writer_close = Some(close_tx);
        tokio::spawn(Self::run_writer(this.clone(), sink, close_rx, generation));
        session.tasks.reader = Some(Self::spawn_reader(this, stream, generation));
        session.tasks.keepalive = this
            .config
            .keepalive_interval()
            .map(|period| Self::spawn_keepalive(this, period, generation));

        let queued = session.queue.len();
        if queued > 0 {
            info!(queued, "Flushing outbound queue");
        }
    }

    /// Take the next encodable envelope for the writer of `generation`
    async fn next_outbound(&self, generation: u64) -> Option<Vec<u8>> {
        let mut session = self.session.lock().await;
        if session.generation != generation {
            return None;
        }
        while let Some(envelope) = session.queue.pop_front() {
            match envelope.encode() {
                Ok(bytes) => {
                    session.in_flight = Some(envelope);
                    return Some(bytes);
                }
                Err(e) => {
                    warn!(error = %e, message_type = %envelope.message_type, "Dropping unencodable message")
                }
            }
        }
        None
    }

    /// Sole owner of the socket sink for one connection
    async fn run_writer(
        self: Arc<Self>,
        mut sink: FrameSink,
        mut close_rx: oneshot::Receiver<()>,
        generation: u64,
    ) {
        let write_timeout = self.config.write_timeout();
        let failure = loop {
            let bytes = match self.next_outbound(generation).await {
                Some(bytes) => bytes,
                None => {
                    tokio::select! {
                        biased;
                        _ = &mut close_rx => break None,
                        _ = self.outbound_ready.notified() => {}
                    }
                    continue;
                }
            };

            let len = bytes.len() as u64;
            let result = tokio::select! {
                biased;
                _ = &mut close_rx => break None,
                result = tokio::time::timeout(write_timeout, sink.send(Frame::Binary(bytes))) => {
                    match result {
                        Ok(result) => result,
                        Err(_) => Err(TransportError::WriteTimeout(write_timeout)),
                    }
                }
            };

            match result {
                Ok(()) => {
                    self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
                    self.stats.bytes_sent.fetch_add(len, Ordering::Relaxed);
                    let mut session = self.session.lock().await;
                    if session.generation == generation {
                        session.in_flight = None;
                    }
                }
                Err(e) => break Some(e),
            }
        };

        match failure {
            None => match tokio::time::timeout(write_timeout, sink.close()).await {
                Ok(Ok(())) => trace!("Socket closed"),
                Ok(Err(e)) => debug!(error = %e, "Error closing socket"),
                Err(_) => debug!("Socket close timed out"),
            },
            Some(error) => {
                let mut session = self.session.lock().await;
                if session.generation != generation {
                    return;
                }
                Inner::on_connection_error(&self, &mut session, error);
            }
        }
    }

    fn spawn_reader(
        this: &Arc<Self>,
        mut stream: FrameStream,
        generation: u64,
    ) -> JoinHandle<()> {
        let inner = this.clone();
        tokio::spawn(async move {
            let error = loop {
                match stream.next().await {
                    Some(Ok(Frame::Binary(bytes))) => inner.handle_inbound(&bytes),
                    Some(Ok(Frame::Text(text))) => inner.handle_inbound(text.as_bytes()),
                    Some(Ok(Frame::Ping(_) | Frame::Pong(_))) => {}
                    Some(Ok(Frame::Close)) | None => break TransportError::Closed,
                    Some(Err(e)) => break e,
                }
            };

            let mut session = inner.session.lock().await;
            if session.generation != generation {
                return;
            }
            session.tasks.reader.take();
            Inner::on_connection_error(&inner, &mut session, error);
        })
    }

    fn spawn_keepalive(this: &Arc<Self>, period: Duration, generation: u64) -> JoinHandle<()> {
        let inner = this.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;

                let mut session = inner.session.lock().await;
                if session.generation != generation || session.state != ConnectionState::Connected {
                    return;
                }
                // Pending traffic already exercises the link
                if !session.queue.is_empty() || session.in_flight.is_some() {
                    continue;
                }
                trace!("Queueing keep-alive ping");
                let ping = Envelope::ping(session.session_id.clone());
                inner.enqueue(&mut session, ping);
                inner.outbound_ready.notify_one();
            }
        })
    }

    fn handle_inbound(&self, bytes: &[u8]) {
        self.stats.messages_received.fetch_add(1, Ordering::Relaxed);
        self.stats
            .bytes_received
            .fetch_add(bytes.len() as u64, Ordering::Relaxed);

        let envelope = match Envelope::decode(bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, len = bytes.len(), "Dropping malformed inbound message");
                return;
            }
        };

        match envelope.kind() {
            MessageKind::Pong => trace!("Received pong"),
            MessageKind::Error => {
                let message = envelope
                    .payload_as::<ErrorPayload>()
                    .map(|payload| payload.message)
                    .unwrap_or_else(|_| "unknown server error".to_string());
                warn!(message = %message, "Server reported error");
                self.emit(TransportEvent::ServerError(message));
            }
            kind if kind.is_forwarded() => {
                debug!(message_type = %envelope.message_type, "Received message");
                self.emit(TransportEvent::Message(envelope));
            }
            _ => debug!(message_type = %envelope.message_type, "Ignoring unrecognised message type"),
        }
    }

    /// Tear down the dead connection and either schedule a reconnect or
    /// give up once the attempt budget is spent
    fn on_connection_error(this: &Arc<Self>, session: &mut Session, error: TransportError) {
        warn!(error = %error, attempts = session.attempts, "Connection error");
        this.emit(TransportEvent::Error(Arc::new(error)));
        this.release_connection(session);

        if session.state == ConnectionState::Disconnected {
            return;
        }
        if session.attempts >= this.config.max_reconnect_attempts {
            error!(
                attempts = session.attempts,
                "Reconnect attempts exhausted, giving up"
            );
            this.set_state(session, ConnectionState::Failed);
            return;
        }

        session.attempts += 1;
        let attempt = session.attempts;
        let delay = backoff_delay(this.config.reconnect_base_delay(), attempt);
        this.set_state(session, ConnectionState::Reconnecting);
        info!(
            attempt,
            max_attempts = this.config.max_reconnect_attempts,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );

        let generation = session.generation;
        let inner = this.clone();
        session.tasks.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let mut session = inner.session.lock().await;
            if session.generation != generation || session.state != ConnectionState::Reconnecting {
                return;
            }
            session.tasks.reconnect.take();
            Inner::begin_connect(&inner, &mut session);
        }));
    }
}
