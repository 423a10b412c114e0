#![expect(
    clippy::module_name_repetitions,
    reason = "Connection types expose their domain in the name for clarity"
)]

use std::fmt;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;

use backoff::backoff::Backoff;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::Result;
use crate::config::{Config, ConnectOptions, HeartbeatConfig};
use crate::error::{
    ConnectionDown, Error, InvalidConnectHandler, Kind, OptionsNotProvided, RetriesExhausted,
};
use crate::events::{EventRegistry, Handler, Slot};
use crate::heartbeat::HeartbeatMonitor;
use crate::transport::{BoxedSocket, Connector, TcpConnector};

/// Connection state tracking.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket and no connect loop running
    Disconnected,
    /// The connect loop is running
    Connecting {
        /// 1-based number of the attempt in flight
        attempt: u32,
    },
    /// Socket open and heartbeat running
    Connected {
        /// When the connection was established
        since: Instant,
    },
}

impl ConnectionState {
    /// Check if the connection is currently active.
    #[must_use]
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected { .. })
    }
}

/// Why a live socket is torn down and replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Failure {
    HeartbeatTimeout,
    PingFailed,
    WriteFailed,
    ReadFailed,
    PeerClosed,
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeartbeatTimeout => write!(f, "heartbeat timed out"),
            Self::PingFailed => write!(f, "ping could not be written"),
            Self::WriteFailed => write!(f, "message could not be written"),
            Self::ReadFailed => write!(f, "read failed"),
            Self::PeerClosed => write!(f, "peer closed the connection"),
        }
    }
}

/// What an inbound chunk turned out to be.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Inbound<'chunk> {
    Pong,
    Data(&'chunk [u8]),
}

/// A chunk is a pong only if it is byte-for-byte the pong payload. Anything else, including a
/// chunk that merely contains the payload, is application data.
pub(crate) fn classify<'chunk>(chunk: &'chunk [u8], pong: &[u8]) -> Inbound<'chunk> {
    if chunk == pong {
        Inbound::Pong
    } else {
        Inbound::Data(chunk)
    }
}

/// Queued for the write task.
#[derive(Debug)]
enum Frame {
    Ping(Vec<u8>),
    Message(Vec<u8>),
}

/// The live socket. Dropping it aborts both I/O tasks, which drops the stream without a
/// graceful shutdown.
struct Socket {
    generation: u64,
    writer: mpsc::UnboundedSender<Frame>,
    tasks: Vec<AbortHandle>,
}

impl Drop for Socket {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// The single logical link.
struct Connection {
    socket: Option<Socket>,
    /// Last options passed to `connect`, reused by every reconnection
    options: Option<ConnectOptions>,
    connector: Arc<dyn Connector>,
    retry_count: u32,
    /// Incremented for every socket, failure reports for older sockets are ignored
    generation: u64,
    /// Set between `connect` and `disconnect`. Cancelling it ends the connect loop.
    session: Option<CancellationToken>,
}

struct Shared {
    config: Config,
    connection: Mutex<Connection>,
    heartbeat: HeartbeatMonitor,
    events: EventRegistry,
    state_tx: watch::Sender<ConnectionState>,
}

/// Owns one logical TCP connection: connects with unbounded retries, keeps it alive with a
/// ping/pong heartbeat, and reconnects transparently when the peer goes silent or a write
/// fails.
///
/// Four single-slot event handlers observe the lifecycle:
///
/// - [`on_open`](Self::on_open) with `true` once a socket is established
/// - [`on_close`](Self::on_close) with `false` whenever the socket is torn down
/// - [`on_data`](Self::on_data) with every inbound chunk that is not a pong
/// - [`on_retry`](Self::on_retry) with the error and the attempt count after a failed attempt
///
/// Handlers run synchronously on the runtime's worker threads and must not block.
///
/// # Example
///
/// ```rust,no_run
/// use resilient_tcp::{Config, ConnectOptions, ConnectionManager};
///
/// #[tokio::main]
/// async fn main() -> resilient_tcp::Result<()> {
///     let manager = ConnectionManager::new(Config::default());
///
///     manager.on_data(|chunk| println!("received {} bytes", chunk.len()));
///     manager.on_retry(|error, attempt| println!("attempt {attempt} failed: {error}"));
///
///     manager.connect(Some(ConnectOptions::new("127.0.0.1", 8124))).await?;
///     manager.send(b"hello")?;
///
///     manager.disconnect();
///     Ok(())
/// }
/// ```
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("state", &self.state())
            .field("retry_count", &self.retry_count())
            .finish_non_exhaustive()
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.shared.disconnect();
    }
}

impl ConnectionManager {
    /// Create a disconnected manager using the plain [`TcpConnector`].
    #[must_use]
    pub fn new(config: Config) -> Self {
        let heartbeat = HeartbeatMonitor::new(config.heartbeat().clone());
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            shared: Arc::new(Shared {
                config,
                connection: Mutex::new(Connection {
                    socket: None,
                    options: None,
                    connector: Arc::new(TcpConnector),
                    retry_count: 0,
                    generation: 0,
                    session: None,
                }),
                heartbeat,
                events: EventRegistry::new(),
                state_tx,
            }),
        }
    }

    /// Connect, retrying until an attempt succeeds.
    ///
    /// `options` are stored and reused for every automatic reconnection. Passing `None` reuses
    /// the options of the previous call. Any existing connection or connect loop is torn down
    /// first.
    ///
    /// Failed attempts are never returned; each one fires the retry event and the attempt is
    /// repeated immediately, forever, unless the configured
    /// [`RetryPolicy`](crate::config::RetryPolicy) says otherwise.
    ///
    /// # Errors
    ///
    /// - [`OptionsNotProvided`] when `options` is `None` and none were stored
    /// - [`ConnectionDown`] when [`Self::disconnect`] cancels the loop before it succeeds
    /// - [`RetriesExhausted`] when a maximum number of attempts is configured and reached
    pub async fn connect(&self, options: Option<ConnectOptions>) -> Result<()> {
        let (options, session) = self.shared.begin(options)?;
        self.shared.run(options, session).await
    }

    /// Stop the heartbeat and drop the socket without a graceful shutdown, then fire the close
    /// event with `false`. Also cancels a connect loop in progress.
    ///
    /// Calling this again, or before ever connecting, does nothing and fires no event.
    pub fn disconnect(&self) {
        self.shared.disconnect();
    }

    /// `true` iff the heartbeat is running and the socket is open.
    ///
    /// This is `false` while a reconnection is in flight, so a single `false` does not mean the
    /// manager has given up.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        let conn = self.shared.connection();
        self.shared.heartbeat.is_beating()
            && conn
                .socket
                .as_ref()
                .is_some_and(|socket| !socket.writer.is_closed())
    }

    /// Write `message` to the socket verbatim, without framing.
    ///
    /// The write happens in the background; success only means the message was queued on a
    /// live socket.
    ///
    /// # Errors
    ///
    /// Fails with [`ConnectionDown`] if there is no open socket.
    pub fn send(&self, message: &[u8]) -> Result<()> {
        let conn = self.shared.connection();
        let socket = conn.socket.as_ref().ok_or(ConnectionDown)?;
        socket
            .writer
            .send(Frame::Message(message.to_vec()))
            .map_err(|_e| ConnectionDown)?;
        Ok(())
    }

    /// Bind the open handler, called with `true` once a socket is established.
    pub fn on_open<F: Fn(bool) + Send + Sync + 'static>(&self, handler: F) {
        self.shared.events.set_open(Arc::new(handler));
    }

    /// Bind the close handler, called with `false` whenever the socket is torn down.
    pub fn on_close<F: Fn(bool) + Send + Sync + 'static>(&self, handler: F) {
        self.shared.events.set_close(Arc::new(handler));
    }

    /// Bind the data handler, called with every inbound chunk that is not a pong.
    pub fn on_data<F: Fn(&[u8]) + Send + Sync + 'static>(&self, handler: F) {
        self.shared.events.set_data(Arc::new(handler));
    }

    /// Bind the retry handler, called with the error and attempt count after a failed attempt.
    pub fn on_retry<F: Fn(&Error, u32) + Send + Sync + 'static>(&self, handler: F) {
        self.shared.events.set_retry(Arc::new(handler));
    }

    /// Replace the connect capability. Takes effect from the next attempt.
    pub fn set_connector<C: Connector + 'static>(&self, connector: C) {
        self.shared.connection().connector = Arc::new(connector);
    }

    /// Bind a type-erased `handler` to `slot`.
    ///
    /// # Errors
    ///
    /// Fails with [`InvalidConnectHandler`] when `slot` is [`Slot::Connector`] and `handler` is
    /// not a connector, or [`InvalidCallback`](crate::error::InvalidCallback) when an event
    /// slot is given a handler of the wrong shape. The existing binding is kept either way.
    pub fn register(&self, slot: Slot, handler: Handler) -> Result<()> {
        match (slot, handler) {
            (Slot::Connector, Handler::Connector(connector)) => {
                self.shared.connection().connector = connector;
                Ok(())
            }
            (Slot::Connector, _) => Err(InvalidConnectHandler.into()),
            (slot, handler) => self.shared.events.register(slot, handler),
        }
    }

    /// Get the current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Subscribe to connection state changes.
    ///
    /// Returns a receiver that notifies when the connection state changes.
    #[must_use]
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Consecutive failed attempts since the last successful connect.
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.shared.connection().retry_count
    }

    /// Options the next reconnection will use.
    #[must_use]
    pub fn options(&self) -> Option<ConnectOptions> {
        self.shared.connection().options.clone()
    }

    /// Ping and pong payloads, interval and timeout in use.
    #[must_use]
    pub fn heartbeat_config(&self) -> &HeartbeatConfig {
        self.shared.heartbeat.config()
    }

    /// `true` iff the heartbeat is running and no pong arrived within the timeout.
    #[must_use]
    pub fn has_timed_out(&self) -> bool {
        self.shared.heartbeat.has_timed_out()
    }
}

impl Shared {
    // Lock order is connection, then the heartbeat's own lock. Handlers are never invoked
    // while the connection lock is held. Teardown and establishment publish their state under
    // that lock so `state()` agrees with the socket.
    fn connection(&self) -> MutexGuard<'_, Connection> {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: ConnectionState) {
        self.state_tx.send_replace(state);
    }

    fn is_current(&self, generation: u64) -> bool {
        self.connection()
            .socket
            .as_ref()
            .is_some_and(|socket| socket.generation == generation)
    }

    /// Resolve the options and open a new session, tearing down the previous one.
    fn begin(&self, options: Option<ConnectOptions>) -> Result<(ConnectOptions, CancellationToken)> {
        let options = match options {
            Some(options) => options,
            None => self
                .connection()
                .options
                .clone()
                .ok_or(OptionsNotProvided)?,
        };

        self.disconnect();

        let session = CancellationToken::new();
        let mut conn = self.connection();
        if let Some(previous) = conn.session.replace(session.clone()) {
            // A concurrent `connect` won the race after our disconnect
            previous.cancel();
        }
        conn.options = Some(options.clone());

        Ok((options, session))
    }

    /// The retry loop. Returns once a socket is established.
    async fn run(self: &Arc<Self>, options: ConnectOptions, session: CancellationToken) -> Result<()> {
        let mut backoff = self.config.retry().new_backoff();

        loop {
            let connector = {
                let conn = self.connection();
                if session.is_cancelled() {
                    return Err(ConnectionDown.into());
                }
                self.publish(ConnectionState::Connecting {
                    attempt: conn.retry_count.saturating_add(1),
                });
                Arc::clone(&conn.connector)
            };

            let outcome = tokio::select! {
                biased;

                () = session.cancelled() => return Err(ConnectionDown.into()),
                outcome = connector.connect(&options) => outcome,
            };

            match outcome {
                Ok(socket) => return self.establish(socket, &session),
                Err(e) => {
                    let retries = {
                        let mut conn = self.connection();
                        conn.retry_count = conn.retry_count.saturating_add(1);
                        conn.retry_count
                    };
                    let error = Error::with_source(Kind::Connection, e);
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        address = %options.address(),
                        attempt = retries,
                        "Unable to connect: {error}"
                    );
                    self.events.emit_retry(&error, retries);

                    if let Some(max) = self.config.retry().max_attempts
                        && retries >= max
                    {
                        self.abandon(&session);
                        return Err(RetriesExhausted { attempts: retries }.into());
                    }
                }
            }

            match backoff.as_mut().and_then(Backoff::next_backoff) {
                Some(delay) => tokio::select! {
                    biased;

                    () = session.cancelled() => return Err(ConnectionDown.into()),
                    () = sleep(delay) => {}
                },
                // No delay configured: let other tasks run before the next attempt
                None => tokio::task::yield_now().await,
            }
        }
    }

    /// Install a freshly connected socket, start the heartbeat and fire the open event.
    fn establish(self: &Arc<Self>, socket: BoxedSocket, session: &CancellationToken) -> Result<()> {
        let (reader, writer) = tokio::io::split(socket);
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();

        let generation = {
            let mut conn = self.connection();
            if session.is_cancelled() {
                // Disconnected while the last attempt was completing
                return Err(ConnectionDown.into());
            }

            conn.generation = conn.generation.wrapping_add(1);
            conn.retry_count = 0;
            let generation = conn.generation;

            let write_task = tokio::spawn(Self::write_loop(
                Arc::downgrade(self),
                generation,
                writer,
                frame_rx,
            ));
            conn.socket = Some(Socket {
                generation,
                writer: frame_tx,
                tasks: vec![write_task.abort_handle()],
            });
            self.start_heartbeat(generation);
            self.publish(ConnectionState::Connected {
                since: Instant::now(),
            });

            generation
        };

        if !self.is_current(generation) {
            // Torn down from another thread before the open event could fire
            return Ok(());
        }
        #[cfg(feature = "tracing")]
        tracing::debug!(generation, "Connection established");
        self.events.emit_open(true);

        // Inbound data only flows once the open handler has run
        let read_task = tokio::spawn(Self::read_loop(
            Arc::downgrade(self),
            generation,
            reader,
            self.config.read_buffer_size(),
        ));
        match self.connection().socket.as_mut() {
            Some(socket) if socket.generation == generation => {
                socket.tasks.push(read_task.abort_handle());
            }
            // The open handler already tore the socket down
            _ => read_task.abort(),
        }

        Ok(())
    }

    /// Must be called with the connection lock held so a teardown cannot interleave.
    fn start_heartbeat(self: &Arc<Self>, generation: u64) {
        let on_timeout = Arc::downgrade(self);
        self.heartbeat.on_timeout(move || {
            if let Some(shared) = on_timeout.upgrade() {
                shared.fail(generation, Failure::HeartbeatTimeout);
            }
        });

        let on_tick = Arc::downgrade(self);
        self.heartbeat.stop();
        let started = self.heartbeat.start(move || {
            if let Some(shared) = on_tick.upgrade() {
                shared.ping(generation);
            }
        });
        if let Err(e) = started {
            #[cfg(feature = "tracing")]
            tracing::error!("Unable to start heartbeat: {e}");
            #[cfg(not(feature = "tracing"))]
            let _: &Error = &e;
        }
    }

    fn ping(self: &Arc<Self>, generation: u64) {
        let queued = {
            let conn = self.connection();
            match conn.socket.as_ref() {
                Some(socket) if socket.generation == generation => socket
                    .writer
                    .send(Frame::Ping(self.heartbeat.ping().to_vec()))
                    .is_ok(),
                // Stale tick from a socket that is already gone
                _ => return,
            }
        };

        if queued {
            #[cfg(feature = "tracing")]
            tracing::trace!(generation, "Ping queued");
        } else {
            self.fail(generation, Failure::PingFailed);
        }
    }

    fn handle_inbound(&self, generation: u64, chunk: &[u8]) {
        if !self.is_current(generation) {
            return;
        }

        match classify(chunk, self.heartbeat.pong()) {
            Inbound::Pong => {
                #[cfg(feature = "tracing")]
                tracing::trace!(generation, "Pong received");
                self.heartbeat.received_pong();
            }
            Inbound::Data(data) => {
                #[cfg(feature = "tracing")]
                tracing::trace!(generation, len = data.len(), "Received data");
                self.events.emit_data(data);
            }
        }
    }

    async fn read_loop(
        shared: Weak<Self>,
        generation: u64,
        mut reader: ReadHalf<BoxedSocket>,
        buffer_size: usize,
    ) {
        let mut buffer = vec![0_u8; buffer_size];

        let failure = loop {
            match reader.read(&mut buffer).await {
                Ok(0) => break Failure::PeerClosed,
                Ok(n) => {
                    let Some(shared) = shared.upgrade() else {
                        return;
                    };
                    if let Some(chunk) = buffer.get(..n) {
                        shared.handle_inbound(generation, chunk);
                    }
                }
                Err(e) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(generation, error = %e, "Read failed");
                    #[cfg(not(feature = "tracing"))]
                    let _: &io::Error = &e;
                    break Failure::ReadFailed;
                }
            }
        };

        if let Some(shared) = shared.upgrade() {
            shared.fail(generation, failure);
        }
    }

    async fn write_loop(
        shared: Weak<Self>,
        generation: u64,
        mut writer: WriteHalf<BoxedSocket>,
        mut frames: mpsc::UnboundedReceiver<Frame>,
    ) {
        while let Some(frame) = frames.recv().await {
            let (bytes, failure) = match &frame {
                Frame::Ping(bytes) => (bytes, Failure::PingFailed),
                Frame::Message(bytes) => (bytes, Failure::WriteFailed),
            };

            if let Err(e) = write_frame(&mut writer, bytes).await {
                #[cfg(feature = "tracing")]
                tracing::debug!(generation, error = %e, "Write failed");
                #[cfg(not(feature = "tracing"))]
                let _: &io::Error = &e;

                if let Some(shared) = shared.upgrade() {
                    shared.fail(generation, failure);
                }
                return;
            }
        }
    }

    /// Tear down socket `generation` after a failure and schedule a fresh connect loop with the
    /// stored options. Reports for sockets that are no longer current are ignored, so
    /// simultaneous failures of one socket produce a single reconnection.
    fn fail(self: &Arc<Self>, generation: u64, failure: Failure) {
        let (socket, resume) = {
            let mut conn = self.connection();
            if conn
                .socket
                .as_ref()
                .is_none_or(|socket| socket.generation != generation)
            {
                return;
            }
            self.heartbeat.stop();
            self.publish(ConnectionState::Disconnected);
            let socket = conn.socket.take();
            (socket, conn.session.clone().zip(conn.options.clone()))
        };

        #[cfg(feature = "tracing")]
        tracing::warn!(generation, %failure, "Connection lost, reconnecting");
        #[cfg(not(feature = "tracing"))]
        let _: Failure = failure;

        drop(socket);
        self.events.emit_close(false);

        let Some((session, options)) = resume else {
            return;
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(address = %options.address(), "Reconnect scheduled");

        // Reconnect on a new task rather than recursing, so repeated failures never grow the
        // stack of the task that observed them.
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = shared.run(options, session).await {
                #[cfg(feature = "tracing")]
                tracing::debug!("Reconnection abandoned: {e}");
                #[cfg(not(feature = "tracing"))]
                let _: &Error = &e;
            }
        });
    }

    fn disconnect(&self) {
        let socket = {
            let mut conn = self.connection();
            if let Some(session) = conn.session.take() {
                session.cancel();
            }
            self.heartbeat.stop();
            self.publish(ConnectionState::Disconnected);
            conn.socket.take()
        };

        if let Some(socket) = socket {
            #[cfg(feature = "tracing")]
            tracing::debug!(generation = socket.generation, "Disconnected");
            drop(socket);
            self.events.emit_close(false);
        }
    }

    /// End `session` after the retry policy gave up, unless a newer session replaced it.
    fn abandon(&self, session: &CancellationToken) {
        let mut conn = self.connection();
        if session.is_cancelled() {
            return;
        }
        session.cancel();
        conn.session = None;
        self.publish(ConnectionState::Disconnected);
    }
}

async fn write_frame(writer: &mut WriteHalf<BoxedSocket>, bytes: &[u8]) -> io::Result<()> {
    writer.write_all(bytes).await?;
    writer.flush().await
}
