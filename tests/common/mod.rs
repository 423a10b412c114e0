#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests, and https://github.com/rust-lang/rust-clippy/issues/13981"
)]
#![allow(
    unused,
    reason = "Not every test binary uses every helper"
)]

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use resilient_tcp::transport::connector_fn;
use resilient_tcp::{ConnectOptions, ConnectionManager, Connector};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing_subscriber::EnvFilter;

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

/// Route library logs through the test harness. Honours `RUST_LOG`.
pub fn init_tracing() {
    drop(
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init(),
    );
}

/// Mock TCP peer. Every accepted stream is handed to the test untouched.
pub struct MockTcpServer {
    pub addr: SocketAddr,
    accepted: mpsc::UnboundedReceiver<TcpStream>,
    acceptor: JoinHandle<()>,
}

impl MockTcpServer {
    /// Start a mock server on a random port.
    pub async fn start() -> Self {
        init_tracing();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted_tx, accepted) = mpsc::unbounded_channel();

        let acceptor = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                if accepted_tx.send(stream).is_err() {
                    break;
                }
            }
        });

        Self {
            addr,
            accepted,
            acceptor,
        }
    }

    pub fn options(&self) -> ConnectOptions {
        ConnectOptions::new("127.0.0.1", self.addr.port())
    }

    /// Wait for the next client connection.
    pub async fn accept(&mut self) -> TcpStream {
        timeout(EVENT_TIMEOUT, self.accepted.recv())
            .await
            .unwrap()
            .unwrap()
    }

    /// Close the listening socket so further connect attempts are refused. Streams already
    /// accepted stay open.
    pub async fn stop_listening(mut self) -> Vec<TcpStream> {
        self.acceptor.abort();
        drop((&mut self.acceptor).await);

        let mut streams = Vec::new();
        while let Ok(stream) = self.accepted.try_recv() {
            streams.push(stream);
        }
        streams
    }
}

/// Everything a [`ConnectionManager`] reports through its event slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Open(bool),
    Close(bool),
    Data(Vec<u8>),
    Retry(u32),
}

/// Bind all four event slots to a channel.
pub fn record(manager: &ConnectionManager) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();

    let open = tx.clone();
    manager.on_open(move |connected| drop(open.send(Event::Open(connected))));
    let close = tx.clone();
    manager.on_close(move |connected| drop(close.send(Event::Close(connected))));
    let data = tx.clone();
    manager.on_data(move |chunk| drop(data.send(Event::Data(chunk.to_vec()))));
    manager.on_retry(move |_, attempt| drop(tx.send(Event::Retry(attempt))));

    rx
}

/// Receive the next event, failing the test if none arrives in time.
pub async fn next_event(events: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(EVENT_TIMEOUT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .unwrap()
}

/// Assert no event arrives within `window`.
pub async fn assert_silent(events: &mut mpsc::UnboundedReceiver<Event>, window: Duration) {
    if let Ok(event) = timeout(window, events.recv()).await {
        panic!("unexpected event: {event:?}");
    }
}

/// A connector that refuses the first `failures` attempts, then connects over TCP. Also returns
/// the number of attempts made so far.
pub fn flaky_connector(failures: u32) -> (impl Connector, Arc<AtomicU32>) {
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&attempts);

    let connector = connector_fn(move |options: ConnectOptions| {
        let counter = Arc::clone(&counter);
        async move {
            let attempt = counter.fetch_add(1, Ordering::SeqCst);
            if attempt < failures {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
            }
            TcpStream::connect(options.address()).await
        }
    });

    (connector, attempts)
}

/// A connector that never succeeds.
pub fn refusing_connector() -> impl Connector {
    connector_fn(|_: ConnectOptions| async {
        Err::<TcpStream, _>(io::Error::from(io::ErrorKind::ConnectionRefused))
    })
}
