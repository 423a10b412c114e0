//! The pluggable connect capability.
//!
//! A [`ConnectionManager`](crate::ConnectionManager) never opens sockets itself; every attempt
//! goes through a [`Connector`]. The default [`TcpConnector`] opens a plain TCP connection.
//! Custom connectors can wrap the stream in TLS, perform a handshake, or connect to an
//! in-memory peer in tests.
//!
//! # Example
//!
//! ```rust,no_run
//! use resilient_tcp::transport::connector_fn;
//! use tokio::net::TcpStream;
//!
//! let connector = connector_fn(|options| async move {
//!     let stream = TcpStream::connect(options.address()).await?;
//!     stream.set_nodelay(true)?;
//!     Ok::<_, std::io::Error>(stream)
//! });
//! ```

use std::fmt;
use std::future::Future;
use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::ConnectOptions;

/// A bidirectional byte stream the manager can own.
pub trait Socket: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Socket for T {}

pub type BoxedSocket = Box<dyn Socket>;

/// Produces a connected socket from [`ConnectOptions`], or the reason it could not.
///
/// A failure is never surfaced to the caller of `connect`: it is reported through the retry
/// event and the attempt is repeated.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, options: &ConnectOptions) -> io::Result<BoxedSocket>;
}

/// Plain TCP via [`TcpStream::connect`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, options: &ConnectOptions) -> io::Result<BoxedSocket> {
        let addr = options.address();

        let stream = match options.connect_timeout {
            Some(limit) => timeout(limit, TcpStream::connect(&addr))
                .await
                .map_err(|_e| {
                    io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connecting to {addr} timed out after {limit:?}"),
                    )
                })??,
            None => TcpStream::connect(&addr).await?,
        };
        stream.set_nodelay(options.no_delay)?;

        Ok(Box::new(stream))
    }
}

/// A [`Connector`] backed by an async closure. Build one with [`connector_fn`].
pub struct FnConnector<F> {
    connect: F,
}

impl<F> fmt::Debug for FnConnector<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnConnector").finish_non_exhaustive()
    }
}

/// Wrap an async function `ConnectOptions -> io::Result<S>` into a [`Connector`].
pub fn connector_fn<F, Fut, S>(connect: F) -> FnConnector<F>
where
    F: Fn(ConnectOptions) -> Fut + Send + Sync,
    Fut: Future<Output = io::Result<S>> + Send,
    S: Socket,
{
    FnConnector { connect }
}

#[async_trait]
impl<F, Fut, S> Connector for FnConnector<F>
where
    F: Fn(ConnectOptions) -> Fut + Send + Sync,
    Fut: Future<Output = io::Result<S>> + Send,
    S: Socket,
{
    async fn connect(&self, options: &ConnectOptions) -> io::Result<BoxedSocket> {
        let socket = (self.connect)(options.clone()).await?;
        Ok(Box::new(socket))
    }
}
