#![cfg_attr(doc, doc = include_str!("../README.md"))]

pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod heartbeat;
pub mod transport;

pub use config::{BackoffConfig, Config, ConnectOptions, HeartbeatConfig, RetryPolicy};
pub use connection::{ConnectionManager, ConnectionState};
pub use error::{Error, Kind};
pub use events::{Handler, Slot};
pub use heartbeat::HeartbeatMonitor;
pub use transport::{Connector, TcpConnector, connector_fn};

pub type Result<T> = std::result::Result<T, Error>;
