//! Connects to a local echo server that answers pings, sends a few messages and then kills the
//! server to show the reconnection loop.
//!
//! Run with tracing enabled:
//! ```sh
//! RUST_LOG=info,resilient_tcp=debug cargo run --example echo
//! ```
//!
//! Optionally log to a file:
//! ```sh
//! LOG_FILE=echo.log RUST_LOG=debug cargo run --example echo
//! ```

use std::fs::File;
use std::time::Duration;

use resilient_tcp::config::{DEFAULT_PING, DEFAULT_PONG};
use resilient_tcp::{
    BackoffConfig, Config, ConnectOptions, ConnectionManager, HeartbeatConfig, RetryPolicy,
};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Ok(path) = std::env::var("LOG_FILE") {
        let file = File::create(path)?;
        tracing_subscriber::registry()
            .with(EnvFilter::from_default_env())
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(file)
                    .with_ansi(false),
            )
            .init();
    } else {
        tracing_subscriber::fmt::init();
    }

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    // Aborting the server drops the JoinSet, which aborts every open connection too
    let server = tokio::spawn(async move {
        let mut connections = JoinSet::new();
        while let Ok((mut stream, peer)) = listener.accept().await {
            info!(%peer, "accepted");
            connections.spawn(async move {
                let mut buf = [0_u8; 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    let Some(chunk) = buf.get(..n).filter(|chunk| !chunk.is_empty()) else {
                        break;
                    };
                    let reply = if chunk == [DEFAULT_PING] {
                        vec![DEFAULT_PONG]
                    } else {
                        chunk.to_vec()
                    };
                    if stream.write_all(&reply).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    let config = Config::builder()
        .heartbeat(
            HeartbeatConfig::builder()
                .interval(Duration::from_millis(500))
                .timeout(Duration::from_secs(2))
                .build(),
        )
        .retry(RetryPolicy::unbounded().with_backoff(BackoffConfig::default()))
        .build();
    let manager = ConnectionManager::new(config);

    manager.on_open(|connected| info!(connected, "open"));
    manager.on_close(|connected| info!(connected, "close"));
    manager.on_data(|chunk| info!(echo = %String::from_utf8_lossy(chunk), "data"));
    manager.on_retry(|error, attempt| warn!(attempt, %error, "retry"));

    manager
        .connect(Some(ConnectOptions::new("127.0.0.1", port)))
        .await?;

    for i in 0..3 {
        manager.send(format!("message {i}").as_bytes())?;
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    info!("stopping the server, the manager will keep retrying");
    server.abort();
    tokio::time::sleep(Duration::from_secs(5)).await;

    info!(retries = manager.retry_count(), state = ?manager.state());
    manager.disconnect();

    Ok(())
}
