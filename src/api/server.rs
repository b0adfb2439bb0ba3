//! HTTP server setup
//!
//! Binding is separate from serving so a taken port fails the boot instead
//! of a background task.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use super::{router, AppState};

pub async fn bind(bind_addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind to {bind_addr}"))
}

/// Serve on `listener` until the state's shutdown token fires
pub async fn start_server(listener: TcpListener, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let addr = listener.local_addr().context("listener address")?;
    let app = router(state);

    tracing::info!("HTTP interface listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Server error")?;

    tracing::info!("HTTP interface shut down gracefully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::state;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_serves_until_cancelled() {
        let (_db, state) = state();
        let shutdown = state.shutdown.clone();
        let listener = bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(start_server(listener, state));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("\"status\":\"running\""));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_taken_port_fails_to_bind() {
        let held = bind(SocketAddr::from(([127, 0, 0, 1], 0))).await.unwrap();
        let addr = held.local_addr().unwrap();
        assert!(bind(addr).await.is_err());
    }
}
