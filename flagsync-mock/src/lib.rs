//! Mock control plane
//!
//! In-process axum server speaking the auth, fetch and streaming endpoints
//! with scriptable data. Used by integration tests and the `watch` demo.

pub mod api;
pub mod state;

use std::net::SocketAddr;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;

pub use api::router;
pub use state::{ControlPlane, RecordedRequest, StreamFrame};

/// Running mock server
#[derive(Debug)]
pub struct MockServer {
    pub addr: SocketAddr,
    pub plane: ControlPlane,
    handle: JoinHandle<()>,
}

impl MockServer {
    /// Bind an ephemeral port on localhost and serve `plane`
    pub async fn start(plane: ControlPlane) -> std::io::Result<Self> {
        Self::bind("127.0.0.1:0", plane).await
    }

    pub async fn bind(addr: &str, plane: ControlPlane) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let app = router(plane.clone());
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "Mock control plane stopped");
            }
        });
        tracing::info!(%addr, "Mock control plane listening");
        Ok(Self {
            addr,
            plane,
            handle,
        })
    }

    /// Base URL for every endpoint (auth, fetch and streaming)
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.plane.disconnect_all();
        self.handle.abort();
    }
}
