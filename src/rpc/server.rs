use super::handlers::*;
use crate::node::NodeHandle;
use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;

pub struct RpcServer {
    addr: SocketAddr,
}

impl RpcServer {
    pub fn new(port: u16) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        Self { addr }
    }

    pub async fn run(self, node_handle: NodeHandle) -> Result<()> {
        let app = Router::new()
            .route("/health", get(health))
            .route("/state", get(get_status))
            .route("/createstate", post(create_state))
            .route("/loadstate", post(load_state))
            .route("/readytoserve", get(ready_to_serve))
            .layer(TraceLayer::new_for_http())
            .with_state(node_handle);

        tracing::info!("RPC server listening on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}
