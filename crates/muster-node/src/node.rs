//! Daemon node lifecycle

use crate::config::NodeConfig;
use muster_primitives::ProcessType;
use muster_runtime::{Runtime, Shutdownable};
use muster_session::{ws, Endpoint};
use std::sync::Arc;

/// A running daemon node: runtime plus bound endpoint.
pub struct Node {
    runtime: Arc<Runtime>,
    endpoint: Arc<Endpoint>,
    port: u16,
}

impl Node {
    /// Start a daemon runtime and bind its endpoint
    pub async fn start(config: &NodeConfig) -> anyhow::Result<Node> {
        let runtime = Runtime::new(ProcessType::Daemon);
        let endpoint = Endpoint::new(runtime.clone());
        endpoint.set_connector(Arc::new(ws::WsConnector));

        let port = ws::listen(endpoint.clone(), config.port.unwrap_or(0)).await?;
        let host = if config.host.is_empty() {
            "127.0.0.1".to_owned()
        } else {
            config.host.clone()
        };
        runtime.register_process_addr(runtime.process_id(), &host, &port.to_string());

        if let Some(master_url) = &config.master_url {
            endpoint.set_master_url(master_url.clone());
        }

        tracing::info!(port, process_id = %runtime.process_id(), "node started");
        Ok(Node {
            runtime,
            endpoint,
            port,
        })
    }

    /// The runtime
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// The bound port
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run until ctrl-c, then shut down in order
    pub async fn run(&self) -> anyhow::Result<()> {
        tokio::signal::ctrl_c().await?;
        tracing::info!("shutdown signal received");
        self.stop().await;
        Ok(())
    }

    /// Orderly teardown: endpoint first, then the runtime
    pub async fn stop(&self) {
        self.endpoint.shutdown().await;
        self.runtime.shutdown().await;
        if let Ok(snapshot) = self.endpoint.metrics().snapshot().to_json() {
            tracing::debug!(%snapshot, "final traffic totals");
        }
        tracing::info!("node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_node_binds_ephemeral_port() {
        let node = Node::start(&NodeConfig::default()).await.unwrap();
        assert_ne!(node.port(), 0);
        node.stop().await;
    }
}
