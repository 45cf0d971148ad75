//! Serve command - become Master and accept devices over TCP.

use anyhow::{Context, Result};
use plane_link::{Config, Node, TcpTransport};
use std::sync::Arc;

use super::session;

/// Run the serve command.
pub async fn run(config: &Config, bind: Option<&str>) -> Result<()> {
    let bind = bind.unwrap_or(&config.link.bind_address);
    let transport = Arc::new(TcpTransport::new(bind));
    let node = Node::start(config.to_node_config()?, transport);

    let address = node
        .become_master()
        .await
        .context("Failed to start master")?;
    println!("Master {} listening on {}", node.device_id(), address);

    session::run(node, None).await
}
