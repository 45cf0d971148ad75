//! Join command - connect to a Master as Slave.

use anyhow::{Context, Result};
use plane_link::{Config, Node, TcpTransport};
use std::sync::Arc;

use super::session;

/// Run the join command.
pub async fn run(config: &Config, address: &str) -> Result<()> {
    let transport = Arc::new(TcpTransport::new(&config.link.bind_address));
    let node = Node::start(config.to_node_config()?, transport);

    node.join(address)
        .await
        .with_context(|| format!("Failed to join {address}"))?;
    println!("Slave {} joined {}", node.device_id(), address);

    session::run(node, None).await
}
