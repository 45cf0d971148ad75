//! Auto command - negotiate the role from a candidate list.

use anyhow::Result;
use plane_core::RoleNotice;
use plane_link::{Config, Node, Orchestrator, StaticDiscovery, TcpTransport};
use std::sync::Arc;

use super::session;

/// Run the auto command.
pub async fn run(config: &Config, extra: Vec<String>, bind: Option<&str>) -> Result<()> {
    let mut candidates = config.discovery.candidates.clone();
    candidates.extend(extra);

    let bind = bind.unwrap_or(&config.link.bind_address);
    let transport = Arc::new(TcpTransport::new(bind));
    let node = Node::start(config.to_node_config()?, transport.clone());

    println!(
        "Negotiating role for {} ({} candidates)",
        node.device_id(),
        candidates.len()
    );
    let orchestrator = Orchestrator::start(
        node.clone(),
        transport,
        Arc::new(StaticDiscovery::new(candidates)),
        config.orchestrator_settings(),
    );

    let mut notices = orchestrator.subscribe();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            match notice {
                RoleNotice::RoleEstablished { role, address } => {
                    println!("Role: {role} ({})", address.unwrap_or_default())
                }
                RoleNotice::CandidateRejected { address, error } => {
                    println!("Skipped {address}: {error}")
                }
                RoleNotice::Failed { error } => println!("Negotiation failed: {error}"),
                RoleNotice::UplinkLost { reason } => println!("Master lost: {reason}"),
            }
        }
    });

    session::run(node, Some(orchestrator)).await
}
