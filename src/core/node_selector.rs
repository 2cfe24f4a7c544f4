use tracing::{debug, info};

use crate::errors::{ProviderResult, SelectionError};
use crate::proxmox::ProxmoxApi;

pub const MACHINE_REQUEST_TAG_PREFIX: &str = "machine-request.";

/// Ranking inputs for one cluster node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStatus {
    pub name: String,
    pub memory_free: f64,
    /// VMs tagged with the same request set.
    pub siblings: usize,
}

pub fn request_set_tag(request_set_id: &str) -> String {
    format!("{MACHINE_REQUEST_TAG_PREFIX}{request_set_id}")
}

/// Fewest siblings first, then most free memory. The sort is stable so full
/// ties keep the order the cluster reported.
pub fn pick_node(nodes: &[NodeStatus]) -> Option<&NodeStatus> {
    let mut ranked: Vec<&NodeStatus> = nodes.iter().collect();
    ranked.sort_by(|a, b| {
        a.siblings
            .cmp(&b.siblings)
            .then_with(|| b.memory_free.total_cmp(&a.memory_free))
    });
    ranked.first().copied()
}

/// Resolves the node a new VM goes to, either the pinned one or the best
/// ranked node of the live cluster listing.
pub async fn select_node<A: ProxmoxApi + ?Sized>(
    api: &A,
    pinned: Option<&str>,
    request_set_id: Option<&str>,
) -> ProviderResult<String> {
    let nodes = api.nodes().await?;
    if nodes.is_empty() {
        return Err(SelectionError::NoNodes.into());
    }

    if let Some(wanted) = pinned {
        let node = nodes
            .iter()
            .find(|n| n.node == wanted)
            .ok_or_else(|| SelectionError::NodeNotFound {
                node: wanted.to_string(),
            })?;

        if !node.is_online() {
            return Err(SelectionError::NodeOffline {
                node: wanted.to_string(),
                status: node.status.clone(),
            }
            .into());
        }

        info!(node = wanted, "using configured node for the Proxmox VM");
        return Ok(wanted.to_string());
    }

    let tag = request_set_id.map(request_set_tag);
    let mut statuses = Vec::with_capacity(nodes.len());

    for node in &nodes {
        let siblings = match &tag {
            Some(tag) => api
                .virtual_machines(&node.node)
                .await?
                .iter()
                .filter(|vm| vm.has_tag(tag))
                .count(),
            None => 0,
        };

        debug!(
            node = %node.node,
            memory_free = node.memory_free_ratio(),
            siblings,
            "node candidate"
        );

        statuses.push(NodeStatus {
            name: node.node.clone(),
            memory_free: node.memory_free_ratio(),
            siblings,
        });
    }

    let picked = pick_node(&statuses).ok_or(SelectionError::NoNodes)?;
    info!(node = %picked.name, "auto-selected node for the Proxmox VM");

    Ok(picked.name.clone())
}
