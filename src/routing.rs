//! Node group and rule derivation.
//!
//! Both derivations are pure functions over cache snapshots. Their outputs are
//! recomputed in full every time and never patched in place.

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::nodes::ClusterNode;
use crate::services::ServiceExposure;

/// Nodes sharing one public ingress point.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroup {
    /// Value of the group label shared by all members.
    pub group_id: String,
    /// Ready members of the group.
    pub members: Vec<GroupMember>,
}

/// A ready node within a [`NodeGroup`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMember {
    /// Node name.
    pub name: String,
    /// Node UID.
    pub unique_id: String,
    /// Internal IPv4 addresses of the node.
    pub internal_ips: Vec<Ipv4Addr>,
}

/// Transport protocol of a routing rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// TCP.
    Tcp,
    /// UDP.
    Udp,
    /// SCTP.
    Sctp,
    /// Any protocol not listed above.
    Unknown,
}

impl Protocol {
    /// Maps a Kubernetes port protocol.
    ///
    /// Anything other than `TCP`, `UDP` or `SCTP`, including an unset protocol,
    /// is [`Protocol::Unknown`].
    #[must_use]
    pub fn from_kube(protocol: Option<&str>) -> Self {
        match protocol {
            Some("TCP") => Self::Tcp,
            Some("UDP") => Self::Udp,
            Some("SCTP") => Self::Sctp,
            _ => Self::Unknown,
        }
    }
}

/// A node port that edges must route to the members of every group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RuleSpecification {
    /// Transport protocol.
    pub protocol: Protocol,
    /// Node port to route.
    pub node_port: u16,
}

/// The complete derived routing state.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingState {
    /// Ready nodes grouped by ingress point.
    pub node_groups: Vec<NodeGroup>,
    /// Node ports to route.
    pub rules: Vec<RuleSpecification>,
}

/// Groups ready nodes by the value of `group_label`.
///
/// Nodes without the label are left out. Groups come out ordered by ID and
/// members by name, though callers should not depend on either.
#[must_use]
pub fn derive_node_groups(ready_nodes: &[ClusterNode], group_label: &str) -> Vec<NodeGroup> {
    let mut groups: BTreeMap<&str, Vec<GroupMember>> = BTreeMap::new();

    for node in ready_nodes {
        let Some(group_id) = node.label(group_label) else {
            tracing::debug!("ready node {} has no {group_label} label, skipping", node.name);
            continue;
        };

        groups.entry(group_id).or_default().push(GroupMember {
            name: node.name.clone(),
            unique_id: node.uid.clone(),
            internal_ips: node.internal_ips(),
        });
    }

    groups
        .into_iter()
        .map(|(group_id, mut members)| {
            members.sort_by(|a, b| a.name.cmp(&b.name));
            NodeGroup {
                group_id: group_id.to_string(),
                members,
            }
        })
        .collect()
}

/// Emits one rule per declared node port of every service.
///
/// Identical rules from different services are kept; callers wanting set
/// semantics must deduplicate.
#[must_use]
pub fn derive_rule_specifications(services: &[ServiceExposure]) -> Vec<RuleSpecification> {
    services
        .iter()
        .flat_map(|service| &service.ports)
        .map(|port| RuleSpecification {
            protocol: Protocol::from_kube(port.protocol.as_deref()),
            node_port: port.node_port,
        })
        .collect()
}
