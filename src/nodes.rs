//! Node readiness cache.
//!
//! Holds the nodes whose most recent observation reports a `Ready` condition
//! with status `True`. Everything else is evicted on sight.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

use k8s_openapi::api::core::v1::Node;
use parking_lot::RwLock;

use crate::k8s;
use crate::watcher::{EventHandler, ResourceEvent};

/// Address type of node-internal addresses.
pub const INTERNAL_IP: &str = "InternalIP";

const CONDITION_TRUE: &str = "True";

/// A typed node address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeAddress {
    /// Address type, e.g. `InternalIP` or `Hostname`.
    pub kind: String,
    /// The address itself.
    pub address: String,
}

/// The parts of a Kubernetes node relevant to ingress routing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterNode {
    /// Node name, unique within the cluster.
    pub name: String,
    /// Node UID.
    pub uid: String,
    /// Reported node addresses.
    pub addresses: Vec<NodeAddress>,
    /// Node labels.
    pub labels: BTreeMap<String, String>,
    /// Status of the `Ready` condition, if the node reports one.
    pub ready: Option<String>,
}

impl ClusterNode {
    /// Whether the node reports `Ready=True`.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.as_deref() == Some(CONDITION_TRUE)
    }

    /// Returns the value of a label, if set.
    #[must_use]
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// Returns the node's internal IPv4 addresses.
    #[must_use]
    pub fn internal_ips(&self) -> Vec<Ipv4Addr> {
        self.addresses
            .iter()
            .filter(|a| a.kind == INTERNAL_IP)
            .filter_map(|a| a.address.parse().ok())
            .collect()
    }
}

/// Cache of ready nodes, keyed by name.
#[derive(Debug, Default)]
pub struct NodeCache {
    ready: RwLock<HashMap<String, ClusterNode>>,
}

impl NodeCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the latest observation of a node.
    ///
    /// A ready node replaces any earlier entry under its name; a node that is
    /// not ready is evicted.
    pub fn apply_node(&self, node: ClusterNode) {
        let mut ready = self.ready.write();

        if node.is_ready() {
            let name = node.name.clone();
            if ready.insert(name.clone(), node).is_none() {
                tracing::debug!("node became ready: {name}");
            }
        } else if ready.remove(&node.name).is_some() {
            tracing::debug!("node no longer ready: {}", node.name);
        }
    }

    /// Evicts a node by name. Unknown names are ignored.
    pub fn remove_node(&self, name: &str) {
        if self.ready.write().remove(name).is_some() {
            tracing::debug!("removed node: {name}");
        }
    }

    /// Returns a snapshot of the ready nodes.
    #[must_use]
    pub fn list_ready(&self) -> Vec<ClusterNode> {
        self.ready.read().values().cloned().collect()
    }
}

impl EventHandler<Node> for NodeCache {
    fn handle(&self, event: ResourceEvent<Node>) {
        match event {
            ResourceEvent::Added(node) | ResourceEvent::Updated { new: node, .. } => {
                match k8s::cluster_node(&node) {
                    Some(node) => self.apply_node(node),
                    None => tracing::warn!("dropping node without a name"),
                }
            }

            ResourceEvent::Deleted(node) => match node.metadata.name.as_deref() {
                Some(name) => self.remove_node(name),
                None => tracing::warn!("dropping deleted node without a name"),
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use k8s_openapi::api::core::v1::{NodeCondition, NodeStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    use super::*;

    // Helper to create a node with internal addresses, labels and a ready status
    pub(crate) fn make_node(name: &str, ips: &[&str], labels: &[(&str, &str)], ready: Option<&str>) -> ClusterNode {
        ClusterNode {
            name: name.to_string(),
            uid: format!("uid-{name}"),
            addresses: ips
                .iter()
                .map(|ip| NodeAddress {
                    kind: INTERNAL_IP.to_string(),
                    address: (*ip).to_string(),
                })
                .collect(),
            labels: labels.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect(),
            ready: ready.map(String::from),
        }
    }

    fn make_kube_node(name: &str, ready: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                uid: Some(format!("uid-{name}")),
                ..Default::default()
            },
            status: Some(NodeStatus {
                conditions: Some(vec![NodeCondition {
                    type_: "Ready".to_string(),
                    status: ready.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn names(cache: &NodeCache) -> Vec<String> {
        let mut names: Vec<String> = cache.list_ready().into_iter().map(|n| n.name).collect();
        names.sort();
        names
    }

    // Readiness predicate tests

    #[test]
    fn is_ready_requires_true_status() {
        assert!(make_node("n1", &[], &[], Some("True")).is_ready());
        assert!(!make_node("n1", &[], &[], Some("False")).is_ready());
        assert!(!make_node("n1", &[], &[], Some("Unknown")).is_ready());
        assert!(!make_node("n1", &[], &[], Some("true")).is_ready());
        assert!(!make_node("n1", &[], &[], None).is_ready());
    }

    #[test]
    fn internal_ips_filters_type_and_family() {
        let mut node = make_node("n1", &["10.0.0.1", "fd00::1"], &[], Some("True"));
        node.addresses.push(NodeAddress {
            kind: "ExternalIP".to_string(),
            address: "203.0.113.7".to_string(),
        });
        node.addresses.push(NodeAddress {
            kind: "Hostname".to_string(),
            address: "n1".to_string(),
        });

        assert_eq!(node.internal_ips(), vec![Ipv4Addr::new(10, 0, 0, 1)]);
    }

    // Cache tests

    #[test]
    fn apply_ready_node_inserts() {
        let cache = NodeCache::new();
        cache.apply_node(make_node("n1", &["10.0.0.1"], &[], Some("True")));

        assert_eq!(names(&cache), vec!["n1"]);
        assert_eq!(cache.list_ready().len(), 1);
    }

    #[test]
    fn apply_not_ready_node_is_absent() {
        let cache = NodeCache::new();
        cache.apply_node(make_node("n1", &[], &[], Some("False")));
        cache.apply_node(make_node("n2", &[], &[], None));

        assert!(cache.list_ready().is_empty());
    }

    #[test]
    fn apply_not_ready_evicts_previously_ready() {
        let cache = NodeCache::new();
        cache.apply_node(make_node("n1", &[], &[], Some("True")));
        cache.apply_node(make_node("n1", &[], &[], Some("Unknown")));

        assert!(cache.list_ready().is_empty());
    }

    #[test]
    fn apply_replaces_with_latest_observation() {
        let cache = NodeCache::new();
        cache.apply_node(make_node("n1", &["10.0.0.1"], &[], Some("True")));
        cache.apply_node(make_node("n1", &["10.0.0.9"], &[("group", "east")], Some("True")));

        let ready = cache.list_ready();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].internal_ips(), vec![Ipv4Addr::new(10, 0, 0, 9)]);
        assert_eq!(ready[0].label("group"), Some("east"));
    }

    #[test]
    fn apply_is_idempotent() {
        let cache = NodeCache::new();
        let node = make_node("n1", &["10.0.0.1"], &[], Some("True"));
        cache.apply_node(node.clone());
        let once = cache.list_ready();
        cache.apply_node(node);

        assert_eq!(cache.list_ready(), once);
    }

    #[test]
    fn remove_node_is_idempotent() {
        let cache = NodeCache::new();
        cache.apply_node(make_node("n1", &[], &[], Some("True")));
        cache.apply_node(make_node("n2", &[], &[], Some("True")));

        cache.remove_node("n1");
        cache.remove_node("n1");
        cache.remove_node("never-seen");

        assert_eq!(names(&cache), vec!["n2"]);
    }

    #[test]
    fn list_ready_is_a_snapshot() {
        let cache = NodeCache::new();
        cache.apply_node(make_node("n1", &[], &[], Some("True")));

        let snapshot = cache.list_ready();
        cache.remove_node("n1");

        assert_eq!(snapshot.len(), 1);
        assert!(cache.list_ready().is_empty());
    }

    #[test]
    fn readers_never_see_partial_entries() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let cache = NodeCache::new();
        let done = AtomicBool::new(false);
        let full = |name: &str, ready: &str| {
            make_node(
                name,
                &["10.0.0.1", "10.0.0.2"],
                &[("group", "east"), ("zone", "a")],
                Some(ready),
            )
        };

        std::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|| {
                    while !done.load(Ordering::Relaxed) {
                        for node in cache.list_ready() {
                            assert!(node.is_ready());
                            assert_eq!(node.uid, format!("uid-{}", node.name));
                            assert_eq!(node.internal_ips().len(), 2);
                            assert_eq!(node.labels.len(), 2);
                        }
                    }
                });
            }

            s.spawn(|| {
                for i in 0..2_000 {
                    let name = format!("n{}", i % 8);
                    let ready = if i % 3 == 0 { "False" } else { "True" };
                    cache.apply_node(full(&name, ready));
                    if i % 5 == 0 {
                        cache.remove_node(&name);
                    }
                }
                done.store(true, Ordering::Relaxed);
            });
        });

        assert!(cache.list_ready().iter().all(ClusterNode::is_ready));
    }

    // EventHandler tests

    #[test]
    fn handle_events() {
        let cache = NodeCache::new();

        cache.handle(ResourceEvent::Added(make_kube_node("n1", "True")));
        assert_eq!(names(&cache), vec!["n1"]);

        cache.handle(ResourceEvent::Updated {
            old: make_kube_node("n1", "True"),
            new: make_kube_node("n1", "False"),
        });
        assert!(cache.list_ready().is_empty());

        cache.handle(ResourceEvent::Added(make_kube_node("n2", "True")));
        cache.handle(ResourceEvent::Deleted(make_kube_node("n2", "True")));
        assert!(cache.list_ready().is_empty());
    }

    #[test]
    fn handle_drops_nameless_nodes() {
        let cache = NodeCache::new();
        cache.handle(ResourceEvent::Added(Node::default()));
        cache.handle(ResourceEvent::Deleted(Node::default()));

        assert!(cache.list_ready().is_empty());
    }
}
