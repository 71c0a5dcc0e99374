//! Kubernetes API boundary.
//!
//! This module provides the production [`EventSource`] backed by a `kube`
//! watcher, and the projections from `k8s-openapi` objects into the records
//! held by the node and service caches.
//!
//! # Example
//!
//! ```ignore
//! use k8s_openapi::api::core::v1::Node;
//! use kube::{Api, Client};
//! use multihome_ingress_k8s::{ApiSource, ControllerConfig, NodeCache, ResourceWatcher};
//!
//! let client = Client::try_default().await?;
//! let source = ApiSource::new(Api::<Node>::all(client));
//! let watcher = ResourceWatcher::new(source, &ControllerConfig::new());
//! ```

use std::fmt::Debug;

use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{Node, NodeStatus, Service, ServiceSpec};
use kube::Api;
use kube::Resource;
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use serde::de::DeserializeOwned;

use crate::nodes::{ClusterNode, NodeAddress};
use crate::services::{ServiceExposure, ServicePort};
use crate::watcher::EventSource;

const READY_CONDITION: &str = "Ready";

/// List+watch source over a Kubernetes API.
///
/// Watch errors are retried with `kube`'s default exponential backoff, and the
/// underlying watcher re-lists after each one.
#[derive(Clone)]
pub struct ApiSource<K> {
    api: Api<K>,
}

impl<K> ApiSource<K> {
    /// Creates a source watching every object visible through `api`.
    #[must_use]
    pub fn new(api: Api<K>) -> Self {
        Self { api }
    }
}

impl<K> EventSource<K> for ApiSource<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    fn watch(&self) -> BoxStream<'static, watcher::Result<Event<K>>> {
        watcher::watcher(self.api.clone(), WatcherConfig::default())
            .default_backoff()
            .boxed()
    }
}

/// Projects a Kubernetes node. Returns `None` if the node has no name.
pub(crate) fn cluster_node(node: &Node) -> Option<ClusterNode> {
    let name = node.metadata.name.clone()?;

    Some(ClusterNode {
        name,
        uid: node.metadata.uid.clone().unwrap_or_default(),
        addresses: node.status.as_ref().map(extract_addresses).unwrap_or_default(),
        labels: node.metadata.labels.clone().unwrap_or_default(),
        ready: node.status.as_ref().and_then(extract_ready_status),
    })
}

/// Projects a Kubernetes service. Returns `None` if it has no namespace or name.
pub(crate) fn service_exposure(service: &Service) -> Option<ServiceExposure> {
    let namespace = service.metadata.namespace.clone()?;
    let name = service.metadata.name.clone()?;
    let spec = service.spec.as_ref();

    Some(ServiceExposure {
        namespace,
        name,
        service_type: spec.and_then(|s| s.type_.clone()),
        labels: service.metadata.labels.clone().unwrap_or_default(),
        ports: spec.map(extract_node_ports).unwrap_or_default(),
    })
}

/// Extracts the typed addresses reported by a node.
fn extract_addresses(status: &NodeStatus) -> Vec<NodeAddress> {
    status
        .addresses
        .iter()
        .flatten()
        .map(|a| NodeAddress {
            kind: a.type_.clone(),
            address: a.address.clone(),
        })
        .collect()
}

/// Extracts the status of the first `Ready` condition.
fn extract_ready_status(status: &NodeStatus) -> Option<String> {
    status
        .conditions
        .iter()
        .flatten()
        .find(|c| c.type_ == READY_CONDITION)
        .map(|c| c.status.clone())
}

/// Extracts the node ports declared by a service.
fn extract_node_ports(spec: &ServiceSpec) -> Vec<ServicePort> {
    spec.ports
        .iter()
        .flatten()
        .filter_map(|p| {
            // Ports without an allocated node port are not reachable on nodes
            let node_port = p.node_port.and_then(|n| u16::try_from(n).ok())?;
            Some(ServicePort {
                protocol: p.protocol.clone(),
                node_port,
            })
        })
        .collect()
}
