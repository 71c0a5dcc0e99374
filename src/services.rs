//! Service eligibility cache.
//!
//! Holds the `NodePort` services that carry the eligibility label with its
//! enabled value. Services are keyed by namespace and name.

use std::collections::{BTreeMap, HashMap};

use k8s_openapi::api::core::v1::Service;
use parking_lot::RwLock;

use crate::config::ControllerConfig;
use crate::k8s;
use crate::watcher::{EventHandler, ResourceEvent};

/// Service type that exposes a port on every node.
pub const NODE_PORT: &str = "NodePort";

/// A declared node port of a service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServicePort {
    /// Protocol as reported by Kubernetes (`TCP`, `UDP`, `SCTP`).
    pub protocol: Option<String>,
    /// The allocated node port.
    pub node_port: u16,
}

/// The parts of a Kubernetes service relevant to ingress routing.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ServiceExposure {
    /// Service namespace.
    pub namespace: String,
    /// Service name.
    pub name: String,
    /// Service type, e.g. `NodePort` or `ClusterIP`.
    pub service_type: Option<String>,
    /// Service labels.
    pub labels: BTreeMap<String, String>,
    /// Declared node ports.
    pub ports: Vec<ServicePort>,
}

/// Label selection deciding which services are eligible.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Eligibility {
    /// Label that must be present.
    pub label: String,
    /// Value the label must carry.
    pub enabled_value: String,
}

impl Eligibility {
    /// Creates an eligibility rule for the given label and enabled value.
    #[must_use]
    pub fn new(label: impl Into<String>, enabled_value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            enabled_value: enabled_value.into(),
        }
    }

    /// Whether the service is a `NodePort` service with the label enabled.
    #[must_use]
    pub fn matches(&self, service: &ServiceExposure) -> bool {
        service.service_type.as_deref() == Some(NODE_PORT)
            && service.labels.get(&self.label) == Some(&self.enabled_value)
    }
}

impl From<&ControllerConfig> for Eligibility {
    fn from(config: &ControllerConfig) -> Self {
        Self::new(&config.service_label, &config.enabled_value)
    }
}

/// Cache of eligible services, keyed by namespace and name.
#[derive(Debug)]
pub struct ServiceCache {
    eligibility: Eligibility,
    matching: RwLock<HashMap<(String, String), ServiceExposure>>,
}

impl ServiceCache {
    /// Creates an empty cache using the given eligibility rule.
    #[must_use]
    pub fn new(eligibility: Eligibility) -> Self {
        Self {
            eligibility,
            matching: RwLock::new(HashMap::new()),
        }
    }

    /// Records the latest observation of a service.
    ///
    /// An eligible service replaces any earlier entry under its key; any other
    /// service is evicted.
    pub fn apply_service(&self, service: ServiceExposure) {
        let key = (service.namespace.clone(), service.name.clone());
        let eligible = self.eligibility.matches(&service);
        let mut matching = self.matching.write();

        if eligible {
            if matching.insert(key.clone(), service).is_none() {
                tracing::debug!("service became eligible: {}/{}", key.0, key.1);
            }
        } else if matching.remove(&key).is_some() {
            tracing::debug!("service no longer eligible: {}/{}", key.0, key.1);
        }
    }

    /// Evicts a service. Unknown keys are ignored.
    pub fn remove_service(&self, namespace: &str, name: &str) {
        let key = (namespace.to_string(), name.to_string());
        if self.matching.write().remove(&key).is_some() {
            tracing::debug!("removed service: {namespace}/{name}");
        }
    }

    /// Returns a snapshot of the eligible services.
    #[must_use]
    pub fn list_matching(&self) -> Vec<ServiceExposure> {
        self.matching.read().values().cloned().collect()
    }
}

impl EventHandler<Service> for ServiceCache {
    fn handle(&self, event: ResourceEvent<Service>) {
        match event {
            ResourceEvent::Added(service) | ResourceEvent::Updated { new: service, .. } => {
                match k8s::service_exposure(&service) {
                    Some(service) => self.apply_service(service),
                    None => tracing::warn!("dropping service without a namespace or name"),
                }
            }

            ResourceEvent::Deleted(service) => {
                match (service.metadata.namespace.as_deref(), service.metadata.name.as_deref()) {
                    (Some(namespace), Some(name)) => self.remove_service(namespace, name),
                    _ => tracing::warn!("dropping deleted service without a namespace or name"),
                }
            }
        }
    }
}
