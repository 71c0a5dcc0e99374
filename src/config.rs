//! Controller configuration.

use std::time::Duration;

/// Label marking a `NodePort` service for multihome ingress.
pub const SERVICE_LABEL: &str = "multihome-ingress.kube-system.com/service";

/// Label naming the ingress group a node belongs to.
///
/// Nodes sharing a value share the same public ingress point.
pub const NODE_GROUP_LABEL: &str = "multihome-ingress.kube-system.com/node-group";

/// Value of [`SERVICE_LABEL`] that enables a service.
pub const ENABLED_VALUE: &str = "true";

const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const DEFAULT_MAX_WATCH_FAILURES: u32 = 5;

/// Configuration for the multihome ingress controller.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// Service label that opts a `NodePort` service in.
    pub service_label: String,

    /// Value the service label must carry to be considered enabled.
    pub enabled_value: String,

    /// Node label carrying the ingress group identifier.
    pub group_label: String,

    /// Namespace to watch services in.
    /// If `None`, services are watched across all namespaces.
    pub namespace: Option<String>,

    /// Interval after which each watcher re-lists its resources.
    pub resync_interval: Duration,

    /// Deadline for both caches to complete their initial list.
    pub sync_timeout: Duration,

    /// Time given to watchers to stop after shutdown is requested.
    pub shutdown_grace: Duration,

    /// Consecutive watch failures tolerated before giving up.
    pub max_watch_failures: u32,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            service_label: SERVICE_LABEL.to_string(),
            enabled_value: ENABLED_VALUE.to_string(),
            group_label: NODE_GROUP_LABEL.to_string(),
            namespace: None,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            sync_timeout: DEFAULT_SYNC_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            max_watch_failures: DEFAULT_MAX_WATCH_FAILURES,
        }
    }
}

impl ControllerConfig {
    /// Creates a configuration with the default labels and timings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the service eligibility label and its enabled value.
    #[must_use]
    pub fn service_label(mut self, label: impl Into<String>, enabled_value: impl Into<String>) -> Self {
        self.service_label = label.into();
        self.enabled_value = enabled_value.into();
        self
    }

    /// Sets the node group label.
    #[must_use]
    pub fn group_label(mut self, label: impl Into<String>) -> Self {
        self.group_label = label.into();
        self
    }

    /// Restricts the service watch to a single namespace.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Sets the re-list interval for both watchers.
    #[must_use]
    pub fn resync_interval(mut self, interval: Duration) -> Self {
        self.resync_interval = interval;
        self
    }

    /// Sets the initial sync deadline.
    #[must_use]
    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Sets the shutdown grace period.
    #[must_use]
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Sets how many consecutive watch failures are tolerated.
    #[must_use]
    pub fn max_watch_failures(mut self, attempts: u32) -> Self {
        self.max_watch_failures = attempts;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults() {
        let config = ControllerConfig::new();

        assert_eq!(config.service_label, SERVICE_LABEL);
        assert_eq!(config.enabled_value, "true");
        assert_eq!(config.group_label, NODE_GROUP_LABEL);
        assert!(config.namespace.is_none());
        assert_eq!(config.resync_interval, Duration::from_secs(30));
        assert_eq!(config.max_watch_failures, 5);
    }

    #[test]
    fn config_builder_overrides() {
        let config = ControllerConfig::new()
            .service_label("example.com/ingress", "on")
            .group_label("example.com/group")
            .namespace("edge")
            .resync_interval(Duration::from_secs(5))
            .sync_timeout(Duration::from_secs(10))
            .shutdown_grace(Duration::from_secs(1))
            .max_watch_failures(2);

        assert_eq!(config.service_label, "example.com/ingress");
        assert_eq!(config.enabled_value, "on");
        assert_eq!(config.group_label, "example.com/group");
        assert_eq!(config.namespace, Some("edge".to_string()));
        assert_eq!(config.resync_interval, Duration::from_secs(5));
        assert_eq!(config.sync_timeout, Duration::from_secs(10));
        assert_eq!(config.shutdown_grace, Duration::from_secs(1));
        assert_eq!(config.max_watch_failures, 2);
    }
}
