//! Controller supervisor.
//!
//! The [`Controller`] owns the node and service watchers and walks through
//! [`Phase`]s: it starts both watchers, waits for their initial lists, then
//! republishes the derived [`RoutingState`] after every change until shutdown.
//!
//! # Example
//!
//! ```ignore
//! use kube::Client;
//! use multihome_ingress_k8s::{Controller, ControllerConfig};
//!
//! let controller = Controller::new(ControllerConfig::new());
//! let view = controller.view();
//!
//! tokio::spawn(async move {
//!     let mut states = view.subscribe();
//!     while states.changed().await.is_ok() {
//!         let state = states.borrow_and_update().clone();
//!         // hand the state to the edges
//!     }
//! });
//!
//! let client = Client::try_default().await?;
//! controller.run_with_client(client, async { tokio::signal::ctrl_c().await.unwrap() }).await?;
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Node, Service};
use kube::{Api, Client, Resource};
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::ControllerConfig;
use crate::error::{Error, Result};
use crate::k8s::ApiSource;
use crate::nodes::NodeCache;
use crate::routing::{self, NodeGroup, RoutingState, RuleSpecification};
use crate::services::{Eligibility, ServiceCache};
use crate::watcher::{EventHandler, EventSource, ResourceEvent, ResourceWatcher};

/// Lifecycle phase of a [`Controller`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Watchers are being launched.
    Starting,
    /// Waiting for both initial lists.
    WaitingForSync,
    /// Caches are synced and routing state is being published.
    Running,
    /// Watchers have been asked to stop.
    ShuttingDown,
    /// All watchers have stopped.
    Stopped,
}

/// Read handle onto the controller's caches and published state.
#[derive(Clone, Debug)]
pub struct RoutingView {
    nodes: Arc<NodeCache>,
    services: Arc<ServiceCache>,
    group_label: Arc<str>,
    phase: watch::Receiver<Phase>,
    published: watch::Receiver<Arc<RoutingState>>,
}

impl RoutingView {
    /// Current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Derives node groups from the current node cache.
    #[must_use]
    pub fn node_groups(&self) -> Vec<NodeGroup> {
        routing::derive_node_groups(&self.nodes.list_ready(), &self.group_label)
    }

    /// Derives routing rules from the current service cache.
    #[must_use]
    pub fn rule_specifications(&self) -> Vec<RuleSpecification> {
        routing::derive_rule_specifications(&self.services.list_matching())
    }

    /// Derives the full routing state.
    ///
    /// Nodes and services are snapshotted independently.
    #[must_use]
    pub fn routing_state(&self) -> RoutingState {
        RoutingState {
            node_groups: self.node_groups(),
            rules: self.rule_specifications(),
        }
    }

    /// Subscribes to the routing state republished after every change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Arc<RoutingState>> {
        self.published.clone()
    }
}

/// Bumps a generation counter after every event handled by `inner`.
struct Notifying<H> {
    inner: H,
    changes: watch::Sender<u64>,
}

impl<K, H> EventHandler<K> for Notifying<H>
where
    H: EventHandler<K>,
{
    fn handle(&self, event: ResourceEvent<K>) {
        self.inner.handle(event);
        self.changes.send_modify(|generation| *generation = generation.wrapping_add(1));
    }
}

type WatchOutcome = (String, Result<()>);

/// Supervises the node and service watchers and publishes routing state.
pub struct Controller {
    config: ControllerConfig,
    view: RoutingView,
    phase: watch::Sender<Phase>,
    published: watch::Sender<Arc<RoutingState>>,
    changes: watch::Sender<u64>,
}

impl Controller {
    /// Creates a controller with empty caches.
    #[must_use]
    pub fn new(config: ControllerConfig) -> Self {
        let (phase, phase_rx) = watch::channel(Phase::Starting);
        let (published, published_rx) = watch::channel(Arc::new(RoutingState::default()));
        let (changes, _) = watch::channel(0);

        let view = RoutingView {
            nodes: Arc::new(NodeCache::new()),
            services: Arc::new(ServiceCache::new(Eligibility::from(&config))),
            group_label: config.group_label.as_str().into(),
            phase: phase_rx,
            published: published_rx,
        };

        Self {
            config,
            view,
            phase,
            published,
            changes,
        }
    }

    /// Returns a read handle that stays valid after the controller stops.
    #[must_use]
    pub fn view(&self) -> RoutingView {
        self.view.clone()
    }

    /// Runs against the Kubernetes API until `shutdown` completes.
    ///
    /// Nodes are watched cluster-wide; services in the configured namespace,
    /// or cluster-wide if none is set.
    ///
    /// # Errors
    ///
    /// See [`Controller::run`].
    pub async fn run_with_client<F>(self, client: Client, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let nodes: Api<Node> = Api::all(client.clone());
        let services: Api<Service> = match &self.config.namespace {
            Some(namespace) => Api::namespaced(client, namespace),
            None => Api::all(client),
        };

        self.run(ApiSource::new(nodes), ApiSource::new(services), shutdown)
            .await
    }

    /// Runs both watchers until `shutdown` completes.
    ///
    /// # Errors
    ///
    /// Fails if either initial list fails, if the caches do not sync within the
    /// configured timeout, or if a watcher stops on its own after startup.
    pub async fn run<N, S, F>(self, node_source: N, service_source: S, shutdown: F) -> Result<()>
    where
        N: EventSource<Node>,
        S: EventSource<Service>,
        F: Future<Output = ()>,
    {
        let token = CancellationToken::new();
        tokio::pin!(shutdown);

        self.set_phase(Phase::Starting);
        let node_watcher = ResourceWatcher::new(node_source, &self.config);
        let service_watcher = ResourceWatcher::new(service_source, &self.config);
        let mut nodes_synced = node_watcher.synced();
        let mut services_synced = service_watcher.synced();

        let mut tasks = JoinSet::new();
        tasks.spawn(run_watcher(node_watcher, self.notifying(self.view.nodes.clone()), token.clone()));
        tasks.spawn(run_watcher(
            service_watcher,
            self.notifying(self.view.services.clone()),
            token.clone(),
        ));

        self.set_phase(Phase::WaitingForSync);
        let barrier = time::timeout(self.config.sync_timeout, async {
            tokio::join!(
                wait_synced(&mut nodes_synced),
                wait_synced(&mut services_synced)
            );
        });

        let startup = tokio::select! {
            res = barrier => res
                .map(|()| true)
                .map_err(|_| Error::SyncTimeout(self.config.sync_timeout)),
            Some(res) = tasks.join_next() => Err(exit_error(res)),
            () = &mut shutdown => Ok(false),
        };

        let result = match startup {
            Ok(true) => self.supervise(&mut tasks, shutdown.as_mut()).await,
            Ok(false) => Ok(()),
            Err(error) => Err(error),
        };

        if let Err(error) = &result {
            tracing::error!("multihome ingress controller failed: {error}");
        }

        self.shut_down(&token, tasks).await;
        result
    }

    async fn supervise<F>(&self, tasks: &mut JoinSet<WatchOutcome>, mut shutdown: Pin<&mut F>) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let mut changes = self.changes.subscribe();
        self.set_phase(Phase::Running);
        self.publish();

        loop {
            tokio::select! {
                () = &mut shutdown => return Ok(()),
                Some(res) = tasks.join_next() => return Err(exit_error(res)),
                Ok(()) = changes.changed() => self.publish(),
            }
        }
    }

    async fn shut_down(&self, token: &CancellationToken, mut tasks: JoinSet<WatchOutcome>) {
        self.set_phase(Phase::ShuttingDown);
        token.cancel();

        let drain = async {
            while let Some(res) = tasks.join_next().await {
                if let Ok((kind, Err(error))) = res {
                    tracing::debug!("{kind} watcher stopped with error: {error}");
                }
            }
        };

        if time::timeout(self.config.shutdown_grace, drain).await.is_err() {
            tracing::warn!(
                "watchers did not stop within {:?}, aborting",
                self.config.shutdown_grace
            );
            tasks.abort_all();
        }

        self.set_phase(Phase::Stopped);
    }

    fn notifying<H>(&self, inner: H) -> Notifying<H> {
        Notifying {
            inner,
            changes: self.changes.clone(),
        }
    }

    fn publish(&self) {
        let state = self.view.routing_state();
        tracing::debug!(
            "publishing {} node groups and {} rules",
            state.node_groups.len(),
            state.rules.len()
        );

        self.published.send_replace(Arc::new(state));
    }

    fn set_phase(&self, phase: Phase) {
        tracing::info!("multihome ingress controller {phase:?}");
        self.phase.send_replace(phase);
    }
}

async fn run_watcher<K, S, H>(watcher: ResourceWatcher<K, S>, handler: H, token: CancellationToken) -> WatchOutcome
where
    K: Resource<DynamicType = ()> + Clone + Send + 'static,
    S: EventSource<K>,
    H: EventHandler<K>,
{
    let kind = watcher.kind().to_string();
    let result = watcher.run(handler, token).await;
    (kind, result)
}

/// Resolves once the barrier is set. If the watcher goes away first, never
/// resolves; its task result reports why.
async fn wait_synced(synced: &mut watch::Receiver<bool>) {
    if synced.wait_for(|s| *s).await.is_err() {
        std::future::pending::<()>().await;
    }
}

fn exit_error(result: std::result::Result<WatchOutcome, JoinError>) -> Error {
    match result {
        Ok((_, Err(error))) => error,
        Ok((kind, Ok(()))) => Error::WatcherExited { kind },
        Err(error) => Error::TaskFailed(error),
    }
}
