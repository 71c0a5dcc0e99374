#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Kubernetes-driven routing state for multi-homed ingress.
//!
//! Edge routers in front of a cluster need to know two things: which nodes
//! share a public ingress point, and which `NodePort`s to forward to them.
//! This crate watches Kubernetes `Node` and `Service` resources and derives
//! both, ready to be handed to whatever programs the edges.
//!
//! # Features
//!
//! - **Node groups**: Ready nodes grouped by the `multihome-ingress.kube-system.com/node-group` label
//! - **Routing rules**: One rule per node port of every labelled `NodePort` service
//! - **Self-healing watches**: Periodic re-lists and transparent watch recovery
//! - **Explicit lifecycle**: Startup gated on initial sync, graceful shutdown
//!
//! # Usage
//!
//! ```ignore
//! use kube::Client;
//! use multihome_ingress_k8s::{Controller, ControllerConfig};
//!
//! let controller = Controller::new(ControllerConfig::new());
//! let view = controller.view();
//!
//! let client = Client::try_default().await?;
//! tokio::spawn(controller.run_with_client(client, async {
//!     tokio::signal::ctrl_c().await.ok();
//! }));
//!
//! // Later, from anywhere
//! let state = view.routing_state();
//! for group in &state.node_groups {
//!     println!("{}: {} members", group.group_id, group.members.len());
//! }
//! ```

mod config;
mod controller;
mod error;
mod k8s;
mod nodes;
mod routing;
mod services;
mod watcher;

pub use config::{ControllerConfig, ENABLED_VALUE, NODE_GROUP_LABEL, SERVICE_LABEL};
pub use controller::{Controller, Phase, RoutingView};
pub use error::{Error, Result};
pub use k8s::ApiSource;
pub use nodes::{ClusterNode, INTERNAL_IP, NodeAddress, NodeCache};
pub use routing::{
    GroupMember, NodeGroup, Protocol, RoutingState, RuleSpecification, derive_node_groups,
    derive_rule_specifications,
};
pub use services::{Eligibility, NODE_PORT, ServiceCache, ServiceExposure, ServicePort};
pub use watcher::{EventHandler, EventSource, ResourceEvent, ResourceWatcher};
