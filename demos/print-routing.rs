//! Prints the derived routing state as JSON every time it changes.
//!
//! Run with:
//! ```bash
//! RUST_LOG=multihome_ingress_k8s=debug cargo run --example print-routing
//! ```
//!
//! Uses the in-cluster configuration or `KUBECONFIG`, like `kubectl`.

use kube::Client;
use multihome_ingress_k8s::{Controller, ControllerConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = ControllerConfig::new();
    if let Ok(namespace) = std::env::var("SERVICE_NAMESPACE") {
        config = config.namespace(namespace);
    }

    let controller = Controller::new(config);
    let mut states = controller.view().subscribe();

    tokio::spawn(async move {
        while states.changed().await.is_ok() {
            let state = states.borrow_and_update().clone();
            match serde_json::to_string_pretty(&*state) {
                Ok(json) => println!("{json}"),
                Err(e) => tracing::warn!("failed to serialize routing state: {e}"),
            }
        }
    });

    let client = Client::try_default().await?;
    controller
        .run_with_client(client, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("failed to listen for ctrl-c: {e}");
            }
        })
        .await?;

    Ok(())
}
