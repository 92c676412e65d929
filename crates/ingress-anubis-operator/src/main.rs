//! ingress-anubis - puts an Anubis proof-of-work worker in front of Ingress backends

use std::sync::Arc;

use clap::Parser;
use kube::Client;
use tracing::{error, info, warn};

use ingress_anubis_common::leader_election::{LeaderElector, LEADER_LEASE_NAME};
use ingress_anubis_common::telemetry::{init_telemetry, shutdown_telemetry, TelemetryConfig};
use ingress_anubis_operator::controller_runner::build_ingress_controller;
use ingress_anubis_operator::OperatorConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = OperatorConfig::parse();

    init_telemetry(&TelemetryConfig {
        otlp_endpoint: cli.otlp_endpoint.clone(),
        namespace: cli.namespace.clone(),
        ingress_class: cli.ingress_class_name.clone(),
        pod_name: cli.pod_name.clone(),
    })?;

    let identity = cli.identity();
    let leader_election = cli.leader_election;
    let config = cli.into_controller_config()?;
    let namespace = config.namespace.clone();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        image = %config.image(),
        wrapped_ingress_class = %config.wrapped_ingress_class,
        "starting ingress-anubis"
    );

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kubernetes client: {}", e))?;

    if !leader_election {
        warn!("leader election disabled, running controller unconditionally");
        build_ingress_controller(client, config).await;
        shutdown_telemetry();
        return Ok(());
    }

    let elector = Arc::new(LeaderElector::new(
        client.clone(),
        LEADER_LEASE_NAME,
        &namespace,
        &identity,
    ));
    let mut guard = elector.acquire().await;
    info!(%identity, "acquired leadership, starting controller");

    let lost = tokio::select! {
        _ = build_ingress_controller(client, config) => false,
        _ = guard.lost() => true,
    };

    if lost {
        error!(%identity, "leadership lost, exiting");
        shutdown_telemetry();
        anyhow::bail!("leadership lost");
    }

    info!("controller stopped, releasing leadership");
    if let Err(e) = guard.release_leadership().await {
        warn!(error = %e, "failed to release leader lease");
    }
    shutdown_telemetry();
    Ok(())
}
