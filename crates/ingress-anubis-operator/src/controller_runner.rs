//! Builds the Ingress controller future

use std::future::Future;
use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};

use ingress_anubis_controller::{error_policy, reconcile, Context, ControllerConfig};

/// Watcher timeout (seconds), kept below the client's 30s read timeout so
/// idle watches are closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Build the controller watching every Ingress in the cluster
///
/// Source Ingresses and the generated ones are both Ingresses, so a single
/// watch drives claiming, syncing, pruning and status mirroring.
pub fn build_ingress_controller(
    client: Client,
    config: ControllerConfig,
) -> impl Future<Output = ()> + Send {
    let ingresses: Api<Ingress> = Api::all(client.clone());
    let ctx = Arc::new(Context::from_client(client, config));

    tracing::info!(
        ingress_class = %ctx.config.ingress_class,
        namespace = %ctx.config.namespace,
        "starting ingress controller"
    );

    Controller::new(ingresses, WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS))
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(log_reconcile_result("Ingress"))
}

/// Creates a closure for logging reconciliation results.
fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => tracing::debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::debug!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
