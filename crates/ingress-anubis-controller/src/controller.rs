//! Ingress lifecycle controller
//!
//! Every reconciliation re-reads the Ingress, classifies it once, then runs
//! exactly one branch:
//!
//! - **Unclaimed**: another class and not generated by us, ignored
//! - **GeneratedSelf**: one of our rewritten Ingresses, its status is mirrored to the owner
//! - **Deleting**: generated resources are pruned, then the finalizer is released
//! - **ActiveNoFinalizer**: the finalizer is added and the Ingress requeued; nothing is generated yet
//! - **ActiveFinalized**: directives and upstream are resolved and the generated resources synced
//!
//! The finalizer is always persisted before the first generated resource is
//! created, so a deleted Ingress can always be cleaned up.

use std::sync::Arc;
use std::time::{Duration, Instant};

use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

use crate::backend::{resolve_target, select_backend};
use crate::config::ControllerConfig;
use crate::directives::DirectiveConfig;
use crate::mirror::mirror_status;
use crate::resources::DesiredTriad;
use crate::sync::{sync_triad, KubeResourceStore, ResourceStore};
use crate::{Error, Result};
use ingress_anubis_common::events::{actions, reasons, EventPublisher};
use ingress_anubis_common::labels::{generated_name, is_managed, FINALIZER};
use ingress_anubis_common::{metrics, KubeEventPublisher, OwnerKey, FIELD_MANAGER};
#[cfg(test)]
use ingress_anubis_common::NoopEventPublisher;

/// Requeue delay for transient failures
const RETRY_INTERVAL: Duration = Duration::from_secs(30);

/// Where an Ingress is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Lifecycle {
    /// Another controller's Ingress
    Unclaimed,
    /// An Ingress this controller generated
    GeneratedSelf,
    /// Claimed and being deleted
    Deleting,
    /// Claimed but the finalizer isn't there yet
    ActiveNoFinalizer,
    /// Claimed and finalized, generated resources should exist
    ActiveFinalized,
}

impl Lifecycle {
    /// Metric label
    pub fn as_str(self) -> &'static str {
        match self {
            Lifecycle::Unclaimed => "unclaimed",
            Lifecycle::GeneratedSelf => "generated",
            Lifecycle::Deleting => "delete",
            Lifecycle::ActiveNoFinalizer => "claim",
            Lifecycle::ActiveFinalized => "sync",
        }
    }
}

/// Classify an Ingress
///
/// An Ingress of our own class that carries the managed label would make us
/// wrap our own output; that is a permanent error.
pub fn classify(ingress: &Ingress, config: &ControllerConfig) -> Result<Lifecycle> {
    let class = ingress
        .spec
        .as_ref()
        .and_then(|s| s.ingress_class_name.as_deref());
    let managed = is_managed(ingress.metadata.labels.as_ref());

    if class != Some(config.ingress_class.as_str()) {
        return Ok(if managed {
            Lifecycle::GeneratedSelf
        } else {
            Lifecycle::Unclaimed
        });
    }
    if managed {
        return Err(Error::validation_for(
            ingress_ref(ingress),
            "attempted to reconcile ingress owned by self",
        ));
    }
    if ingress.metadata.deletion_timestamp.is_some() {
        return Ok(Lifecycle::Deleting);
    }
    if !has_finalizer(ingress) {
        return Ok(Lifecycle::ActiveNoFinalizer);
    }
    Ok(Lifecycle::ActiveFinalized)
}

fn ingress_ref(ingress: &Ingress) -> String {
    format!(
        "{}/{}",
        ingress.namespace().unwrap_or_default(),
        ingress.name_any()
    )
}

fn has_finalizer(ingress: &Ingress) -> bool {
    ingress.finalizers().iter().any(|f| f == FINALIZER)
}

/// Shared state for reconciliations
pub struct Context {
    /// Store the generated resources are read from and written to
    pub store: Arc<dyn ResourceStore>,
    /// Process configuration
    pub config: Arc<ControllerConfig>,
    /// Event publisher for emitting Kubernetes Events
    pub events: Arc<dyn EventPublisher>,
}

impl Context {
    /// Create a context from explicit dependencies
    pub fn new(
        store: Arc<dyn ResourceStore>,
        config: Arc<ControllerConfig>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            store,
            config,
            events,
        }
    }

    /// Create a context talking to the API server through `client`
    pub fn from_client(client: Client, config: ControllerConfig) -> Self {
        Self {
            store: Arc::new(KubeResourceStore::new(client.clone())),
            config: Arc::new(config),
            events: Arc::new(KubeEventPublisher::new(client, FIELD_MANAGER)),
        }
    }

    /// Create a context for testing with a mock store and default configuration
    #[cfg(test)]
    pub fn for_testing(store: Arc<dyn ResourceStore>) -> Self {
        Self {
            store,
            config: Arc::new(ControllerConfig::default()),
            events: Arc::new(NoopEventPublisher),
        }
    }
}

/// Reconcile an Ingress
///
/// The watched object is only used for its coordinates; the current state is
/// read from the store so decisions never act on a stale cache entry.
#[instrument(skip(ingress, ctx), fields(ingress = %ingress_ref(&ingress)))]
pub async fn reconcile(ingress: Arc<Ingress>, ctx: Arc<Context>) -> Result<Action> {
    let start = Instant::now();
    let namespace = ingress.namespace().unwrap_or_default();
    let name = ingress.name_any();

    let Some(current) = ctx.store.get_ingress(&namespace, &name).await? else {
        debug!("ingress no longer exists");
        return Ok(Action::await_change());
    };

    let (lifecycle, result) = match classify(&current, &ctx.config) {
        Ok(lifecycle) => (lifecycle.as_str(), drive(lifecycle, &current, &ctx).await),
        Err(e) => ("invalid", Err(e)),
    };

    metrics::record_reconcile(lifecycle, start.elapsed().as_secs_f64(), result.is_ok());
    if let Err(e) = &result {
        metrics::record_error(e.error_type());
        if !e.is_retryable() {
            ctx.events
                .publish(
                    &current.object_ref(&()),
                    EventType::Warning,
                    reasons::INVALID_INGRESS,
                    actions::RECONCILE,
                    Some(e.to_string()),
                )
                .await;
        }
    }
    result
}

async fn drive(lifecycle: Lifecycle, ingress: &Ingress, ctx: &Context) -> Result<Action> {
    match lifecycle {
        Lifecycle::Unclaimed => {
            debug!("ingress class not ours, ignoring");
            Ok(Action::await_change())
        }
        Lifecycle::GeneratedSelf => {
            mirror_status(ctx.store.as_ref(), ingress).await?;
            Ok(Action::await_change())
        }
        Lifecycle::Deleting => {
            info!("ingress was deleted, pruning resources");
            let pruned = prune(ctx.store.as_ref(), &ctx.config, ingress).await?;
            if pruned > 0 {
                ctx.events
                    .publish(
                        &ingress.object_ref(&()),
                        EventType::Normal,
                        reasons::RESOURCES_PRUNED,
                        actions::PRUNE,
                        Some(format!("Deleted {pruned} generated resources")),
                    )
                    .await;
            }
            info!(pruned, "finished pruning resources and removed finalizer");
            Ok(Action::await_change())
        }
        Lifecycle::ActiveNoFinalizer => {
            add_finalizer(ctx.store.as_ref(), ingress).await?;
            ctx.events
                .publish(
                    &ingress.object_ref(&()),
                    EventType::Normal,
                    reasons::CLAIMED,
                    actions::RECONCILE,
                    Some(format!("Claimed by ingress class {}", ctx.config.ingress_class)),
                )
                .await;
            Ok(Action::requeue(Duration::ZERO))
        }
        Lifecycle::ActiveFinalized => {
            info!("reconciling ingress");
            sync_generated(ingress, ctx).await?;
            Ok(Action::await_change())
        }
    }
}

/// Resolve everything the generated resources depend on, then apply them
///
/// Spec-shape errors are raised before any store read.
async fn sync_generated(ingress: &Ingress, ctx: &Context) -> Result<()> {
    let namespace = ingress.namespace().unwrap_or_default();
    let backend = select_backend(ingress)?;
    let directives = DirectiveConfig::from_ingress(Some(ingress), &ctx.config.directive_defaults)?;
    OwnerKey::new(namespace.as_str(), ingress.name_any()).encode()?;

    let target = resolve_target(ctx.store.as_ref(), &namespace, &backend).await?;
    debug!(%target, difficulty = directives.difficulty, "resolved worker settings");

    let desired = DesiredTriad::build(ingress, &directives, &target, &ctx.config)?;
    let outcome = sync_triad(ctx.store.as_ref(), &ctx.config.namespace, &desired).await?;
    debug!(?outcome, "generated resources synced");
    Ok(())
}

async fn add_finalizer(store: &dyn ResourceStore, ingress: &Ingress) -> Result<()> {
    info!("adding finalizer");
    let mut finalizers = ingress.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    store
        .patch_ingress_finalizers(
            &ingress.namespace().unwrap_or_default(),
            &ingress.name_any(),
            ingress.resource_version(),
            &finalizers,
        )
        .await
}

/// Delete the generated resources of `ingress`, then release its finalizer
///
/// Resources that are already gone are skipped, so pruning twice is a no-op.
/// Returns how many resources were actually deleted.
pub async fn prune(
    store: &dyn ResourceStore,
    config: &ControllerConfig,
    ingress: &Ingress,
) -> Result<usize> {
    let generated = generated_name(&ingress.name_any());
    let namespace = config.namespace.as_str();

    let deleted = [
        store.delete_ingress(namespace, &generated).await?,
        store.delete_service(namespace, &generated).await?,
        store.delete_deployment(namespace, &generated).await?,
    ];
    let pruned = deleted.iter().filter(|d| **d).count();

    if has_finalizer(ingress) {
        let remaining: Vec<String> = ingress
            .finalizers()
            .iter()
            .filter(|f| f.as_str() != FINALIZER)
            .cloned()
            .collect();
        store
            .patch_ingress_finalizers(
                &ingress.namespace().unwrap_or_default(),
                &ingress.name_any(),
                ingress.resource_version(),
                &remaining,
            )
            .await?;
    }

    Ok(pruned)
}

/// Error policy for the ingress controller
///
/// - Retryable errors (transient): requeue after 30 seconds
/// - Non-retryable errors (permanent): await a change to the Ingress
pub fn error_policy(ingress: Arc<Ingress>, error: &Error, _ctx: Arc<Context>) -> Action {
    if error.is_retryable() {
        warn!(
            %error,
            ingress = %ingress_ref(&ingress),
            "reconciliation failed, will retry"
        );
        Action::requeue(RETRY_INTERVAL)
    } else {
        error!(
            %error,
            ingress = %ingress_ref(&ingress),
            "reconciliation failed permanently"
        );
        Action::await_change()
    }
}
