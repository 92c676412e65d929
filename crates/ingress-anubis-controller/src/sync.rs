//! Create-or-update of the generated resources
//!
//! Each generated resource is applied independently: read the live object,
//! create it when absent, otherwise overwrite only the fields we own on the
//! live copy and replace it with the observed resourceVersion. Unchanged
//! objects are not written at all, so steady-state reconciles are read-only.

use std::fmt::Debug;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::Client;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use crate::resources::DesiredTriad;
use crate::{Error, Result};
use ingress_anubis_common::{metrics, FIELD_MANAGER};

/// Store operations the reconciler needs
///
/// Abstracts the API server so the lifecycle can be tested without one.
/// `get_*` return `Ok(None)` for absent objects and `delete_*` return
/// `Ok(false)` when there was nothing to delete.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Get an Ingress
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>>;
    /// Create an Ingress
    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress>;
    /// Replace an Ingress (conditional on its resourceVersion)
    async fn replace_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress>;
    /// Delete an Ingress if it exists
    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Get a Service
    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>>;
    /// Create a Service
    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service>;
    /// Replace a Service (conditional on its resourceVersion)
    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<Service>;
    /// Delete a Service if it exists
    async fn delete_service(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Get a Deployment
    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>>;
    /// Create a Deployment
    async fn create_deployment(&self, namespace: &str, deployment: &Deployment)
        -> Result<Deployment>;
    /// Replace a Deployment (conditional on its resourceVersion)
    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment>;
    /// Delete a Deployment if it exists
    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<bool>;

    /// Set an Ingress's finalizer list, failing with 409 if it changed since `resource_version`
    async fn patch_ingress_finalizers(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        finalizers: &[String],
    ) -> Result<()>;

    /// Replace an Ingress's whole status with `ingress.status`
    ///
    /// Fields absent from `ingress.status` are cleared. Fails with 409 if the
    /// object changed since `ingress`'s resourceVersion.
    async fn replace_ingress_status(&self, namespace: &str, ingress: &Ingress) -> Result<()>;
}

/// [`ResourceStore`] backed by the Kubernetes API
pub struct KubeResourceStore {
    client: Client,
}

impl KubeResourceStore {
    /// Create a store using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as kube::Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

async fn delete_opt<K>(api: Api<K>, name: &str) -> Result<bool>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::default()).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn object_name<K: kube::Resource>(obj: &K) -> String {
    obj.meta().name.clone().unwrap_or_default()
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn merge_params() -> PatchParams {
    PatchParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl ResourceStore for KubeResourceStore {
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>> {
        Ok(self.api::<Ingress>(namespace).get_opt(name).await?)
    }

    async fn create_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress> {
        Ok(self
            .api::<Ingress>(namespace)
            .create(&post_params(), ingress)
            .await?)
    }

    async fn replace_ingress(&self, namespace: &str, ingress: &Ingress) -> Result<Ingress> {
        Ok(self
            .api::<Ingress>(namespace)
            .replace(&object_name(ingress), &post_params(), ingress)
            .await?)
    }

    async fn delete_ingress(&self, namespace: &str, name: &str) -> Result<bool> {
        delete_opt(self.api::<Ingress>(namespace), name).await
    }

    async fn get_service(&self, namespace: &str, name: &str) -> Result<Option<Service>> {
        Ok(self.api::<Service>(namespace).get_opt(name).await?)
    }

    async fn create_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        Ok(self
            .api::<Service>(namespace)
            .create(&post_params(), service)
            .await?)
    }

    async fn replace_service(&self, namespace: &str, service: &Service) -> Result<Service> {
        Ok(self
            .api::<Service>(namespace)
            .replace(&object_name(service), &post_params(), service)
            .await?)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<bool> {
        delete_opt(self.api::<Service>(namespace), name).await
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Option<Deployment>> {
        Ok(self.api::<Deployment>(namespace).get_opt(name).await?)
    }

    async fn create_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        Ok(self
            .api::<Deployment>(namespace)
            .create(&post_params(), deployment)
            .await?)
    }

    async fn replace_deployment(
        &self,
        namespace: &str,
        deployment: &Deployment,
    ) -> Result<Deployment> {
        Ok(self
            .api::<Deployment>(namespace)
            .replace(&object_name(deployment), &post_params(), deployment)
            .await?)
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> Result<bool> {
        delete_opt(self.api::<Deployment>(namespace), name).await
    }

    async fn patch_ingress_finalizers(
        &self,
        namespace: &str,
        name: &str,
        resource_version: Option<String>,
        finalizers: &[String],
    ) -> Result<()> {
        let patch = json!({
            "metadata": {
                "resourceVersion": resource_version,
                "finalizers": finalizers
            }
        });
        self.api::<Ingress>(namespace)
            .patch(name, &merge_params(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn replace_ingress_status(&self, namespace: &str, ingress: &Ingress) -> Result<()> {
        let body = serde_json::to_vec(ingress)
            .map_err(|e| Error::serialization(format!("ingress status: {e}")))?;
        self.api::<Ingress>(namespace)
            .replace_status(&object_name(ingress), &post_params(), body)
            .await?;
        Ok(())
    }
}

/// What happened to a generated resource during sync
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncOutcome {
    /// It did not exist and was created
    Created,
    /// It existed and was replaced
    Updated,
    /// It already matched the desired state
    Unchanged,
}

impl SyncOutcome {
    fn operation(self) -> Option<&'static str> {
        match self {
            SyncOutcome::Created => Some("create"),
            SyncOutcome::Updated => Some("update"),
            SyncOutcome::Unchanged => None,
        }
    }
}

/// Outcome of syncing the Deployment, Service and Ingress
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TriadOutcome {
    /// Worker Deployment
    pub deployment: SyncOutcome,
    /// Worker Service
    pub service: SyncOutcome,
    /// Rewritten Ingress
    pub ingress: SyncOutcome,
}

/// Apply the generated Deployment, Service and Ingress, in that order
///
/// Stops at the first failure; whatever was already applied stays, and the
/// next reconciliation converges the rest.
pub async fn sync_triad(
    store: &dyn ResourceStore,
    namespace: &str,
    desired: &DesiredTriad,
) -> Result<TriadOutcome> {
    let deployment = sync_deployment(store, namespace, &desired.deployment).await?;
    let service = sync_service(store, namespace, &desired.service).await?;
    let ingress = sync_ingress(store, namespace, &desired.ingress).await?;
    Ok(TriadOutcome {
        deployment,
        service,
        ingress,
    })
}

fn record(kind: &'static str, name: &str, outcome: SyncOutcome) -> SyncOutcome {
    match outcome.operation() {
        Some(operation) => {
            info!(kind, name, operation, "applied generated resource");
            metrics::record_applied(kind, operation);
        }
        None => debug!(kind, name, "generated resource up to date"),
    }
    outcome
}

/// Create-or-update the worker Deployment
///
/// The label selector is immutable, so an existing Deployment keeps its own.
pub async fn sync_deployment(
    store: &dyn ResourceStore,
    namespace: &str,
    desired: &Deployment,
) -> Result<SyncOutcome> {
    let name = object_name(desired);
    let Some(live) = store.get_deployment(namespace, &name).await? else {
        store.create_deployment(namespace, desired).await?;
        return Ok(record("Deployment", &name, SyncOutcome::Created));
    };

    let mut updated = live.clone();
    updated.metadata.labels = desired.metadata.labels.clone();
    let live_selector = live.spec.as_ref().map(|s| s.selector.clone());
    updated.spec = desired.spec.clone();
    if let (Some(spec), Some(selector)) = (updated.spec.as_mut(), live_selector) {
        spec.selector = selector;
    }

    if updated == live {
        return Ok(record("Deployment", &name, SyncOutcome::Unchanged));
    }
    store.replace_deployment(namespace, &updated).await?;
    Ok(record("Deployment", &name, SyncOutcome::Updated))
}

/// Create-or-update the worker Service
///
/// Server-assigned fields (cluster IP, node ports, ...) are kept from the live object.
pub async fn sync_service(
    store: &dyn ResourceStore,
    namespace: &str,
    desired: &Service,
) -> Result<SyncOutcome> {
    let name = object_name(desired);
    let Some(live) = store.get_service(namespace, &name).await? else {
        store.create_service(namespace, desired).await?;
        return Ok(record("Service", &name, SyncOutcome::Created));
    };

    let mut updated = live.clone();
    updated.metadata.labels = desired.metadata.labels.clone();
    if let Some(want) = desired.spec.as_ref() {
        let spec = updated.spec.get_or_insert_with(Default::default);
        spec.selector = want.selector.clone();
        spec.type_ = want.type_.clone();
        spec.ports = want.ports.clone();
    }

    if updated == live {
        return Ok(record("Service", &name, SyncOutcome::Unchanged));
    }
    store.replace_service(namespace, &updated).await?;
    Ok(record("Service", &name, SyncOutcome::Updated))
}

/// Create-or-update the rewritten Ingress
///
/// Labels set by others survive; ours win on conflicting keys.
pub async fn sync_ingress(
    store: &dyn ResourceStore,
    namespace: &str,
    desired: &Ingress,
) -> Result<SyncOutcome> {
    let name = object_name(desired);
    let Some(live) = store.get_ingress(namespace, &name).await? else {
        store.create_ingress(namespace, desired).await?;
        return Ok(record("Ingress", &name, SyncOutcome::Created));
    };

    let mut updated = live.clone();
    updated.spec = desired.spec.clone();
    updated.metadata.annotations = desired.metadata.annotations.clone();
    if let Some(want) = desired.metadata.labels.as_ref() {
        let labels = updated.metadata.labels.get_or_insert_with(Default::default);
        labels.extend(want.iter().map(|(k, v)| (k.clone(), v.clone())));
    }

    if updated == live {
        return Ok(record("Ingress", &name, SyncOutcome::Unchanged));
    }
    store.replace_ingress(namespace, &updated).await?;
    Ok(record("Ingress", &name, SyncOutcome::Updated))
}
