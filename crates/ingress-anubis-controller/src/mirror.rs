//! Status mirroring from generated Ingresses to their owners
//!
//! The wrapped ingress controller only publishes load balancer status on the
//! rewritten Ingress. Copying it back lets tooling that watches the source
//! Ingress (external-dns, `kubectl get ingress`) see the address.

use k8s_openapi::api::networking::v1::Ingress;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::sync::ResourceStore;
use crate::Result;
use ingress_anubis_common::labels::OWNER_LABEL;
use ingress_anubis_common::OwnerKey;

/// What the mirror did for one generated Ingress
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MirrorOutcome {
    /// The generated Ingress has no owner label
    NoOwner,
    /// The owner no longer exists
    OwnerGone,
    /// The owner already carries this status
    Unchanged,
    /// The owner's status was patched
    Patched,
}

/// Copy the status of `generated` onto the Ingress named by its owner label
///
/// A malformed owner label is a permanent error.
pub async fn mirror_status(store: &dyn ResourceStore, generated: &Ingress) -> Result<MirrorOutcome> {
    let Some(owner_label) = generated.labels().get(OWNER_LABEL) else {
        debug!(ingress = %generated.name_any(), "generated ingress has no owner label");
        return Ok(MirrorOutcome::NoOwner);
    };
    let owner = OwnerKey::parse(owner_label)?;

    let Some(owner_ingress) = store.get_ingress(&owner.namespace, &owner.name).await? else {
        debug!(owner = %owner, "owning ingress not found, nothing to mirror");
        return Ok(MirrorOutcome::OwnerGone);
    };

    if owner_ingress.status == generated.status {
        return Ok(MirrorOutcome::Unchanged);
    }

    // Whole-status replace so fields the wrapped controller dropped are cleared
    let mut mirrored = owner_ingress;
    mirrored.status = generated.status.clone();
    store
        .replace_ingress_status(&owner.namespace, &mirrored)
        .await?;
    info!(owner = %owner, "mirrored status onto owning ingress");
    Ok(MirrorOutcome::Patched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex};

    use crate::sync::MockResourceStore;
    use k8s_openapi::api::networking::v1::{
        IngressLoadBalancerIngress, IngressLoadBalancerStatus, IngressStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn status(ip: &str) -> IngressStatus {
        IngressStatus {
            load_balancer: Some(IngressLoadBalancerStatus {
                ingress: Some(vec![IngressLoadBalancerIngress {
                    ip: Some(ip.to_string()),
                    ..Default::default()
                }]),
            }),
        }
    }

    fn generated(owner_label: Option<&str>, ip: &str) -> Ingress {
        let labels = owner_label
            .map(|v| BTreeMap::from([(OWNER_LABEL.to_string(), v.to_string())]))
            .unwrap_or_default();
        Ingress {
            metadata: ObjectMeta {
                name: Some("ia-web".to_string()),
                namespace: Some("ingress-anubis".to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: None,
            status: Some(status(ip)),
        }
    }

    fn owner(status: Option<IngressStatus>) -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("shop".to_string()),
                resource_version: Some("12".to_string()),
                ..Default::default()
            },
            spec: None,
            status,
        }
    }

    type Replaced = Arc<Mutex<Vec<(String, Ingress)>>>;

    fn capturing_store(owner_status: Option<IngressStatus>) -> (MockResourceStore, Replaced) {
        let replaced: Replaced = Arc::default();
        let capture = Arc::clone(&replaced);

        let mut store = MockResourceStore::new();
        store
            .expect_get_ingress()
            .times(1)
            .returning(move |_, _| Ok(Some(owner(owner_status.clone()))));
        store
            .expect_replace_ingress_status()
            .times(1)
            .returning(move |ns, ingress| {
                capture
                    .lock()
                    .expect("mutex should not be poisoned")
                    .push((ns.to_string(), ingress.clone()));
                Ok(())
            });
        (store, replaced)
    }

    /// Story: load balancer addresses propagate to the source Ingress
    #[tokio::test]
    async fn story_status_is_copied_to_owner() {
        let (store, replaced) = capturing_store(None);

        let outcome = mirror_status(&store, &generated(Some("shop--web"), "10.0.0.1"))
            .await
            .expect("mirror succeeds");
        assert_eq!(outcome, MirrorOutcome::Patched);

        let calls = replaced.lock().expect("mutex should not be poisoned");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "shop");
        assert_eq!(calls[0].1.name_any(), "web");
        assert_eq!(calls[0].1.resource_version().as_deref(), Some("12"));
        assert_eq!(calls[0].1.status, Some(status("10.0.0.1")));
    }

    /// Story: an address withdrawn by the wrapped controller disappears from the owner too
    #[tokio::test]
    async fn story_withdrawn_address_is_cleared_on_owner() {
        let (store, replaced) = capturing_store(Some(status("10.0.0.1")));

        let mut child = generated(Some("shop--web"), "10.0.0.1");
        child.status = Some(IngressStatus {
            load_balancer: Some(IngressLoadBalancerStatus::default()),
        });

        let outcome = mirror_status(&store, &child).await.expect("mirror succeeds");
        assert_eq!(outcome, MirrorOutcome::Patched);

        let calls = replaced.lock().expect("mutex should not be poisoned");
        let mirrored = &calls[0].1;
        assert_eq!(mirrored.status, child.status);
        assert!(mirrored
            .status
            .as_ref()
            .and_then(|s| s.load_balancer.as_ref())
            .and_then(|lb| lb.ingress.as_ref())
            .is_none());
    }

    #[tokio::test]
    async fn equal_status_is_not_rewritten() {
        let mut store = MockResourceStore::new();
        store
            .expect_get_ingress()
            .returning(|_, _| Ok(Some(owner(Some(status("10.0.0.1"))))));
        store.expect_replace_ingress_status().never();

        let outcome = mirror_status(&store, &generated(Some("shop--web"), "10.0.0.1"))
            .await
            .expect("no-op");
        assert_eq!(outcome, MirrorOutcome::Unchanged);
    }

    #[tokio::test]
    async fn missing_owner_is_a_noop() {
        let mut store = MockResourceStore::new();
        store.expect_get_ingress().returning(|_, _| Ok(None));
        store.expect_replace_ingress_status().never();

        let outcome = mirror_status(&store, &generated(Some("shop--web"), "10.0.0.1"))
            .await
            .expect("owner gone");
        assert_eq!(outcome, MirrorOutcome::OwnerGone);
    }

    #[tokio::test]
    async fn unlabeled_generated_ingress_is_a_noop() {
        let mut store = MockResourceStore::new();
        store.expect_get_ingress().never();

        let outcome = mirror_status(&store, &generated(None, "10.0.0.1"))
            .await
            .expect("no owner");
        assert_eq!(outcome, MirrorOutcome::NoOwner);
    }

    /// Story: a corrupt owner label stops retries instead of looping
    #[tokio::test]
    async fn story_malformed_owner_label_is_permanent() {
        let mut store = MockResourceStore::new();
        store.expect_get_ingress().never();

        let err = mirror_status(&store, &generated(Some("team--a--web"), "10.0.0.1"))
            .await
            .expect_err("three parts");
        assert!(!err.is_retryable());
    }
}
