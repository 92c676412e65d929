//! Upstream selection and address resolution
//!
//! Only one upstream is fronted per Ingress: the default backend when set,
//! otherwise the first path of the first rule.

use k8s_openapi::api::networking::v1::{Ingress, IngressServiceBackend};
use kube::ResourceExt;
use tracing::debug;

use crate::sync::ResourceStore;
use crate::{Error, Result};

/// Pick the backend the worker will proxy to
///
/// All failures are permanent: the Ingress has to change before it can be wrapped.
pub fn select_backend(ingress: &Ingress) -> Result<IngressServiceBackend> {
    let ingress_ref = format!(
        "{}/{}",
        ingress.namespace().unwrap_or_default(),
        ingress.name_any()
    );
    let invalid = |msg: &str| Error::validation_for(ingress_ref.clone(), msg);
    let spec = ingress
        .spec
        .as_ref()
        .ok_or_else(|| invalid("no rules or default backend in ingress"))?;

    if let Some(default_backend) = spec.default_backend.as_ref() {
        return default_backend
            .service
            .clone()
            .ok_or_else(|| invalid("default backend is not a service backend"));
    }

    let rule = spec
        .rules
        .as_ref()
        .and_then(|rules| rules.first())
        .ok_or_else(|| invalid("no rules or default backend in ingress"))?;
    let http = rule
        .http
        .as_ref()
        .ok_or_else(|| invalid("ingress rule 0 HTTP was nil"))?;
    let path = http
        .paths
        .first()
        .ok_or_else(|| invalid("ingress rule 0 paths was empty"))?;

    path.backend
        .service
        .clone()
        .ok_or_else(|| invalid("ingress rule 0 path 0 is not a service backend"))
}

/// Cluster-internal URL of a backend Service in `namespace`
///
/// Numeric ports are used as-is. Named ports are looked up on the Service; a
/// missing Service or port is retryable since the Service may not have synced yet.
pub async fn resolve_target(
    store: &dyn ResourceStore,
    namespace: &str,
    backend: &IngressServiceBackend,
) -> Result<String> {
    let port = backend.port.as_ref();
    let number = port.and_then(|p| p.number).filter(|n| *n != 0);
    let port_name = port.and_then(|p| p.name.as_deref()).filter(|n| !n.is_empty());

    let port = match (port_name, number) {
        (Some(port_name), _) => {
            let service_ref = format!("{namespace}/{}", backend.name);
            let service = store
                .get_service(namespace, &backend.name)
                .await?
                .ok_or_else(|| Error::port_not_found(service_ref.clone(), port_name))?;
            let found = service
                .spec
                .iter()
                .flat_map(|spec| spec.ports.iter().flatten())
                .find(|p| p.name.as_deref() == Some(port_name))
                .map(|p| p.port)
                .ok_or_else(|| Error::port_not_found(service_ref, port_name))?;
            debug!(service = %backend.name, port_name, port = found, "resolved named port");
            found
        }
        (None, Some(number)) => number,
        (None, None) => {
            return Err(Error::validation_for(
                format!("{namespace}/{}", backend.name),
                "backend port has neither a name nor a number",
            ))
        }
    };

    Ok(format!(
        "http://{}.{namespace}.svc.cluster.local:{port}",
        backend.name
    ))
}
