//! Process-wide settings consumed by the reconciler

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Volume, VolumeMount};

use crate::directives::DirectiveDefaults;
use ingress_anubis_common::DEFAULT_NAMESPACE;

/// Default worker image repository
pub const DEFAULT_ANUBIS_IMAGE: &str = "ghcr.io/techarohq/anubis";

/// Default worker image tag
pub const DEFAULT_ANUBIS_VERSION: &str = "v1.14.2";

/// Default class of rewritten Ingresses
pub const DEFAULT_WRAPPED_INGRESS_CLASS: &str = "nginx";

/// Default class claimed by the engine
pub const DEFAULT_INGRESS_CLASS: &str = "anubis";

/// Settings shared by every reconciliation
///
/// Built once at startup by the operator binary and handed to the controller
/// behind an `Arc`; never mutated afterwards.
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Namespace the generated resources are created in
    pub namespace: String,
    /// Worker image repository
    pub anubis_image: String,
    /// Worker image tag
    pub anubis_version: String,
    /// Class given to rewritten Ingresses unless a directive overrides it
    pub wrapped_ingress_class: String,
    /// Class of the Ingresses this engine wraps
    pub ingress_class: String,
    /// Static environment for every worker
    pub environment: BTreeMap<String, String>,
    /// ConfigMap every worker loads environment from
    pub env_from_configmap: Option<String>,
    /// Secret every worker loads environment from
    pub env_from_secret: Option<String>,
    /// Annotations placed on every worker pod
    pub pod_annotations: BTreeMap<String, String>,
    /// Volumes added to every worker pod
    pub volumes: Vec<Volume>,
    /// Volume mounts added to every worker container
    pub volume_mounts: Vec<VolumeMount>,
    /// Fallback values for directives an Ingress doesn't set
    pub directive_defaults: DirectiveDefaults,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            anubis_image: DEFAULT_ANUBIS_IMAGE.to_string(),
            anubis_version: DEFAULT_ANUBIS_VERSION.to_string(),
            wrapped_ingress_class: DEFAULT_WRAPPED_INGRESS_CLASS.to_string(),
            ingress_class: DEFAULT_INGRESS_CLASS.to_string(),
            environment: BTreeMap::new(),
            env_from_configmap: None,
            env_from_secret: None,
            pod_annotations: BTreeMap::new(),
            volumes: Vec::new(),
            volume_mounts: Vec::new(),
            directive_defaults: DirectiveDefaults::default(),
        }
    }
}

impl ControllerConfig {
    /// Full worker image reference (`<image>:<version>`)
    pub fn image(&self) -> String {
        format!("{}:{}", self.anubis_image, self.anubis_version)
    }
}
