//! Ownership labels, finalizer and naming for generated resources
//!
//! Generated resources point back at the Ingress that produced them through a
//! flat `<namespace>--<name>` label value rather than an ownerReference: the
//! generated resources live in the controller's namespace, and label selectors
//! only index flat strings.

use std::collections::BTreeMap;
use std::fmt;

use crate::Error;

/// Prefix shared by every annotation, label and finalizer we own
pub const KEY_BASE: &str = "ingress-anubis.jaredallard.github.com/";

/// Label marking a resource as generated by this controller
pub const MANAGED_LABEL: &str = "ingress-anubis.jaredallard.github.com/managed";

/// Value of [`MANAGED_LABEL`] on generated resources
pub const MANAGED_VALUE: &str = "true";

/// Label storing the owning Ingress as `<namespace>--<name>`
pub const OWNER_LABEL: &str = "ingress-anubis.jaredallard.github.com/owner";

/// Finalizer placed on every claimed Ingress
pub const FINALIZER: &str = "ingress-anubis.jaredallard.github.com/finalizer";

/// Separator between namespace and name in [`OWNER_LABEL`]
pub const OWNER_SEPARATOR: &str = "--";

/// Prefix of every generated resource name
pub const GENERATED_NAME_PREFIX: &str = "ia-";

/// `app.kubernetes.io/name` / `app.kubernetes.io/instance` value
pub const APP_NAME: &str = "anubis";

/// Name of the generated Deployment, Service and Ingress for a source Ingress
pub fn generated_name(source_name: &str) -> String {
    format!("{GENERATED_NAME_PREFIX}{source_name}")
}

/// Identity of the Ingress that owns a set of generated resources
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OwnerKey {
    /// Namespace of the source Ingress
    pub namespace: String,
    /// Name of the source Ingress
    pub name: String,
}

impl OwnerKey {
    /// Create an owner key for the given source Ingress coordinates
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Encode as a label value, refusing keys that could not be parsed back
    ///
    /// Namespaces containing the separator would make the label ambiguous, so
    /// they are rejected here instead of silently writing a corrupt key.
    pub fn encode(&self) -> Result<String, Error> {
        if self.namespace.is_empty() || self.name.is_empty() {
            return Err(Error::owner_key(
                format!("{}/{}", self.namespace, self.name),
                "namespace and name must be non-empty",
            ));
        }
        if self.namespace.contains(OWNER_SEPARATOR) || self.name.contains(OWNER_SEPARATOR) {
            return Err(Error::owner_key(
                format!("{}/{}", self.namespace, self.name),
                format!("namespace and name must not contain {OWNER_SEPARATOR:?}"),
            ));
        }
        Ok(format!("{}{}{}", self.namespace, OWNER_SEPARATOR, self.name))
    }

    /// Parse a label value written by [`OwnerKey::encode`]
    pub fn parse(value: &str) -> Result<Self, Error> {
        let parts: Vec<&str> = value.split(OWNER_SEPARATOR).collect();
        match parts.as_slice() {
            [namespace, name] if !namespace.is_empty() && !name.is_empty() => {
                Ok(Self::new(*namespace, *name))
            }
            _ => Err(Error::owner_key(
                value,
                "failed to determine owner: expected <namespace>--<name>",
            )),
        }
    }

    /// Full label set carried by every generated resource of this owner
    pub fn labels(&self) -> Result<BTreeMap<String, String>, Error> {
        Ok(BTreeMap::from([
            ("app.kubernetes.io/instance".to_string(), APP_NAME.to_string()),
            ("app.kubernetes.io/name".to_string(), APP_NAME.to_string()),
            (MANAGED_LABEL.to_string(), MANAGED_VALUE.to_string()),
            (OWNER_LABEL.to_string(), self.encode()?),
        ]))
    }
}

impl fmt::Display for OwnerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Whether a label map carries the managed marker
pub fn is_managed(labels: Option<&BTreeMap<String, String>>) -> bool {
    labels
        .and_then(|l| l.get(MANAGED_LABEL))
        .is_some_and(|v| v == MANAGED_VALUE)
}
