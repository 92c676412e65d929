//! Ingress reconciliation engine for ingress-anubis
//!
//! An Ingress with the engine's class is wrapped: a worker Deployment running
//! Anubis, a Service in front of it, and a rewritten Ingress (of the wrapped
//! class) pointing at that Service are generated in the controller namespace.
//!
//! - **Backend**: picks the upstream of the source Ingress and resolves it to an address
//! - **Directives**: per-Ingress overrides read from annotations
//! - **Resources**: pure builders for the generated Deployment, Service and Ingress
//! - **Sync**: create-or-update of the generated resources through [`ResourceStore`]
//! - **Controller**: lifecycle state machine, finalizer handling and pruning
//! - **Mirror**: copies status from a generated Ingress back onto its owner

pub mod backend;
pub mod config;
pub mod controller;
pub mod directives;
pub mod mirror;
pub mod resources;
pub mod sync;

pub use config::ControllerConfig;
pub use controller::{error_policy, reconcile, Context};
pub use directives::{DirectiveConfig, DirectiveDefaults, DirectiveKey};
pub use sync::{KubeResourceStore, ResourceStore};

pub(crate) use ingress_anubis_common::{Error, Result};
