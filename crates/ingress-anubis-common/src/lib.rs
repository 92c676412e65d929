//! Common types for ingress-anubis: errors, ownership labels, and process plumbing

#![deny(missing_docs)]

pub mod error;
pub mod events;
pub mod labels;
pub mod leader_election;
pub mod metrics;
pub mod telemetry;

pub use error::Error;
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
pub use labels::OwnerKey;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Default namespace generated resources and the leader lease live in
pub const DEFAULT_NAMESPACE: &str = "ingress-anubis";

/// Field manager / reporting component used for every write we make
pub const FIELD_MANAGER: &str = "ingress-anubis-controller";
