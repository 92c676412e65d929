//! ingress-anubis operator: process configuration and controller wiring

pub mod config;
pub mod controller_runner;

pub use config::OperatorConfig;
