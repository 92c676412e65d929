//! Per-Ingress overrides read from annotations
//!
//! Only the closed set in [`DirectiveKey::ALL`] is inspected; every other
//! annotation is ignored. A recognized annotation with a value of the wrong
//! type fails the whole extraction.

use std::collections::BTreeMap;

use k8s_openapi::api::networking::v1::Ingress;

use crate::{Error, Result};

/// Environment variable carrying the challenge difficulty
pub const ENV_DIFFICULTY: &str = "DIFFICULTY";
/// Environment variable toggling the built-in robots.txt
pub const ENV_SERVE_ROBOTS_TXT: &str = "SERVE_ROBOTS_TXT";
/// Environment variable toggling OpenGraph passthrough
pub const ENV_OG_PASSTHROUGH: &str = "OG_PASSTHROUGH";
/// Environment variable with the metrics listen address
pub const ENV_METRICS_BIND: &str = "METRICS_BIND";

/// Annotations understood by the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DirectiveKey {
    /// Challenge difficulty passed to the worker
    Difficulty,
    /// Whether the worker serves its own robots.txt
    ServeRobotsTxt,
    /// Whether OpenGraph tags are passed through to crawlers
    OgPassthrough,
    /// Port the worker exposes metrics (and readiness) on
    MetricsPort,
    /// Class of the rewritten Ingress
    IngressClass,
    /// Extra ConfigMap to load worker environment from
    EnvFromConfigMap,
    /// Extra Secret to load worker environment from
    EnvFromSecret,
}

impl DirectiveKey {
    /// Every directive, in extraction order
    pub const ALL: [DirectiveKey; 7] = [
        DirectiveKey::Difficulty,
        DirectiveKey::ServeRobotsTxt,
        DirectiveKey::OgPassthrough,
        DirectiveKey::MetricsPort,
        DirectiveKey::IngressClass,
        DirectiveKey::EnvFromConfigMap,
        DirectiveKey::EnvFromSecret,
    ];

    /// Full annotation key
    pub fn annotation(self) -> &'static str {
        match self {
            DirectiveKey::Difficulty => "ingress-anubis.jaredallard.github.com/difficulty",
            DirectiveKey::ServeRobotsTxt => "ingress-anubis.jaredallard.github.com/serve-robots-txt",
            DirectiveKey::OgPassthrough => "ingress-anubis.jaredallard.github.com/og-passthrough",
            DirectiveKey::MetricsPort => "ingress-anubis.jaredallard.github.com/metrics-port",
            DirectiveKey::IngressClass => "ingress-anubis.jaredallard.github.com/ingress-class",
            DirectiveKey::EnvFromConfigMap => "ingress-anubis.jaredallard.github.com/env-from-cm",
            DirectiveKey::EnvFromSecret => "ingress-anubis.jaredallard.github.com/env-from-secret",
        }
    }
}

/// Values used for directives an Ingress leaves unset
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectiveDefaults {
    /// Default challenge difficulty
    pub difficulty: u32,
    /// Default for serving robots.txt
    pub serve_robots_txt: bool,
    /// Default for OpenGraph passthrough
    pub og_passthrough: bool,
    /// Default metrics port
    pub metrics_port: u16,
}

impl Default for DirectiveDefaults {
    fn default() -> Self {
        Self {
            difficulty: 4,
            serve_robots_txt: true,
            og_passthrough: true,
            metrics_port: 9090,
        }
    }
}

impl DirectiveDefaults {
    /// Worker environment implied by the defaults alone
    pub fn environment(&self) -> BTreeMap<String, String> {
        directive_environment(
            self.difficulty,
            self.serve_robots_txt,
            self.og_passthrough,
            self.metrics_port,
        )
    }
}

/// Fully resolved directives for one Ingress
///
/// Computed on every reconciliation and never stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectiveConfig {
    /// Challenge difficulty
    pub difficulty: u32,
    /// Serve the worker's robots.txt
    pub serve_robots_txt: bool,
    /// Pass OpenGraph tags through
    pub og_passthrough: bool,
    /// Metrics and readiness port
    pub metrics_port: u16,
    /// Class override for the rewritten Ingress
    pub ingress_class: Option<String>,
    /// Extra ConfigMap environment source
    pub env_from_configmap: Option<String>,
    /// Extra Secret environment source
    pub env_from_secret: Option<String>,
}

/// Directives as read, before defaults are applied
#[derive(Default)]
struct PartialDirectives {
    difficulty: Option<u32>,
    serve_robots_txt: Option<bool>,
    og_passthrough: Option<bool>,
    metrics_port: Option<u16>,
    ingress_class: Option<String>,
    env_from_configmap: Option<String>,
    env_from_secret: Option<String>,
}

impl DirectiveConfig {
    /// Extract directives from an Ingress's annotations
    ///
    /// `None`, or an Ingress without annotations, yields the defaults.
    pub fn from_ingress(ingress: Option<&Ingress>, defaults: &DirectiveDefaults) -> Result<Self> {
        let mut partial = PartialDirectives::default();

        if let Some(annotations) = ingress.and_then(|i| i.metadata.annotations.as_ref()) {
            for key in DirectiveKey::ALL {
                let Some(value) = annotations.get(key.annotation()) else {
                    continue;
                };
                match key {
                    DirectiveKey::Difficulty => {
                        partial.difficulty = Some(parse_int(key, value)?);
                    }
                    DirectiveKey::ServeRobotsTxt => {
                        partial.serve_robots_txt = Some(parse_directive_bool(key, value)?);
                    }
                    DirectiveKey::OgPassthrough => {
                        partial.og_passthrough = Some(parse_directive_bool(key, value)?);
                    }
                    DirectiveKey::MetricsPort => {
                        partial.metrics_port = Some(parse_port(key, value)?);
                    }
                    DirectiveKey::IngressClass => partial.ingress_class = Some(value.clone()),
                    DirectiveKey::EnvFromConfigMap => {
                        partial.env_from_configmap = Some(value.clone());
                    }
                    DirectiveKey::EnvFromSecret => partial.env_from_secret = Some(value.clone()),
                }
            }
        }

        Ok(Self {
            difficulty: partial.difficulty.unwrap_or(defaults.difficulty),
            serve_robots_txt: partial.serve_robots_txt.unwrap_or(defaults.serve_robots_txt),
            og_passthrough: partial.og_passthrough.unwrap_or(defaults.og_passthrough),
            metrics_port: partial.metrics_port.unwrap_or(defaults.metrics_port),
            ingress_class: partial.ingress_class,
            env_from_configmap: partial.env_from_configmap,
            env_from_secret: partial.env_from_secret,
        })
    }

    /// Worker environment implied by these directives
    pub fn environment(&self) -> BTreeMap<String, String> {
        directive_environment(
            self.difficulty,
            self.serve_robots_txt,
            self.og_passthrough,
            self.metrics_port,
        )
    }
}

fn directive_environment(
    difficulty: u32,
    serve_robots_txt: bool,
    og_passthrough: bool,
    metrics_port: u16,
) -> BTreeMap<String, String> {
    BTreeMap::from([
        (ENV_DIFFICULTY.to_string(), difficulty.to_string()),
        (ENV_METRICS_BIND.to_string(), format!(":{metrics_port}")),
        (ENV_OG_PASSTHROUGH.to_string(), og_passthrough.to_string()),
        (ENV_SERVE_ROBOTS_TXT.to_string(), serve_robots_txt.to_string()),
    ])
}

/// Parse a boolean
///
/// Accepts `1`, `t`, `T`, `TRUE`, `true`, `True` and `0`, `f`, `F`, `FALSE`,
/// `false`, `False`; anything else is `None`.
pub fn parse_bool(value: &str) -> Option<bool> {
    match value {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

fn parse_directive_bool(key: DirectiveKey, value: &str) -> Result<bool> {
    parse_bool(value).ok_or_else(|| Error::directive(key.annotation(), value, "bool"))
}

fn parse_int(key: DirectiveKey, value: &str) -> Result<u32> {
    value
        .parse()
        .map_err(|_| Error::directive(key.annotation(), value, "int"))
}

fn parse_port(key: DirectiveKey, value: &str) -> Result<u16> {
    match value.parse::<u16>() {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(Error::directive(key.annotation(), value, "port (1-65535)")),
    }
}
