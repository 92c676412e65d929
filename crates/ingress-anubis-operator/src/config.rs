//! Process configuration, loaded from flags or the environment

use std::collections::BTreeMap;

use clap::{ArgAction, Parser};
use k8s_openapi::api::core::v1::{Volume, VolumeMount};
use serde::de::DeserializeOwned;
use tracing::warn;

use ingress_anubis_common::{Error, Result, DEFAULT_NAMESPACE};
use ingress_anubis_controller::config::{
    DEFAULT_ANUBIS_IMAGE, DEFAULT_ANUBIS_VERSION, DEFAULT_INGRESS_CLASS, DEFAULT_WRAPPED_INGRESS_CLASS,
};
use ingress_anubis_controller::directives::parse_bool;
use ingress_anubis_controller::{ControllerConfig, DirectiveDefaults};

/// ingress-anubis - fronts Ingress backends with an Anubis proof-of-work worker
#[derive(Parser, Debug, Clone)]
#[command(name = "ingress-anubis", version, about, long_about = None)]
pub struct OperatorConfig {
    /// Namespace for generated resources and the leader lease
    #[arg(long, env = "NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Worker image tag
    #[arg(long, env = "ANUBIS_VERSION", default_value = DEFAULT_ANUBIS_VERSION)]
    pub anubis_version: String,

    /// Worker image repository
    #[arg(long, env = "ANUBIS_IMAGE", default_value = DEFAULT_ANUBIS_IMAGE)]
    pub anubis_image: String,

    /// Class given to rewritten Ingresses unless overridden per Ingress
    #[arg(long, env = "WRAPPED_INGRESS_CLASS_NAME", default_value = DEFAULT_WRAPPED_INGRESS_CLASS)]
    pub wrapped_ingress_class_name: String,

    /// Ingress class claimed by this controller
    #[arg(long, env = "INGRESS_CLASS_NAME", default_value = DEFAULT_INGRESS_CLASS)]
    pub ingress_class_name: String,

    /// Run controllers only while holding the leader lease
    #[arg(long, env = "LEADER_ELECTION", default_value = "true", value_parser = bool_value, action = ArgAction::Set)]
    pub leader_election: bool,

    /// Leader election identity, defaults to the hostname
    #[arg(long, env = "POD_NAME")]
    pub pod_name: Option<String>,

    /// Static worker environment as `KEY:VALUE,KEY:VALUE`
    #[arg(long, env = "ENVIRONMENT_VARIABLES", default_value = "")]
    pub environment_variables: String,

    /// ConfigMap every worker loads its environment from
    #[arg(long, env = "ENV_FROM_CM")]
    pub env_from_cm: Option<String>,

    /// Secret every worker loads its environment from
    #[arg(long, env = "ENV_FROM_SEC")]
    pub env_from_sec: Option<String>,

    /// Worker pod annotations as `KEY:VALUE,KEY:VALUE`
    #[arg(long, env = "ANNOTATIONS", default_value = "")]
    pub annotations: String,

    /// JSON array of volumes added to every worker pod
    #[arg(long, env = "VOLUMES", default_value = "")]
    pub volumes: String,

    /// JSON array of volume mounts added to every worker container
    #[arg(long, env = "VOLUME_MOUNTS", default_value = "")]
    pub volume_mounts: String,

    /// Proof-of-work difficulty unless overridden per Ingress
    #[arg(long, env = "DEFAULT_DIFFICULTY", default_value_t = 4)]
    pub default_difficulty: u32,

    /// Serve a restrictive robots.txt unless overridden per Ingress
    #[arg(long, env = "DEFAULT_SERVE_ROBOTS_TXT", default_value = "true", value_parser = bool_value, action = ArgAction::Set)]
    pub default_serve_robots_txt: bool,

    /// Pass Open Graph tags through unless overridden per Ingress
    #[arg(long, env = "DEFAULT_OG_PASSTHROUGH", default_value = "true", value_parser = bool_value, action = ArgAction::Set)]
    pub default_og_passthrough: bool,

    /// Worker metrics port unless overridden per Ingress
    #[arg(long, env = "DEFAULT_METRICS_PORT", default_value_t = 9090, value_parser = clap::value_parser!(u16).range(1..))]
    pub default_metrics_port: u16,

    /// OTLP collector endpoint for traces and metrics
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,
}

fn bool_value(value: &str) -> std::result::Result<bool, String> {
    parse_bool(value).ok_or_else(|| format!("invalid boolean {value:?}"))
}

/// Parse `KEY:VALUE,KEY:VALUE`; the value may itself contain colons
pub fn parse_key_values(field: &str, raw: &str) -> Result<BTreeMap<String, String>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            entry
                .split_once(':')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .ok_or_else(|| Error::config(field, format!("missing ':' in entry {entry:?}")))
        })
        .collect()
}

/// Decode a JSON array, falling back to empty on malformed input
fn lenient_json_list<T: DeserializeOwned>(field: &str, raw: &str) -> Vec<T> {
    if raw.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str(raw) {
        Ok(items) => items,
        Err(error) => {
            warn!(field, %error, "ignoring malformed JSON");
            Vec::new()
        }
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

impl OperatorConfig {
    /// Identity used for the leader lease
    pub fn identity(&self) -> String {
        non_empty(&self.pod_name)
            .or_else(|| std::env::var("HOSTNAME").ok().filter(|h| !h.is_empty()))
            .unwrap_or_else(|| format!("ingress-anubis-{}", std::process::id()))
    }

    /// Build the reconciler configuration
    pub fn into_controller_config(self) -> Result<ControllerConfig> {
        let environment = parse_key_values("ENVIRONMENT_VARIABLES", &self.environment_variables)?;
        let pod_annotations = parse_key_values("ANNOTATIONS", &self.annotations)?;
        let volumes: Vec<Volume> = lenient_json_list("VOLUMES", &self.volumes);
        let volume_mounts: Vec<VolumeMount> =
            lenient_json_list("VOLUME_MOUNTS", &self.volume_mounts);

        Ok(ControllerConfig {
            env_from_configmap: non_empty(&self.env_from_cm),
            env_from_secret: non_empty(&self.env_from_sec),
            namespace: self.namespace,
            anubis_image: self.anubis_image,
            anubis_version: self.anubis_version,
            wrapped_ingress_class: self.wrapped_ingress_class_name,
            ingress_class: self.ingress_class_name,
            environment,
            pod_annotations,
            volumes,
            volume_mounts,
            directive_defaults: DirectiveDefaults {
                difficulty: self.default_difficulty,
                serve_robots_txt: self.default_serve_robots_txt,
                og_passthrough: self.default_og_passthrough,
                metrics_port: self.default_metrics_port,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> OperatorConfig {
        let argv = std::iter::once("ingress-anubis").chain(args.iter().copied());
        OperatorConfig::try_parse_from(argv).expect("valid flags")
    }

    #[test]
    fn key_values_split_on_first_colon() {
        let parsed = parse_key_values("ANNOTATIONS", "a:1, b:http://x:8080 ,").expect("valid");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed["a"], "1");
        assert_eq!(parsed["b"], "http://x:8080");
        assert!(parse_key_values("ANNOTATIONS", "").expect("empty").is_empty());
    }

    /// Story: a malformed static env entry stops startup
    #[test]
    fn story_entry_without_colon_is_a_config_error() {
        let err = parse_key_values("ENVIRONMENT_VARIABLES", "FOO").expect_err("no colon");
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("ENVIRONMENT_VARIABLES"));
    }

    /// Story: a broken volume list degrades to no volumes instead of crashing
    #[test]
    fn story_malformed_volumes_decode_to_empty() {
        let volumes: Vec<Volume> = lenient_json_list("VOLUMES", "[{not json");
        assert!(volumes.is_empty());

        let volumes: Vec<Volume> =
            lenient_json_list("VOLUMES", r#"[{"name":"policy","configMap":{"name":"anubis"}}]"#);
        assert_eq!(volumes.len(), 1);
        assert_eq!(volumes[0].name, "policy");
    }

    #[test]
    fn flags_map_onto_controller_config() {
        let config = parse(&[
            "--namespace",
            "edge",
            "--ingress-class-name",
            "pow",
            "--environment-variables",
            "POLICY_FNAME:/data/policy.yaml",
            "--env-from-cm",
            "shared",
            "--env-from-sec",
            "",
            "--default-difficulty",
            "6",
            "--default-serve-robots-txt",
            "f",
            "--volume-mounts",
            r#"[{"name":"policy","mountPath":"/data"}]"#,
        ])
        .into_controller_config()
        .expect("valid config");

        assert_eq!(config.namespace, "edge");
        assert_eq!(config.ingress_class, "pow");
        assert_eq!(config.wrapped_ingress_class, "nginx");
        assert_eq!(config.image(), "ghcr.io/techarohq/anubis:v1.14.2");
        assert_eq!(config.environment["POLICY_FNAME"], "/data/policy.yaml");
        assert_eq!(config.env_from_configmap.as_deref(), Some("shared"));
        assert!(config.env_from_secret.is_none());
        assert_eq!(config.volume_mounts[0].mount_path, "/data");
        assert_eq!(config.directive_defaults.difficulty, 6);
        assert!(!config.directive_defaults.serve_robots_txt);
        assert!(config.directive_defaults.og_passthrough);
        assert_eq!(config.directive_defaults.metrics_port, 9090);
    }

    #[test]
    fn leader_election_can_be_disabled() {
        assert!(!parse(&["--leader-election", "false"]).leader_election);
        assert!(parse(&["--leader-election", "1"]).leader_election);
    }

    #[test]
    fn metrics_port_zero_is_rejected() {
        let argv = ["ingress-anubis", "--default-metrics-port", "0"];
        assert!(OperatorConfig::try_parse_from(argv).is_err());
    }

    #[test]
    fn explicit_pod_name_is_the_identity() {
        assert_eq!(parse(&["--pod-name", "ia-0"]).identity(), "ia-0");
    }
}
