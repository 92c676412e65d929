//! Desired state of the generated Deployment, Service and Ingress
//!
//! Everything here is a pure function of the source Ingress, its directives,
//! the resolved upstream and the process configuration. Building twice from
//! the same inputs yields identical objects.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMapEnvSource, Container, ContainerPort, EnvFromSource, EnvVar,
    HTTPGetAction, PodSpec, PodTemplateSpec, Probe, SeccompProfile, SecretEnvSource,
    SecurityContext, Service, ServicePort, ServiceSpec,
};
use k8s_openapi::api::networking::v1::{
    Ingress, IngressBackend, IngressServiceBackend, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::config::ControllerConfig;
use crate::directives::{
    DirectiveConfig, ENV_DIFFICULTY, ENV_METRICS_BIND, ENV_OG_PASSTHROUGH, ENV_SERVE_ROBOTS_TXT,
};
use crate::Result;
use ingress_anubis_common::labels::generated_name;
use ingress_anubis_common::OwnerKey;

/// Port the worker serves proxied traffic on
pub const HTTP_PORT: i32 = 8080;
/// Name of the worker's traffic port
pub const HTTP_PORT_NAME: &str = "http";
/// Name of the worker's metrics port
pub const METRICS_PORT_NAME: &str = "http-metrics";
/// Name of the worker container
pub const CONTAINER_NAME: &str = "main";
/// Path probed for readiness
pub const READINESS_PATH: &str = "/metrics";

const WORKER_UID: i64 = 1000;

/// Worker environment, one layer per source, lowest precedence first
///
/// Later layers win on key collisions. `engine` always comes last so the
/// listen address, target and directive values can't be overridden by static
/// configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EnvLayers {
    /// Static environment from process configuration
    pub static_env: BTreeMap<String, String>,
    /// Environment implied by the process-wide directive defaults
    pub process_directives: BTreeMap<String, String>,
    /// Environment implied by this Ingress's directives
    pub resource_directives: BTreeMap<String, String>,
    /// Values the engine always sets
    pub engine: BTreeMap<String, String>,
}

impl EnvLayers {
    /// Assemble the layers for one worker
    pub fn new(config: &ControllerConfig, directives: &DirectiveConfig, target: &str) -> Self {
        Self {
            static_env: config.environment.clone(),
            process_directives: config.directive_defaults.environment(),
            resource_directives: directives.environment(),
            engine: engine_overrides(directives, target),
        }
    }

    /// Merge the layers into the final environment
    pub fn merge(&self) -> BTreeMap<String, String> {
        let mut merged = BTreeMap::new();
        for layer in [
            &self.static_env,
            &self.process_directives,
            &self.resource_directives,
            &self.engine,
        ] {
            merged.extend(layer.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        merged
    }

    /// Merged environment as container env vars, sorted by name
    pub fn to_env_vars(&self) -> Vec<EnvVar> {
        self.merge()
            .into_iter()
            .map(|(name, value)| EnvVar {
                name,
                value: Some(value),
                ..Default::default()
            })
            .collect()
    }
}

fn engine_overrides(directives: &DirectiveConfig, target: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("BIND".to_string(), format!(":{HTTP_PORT}")),
        (ENV_DIFFICULTY.to_string(), directives.difficulty.to_string()),
        (
            ENV_METRICS_BIND.to_string(),
            format!(":{}", directives.metrics_port),
        ),
        (
            ENV_SERVE_ROBOTS_TXT.to_string(),
            directives.serve_robots_txt.to_string(),
        ),
        ("TARGET".to_string(), target.to_string()),
        (
            ENV_OG_PASSTHROUGH.to_string(),
            directives.og_passthrough.to_string(),
        ),
    ])
}

/// The three generated resources for one source Ingress
#[derive(Clone, Debug, PartialEq)]
pub struct DesiredTriad {
    /// Worker Deployment
    pub deployment: Deployment,
    /// Worker Service
    pub service: Service,
    /// Rewritten Ingress pointing at the worker Service
    pub ingress: Ingress,
}

impl DesiredTriad {
    /// Build the desired triad for `source`
    ///
    /// Fails only when the source's coordinates can't be encoded as an owner label.
    pub fn build(
        source: &Ingress,
        directives: &DirectiveConfig,
        target: &str,
        config: &ControllerConfig,
    ) -> Result<Self> {
        let owner = OwnerKey::new(source.namespace().unwrap_or_default(), source.name_any());
        let labels = owner.labels()?;
        let name = generated_name(&owner.name);

        Ok(Self {
            deployment: build_deployment(&name, &labels, directives, target, config),
            service: build_service(&name, &labels, config),
            ingress: build_ingress(&name, &labels, source, directives, config),
        })
    }
}

fn generated_meta(name: &str, labels: &BTreeMap<String, String>, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels.clone()),
        ..Default::default()
    }
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    (!items.is_empty()).then_some(items)
}

/// `envFrom` sources: process ConfigMap, process Secret, then the per-Ingress ones
fn env_from(config: &ControllerConfig, directives: &DirectiveConfig) -> Vec<EnvFromSource> {
    let configmap = |name: &String| EnvFromSource {
        config_map_ref: Some(ConfigMapEnvSource {
            name: name.clone(),
            ..Default::default()
        }),
        ..Default::default()
    };
    let secret = |name: &String| EnvFromSource {
        secret_ref: Some(SecretEnvSource {
            name: name.clone(),
            ..Default::default()
        }),
        ..Default::default()
    };

    config
        .env_from_configmap
        .iter()
        .map(configmap)
        .chain(config.env_from_secret.iter().map(secret))
        .chain(directives.env_from_configmap.iter().map(configmap))
        .chain(directives.env_from_secret.iter().map(secret))
        .collect()
}

fn security_context() -> SecurityContext {
    SecurityContext {
        allow_privilege_escalation: Some(false),
        run_as_user: Some(WORKER_UID),
        run_as_group: Some(WORKER_UID),
        run_as_non_root: Some(true),
        read_only_root_filesystem: Some(true),
        capabilities: Some(Capabilities {
            drop: Some(vec!["ALL".to_string()]),
            ..Default::default()
        }),
        seccomp_profile: Some(SeccompProfile {
            type_: "RuntimeDefault".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Worker Deployment: one replica, recreated on change, hardened container
pub fn build_deployment(
    name: &str,
    labels: &BTreeMap<String, String>,
    directives: &DirectiveConfig,
    target: &str,
    config: &ControllerConfig,
) -> Deployment {
    let metrics_port = i32::from(directives.metrics_port);

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(config.image()),
        env: Some(EnvLayers::new(config, directives, target).to_env_vars()),
        env_from: non_empty(env_from(config, directives)),
        ports: Some(vec![
            ContainerPort {
                name: Some(HTTP_PORT_NAME.to_string()),
                container_port: HTTP_PORT,
                ..Default::default()
            },
            ContainerPort {
                name: Some(METRICS_PORT_NAME.to_string()),
                container_port: metrics_port,
                ..Default::default()
            },
        ]),
        readiness_probe: Some(Probe {
            failure_threshold: Some(3),
            http_get: Some(HTTPGetAction {
                path: Some(READINESS_PATH.to_string()),
                port: IntOrString::Int(metrics_port),
                ..Default::default()
            }),
            ..Default::default()
        }),
        security_context: Some(security_context()),
        volume_mounts: non_empty(config.volume_mounts.clone()),
        ..Default::default()
    };

    Deployment {
        metadata: generated_meta(name, labels, &config.namespace),
        spec: Some(DeploymentSpec {
            replicas: Some(1),
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels.clone()),
                    annotations: (!config.pod_annotations.is_empty())
                        .then(|| config.pod_annotations.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    volumes: non_empty(config.volumes.clone()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Worker Service exposing the traffic port inside the cluster
pub fn build_service(
    name: &str,
    labels: &BTreeMap<String, String>,
    config: &ControllerConfig,
) -> Service {
    Service {
        metadata: generated_meta(name, labels, &config.namespace),
        spec: Some(ServiceSpec {
            ports: Some(vec![ServicePort {
                name: Some(HTTP_PORT_NAME.to_string()),
                port: HTTP_PORT,
                protocol: Some("TCP".to_string()),
                target_port: Some(IntOrString::String(HTTP_PORT_NAME.to_string())),
                ..Default::default()
            }]),
            selector: Some(labels.clone()),
            type_: Some("ClusterIP".to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Copy of the source Ingress routed through the worker Service
///
/// Hosts, paths, TLS and annotations are kept; every service backend is
/// swapped for the worker. Rules without an HTTP section are copied as-is.
pub fn build_ingress(
    name: &str,
    labels: &BTreeMap<String, String>,
    source: &Ingress,
    directives: &DirectiveConfig,
    config: &ControllerConfig,
) -> Ingress {
    let worker = IngressBackend {
        service: Some(IngressServiceBackend {
            name: name.to_string(),
            port: Some(ServiceBackendPort {
                name: Some(HTTP_PORT_NAME.to_string()),
                number: None,
            }),
        }),
        resource: None,
    };

    let mut spec = source.spec.clone().unwrap_or_default();
    spec.ingress_class_name = Some(
        directives
            .ingress_class
            .clone()
            .unwrap_or_else(|| config.wrapped_ingress_class.clone()),
    );
    if let Some(default_backend) = spec.default_backend.as_mut() {
        *default_backend = worker.clone();
    }
    for rule in spec.rules.iter_mut().flatten() {
        let Some(http) = rule.http.as_mut() else {
            continue;
        };
        for path in http.paths.iter_mut() {
            path.backend = worker.clone();
        }
    }

    let mut metadata = generated_meta(name, labels, &config.namespace);
    metadata.annotations = source.metadata.annotations.clone();

    Ingress {
        metadata,
        spec: Some(spec),
        status: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directives::DirectiveDefaults;
    use k8s_openapi::api::core::v1::{Volume, VolumeMount};
    use k8s_openapi::api::networking::v1::{
        HTTPIngressPath, HTTPIngressRuleValue, IngressRule, IngressSpec,
    };
    use ingress_anubis_common::labels::{MANAGED_LABEL, OWNER_LABEL};

    const TARGET: &str = "http://backend.shop.svc.cluster.local:80";

    fn path(service: &str) -> HTTPIngressPath {
        HTTPIngressPath {
            path: Some("/".to_string()),
            path_type: "Prefix".to_string(),
            backend: IngressBackend {
                service: Some(IngressServiceBackend {
                    name: service.to_string(),
                    port: Some(ServiceBackendPort {
                        number: Some(80),
                        name: None,
                    }),
                }),
                resource: None,
            },
        }
    }

    fn source() -> Ingress {
        Ingress {
            metadata: ObjectMeta {
                name: Some("web".to_string()),
                namespace: Some("shop".to_string()),
                annotations: Some(BTreeMap::from([(
                    "cert-manager.io/cluster-issuer".to_string(),
                    "letsencrypt".to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                ingress_class_name: Some("anubis".to_string()),
                rules: Some(vec![
                    IngressRule {
                        host: Some("shop.example.com".to_string()),
                        http: Some(HTTPIngressRuleValue {
                            paths: vec![path("backend"), path("api")],
                        }),
                    },
                    IngressRule {
                        host: Some("bare.example.com".to_string()),
                        http: None,
                    },
                ]),
                ..Default::default()
            }),
            status: None,
        }
    }

    fn directives() -> DirectiveConfig {
        DirectiveConfig::from_ingress(None, &DirectiveDefaults::default()).expect("defaults")
    }

    fn build(config: &ControllerConfig, directives: &DirectiveConfig) -> DesiredTriad {
        DesiredTriad::build(&source(), directives, TARGET, config).expect("valid source")
    }

    fn container(triad: &DesiredTriad) -> &Container {
        &triad
            .deployment
            .spec
            .as_ref()
            .and_then(|s| s.template.spec.as_ref())
            .expect("pod spec")
            .containers[0]
    }

    fn env(triad: &DesiredTriad) -> BTreeMap<String, String> {
        container(triad)
            .env
            .iter()
            .flatten()
            .map(|e| (e.name.clone(), e.value.clone().unwrap_or_default()))
            .collect()
    }

    /// Story: building twice from the same inputs is a no-op for the store
    #[test]
    fn story_desired_state_is_deterministic() {
        let config = ControllerConfig {
            environment: BTreeMap::from([
                ("ZED".to_string(), "1".to_string()),
                ("ALPHA".to_string(), "2".to_string()),
            ]),
            ..Default::default()
        };
        let first = build(&config, &directives());
        let second = build(&config, &directives());
        assert_eq!(first, second);

        let names: Vec<_> = container(&first).env.iter().flatten().map(|e| &e.name).collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn generated_resources_share_name_namespace_and_labels() {
        let triad = build(&ControllerConfig::default(), &directives());
        for meta in [
            &triad.deployment.metadata,
            &triad.service.metadata,
            &triad.ingress.metadata,
        ] {
            assert_eq!(meta.name.as_deref(), Some("ia-web"));
            assert_eq!(meta.namespace.as_deref(), Some("ingress-anubis"));
            let labels = meta.labels.as_ref().expect("labels");
            assert_eq!(labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
            assert_eq!(labels.get(OWNER_LABEL).map(String::as_str), Some("shop--web"));
        }
    }

    #[test]
    fn deployment_is_single_replica_recreate() {
        let triad = build(&ControllerConfig::default(), &directives());
        let spec = triad.deployment.spec.as_ref().expect("spec");
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(
            spec.strategy.as_ref().and_then(|s| s.type_.as_deref()),
            Some("Recreate")
        );
        assert_eq!(
            spec.selector.match_labels,
            triad.deployment.metadata.labels
        );
    }

    #[test]
    fn container_is_hardened_and_probed_on_metrics_port() {
        let mut d = directives();
        d.metrics_port = 9300;
        let triad = build(&ControllerConfig::default(), &d);
        let c = container(&triad);

        assert_eq!(c.name, "main");
        assert_eq!(c.image.as_deref(), Some("ghcr.io/techarohq/anubis:v1.14.2"));
        let ports: Vec<_> = c
            .ports
            .iter()
            .flatten()
            .map(|p| (p.name.as_deref(), p.container_port))
            .collect();
        assert_eq!(ports, vec![(Some("http"), 8080), (Some("http-metrics"), 9300)]);

        let probe = c.readiness_probe.as_ref().expect("probe");
        assert_eq!(probe.failure_threshold, Some(3));
        let get = probe.http_get.as_ref().expect("http get");
        assert_eq!(get.path.as_deref(), Some("/metrics"));
        assert_eq!(get.port, IntOrString::Int(9300));

        let sc = c.security_context.as_ref().expect("security context");
        assert_eq!(sc.allow_privilege_escalation, Some(false));
        assert_eq!(sc.run_as_non_root, Some(true));
        assert_eq!(sc.read_only_root_filesystem, Some(true));
        assert_eq!(sc.run_as_user, Some(1000));
        assert_eq!(
            sc.capabilities.as_ref().and_then(|c| c.drop.clone()),
            Some(vec!["ALL".to_string()])
        );
        assert_eq!(
            sc.seccomp_profile.as_ref().map(|p| p.type_.as_str()),
            Some("RuntimeDefault")
        );
    }

    /// Story: engine values win over static configuration
    #[test]
    fn story_engine_overrides_static_environment() {
        let config = ControllerConfig {
            environment: BTreeMap::from([
                ("DIFFICULTY".to_string(), "99".to_string()),
                ("TARGET".to_string(), "http://evil".to_string()),
                ("POLICY_FNAME".to_string(), "/data/policy.yaml".to_string()),
            ]),
            ..Default::default()
        };
        let mut d = directives();
        d.difficulty = 7;
        d.serve_robots_txt = false;
        let env = env(&build(&config, &d));

        assert_eq!(env["DIFFICULTY"], "7");
        assert_eq!(env["SERVE_ROBOTS_TXT"], "false");
        assert_eq!(env["TARGET"], TARGET);
        assert_eq!(env["BIND"], ":8080");
        assert_eq!(env["METRICS_BIND"], ":9090");
        assert_eq!(env["OG_PASSTHROUGH"], "true");
        assert_eq!(env["POLICY_FNAME"], "/data/policy.yaml");
    }

    #[test]
    fn env_layers_merge_in_precedence_order() {
        let layers = EnvLayers {
            static_env: BTreeMap::from([
                ("A".to_string(), "static".to_string()),
                ("B".to_string(), "static".to_string()),
            ]),
            process_directives: BTreeMap::from([("B".to_string(), "process".to_string())]),
            resource_directives: BTreeMap::from([("C".to_string(), "resource".to_string())]),
            engine: BTreeMap::from([("C".to_string(), "engine".to_string())]),
        };
        let merged = layers.merge();
        assert_eq!(merged["A"], "static");
        assert_eq!(merged["B"], "process");
        assert_eq!(merged["C"], "engine");
    }

    #[test]
    fn env_from_orders_process_sources_first() {
        let config = ControllerConfig {
            env_from_configmap: Some("global-cm".to_string()),
            env_from_secret: Some("global-sec".to_string()),
            ..Default::default()
        };
        let mut d = directives();
        d.env_from_configmap = Some("local-cm".to_string());
        d.env_from_secret = Some("local-sec".to_string());
        let triad = build(&config, &d);

        let sources: Vec<String> = container(&triad)
            .env_from
            .iter()
            .flatten()
            .map(|s| match (&s.config_map_ref, &s.secret_ref) {
                (Some(cm), _) => format!("cm:{}", cm.name),
                (_, Some(sec)) => format!("sec:{}", sec.name),
                _ => String::new(),
            })
            .collect();
        assert_eq!(
            sources,
            vec!["cm:global-cm", "sec:global-sec", "cm:local-cm", "sec:local-sec"]
        );
    }

    #[test]
    fn optional_pod_settings_are_omitted_when_empty() {
        let triad = build(&ControllerConfig::default(), &directives());
        let template = &triad.deployment.spec.as_ref().expect("spec").template;
        assert!(container(&triad).env_from.is_none());
        assert!(container(&triad).volume_mounts.is_none());
        assert!(template.spec.as_ref().and_then(|s| s.volumes.as_ref()).is_none());
        assert!(template.metadata.as_ref().and_then(|m| m.annotations.as_ref()).is_none());
    }

    #[test]
    fn volumes_and_pod_annotations_come_from_config() {
        let config = ControllerConfig {
            volumes: vec![Volume {
                name: "policy".to_string(),
                ..Default::default()
            }],
            volume_mounts: vec![VolumeMount {
                name: "policy".to_string(),
                mount_path: "/data".to_string(),
                ..Default::default()
            }],
            pod_annotations: BTreeMap::from([("prometheus.io/scrape".to_string(), "true".to_string())]),
            ..Default::default()
        };
        let triad = build(&config, &directives());
        let template = &triad.deployment.spec.as_ref().expect("spec").template;
        assert_eq!(
            template.spec.as_ref().and_then(|s| s.volumes.as_ref()).map(Vec::len),
            Some(1)
        );
        assert_eq!(container(&triad).volume_mounts.as_ref().map(Vec::len), Some(1));
        assert_eq!(
            template
                .metadata
                .as_ref()
                .and_then(|m| m.annotations.as_ref())
                .and_then(|a| a.get("prometheus.io/scrape"))
                .map(String::as_str),
            Some("true")
        );
    }

    #[test]
    fn service_targets_worker_http_port() {
        let triad = build(&ControllerConfig::default(), &directives());
        let spec = triad.service.spec.as_ref().expect("spec");
        assert_eq!(spec.type_.as_deref(), Some("ClusterIP"));
        assert_eq!(spec.selector, triad.service.metadata.labels);
        let port = &spec.ports.as_ref().expect("ports")[0];
        assert_eq!(port.name.as_deref(), Some("http"));
        assert_eq!(port.port, 8080);
        assert_eq!(port.protocol.as_deref(), Some("TCP"));
        assert_eq!(port.target_port, Some(IntOrString::String("http".to_string())));
    }

    /// Story: every route of the rewritten Ingress goes through the worker
    #[test]
    fn story_rewritten_ingress_routes_through_worker() {
        let triad = build(&ControllerConfig::default(), &directives());
        let spec = triad.ingress.spec.as_ref().expect("spec");
        assert_eq!(spec.ingress_class_name.as_deref(), Some("nginx"));

        let rules = spec.rules.as_ref().expect("rules");
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].host.as_deref(), Some("shop.example.com"));
        for p in &rules[0].http.as_ref().expect("http").paths {
            let svc = p.backend.service.as_ref().expect("service backend");
            assert_eq!(svc.name, "ia-web");
            assert_eq!(
                svc.port.as_ref().and_then(|p| p.name.as_deref()),
                Some("http")
            );
            assert_eq!(p.path_type, "Prefix");
        }
        assert!(rules[1].http.is_none());

        assert_eq!(triad.ingress.metadata.annotations, source().metadata.annotations);
    }

    #[test]
    fn class_override_and_default_backend_are_honored() {
        let mut src = source();
        if let Some(spec) = src.spec.as_mut() {
            spec.default_backend = Some(path("fallback").backend);
        }
        let mut d = directives();
        d.ingress_class = Some("traefik".to_string());

        let triad =
            DesiredTriad::build(&src, &d, TARGET, &ControllerConfig::default()).expect("valid");
        let spec = triad.ingress.spec.as_ref().expect("spec");
        assert_eq!(spec.ingress_class_name.as_deref(), Some("traefik"));
        assert_eq!(
            spec.default_backend
                .as_ref()
                .and_then(|b| b.service.as_ref())
                .map(|s| s.name.as_str()),
            Some("ia-web")
        );
    }

    #[test]
    fn unencodable_owner_is_rejected() {
        let mut src = source();
        src.metadata.namespace = Some("team--a".to_string());
        let err = DesiredTriad::build(&src, &directives(), TARGET, &ControllerConfig::default())
            .expect_err("separator in namespace");
        assert!(!err.is_retryable());
    }
}
