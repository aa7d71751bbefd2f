use std::collections::BTreeMap;

use regex::Regex;
use tracing::error;

use crate::config::{Config, EXCLUDE_CONFIGMAPS_ANNOTATION, EXCLUDE_SECRETS_ANNOTATION, IGNORE_ANNOTATION};
use crate::types::{CoKind, ConfigObject, Edge};
use crate::workload::Workload;

/// Outcome of evaluating one (object, workload) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Skip,
    /// `auto` distinguishes annotation-driven auto reloads from explicit
    /// name-list matches; notifications carry it through.
    Reload { auto: bool },
}

impl Decision {
    pub fn reloads(&self) -> bool {
        matches!(self, Decision::Reload { .. })
    }
}

fn is_truthy(value: Option<&String>) -> bool {
    value.map(|v| v.trim() == "true").unwrap_or(false)
}

fn comma_list_contains(value: Option<&String>, name: &str) -> bool {
    value
        .map(|v| v.split(',').any(|entry| entry.trim() == name))
        .unwrap_or(false)
}

/// Whether `name` matches one of the comma-separated entries, each an exact
/// name or an anchored regex. Malformed patterns are logged and skipped.
fn reload_list_matches(value: &str, name: &str) -> bool {
    value.split(',').map(str::trim).any(|pattern| {
        if pattern.is_empty() {
            return false;
        }
        if pattern == name {
            return true;
        }
        match Regex::new(&format!("^(?:{pattern})$")) {
            Ok(re) => re.is_match(name),
            Err(err) => {
                error!(%pattern, %err, "skipping malformed reload pattern");
                false
            }
        }
    })
}

/// The annotation cascade deciding whether a workload reloads for a changed
/// configuration object.
pub fn should_reload(
    co: &ConfigObject,
    workload: &dyn Workload,
    _edge: Edge,
    config: &Config,
) -> Decision {
    if co.is_non_reloadable_secret() {
        return Decision::Skip;
    }
    if !config.kind_enabled(workload.kind()) {
        return Decision::Skip;
    }

    let top = workload.annotations();
    if is_truthy(top.get(IGNORE_ANNOTATION)) {
        return Decision::Skip;
    }

    let exclude_key = match co.kind {
        CoKind::ConfigMap => EXCLUDE_CONFIGMAPS_ANNOTATION,
        CoKind::Secret => EXCLUDE_SECRETS_ANNOTATION,
    };
    if comma_list_contains(top.get(exclude_key), &co.name) {
        return Decision::Skip;
    }

    let keys = &config.annotations;
    let typed_auto_key = match co.kind {
        CoKind::ConfigMap => &keys.configmap_auto,
        CoKind::Secret => &keys.secret_auto,
    };
    let reload_key = match co.kind {
        CoKind::ConfigMap => &keys.configmap_reload,
        CoKind::Secret => &keys.secret_reload,
    };

    // Annotations may live on the workload or on its pod template; the
    // template is consulted only when the workload level carries none of
    // the interesting keys.
    let annotations = select_annotation_source(
        top,
        workload.pod_annotations(),
        &[&keys.auto, typed_auto_key, reload_key, &keys.search],
    );

    let auto = annotations.get(&keys.auto);
    let typed_auto = annotations.get(typed_auto_key);
    if is_truthy(auto) || is_truthy(typed_auto) {
        return Decision::Reload { auto: true };
    }
    if auto.is_none() && typed_auto.is_none() && config.auto_reload_all {
        return Decision::Reload { auto: true };
    }

    if let Some(list) = annotations.get(reload_key) {
        if reload_list_matches(list, &co.name) {
            return Decision::Reload { auto: false };
        }
    }

    if is_truthy(annotations.get(&keys.search))
        && is_truthy(co.annotations.get(&keys.search_match))
    {
        return Decision::Reload { auto: true };
    }

    Decision::Skip
}

fn select_annotation_source<'a>(
    top: &'a BTreeMap<String, String>,
    pod: &'a BTreeMap<String, String>,
    keys: &[&String],
) -> &'a BTreeMap<String, String> {
    if keys.iter().any(|k| top.contains_key(*k)) {
        top
    } else {
        pod
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
    use k8s_openapi::api::core::v1::PodTemplateSpec;
    use kube::api::ObjectMeta;

    use super::*;
    use crate::config::{Options, PodEnv};
    use crate::types::WorkloadKind;
    use crate::workload::DeploymentWorkload;
    use clap::Parser;

    fn config(args: &[&str]) -> Config {
        let mut argv = vec!["reloader"];
        argv.extend(args);
        Options::parse_from(argv)
            .into_config(&PodEnv::default())
            .unwrap()
    }

    fn configmap(name: &str) -> ConfigObject {
        ConfigObject {
            kind: CoKind::ConfigMap,
            name: name.to_string(),
            namespace: "default".to_string(),
            annotations: BTreeMap::new(),
            labels: BTreeMap::new(),
            secret_type: None,
            content: BTreeMap::new(),
        }
    }

    fn deployment_with(annotations: &[(&str, &str)]) -> DeploymentWorkload {
        DeploymentWorkload(Deployment {
            metadata: ObjectMeta {
                name: Some("app".to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(DeploymentSpec::default()),
            ..Default::default()
        })
    }

    fn deployment_with_pod_annotations(annotations: &[(&str, &str)]) -> DeploymentWorkload {
        DeploymentWorkload(Deployment {
            metadata: ObjectMeta {
                name: Some("app".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        annotations: Some(
                            annotations
                                .iter()
                                .map(|(k, v)| (k.to_string(), v.to_string()))
                                .collect(),
                        ),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    #[test]
    fn explicit_list_matches_by_name() {
        let config = config(&[]);
        let workload = deployment_with(&[("configmap.reloader.stakater.com/reload", "foo,bar")]);
        assert_eq!(
            should_reload(&configmap("foo"), &workload, Edge::EnvFrom, &config),
            Decision::Reload { auto: false }
        );
        assert_eq!(
            should_reload(&configmap("baz"), &workload, Edge::EnvFrom, &config),
            Decision::Skip
        );
    }

    #[test]
    fn explicit_list_matches_anchored_regex() {
        let config = config(&[]);
        let workload = deployment_with(&[("configmap.reloader.stakater.com/reload", "app-.*")]);
        assert!(should_reload(&configmap("app-config"), &workload, Edge::EnvFrom, &config).reloads());
        // Anchored: a pattern never matches a mere substring.
        assert_eq!(
            should_reload(&configmap("my-app-config-v2"), &workload, Edge::EnvFrom, &config),
            Decision::Skip
        );
    }

    #[test]
    fn auto_annotation_reloads() {
        let config = config(&[]);
        let workload = deployment_with(&[("reloader.stakater.com/auto", "true")]);
        assert_eq!(
            should_reload(&configmap("anything"), &workload, Edge::Volume, &config),
            Decision::Reload { auto: true }
        );
    }

    #[test]
    fn typed_auto_annotation_is_kind_specific() {
        let config = config(&[]);
        let workload = deployment_with(&[("secret.reloader.stakater.com/auto", "true")]);
        assert_eq!(
            should_reload(&configmap("cfg"), &workload, Edge::Volume, &config),
            Decision::Skip
        );
        let secret = ConfigObject {
            kind: CoKind::Secret,
            ..configmap("creds")
        };
        assert!(should_reload(&secret, &workload, Edge::Volume, &config).reloads());
    }

    #[test]
    fn auto_reload_all_applies_when_auto_is_unset() {
        let config = config(&["--auto-reload-all"]);
        let workload = deployment_with(&[]);
        assert_eq!(
            should_reload(&configmap("cfg"), &workload, Edge::EnvFrom, &config),
            Decision::Reload { auto: true }
        );
        // An explicit auto=false opts the workload out.
        let opted_out = deployment_with(&[("reloader.stakater.com/auto", "false")]);
        assert_eq!(
            should_reload(&configmap("cfg"), &opted_out, Edge::EnvFrom, &config),
            Decision::Skip
        );
    }

    #[test]
    fn pod_template_annotations_are_a_fallback() {
        let config = config(&[]);
        let workload =
            deployment_with_pod_annotations(&[("reloader.stakater.com/auto", "true")]);
        assert!(should_reload(&configmap("cfg"), &workload, Edge::EnvFrom, &config).reloads());

        // Present-but-false on the workload level wins over the template.
        let both = DeploymentWorkload(Deployment {
            metadata: ObjectMeta {
                name: Some("app".to_string()),
                annotations: Some(BTreeMap::from([(
                    "reloader.stakater.com/auto".to_string(),
                    "false".to_string(),
                )])),
                ..Default::default()
            },
            spec: deployment_with_pod_annotations(&[("reloader.stakater.com/auto", "true")])
                .0
                .spec,
            ..Default::default()
        });
        assert_eq!(
            should_reload(&configmap("cfg"), &both, Edge::EnvFrom, &config),
            Decision::Skip
        );
    }

    #[test]
    fn ignore_annotation_always_wins() {
        let config = config(&["--auto-reload-all"]);
        let workload = deployment_with(&[
            ("reloader.stakater.com/ignore", "true"),
            ("reloader.stakater.com/auto", "true"),
        ]);
        assert_eq!(
            should_reload(&configmap("cfg"), &workload, Edge::EnvFrom, &config),
            Decision::Skip
        );
    }

    #[test]
    fn exclude_list_is_kind_specific() {
        let config = config(&[]);
        let workload = deployment_with(&[
            ("reloader.stakater.com/auto", "true"),
            ("configmaps.exclude.reloader.stakater.com/reload", "noisy-config"),
        ]);
        assert_eq!(
            should_reload(&configmap("noisy-config"), &workload, Edge::EnvFrom, &config),
            Decision::Skip
        );
        assert!(should_reload(&configmap("other"), &workload, Edge::EnvFrom, &config).reloads());
        // The ConfigMap exclude list does not apply to Secrets of that name.
        let secret = ConfigObject {
            kind: CoKind::Secret,
            ..configmap("noisy-config")
        };
        assert!(should_reload(&secret, &workload, Edge::EnvFrom, &config).reloads());
    }

    #[test]
    fn search_requires_match_on_the_object() {
        let config = config(&[]);
        let workload = deployment_with(&[("reloader.stakater.com/search", "true")]);
        let mut co = configmap("cfg");
        assert_eq!(
            should_reload(&co, &workload, Edge::Volume, &config),
            Decision::Skip
        );
        co.annotations.insert(
            "reloader.stakater.com/match".to_string(),
            "true".to_string(),
        );
        assert_eq!(
            should_reload(&co, &workload, Edge::Volume, &config),
            Decision::Reload { auto: true }
        );
    }

    #[test]
    fn token_secrets_never_reload() {
        let config = config(&["--auto-reload-all"]);
        let workload = deployment_with(&[("reloader.stakater.com/auto", "true")]);
        let co = ConfigObject {
            kind: CoKind::Secret,
            secret_type: Some("kubernetes.io/dockercfg".to_string()),
            ..configmap("registry-creds")
        };
        assert_eq!(
            should_reload(&co, &workload, Edge::Volume, &config),
            Decision::Skip
        );
    }

    #[test]
    fn ignored_workload_kinds_never_reload() {
        let config = config(&["--ignored-workload-types", "deployments"]);
        let workload = deployment_with(&[("reloader.stakater.com/auto", "true")]);
        assert_eq!(workload.kind(), WorkloadKind::Deployment);
        assert_eq!(
            should_reload(&configmap("cfg"), &workload, Edge::EnvFrom, &config),
            Decision::Skip
        );
    }

    #[test]
    fn malformed_pattern_is_skipped_not_fatal() {
        let config = config(&[]);
        let workload =
            deployment_with(&[("configmap.reloader.stakater.com/reload", "([,valid-name")]);
        assert!(should_reload(&configmap("valid-name"), &workload, Edge::EnvFrom, &config).reloads());
        assert_eq!(
            should_reload(&configmap("other"), &workload, Edge::EnvFrom, &config),
            Decision::Skip
        );
    }
}
