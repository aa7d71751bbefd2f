use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, ListParams};
use kube::Client;

use crate::config::Config;
use crate::types::{ConfigObject, DeploymentConfig, Edge, Rollout, WorkloadKind};
use crate::workload::{
    CronJobWorkload, DaemonSetWorkload, DeploymentConfigWorkload, DeploymentWorkload, JobWorkload,
    RolloutWorkload, StatefulSetWorkload, Workload,
};

pub struct ResolvedWorkload {
    pub workload: Box<dyn Workload>,
    pub edge: Edge,
}

/// Whether the namespace can be ruled in or out without consulting the
/// cluster. `None` means a namespace-selector lookup is still needed.
pub fn namespace_prefilter(config: &Config, namespace: &str) -> Option<bool> {
    if config.namespace_ignored(namespace) {
        return Some(false);
    }
    if let Some(watch) = &config.watch_namespace {
        if watch != namespace {
            return Some(false);
        }
    }
    if config.namespace_selector.is_none() {
        return Some(true);
    }
    None
}

/// Namespace scope check. A configured namespace selector that matches
/// nothing reconciles nothing; an unresolvable namespace is likewise out of
/// scope.
pub async fn namespace_in_scope(
    client: &Client,
    config: &Config,
    namespace: &str,
) -> Result<bool, kube::Error> {
    if let Some(decided) = namespace_prefilter(config, namespace) {
        return Ok(decided);
    }
    let Some(selector) = config.namespace_selector.as_ref() else {
        return Ok(true);
    };
    let api: Api<Namespace> = Api::all(client.clone());
    match api.get_opt(namespace).await? {
        Some(ns) => Ok(selector.matches(&ns.metadata.labels.unwrap_or_default())),
        None => Ok(false),
    }
}

/// Workloads in the object's namespace that reference it, with the edge that
/// linked them. Ordering follows the list responses and is not stable across
/// calls.
pub async fn workloads_referencing(
    client: &Client,
    config: &Config,
    co: &ConfigObject,
) -> Result<Vec<ResolvedWorkload>, kube::Error> {
    let namespace = &co.namespace;
    let params = list_params(config);
    let mut out = Vec::new();

    if config.kind_enabled(WorkloadKind::Deployment) {
        let api: Api<Deployment> = Api::namespaced(client.clone(), namespace);
        for item in api.list(&params).await?.items {
            collect(&mut out, DeploymentWorkload(item), co, config);
        }
    }
    if config.kind_enabled(WorkloadKind::DaemonSet) {
        let api: Api<DaemonSet> = Api::namespaced(client.clone(), namespace);
        for item in api.list(&params).await?.items {
            collect(&mut out, DaemonSetWorkload(item), co, config);
        }
    }
    if config.kind_enabled(WorkloadKind::StatefulSet) {
        let api: Api<StatefulSet> = Api::namespaced(client.clone(), namespace);
        for item in api.list(&params).await?.items {
            collect(&mut out, StatefulSetWorkload(item), co, config);
        }
    }
    if config.kind_enabled(WorkloadKind::Rollout) {
        let api: Api<Rollout> = Api::namespaced(client.clone(), namespace);
        for item in api.list(&params).await?.items {
            collect(&mut out, RolloutWorkload(item), co, config);
        }
    }
    if config.kind_enabled(WorkloadKind::DeploymentConfig) {
        let api: Api<DeploymentConfig> = Api::namespaced(client.clone(), namespace);
        for item in api.list(&params).await?.items {
            collect(&mut out, DeploymentConfigWorkload(item), co, config);
        }
    }
    if config.kind_enabled(WorkloadKind::Job) {
        let api: Api<Job> = Api::namespaced(client.clone(), namespace);
        for item in api.list(&params).await?.items {
            collect(&mut out, JobWorkload(item), co, config);
        }
    }
    if config.kind_enabled(WorkloadKind::CronJob) {
        let api: Api<CronJob> = Api::namespaced(client.clone(), namespace);
        for item in api.list(&params).await?.items {
            collect(&mut out, CronJobWorkload(item), co, config);
        }
    }

    Ok(out)
}

fn list_params(config: &Config) -> ListParams {
    match &config.resource_selector {
        Some(selector) => ListParams::default().labels(selector.raw()),
        None => ListParams::default(),
    }
}

fn collect(
    out: &mut Vec<ResolvedWorkload>,
    workload: impl Workload + 'static,
    co: &ConfigObject,
    config: &Config,
) {
    if let Some(selector) = &config.resource_selector {
        if !selector.matches(workload.labels()) {
            return;
        }
    }
    if let Some(edge) = workload.reference_to(co.kind, &co.name) {
        out.push(ResolvedWorkload {
            workload: Box::new(workload),
            edge,
        });
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use clap::Parser;
    use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
    use k8s_openapi::api::core::v1::{
        ConfigMapVolumeSource, Container, PodSpec, PodTemplateSpec, Volume,
    };
    use kube::api::ObjectMeta;

    use super::*;
    use crate::config::{Options, PodEnv};
    use crate::types::CoKind;

    fn config(args: &[&str]) -> Config {
        let mut argv = vec!["reloader"];
        argv.extend(args);
        Options::parse_from(argv)
            .into_config(&PodEnv::default())
            .unwrap()
    }

    fn configmap(name: &str, namespace: &str) -> ConfigObject {
        ConfigObject {
            kind: CoKind::ConfigMap,
            name: name.to_string(),
            namespace: namespace.to_string(),
            annotations: BTreeMap::new(),
            labels: BTreeMap::new(),
            secret_type: None,
            content: BTreeMap::new(),
        }
    }

    fn deployment(name: &str, labels: &[(&str, &str)], mounts: &str) -> DeploymentWorkload {
        DeploymentWorkload(Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                template: PodTemplateSpec {
                    spec: Some(PodSpec {
                        containers: vec![Container {
                            name: "app".to_string(),
                            ..Default::default()
                        }],
                        volumes: Some(vec![Volume {
                            name: "config".to_string(),
                            config_map: Some(ConfigMapVolumeSource {
                                name: Some(mounts.to_string()),
                                ..Default::default()
                            }),
                            ..Default::default()
                        }]),
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
    fn collect_keeps_referencing_workloads_only() {
        let config = config(&[]);
        let co = configmap("foo", "default");
        let mut out = Vec::new();
        collect(&mut out, deployment("match", &[], "foo"), &co, &config);
        collect(&mut out, deployment("other", &[], "bar"), &co, &config);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].workload.name(), "match");
        assert_eq!(out[0].edge, Edge::Volume);
    }

    #[test]
    fn collect_honors_resource_selector() {
        let config = config(&["--resource-label-selector", "team=payments"]);
        let co = configmap("foo", "default");
        let mut out = Vec::new();
        collect(
            &mut out,
            deployment("in-team", &[("team", "payments")], "foo"),
            &co,
            &config,
        );
        collect(&mut out, deployment("off-team", &[], "foo"), &co, &config);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].workload.name(), "in-team");
    }

    #[test]
    fn prefilter_rules_out_ignored_and_foreign_namespaces() {
        let config = config(&["--namespaces-to-ignore", "kube-system"]);
        assert_eq!(namespace_prefilter(&config, "kube-system"), Some(false));
        assert_eq!(namespace_prefilter(&config, "default"), Some(true));

        let single = config_with_watch();
        assert_eq!(namespace_prefilter(&single, "default"), Some(true));
        assert_eq!(namespace_prefilter(&single, "other"), Some(false));
    }

    fn config_with_watch() -> Config {
        config(&["--watch-namespace", "default"])
    }

    #[test]
    fn prefilter_defers_to_selector_lookup() {
        let config = config(&["--namespace-selector", "env=prod"]);
        assert_eq!(namespace_prefilter(&config, "default"), None);
    }
}
