use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::types::WorkloadKind;

/// Per-workload opt-out annotation.
pub const IGNORE_ANNOTATION: &str = "reloader.stakater.com/ignore";
/// Comma-separated ConfigMap names a workload excludes from reloads.
pub const EXCLUDE_CONFIGMAPS_ANNOTATION: &str = "configmaps.exclude.reloader.stakater.com/reload";
/// Comma-separated Secret names a workload excludes from reloads.
pub const EXCLUDE_SECRETS_ANNOTATION: &str = "secrets.exclude.reloader.stakater.com/reload";
/// Pod-template annotation recording what triggered the last restart.
pub const RELOADED_FROM_ANNOTATION: &str = "reloader.stakater.com/last-reloaded-from";

/// Command-line flags. Collapsed into [`Config`] at startup; nothing else
/// reads this struct.
#[derive(Parser, Clone, Debug)]
#[clap(name = "reloader", about = "Restarts workloads when their ConfigMaps or Secrets change")]
pub struct Options {
    /// Reload every workload on any referenced change, no annotation needed.
    #[clap(long)]
    pub auto_reload_all: bool,

    /// Restart trigger strategy: `env-vars` or `annotations`.
    #[clap(long, default_value = "env-vars")]
    pub reload_strategy: String,

    /// Enable the Argo Rollout workload kind.
    #[clap(long)]
    pub is_argo_rollouts: bool,

    /// Enable the OpenShift DeploymentConfig workload kind.
    #[clap(long)]
    pub is_openshift: bool,

    /// Treat object creation as a change.
    #[clap(long)]
    pub reload_on_create: bool,

    /// Treat object deletion as a change.
    #[clap(long)]
    pub reload_on_delete: bool,

    /// On startup, treat all pre-existing objects as seen for the first time.
    #[clap(long)]
    pub sync_after_restart: bool,

    /// Enable leader election. Requires POD_NAME and POD_NAMESPACE.
    #[clap(long)]
    pub enable_ha: bool,

    #[clap(long, default_value = "reloader")]
    pub leader_election_id: String,

    /// Lease namespace. Defaults to POD_NAMESPACE.
    #[clap(long)]
    pub leader_election_namespace: Option<String>,

    #[clap(long, default_value_t = 15)]
    pub leader_election_lease_duration: u64,

    #[clap(long, default_value_t = 10)]
    pub leader_election_renew_deadline: u64,

    #[clap(long, default_value_t = 2)]
    pub leader_election_retry_period: u64,

    #[clap(long)]
    pub leader_election_release_on_cancel: bool,

    /// Send notifications to this URL instead of restarting workloads.
    #[clap(long)]
    pub webhook_url: Option<String>,

    /// Object kinds to skip entirely: `configMaps` and/or `secrets`.
    #[clap(long, value_delimiter = ',')]
    pub resources_to_ignore: Vec<String>,

    /// Workload kinds to skip, lowercase plural (`jobs`, `cronjobs`, ...).
    #[clap(long, value_delimiter = ',')]
    pub ignored_workload_types: Vec<String>,

    /// Namespaces to skip, exact match.
    #[clap(long, value_delimiter = ',')]
    pub namespaces_to_ignore: Vec<String>,

    /// Label selector a namespace must match to be watched.
    #[clap(long)]
    pub namespace_selector: Option<String>,

    /// Label selector a workload must match to be reloaded.
    #[clap(long)]
    pub resource_label_selector: Option<String>,

    /// `json` for JSON log lines, empty for plain text.
    #[clap(long, default_value = "")]
    pub log_format: String,

    #[clap(long, default_value = "info")]
    pub log_level: String,

    #[clap(long, default_value = "0.0.0.0:9090")]
    pub metrics_addr: String,

    #[clap(long, default_value = "0.0.0.0:9091")]
    pub health_addr: String,

    /// Workers per watched kind. Keys are sharded across workers; one key is
    /// never processed concurrently.
    #[clap(long, default_value_t = 1)]
    pub workers: usize,

    /// Watch a single namespace instead of the whole cluster.
    #[clap(long)]
    pub watch_namespace: Option<String>,

    #[clap(long, default_value = "reloader.stakater.com/auto")]
    pub auto_annotation: String,

    #[clap(long, default_value = "configmap.reloader.stakater.com/auto")]
    pub configmap_auto_annotation: String,

    #[clap(long, default_value = "secret.reloader.stakater.com/auto")]
    pub secret_auto_annotation: String,

    #[clap(long, default_value = "configmap.reloader.stakater.com/reload")]
    pub configmap_annotation: String,

    #[clap(long, default_value = "secret.reloader.stakater.com/reload")]
    pub secret_annotation: String,

    #[clap(long, default_value = "reloader.stakater.com/search")]
    pub auto_search_annotation: String,

    #[clap(long, default_value = "reloader.stakater.com/match")]
    pub search_match_annotation: String,

    #[clap(long, default_value = "deployment.reloader.stakater.com/pause-period")]
    pub pause_deployment_annotation: String,

    #[clap(long, default_value = "deployment.reloader.stakater.com/paused-at")]
    pub pause_deployment_time_annotation: String,
}

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReloadStrategy {
    EnvVars,
    Annotations,
}

/// Annotation keys in effect, after flag overrides.
#[derive(Serialize, Clone, Debug)]
pub struct AnnotationKeys {
    pub auto: String,
    pub configmap_auto: String,
    pub secret_auto: String,
    pub configmap_reload: String,
    pub secret_reload: String,
    pub search: String,
    pub search_match: String,
    pub pause_period: String,
    pub paused_at: String,
}

#[derive(Serialize, Clone, Debug)]
pub struct HaConfig {
    pub lease_name: String,
    pub lease_namespace: String,
    pub identity: String,
    pub lease_duration_secs: u64,
    pub renew_deadline_secs: u64,
    pub retry_period_secs: u64,
    pub release_on_cancel: bool,
}

/// The single canonical runtime configuration.
#[derive(Serialize, Clone, Debug)]
pub struct Config {
    pub reload_strategy: ReloadStrategy,
    pub auto_reload_all: bool,
    pub reload_on_create: bool,
    pub reload_on_delete: bool,
    pub sync_after_restart: bool,
    pub webhook_url: Option<String>,
    pub ignore_configmaps: bool,
    pub ignore_secrets: bool,
    pub ignored_workload_kinds: HashSet<WorkloadKind>,
    pub ignored_namespaces: HashSet<String>,
    pub namespace_selector: Option<Selector>,
    pub resource_selector: Option<Selector>,
    pub watch_namespace: Option<String>,
    pub workers: usize,
    pub enable_rollouts: bool,
    pub enable_deployment_configs: bool,
    pub ha: Option<HaConfig>,
    pub metrics_addr: SocketAddr,
    pub health_addr: SocketAddr,
    pub annotations: AnnotationKeys,
}

impl Config {
    pub fn kind_enabled(&self, kind: WorkloadKind) -> bool {
        if self.ignored_workload_kinds.contains(&kind) {
            return false;
        }
        match kind {
            WorkloadKind::Rollout => self.enable_rollouts,
            WorkloadKind::DeploymentConfig => self.enable_deployment_configs,
            _ => true,
        }
    }

    pub fn namespace_ignored(&self, namespace: &str) -> bool {
        self.ignored_namespaces.contains(namespace)
    }

    /// True when the controller only notifies and never mutates workloads.
    pub fn webhook_only(&self) -> bool {
        self.webhook_url.is_some()
    }
}

impl Options {
    pub fn into_config(self, pod_env: &PodEnv) -> Result<Config> {
        let reload_strategy = match self.reload_strategy.as_str() {
            "env-vars" => ReloadStrategy::EnvVars,
            "annotations" => ReloadStrategy::Annotations,
            other => bail!("unknown reload strategy {other:?}, expected `env-vars` or `annotations`"),
        };

        let mut ignore_configmaps = false;
        let mut ignore_secrets = false;
        for resource in &self.resources_to_ignore {
            match resource.as_str() {
                "configMaps" => ignore_configmaps = true,
                "secrets" => ignore_secrets = true,
                other => bail!("unknown resource kind {other:?} in --resources-to-ignore"),
            }
        }

        let mut ignored_workload_kinds = HashSet::new();
        for kind in &self.ignored_workload_types {
            let parsed = WorkloadKind::from_plural(kind)
                .with_context(|| format!("unknown workload kind {kind:?} in --ignored-workload-types"))?;
            ignored_workload_kinds.insert(parsed);
        }

        let namespace_selector = self
            .namespace_selector
            .as_deref()
            .map(Selector::parse)
            .transpose()
            .context("invalid --namespace-selector")?;
        let resource_selector = self
            .resource_label_selector
            .as_deref()
            .map(Selector::parse)
            .transpose()
            .context("invalid --resource-label-selector")?;

        let metrics_addr: SocketAddr = self
            .metrics_addr
            .parse()
            .context("invalid --metrics-addr")?;
        let health_addr: SocketAddr = self.health_addr.parse().context("invalid --health-addr")?;

        if self.workers == 0 {
            bail!("--workers must be at least 1");
        }

        let ha = if self.enable_ha {
            let identity = match pod_env.pod_name.clone() {
                Some(name) => name,
                None => hostname::get()
                    .ok()
                    .map(|h| h.to_string_lossy().into_owned())
                    .context("POD_NAME is required with --enable-ha")?,
            };
            let lease_namespace = match self.leader_election_namespace {
                Some(ns) => ns,
                None => pod_env
                    .pod_namespace
                    .clone()
                    .context("POD_NAMESPACE is required with --enable-ha")?,
            };
            if self.leader_election_renew_deadline >= self.leader_election_lease_duration {
                bail!("leader election renew deadline must be shorter than the lease duration");
            }
            Some(HaConfig {
                lease_name: self.leader_election_id,
                lease_namespace,
                identity,
                lease_duration_secs: self.leader_election_lease_duration,
                renew_deadline_secs: self.leader_election_renew_deadline,
                retry_period_secs: self.leader_election_retry_period,
                release_on_cancel: self.leader_election_release_on_cancel,
            })
        } else {
            None
        };

        Ok(Config {
            reload_strategy,
            auto_reload_all: self.auto_reload_all,
            reload_on_create: self.reload_on_create,
            reload_on_delete: self.reload_on_delete,
            sync_after_restart: self.sync_after_restart,
            webhook_url: self.webhook_url,
            ignore_configmaps,
            ignore_secrets,
            ignored_workload_kinds,
            ignored_namespaces: self.namespaces_to_ignore.into_iter().collect(),
            namespace_selector,
            resource_selector,
            watch_namespace: self.watch_namespace,
            workers: self.workers,
            enable_rollouts: self.is_argo_rollouts,
            enable_deployment_configs: self.is_openshift,
            ha,
            metrics_addr,
            health_addr,
            annotations: AnnotationKeys {
                auto: self.auto_annotation,
                configmap_auto: self.configmap_auto_annotation,
                secret_auto: self.secret_auto_annotation,
                configmap_reload: self.configmap_annotation,
                secret_reload: self.secret_annotation,
                search: self.auto_search_annotation,
                search_match: self.search_match_annotation,
                pause_period: self.pause_deployment_annotation,
                paused_at: self.pause_deployment_time_annotation,
            },
        })
    }
}

/// Pod identity injected by the downward API.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct PodEnv {
    pub pod_name: Option<String>,
    pub pod_namespace: Option<String>,
}

impl PodEnv {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::from_env()
    }
}

/// `RELOADER_*` deployment identity, informational.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct ReloaderEnv {
    pub namespace: Option<String>,
    pub deployment_name: Option<String>,
}

impl ReloaderEnv {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("RELOADER_").from_env()
    }
}

/// `ALERT_*` notifier settings.
#[derive(Deserialize, Clone, Debug, Default)]
pub struct AlertEnv {
    pub webhook_url: Option<String>,
    pub sink: Option<String>,
    pub webhook_proxy: Option<String>,
}

impl AlertEnv {
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("ALERT_").from_env()
    }
}

/// Equality- and set-based label selector, evaluated locally against object
/// metadata.
#[derive(Serialize, Clone, Debug)]
pub struct Selector {
    raw: String,
    #[serde(skip)]
    requirements: Vec<Requirement>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Requirement {
    Eq(String, String),
    NotEq(String, String),
    Exists(String),
    NotExists(String),
    In(String, Vec<String>),
    NotIn(String, Vec<String>),
}

impl Selector {
    pub fn parse(raw: &str) -> Result<Selector> {
        let mut requirements = Vec::new();
        for part in split_top_level(raw) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            requirements.push(parse_requirement(part)?);
        }
        if requirements.is_empty() {
            bail!("empty label selector");
        }
        Ok(Selector {
            raw: raw.to_string(),
            requirements,
        })
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|req| match req {
            Requirement::Eq(k, v) => labels.get(k) == Some(v),
            Requirement::NotEq(k, v) => labels.get(k) != Some(v),
            Requirement::Exists(k) => labels.contains_key(k),
            Requirement::NotExists(k) => !labels.contains_key(k),
            Requirement::In(k, vs) => labels.get(k).map(|v| vs.contains(v)).unwrap_or(false),
            Requirement::NotIn(k, vs) => labels.get(k).map(|v| !vs.contains(v)).unwrap_or(true),
        })
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }
}

/// Splits on commas outside parentheses, so `k in (a,b)` stays together.
fn split_top_level(raw: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in raw.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&raw[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&raw[start..]);
    parts
}

fn parse_requirement(part: &str) -> Result<Requirement> {
    if let Some((key, values)) = parse_set_requirement(part, " notin ") {
        return Ok(Requirement::NotIn(key, values?));
    }
    if let Some((key, values)) = parse_set_requirement(part, " in ") {
        return Ok(Requirement::In(key, values?));
    }
    if let Some((k, v)) = part.split_once("!=") {
        return Ok(Requirement::NotEq(k.trim().to_string(), v.trim().to_string()));
    }
    if let Some((k, v)) = part.split_once("==") {
        return Ok(Requirement::Eq(k.trim().to_string(), v.trim().to_string()));
    }
    if let Some((k, v)) = part.split_once('=') {
        return Ok(Requirement::Eq(k.trim().to_string(), v.trim().to_string()));
    }
    if let Some(key) = part.strip_prefix('!') {
        return Ok(Requirement::NotExists(key.trim().to_string()));
    }
    if part.contains(|c: char| c.is_whitespace() || c == '(' || c == ')') {
        bail!("malformed selector requirement {part:?}");
    }
    Ok(Requirement::Exists(part.to_string()))
}

#[allow(clippy::type_complexity)]
fn parse_set_requirement(part: &str, op: &str) -> Option<(String, Result<Vec<String>>)> {
    let (key, rest) = part.split_once(op)?;
    let rest = rest.trim();
    let values = if let Some(inner) = rest.strip_prefix('(').and_then(|r| r.strip_suffix(')')) {
        Ok(inner
            .split(',')
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect())
    } else {
        Err(anyhow::anyhow!("malformed set requirement {part:?}"))
    };
    Some((key.trim().to_string(), values))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(args: &[&str]) -> Options {
        let mut argv = vec!["reloader"];
        argv.extend(args);
        Options::parse_from(argv)
    }

    #[test]
    fn defaults_build_a_config() {
        let config = options(&[]).into_config(&PodEnv::default()).unwrap();
        assert_eq!(config.reload_strategy, ReloadStrategy::EnvVars);
        assert!(!config.auto_reload_all);
        assert!(!config.webhook_only());
        assert!(config.ha.is_none());
        assert_eq!(config.workers, 1);
        assert_eq!(config.annotations.auto, "reloader.stakater.com/auto");
        assert!(config.kind_enabled(WorkloadKind::Deployment));
        assert!(!config.kind_enabled(WorkloadKind::Rollout));
    }

    #[test]
    fn unknown_strategy_is_rejected() {
        let err = options(&["--reload-strategy", "restart-everything"])
            .into_config(&PodEnv::default())
            .unwrap_err();
        assert!(err.to_string().contains("unknown reload strategy"));
    }

    #[test]
    fn ignored_kinds_are_parsed_from_plurals() {
        let config = options(&["--ignored-workload-types", "jobs,cronjobs"])
            .into_config(&PodEnv::default())
            .unwrap();
        assert!(!config.kind_enabled(WorkloadKind::Job));
        assert!(!config.kind_enabled(WorkloadKind::CronJob));
        assert!(config.kind_enabled(WorkloadKind::Deployment));

        assert!(options(&["--ignored-workload-types", "pods"])
            .into_config(&PodEnv::default())
            .is_err());
    }

    #[test]
    fn ha_requires_pod_identity() {
        assert!(options(&["--enable-ha"])
            .into_config(&PodEnv::default())
            .is_err());

        let pod_env = PodEnv {
            pod_name: Some("reloader-0".to_string()),
            pod_namespace: Some("infra".to_string()),
        };
        let config = options(&["--enable-ha"]).into_config(&pod_env).unwrap();
        let ha = config.ha.unwrap();
        assert_eq!(ha.identity, "reloader-0");
        assert_eq!(ha.lease_namespace, "infra");
        assert_eq!(ha.lease_name, "reloader");
    }

    #[test]
    fn selector_equality_and_exists() {
        let sel = Selector::parse("app=web,tier!=cache,owner").unwrap();
        let mut labels = BTreeMap::from([
            ("app".to_string(), "web".to_string()),
            ("owner".to_string(), "payments".to_string()),
        ]);
        assert!(sel.matches(&labels));
        labels.insert("tier".to_string(), "cache".to_string());
        assert!(!sel.matches(&labels));
    }

    #[test]
    fn selector_set_based() {
        let sel = Selector::parse("env in (prod, staging),region notin (eu)").unwrap();
        let prod = BTreeMap::from([("env".to_string(), "prod".to_string())]);
        assert!(sel.matches(&prod));
        let dev = BTreeMap::from([("env".to_string(), "dev".to_string())]);
        assert!(!sel.matches(&dev));
        let eu = BTreeMap::from([
            ("env".to_string(), "prod".to_string()),
            ("region".to_string(), "eu".to_string()),
        ]);
        assert!(!sel.matches(&eu));
    }

    #[test]
    fn malformed_selector_is_a_startup_error() {
        assert!(Selector::parse("env in prod").is_err());
        assert!(Selector::parse("").is_err());
        assert!(options(&["--namespace-selector", "env in prod"])
            .into_config(&PodEnv::default())
            .is_err());
    }
}
