use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{ConfigMap, PodTemplateSpec, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Secret types that never trigger a reload, regardless of references.
pub const NON_RELOADABLE_SECRET_TYPES: [&str; 3] = [
    "kubernetes.io/service-account-token",
    "kubernetes.io/dockercfg",
    "kubernetes.io/dockerconfigjson",
];

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CoKind {
    ConfigMap,
    Secret,
}

impl CoKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigMap => "ConfigMap",
            Self::Secret => "Secret",
        }
    }

    /// Suffix used by the env-var reload strategy.
    pub fn env_suffix(&self) -> &'static str {
        match self {
            Self::ConfigMap => "CONFIGMAP",
            Self::Secret => "SECRET",
        }
    }
}

impl fmt::Display for CoKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single value of a configuration object. ConfigMaps carry both text and
/// binary sides, Secrets carry binary values only.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ContentValue {
    Text(String),
    Binary(Vec<u8>),
}

/// Uniform view over the two watched configuration object variants.
#[derive(Clone, Debug)]
pub struct ConfigObject {
    pub kind: CoKind,
    pub name: String,
    pub namespace: String,
    pub annotations: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// Secret type, `None` for ConfigMaps.
    pub secret_type: Option<String>,
    pub content: BTreeMap<String, ContentValue>,
}

impl ConfigObject {
    /// View of this object without its content, as left behind by a deletion.
    pub fn deleted_view(&self) -> ConfigObject {
        ConfigObject {
            content: BTreeMap::new(),
            ..self.clone()
        }
    }

    pub fn is_non_reloadable_secret(&self) -> bool {
        match &self.secret_type {
            Some(t) => NON_RELOADABLE_SECRET_TYPES.contains(&t.as_str()),
            None => false,
        }
    }
}

/// Conversion from a watched Kubernetes object into the uniform view.
pub trait AsConfigObject {
    const KIND: CoKind;

    fn as_config_object(&self) -> ConfigObject;
}

impl AsConfigObject for ConfigMap {
    const KIND: CoKind = CoKind::ConfigMap;

    fn as_config_object(&self) -> ConfigObject {
        let mut content = BTreeMap::new();
        if let Some(data) = &self.data {
            for (k, v) in data {
                content.insert(k.clone(), ContentValue::Text(v.clone()));
            }
        }
        if let Some(binary) = &self.binary_data {
            for (k, v) in binary {
                content.insert(k.clone(), ContentValue::Binary(v.0.clone()));
            }
        }
        ConfigObject {
            kind: CoKind::ConfigMap,
            name: self.metadata.name.clone().unwrap_or_default(),
            namespace: self.metadata.namespace.clone().unwrap_or_default(),
            annotations: self.metadata.annotations.clone().unwrap_or_default(),
            labels: self.metadata.labels.clone().unwrap_or_default(),
            secret_type: None,
            content,
        }
    }
}

impl AsConfigObject for Secret {
    const KIND: CoKind = CoKind::Secret;

    fn as_config_object(&self) -> ConfigObject {
        let mut content = BTreeMap::new();
        if let Some(data) = &self.data {
            for (k, v) in data {
                content.insert(k.clone(), ContentValue::Binary(v.0.clone()));
            }
        }
        if let Some(string_data) = &self.string_data {
            for (k, v) in string_data {
                content.insert(k.clone(), ContentValue::Text(v.clone()));
            }
        }
        ConfigObject {
            kind: CoKind::Secret,
            name: self.metadata.name.clone().unwrap_or_default(),
            namespace: self.metadata.namespace.clone().unwrap_or_default(),
            annotations: self.metadata.annotations.clone().unwrap_or_default(),
            labels: self.metadata.labels.clone().unwrap_or_default(),
            secret_type: self.type_.clone(),
            content,
        }
    }
}

/// The pod-bearing workload kinds this controller can restart.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WorkloadKind {
    Deployment,
    DaemonSet,
    StatefulSet,
    Rollout,
    DeploymentConfig,
    Job,
    CronJob,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deployment => "Deployment",
            Self::DaemonSet => "DaemonSet",
            Self::StatefulSet => "StatefulSet",
            Self::Rollout => "Rollout",
            Self::DeploymentConfig => "DeploymentConfig",
            Self::Job => "Job",
            Self::CronJob => "CronJob",
        }
    }

    /// Parses the lowercase plural form used by `--ignored-workload-types`.
    pub fn from_plural(s: &str) -> Option<Self> {
        match s {
            "deployments" => Some(Self::Deployment),
            "daemonsets" => Some(Self::DaemonSet),
            "statefulsets" => Some(Self::StatefulSet),
            "rollouts" => Some(Self::Rollout),
            "deploymentconfigs" => Some(Self::DeploymentConfig),
            "jobs" => Some(Self::Job),
            "cronjobs" => Some(Self::CronJob),
            _ => None,
        }
    }
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a workload references a configuration object. Derived on every
/// reconciliation, never persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Edge {
    EnvFrom,
    EnvVar,
    Volume,
    Projected,
}

/// Audit record stamped on the pod template of every reloaded workload.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReloadSource {
    pub kind: CoKind,
    pub name: String,
    pub namespace: String,
    pub hash: String,
    pub containers: Vec<String>,
    pub observed_at: i64,
}

/// Argo Rollout, reduced to the fields this controller reads and writes.
/// Enabled with `--is-argo-rollouts`.
#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug, Default)]
#[kube(
    group = "argoproj.io",
    version = "v1alpha1",
    kind = "Rollout",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct RolloutSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    /// Absent when the Rollout uses a workload reference instead of an
    /// inline template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,
}

/// OpenShift DeploymentConfig, reduced the same way. Enabled with
/// `--is-openshift`.
#[derive(Serialize, Deserialize, JsonSchema, CustomResource, Clone, Debug, Default)]
#[kube(
    group = "apps.openshift.io",
    version = "v1",
    kind = "DeploymentConfig",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentConfigSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<PodTemplateSpec>,
}
