pub mod kinds;

use std::collections::BTreeMap;
use std::collections::HashSet;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, EnvFromSource, Volume};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Client;

use crate::types::{CoKind, Edge, WorkloadKind};

pub use kinds::{
    CronJobWorkload, DaemonSetWorkload, DeploymentConfigWorkload, DeploymentWorkload, JobWorkload,
    RolloutWorkload, StatefulSetWorkload,
};

static EMPTY_MAP: BTreeMap<String, String> = BTreeMap::new();
static NO_CONTAINERS: Vec<Container> = Vec::new();
static NO_VOLUMES: Vec<Volume> = Vec::new();
static NO_OWNERS: Vec<OwnerReference> = Vec::new();

/// Uniform capability set over every pod-bearing workload kind.
///
/// Mutations touch container env lists and pod-template annotations only;
/// workload-level metadata is read but never written.
#[async_trait]
pub trait Workload: Send + Sync {
    fn kind(&self) -> WorkloadKind;
    fn name(&self) -> &str;
    fn namespace(&self) -> &str;
    fn labels(&self) -> &BTreeMap<String, String>;
    fn annotations(&self) -> &BTreeMap<String, String>;
    fn pod_annotations(&self) -> &BTreeMap<String, String>;
    /// `None` when the workload has no inline pod template to mutate.
    fn pod_annotations_mut(&mut self) -> Option<&mut BTreeMap<String, String>>;
    fn containers(&self) -> &[Container];
    fn containers_mut(&mut self) -> Option<&mut Vec<Container>>;
    fn init_containers(&self) -> &[Container];
    fn volumes(&self) -> &[Volume];
    fn owner_references(&self) -> &[OwnerReference];

    fn is_paused(&self) -> bool {
        false
    }

    /// Deep copy preserving the concrete kind.
    fn clone_box(&self) -> Box<dyn Workload>;

    /// Write the mutated object back. For most kinds this is a replace; Jobs
    /// are deleted and recreated because their pod template is immutable.
    async fn persist(&self, client: Client) -> Result<(), kube::Error>;

    /// Every envFrom source across containers and init containers.
    fn env_from_sources(&self) -> Vec<&EnvFromSource> {
        self.containers()
            .iter()
            .chain(self.init_containers())
            .flat_map(|c| c.env_from.iter().flatten())
            .collect()
    }

    fn uses_config_map(&self, name: &str) -> Option<Edge> {
        self.reference_to(CoKind::ConfigMap, name)
    }

    fn uses_secret(&self, name: &str) -> Option<Edge> {
        self.reference_to(CoKind::Secret, name)
    }

    /// First edge linking this workload to the named object, if any.
    fn reference_to(&self, kind: CoKind, name: &str) -> Option<Edge> {
        for container in self.containers().iter().chain(self.init_containers()) {
            if container_env_references(container, kind, name) {
                return container_env_edge(container, kind, name);
            }
        }
        volumes_edge(self.volumes(), kind, name)
    }
}

fn env_from_references(container: &Container, kind: CoKind, name: &str) -> bool {
    container
        .env_from
        .iter()
        .flatten()
        .any(|source| match kind {
            CoKind::ConfigMap => source
                .config_map_ref
                .as_ref()
                .and_then(|r| r.name.as_deref())
                == Some(name),
            CoKind::Secret => {
                source.secret_ref.as_ref().and_then(|r| r.name.as_deref()) == Some(name)
            }
        })
}

fn env_var_references(container: &Container, kind: CoKind, name: &str) -> bool {
    container.env.iter().flatten().any(|env| {
        let Some(source) = &env.value_from else {
            return false;
        };
        match kind {
            CoKind::ConfigMap => source
                .config_map_key_ref
                .as_ref()
                .and_then(|r| r.name.as_deref())
                == Some(name),
            CoKind::Secret => source
                .secret_key_ref
                .as_ref()
                .and_then(|r| r.name.as_deref())
                == Some(name),
        }
    })
}

fn container_env_references(container: &Container, kind: CoKind, name: &str) -> bool {
    env_from_references(container, kind, name) || env_var_references(container, kind, name)
}

fn container_env_edge(container: &Container, kind: CoKind, name: &str) -> Option<Edge> {
    if env_from_references(container, kind, name) {
        Some(Edge::EnvFrom)
    } else if env_var_references(container, kind, name) {
        Some(Edge::EnvVar)
    } else {
        None
    }
}

fn volume_references(volume: &Volume, kind: CoKind, name: &str) -> Option<Edge> {
    match kind {
        CoKind::ConfigMap => {
            if volume.config_map.as_ref().and_then(|s| s.name.as_deref()) == Some(name) {
                return Some(Edge::Volume);
            }
        }
        CoKind::Secret => {
            if volume
                .secret
                .as_ref()
                .and_then(|s| s.secret_name.as_deref())
                == Some(name)
            {
                return Some(Edge::Volume);
            }
        }
    }
    let projected = volume.projected.as_ref()?;
    let referenced = projected.sources.iter().flatten().any(|source| match kind {
        CoKind::ConfigMap => source.config_map.as_ref().and_then(|p| p.name.as_deref()) == Some(name),
        CoKind::Secret => source.secret.as_ref().and_then(|p| p.name.as_deref()) == Some(name),
    });
    referenced.then_some(Edge::Projected)
}

fn volumes_edge(volumes: &[Volume], kind: CoKind, name: &str) -> Option<Edge> {
    volumes.iter().find_map(|v| volume_references(v, kind, name))
}

/// Names of pod volumes that reference the given object.
pub fn volumes_referencing(volumes: &[Volume], kind: CoKind, name: &str) -> HashSet<String> {
    volumes
        .iter()
        .filter(|v| volume_references(v, kind, name).is_some())
        .map(|v| v.name.clone())
        .collect()
}

/// Whether a single container consumes the object, through env or a mounted
/// volume.
pub fn container_references(
    container: &Container,
    kind: CoKind,
    name: &str,
    referencing_volumes: &HashSet<String>,
) -> bool {
    if container_env_references(container, kind, name) {
        return true;
    }
    container
        .volume_mounts
        .iter()
        .flatten()
        .any(|mount| referencing_volumes.contains(&mount.name))
}
