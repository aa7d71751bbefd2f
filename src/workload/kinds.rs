use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, StatefulSet};
use k8s_openapi::api::batch::v1::{CronJob, Job};
use k8s_openapi::api::core::v1::{Container, PodTemplateSpec, Volume};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::{Api, DeleteParams, PostParams};
use kube::Client;

use super::{Workload, EMPTY_MAP, NO_CONTAINERS, NO_OWNERS, NO_VOLUMES};
use crate::types::{DeploymentConfig, Rollout, WorkloadKind};

pub struct DeploymentWorkload(pub Deployment);
pub struct DaemonSetWorkload(pub DaemonSet);
pub struct StatefulSetWorkload(pub StatefulSet);
pub struct RolloutWorkload(pub Rollout);
pub struct DeploymentConfigWorkload(pub DeploymentConfig);
pub struct JobWorkload(pub Job);
pub struct CronJobWorkload(pub CronJob);

impl DeploymentWorkload {
    fn template(&self) -> Option<&PodTemplateSpec> {
        self.0.spec.as_ref().map(|s| &s.template)
    }

    fn template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.0.spec.as_mut().map(|s| &mut s.template)
    }
}

impl DaemonSetWorkload {
    fn template(&self) -> Option<&PodTemplateSpec> {
        self.0.spec.as_ref().map(|s| &s.template)
    }

    fn template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.0.spec.as_mut().map(|s| &mut s.template)
    }
}

impl StatefulSetWorkload {
    fn template(&self) -> Option<&PodTemplateSpec> {
        self.0.spec.as_ref().map(|s| &s.template)
    }

    fn template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.0.spec.as_mut().map(|s| &mut s.template)
    }
}

impl RolloutWorkload {
    fn template(&self) -> Option<&PodTemplateSpec> {
        self.0.spec.template.as_ref()
    }

    fn template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.0.spec.template.as_mut()
    }
}

impl DeploymentConfigWorkload {
    fn template(&self) -> Option<&PodTemplateSpec> {
        self.0.spec.template.as_ref()
    }

    fn template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.0.spec.template.as_mut()
    }
}

impl JobWorkload {
    fn template(&self) -> Option<&PodTemplateSpec> {
        self.0.spec.as_ref().map(|s| &s.template)
    }

    fn template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.0.spec.as_mut().map(|s| &mut s.template)
    }
}

impl CronJobWorkload {
    fn template(&self) -> Option<&PodTemplateSpec> {
        self.0
            .spec
            .as_ref()
            .and_then(|s| s.job_template.spec.as_ref())
            .map(|js| &js.template)
    }

    fn template_mut(&mut self) -> Option<&mut PodTemplateSpec> {
        self.0
            .spec
            .as_mut()
            .and_then(|s| s.job_template.spec.as_mut())
            .map(|js| &mut js.template)
    }
}

/// Generates the `Workload` impl for a wrapper exposing
/// `template()`/`template_mut()`. Kind-specific methods, including
/// `persist`, are passed through verbatim.
macro_rules! workload_impl {
    ($wrapper:ident, $kind:expr, { $($extra:item)* }) => {
        #[async_trait]
        impl Workload for $wrapper {
            fn kind(&self) -> WorkloadKind {
                $kind
            }

            fn name(&self) -> &str {
                self.0.metadata.name.as_deref().unwrap_or_default()
            }

            fn namespace(&self) -> &str {
                self.0.metadata.namespace.as_deref().unwrap_or_default()
            }

            fn labels(&self) -> &BTreeMap<String, String> {
                self.0.metadata.labels.as_ref().unwrap_or(&EMPTY_MAP)
            }

            fn annotations(&self) -> &BTreeMap<String, String> {
                self.0.metadata.annotations.as_ref().unwrap_or(&EMPTY_MAP)
            }

            fn pod_annotations(&self) -> &BTreeMap<String, String> {
                self.template()
                    .and_then(|t| t.metadata.as_ref())
                    .and_then(|m| m.annotations.as_ref())
                    .unwrap_or(&EMPTY_MAP)
            }

            fn pod_annotations_mut(&mut self) -> Option<&mut BTreeMap<String, String>> {
                let template = self.template_mut()?;
                Some(
                    template
                        .metadata
                        .get_or_insert_with(Default::default)
                        .annotations
                        .get_or_insert_with(Default::default),
                )
            }

            fn containers(&self) -> &[Container] {
                self.template()
                    .and_then(|t| t.spec.as_ref())
                    .map(|s| s.containers.as_slice())
                    .unwrap_or(&NO_CONTAINERS)
            }

            fn containers_mut(&mut self) -> Option<&mut Vec<Container>> {
                Some(&mut self.template_mut()?.spec.as_mut()?.containers)
            }

            fn init_containers(&self) -> &[Container] {
                self.template()
                    .and_then(|t| t.spec.as_ref())
                    .and_then(|s| s.init_containers.as_ref())
                    .map(|v| v.as_slice())
                    .unwrap_or(&NO_CONTAINERS)
            }

            fn volumes(&self) -> &[Volume] {
                self.template()
                    .and_then(|t| t.spec.as_ref())
                    .and_then(|s| s.volumes.as_ref())
                    .map(|v| v.as_slice())
                    .unwrap_or(&NO_VOLUMES)
            }

            fn owner_references(&self) -> &[OwnerReference] {
                self.0
                    .metadata
                    .owner_references
                    .as_ref()
                    .map(|v| v.as_slice())
                    .unwrap_or(&NO_OWNERS)
            }

            fn clone_box(&self) -> Box<dyn Workload> {
                Box::new($wrapper(self.0.clone()))
            }

            $($extra)*
        }
    };
}

workload_impl!(DeploymentWorkload, WorkloadKind::Deployment, {
    fn is_paused(&self) -> bool {
        self.0
            .spec
            .as_ref()
            .and_then(|s| s.paused)
            .unwrap_or(false)
    }

    async fn persist(&self, client: Client) -> Result<(), kube::Error> {
        let api: Api<Deployment> = Api::namespaced(client, self.namespace());
        api.replace(self.name(), &PostParams::default(), &self.0)
            .await?;
        Ok(())
    }
});

workload_impl!(DaemonSetWorkload, WorkloadKind::DaemonSet, {
    async fn persist(&self, client: Client) -> Result<(), kube::Error> {
        let api: Api<DaemonSet> = Api::namespaced(client, self.namespace());
        api.replace(self.name(), &PostParams::default(), &self.0)
            .await?;
        Ok(())
    }
});

workload_impl!(StatefulSetWorkload, WorkloadKind::StatefulSet, {
    async fn persist(&self, client: Client) -> Result<(), kube::Error> {
        let api: Api<StatefulSet> = Api::namespaced(client, self.namespace());
        api.replace(self.name(), &PostParams::default(), &self.0)
            .await?;
        Ok(())
    }
});

workload_impl!(RolloutWorkload, WorkloadKind::Rollout, {
    fn is_paused(&self) -> bool {
        self.0.spec.paused.unwrap_or(false)
    }

    async fn persist(&self, client: Client) -> Result<(), kube::Error> {
        let api: Api<Rollout> = Api::namespaced(client, self.namespace());
        api.replace(self.name(), &PostParams::default(), &self.0)
            .await?;
        Ok(())
    }
});

workload_impl!(DeploymentConfigWorkload, WorkloadKind::DeploymentConfig, {
    fn is_paused(&self) -> bool {
        self.0.spec.paused.unwrap_or(false)
    }

    async fn persist(&self, client: Client) -> Result<(), kube::Error> {
        let api: Api<DeploymentConfig> = Api::namespaced(client, self.namespace());
        api.replace(self.name(), &PostParams::default(), &self.0)
            .await?;
        Ok(())
    }
});

workload_impl!(JobWorkload, WorkloadKind::Job, {
    /// A Job's pod template is immutable, so persisting means deleting the
    /// Job and recreating it with the new spec, keeping identity and owner
    /// references.
    async fn persist(&self, client: Client) -> Result<(), kube::Error> {
        let api: Api<Job> = Api::namespaced(client, self.namespace());
        match api.delete(self.name(), &DeleteParams::background()).await {
            Ok(_) => {}
            Err(kube::Error::Api(err)) if err.code == 404 => {}
            Err(err) => return Err(err),
        }
        let job = prepare_job_for_recreate(&self.0);
        api.create(&PostParams::default(), &job).await?;
        Ok(())
    }
});

workload_impl!(CronJobWorkload, WorkloadKind::CronJob, {
    async fn persist(&self, client: Client) -> Result<(), kube::Error> {
        let api: Api<CronJob> = Api::namespaced(client, self.namespace());
        api.replace(self.name(), &PostParams::default(), &self.0)
            .await?;
        Ok(())
    }
});

/// Strips server-populated identity so the apiserver accepts the recreate.
/// The generated selector and its pod labels must go too, unless the Job
/// manages its own selector.
pub(crate) fn prepare_job_for_recreate(original: &Job) -> Job {
    let mut job = original.clone();
    job.metadata.resource_version = None;
    job.metadata.uid = None;
    job.metadata.creation_timestamp = None;
    job.metadata.generation = None;
    job.metadata.managed_fields = None;
    job.status = None;
    if let Some(spec) = job.spec.as_mut() {
        if spec.manual_selector != Some(true) {
            spec.selector = None;
            if let Some(labels) = spec
                .template
                .metadata
                .as_mut()
                .and_then(|m| m.labels.as_mut())
            {
                labels.remove("controller-uid");
                labels.remove("job-name");
            }
        }
    }
    job
}
