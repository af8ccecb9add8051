//! Typed gateway over the Kubernetes API

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DeleteParams, ListParams, PostParams, PropagationPolicy};
use kube::Client;
use tracing::{debug, info};

#[cfg(any(test, feature = "testing"))]
use mockall::automock;

use taskrunner_common::{ClusterJobView, ClusterPodView, Error, Result, JOB_NAME_LABEL};

/// Label selector matching the Pods of Job `name`
pub fn job_pod_selector(name: &str) -> String {
    format!("{}={}", JOB_NAME_LABEL, name)
}

/// Cluster operations the launcher, stopper and reconciler depend on
///
/// Every call runs against the namespace the gateway was built for. Delete
/// operations take `ignore_not_found`; when set, a 404 is treated as success.
#[cfg_attr(any(test, feature = "testing"), automock)]
#[async_trait]
pub trait ClusterGateway: Send + Sync {
    /// Fetch a Job
    async fn get_job(&self, name: &str) -> Result<ClusterJobView>;

    /// Create a Job from a rendered manifest
    async fn create_job(&self, job: &Job) -> Result<ClusterJobView>;

    /// Delete a Job and, in the background, its Pods
    async fn delete_job(&self, name: &str, ignore_not_found: bool) -> Result<()>;

    /// Every Job in the namespace
    async fn list_jobs(&self) -> Result<Vec<ClusterJobView>>;

    /// Pods matching an exact label selector such as `job-name=x`
    async fn list_pods(&self, label_selector: &str) -> Result<Vec<ClusterPodView>>;

    /// Create a PersistentVolumeClaim
    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<()>;

    /// Delete a PersistentVolumeClaim
    async fn delete_pvc(&self, name: &str, ignore_not_found: bool) -> Result<()>;

    /// Create a Secret holding `content` under key `filename`.
    ///
    /// With `ignore_existing` an existing Secret of the same name is left as
    /// is. The check and the create are separate calls.
    async fn create_secret_from_file(
        &self,
        name: &str,
        filename: &str,
        content: &[u8],
        ignore_existing: bool,
    ) -> Result<()>;

    /// Delete a Secret
    async fn delete_secret(&self, name: &str, ignore_not_found: bool) -> Result<()>;
}

/// [`ClusterGateway`] backed by a kube [`Client`]
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
    namespace: String,
}

impl KubeGateway {
    /// Create a gateway bound to `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// A gateway sharing this client but bound to another namespace
    pub fn in_namespace(&self, namespace: impl Into<String>) -> Self {
        Self::new(self.client.clone(), namespace)
    }

    /// Namespace this gateway operates in
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pvcs(&self) -> Api<PersistentVolumeClaim> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

/// Background cascade, no grace period
pub fn background_delete() -> DeleteParams {
    DeleteParams {
        propagation_policy: Some(PropagationPolicy::Background),
        grace_period_seconds: Some(0),
        ..Default::default()
    }
}

/// Collapse a 404 into success when the caller asked for it
fn tolerate_not_found(result: Result<()>, ignore_not_found: bool) -> Result<()> {
    match result {
        Err(e) if ignore_not_found && e.is_not_found() => Ok(()),
        other => other,
    }
}

fn secret_from_file(name: &str, filename: &str, content: &[u8]) -> Secret {
    let mut data = BTreeMap::new();
    data.insert(filename.to_string(), ByteString(content.to_vec()));
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    async fn get_job(&self, name: &str) -> Result<ClusterJobView> {
        let job = self.jobs().get(name).await.map_err(Error::from_kube)?;
        Ok(ClusterJobView::from_job(&job))
    }

    async fn create_job(&self, job: &Job) -> Result<ClusterJobView> {
        let created = self
            .jobs()
            .create(&PostParams::default(), job)
            .await
            .map_err(Error::from_kube)?;
        info!(job = ?created.metadata.name, namespace = %self.namespace, "created job");
        Ok(ClusterJobView::from_job(&created))
    }

    async fn delete_job(&self, name: &str, ignore_not_found: bool) -> Result<()> {
        let result = self
            .jobs()
            .delete(name, &background_delete())
            .await
            .map(|_| ())
            .map_err(Error::from_kube);
        debug!(job = %name, ok = result.is_ok(), "delete job");
        tolerate_not_found(result, ignore_not_found)
    }

    async fn list_jobs(&self) -> Result<Vec<ClusterJobView>> {
        let jobs = self
            .jobs()
            .list(&ListParams::default())
            .await
            .map_err(Error::from_kube)?;
        Ok(jobs.items.iter().map(ClusterJobView::from_job).collect())
    }

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<ClusterPodView>> {
        let pods = self
            .pods()
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(Error::from_kube)?;
        Ok(pods.items.iter().map(ClusterPodView::from_pod).collect())
    }

    async fn create_pvc(&self, pvc: &PersistentVolumeClaim) -> Result<()> {
        self.pvcs()
            .create(&PostParams::default(), pvc)
            .await
            .map_err(Error::from_kube)?;
        debug!(pvc = ?pvc.metadata.name, "created pvc");
        Ok(())
    }

    async fn delete_pvc(&self, name: &str, ignore_not_found: bool) -> Result<()> {
        let result = self
            .pvcs()
            .delete(name, &background_delete())
            .await
            .map(|_| ())
            .map_err(Error::from_kube);
        tolerate_not_found(result, ignore_not_found)
    }

    async fn create_secret_from_file(
        &self,
        name: &str,
        filename: &str,
        content: &[u8],
        ignore_existing: bool,
    ) -> Result<()> {
        let secrets = self.secrets();

        if ignore_existing && secrets.get_opt(name).await.map_err(Error::from_kube)?.is_some() {
            debug!(secret = %name, "secret already exists");
            return Ok(());
        }

        secrets
            .create(&PostParams::default(), &secret_from_file(name, filename, content))
            .await
            .map_err(Error::from_kube)?;
        info!(secret = %name, namespace = %self.namespace, "created secret");
        Ok(())
    }

    async fn delete_secret(&self, name: &str, ignore_not_found: bool) -> Result<()> {
        let result = self
            .secrets()
            .delete(name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(Error::from_kube);
        tolerate_not_found(result, ignore_not_found)
    }
}
