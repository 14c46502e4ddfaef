//! Access to the cluster's batch/v1 Job resources.
//!
//! Everything the manager needs from the control plane goes through the
//! [`JobApi`] trait so a fake cluster can stand in during tests.

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use k8s_openapi::api::batch::v1::Job;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    runtime::{watcher, WatchStreamExt},
    Client,
};
use tracing::info;

use crate::{Error, Result};

/// Stream of raw watch events for jobs in every namespace.
pub type JobWatchStream = BoxStream<'static, Result<watcher::Event<Job>>>;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobApi: Send + Sync {
    async fn create(&self, namespace: &str, job: &Job) -> Result<Job>;

    async fn get(&self, namespace: &str, name: &str) -> Result<Job>;

    /// Full replace. The job's resource version is checked by the server.
    async fn replace(&self, namespace: &str, job: &Job) -> Result<Job>;

    /// Deletes with background propagation; dependents are removed by the
    /// cluster after this returns.
    async fn delete(&self, namespace: &str, name: &str) -> Result<()>;

    /// Lists jobs in `namespace`, or in every namespace when it is empty.
    async fn list(&self, namespace: &str) -> Result<Vec<Job>>;

    /// Opens a cluster-wide watch on jobs.
    fn watch(&self) -> JobWatchStream;
}

/// [`JobApi`] backed by a live `kube::Client`.
#[derive(Clone)]
pub struct KubeJobApi {
    client: Client,
}

impl KubeJobApi {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Builds a client from the pod's service account. There is no retry:
    /// a failure here means the process is not running inside a cluster.
    pub fn in_cluster() -> Result<Self> {
        let config = kube::Config::incluster()
            .map_err(|e| Error::Bootstrap(format!("in-cluster config unavailable: {}", e)))?;
        let client = Client::try_from(config)
            .map_err(|e| Error::Bootstrap(format!("failed to build client: {}", e)))?;
        info!("Using in-cluster credentials");
        Ok(Self::new(client))
    }

    fn namespaced(&self, namespace: &str) -> Api<Job> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl JobApi for KubeJobApi {
    async fn create(&self, namespace: &str, job: &Job) -> Result<Job> {
        Ok(self
            .namespaced(namespace)
            .create(&PostParams::default(), job)
            .await?)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Job> {
        Ok(self.namespaced(namespace).get(name).await?)
    }

    async fn replace(&self, namespace: &str, job: &Job) -> Result<Job> {
        let name = job
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::Validation("cannot replace a job without a name".to_string()))?;
        Ok(self
            .namespaced(namespace)
            .replace(name, &PostParams::default(), job)
            .await?)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
        self.namespaced(namespace)
            .delete(name, &DeleteParams::background())
            .await?;
        Ok(())
    }

    async fn list(&self, namespace: &str) -> Result<Vec<Job>> {
        let api: Api<Job> = if namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            self.namespaced(namespace)
        };
        Ok(api.list(&ListParams::default()).await?.items)
    }

    fn watch(&self) -> JobWatchStream {
        let jobs: Api<Job> = Api::all(self.client.clone());
        watcher(jobs, watcher::Config::default())
            .default_backoff()
            .map_err(|e| Error::Watch(e.to_string()))
            .boxed()
    }
}
