//! Job lifecycle manager.
//!
//! CRUD calls go straight to the cluster. `start` spawns two tasks: the
//! [`JobInformer`] producing typed change events, and a single consumer that
//! runs [`reconcile`] on each update and deletes jobs that have finished.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use k8s_openapi::api::batch::v1::Job;
use kube::{Client, ResourceExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    cluster::{JobApi, KubeJobApi},
    config::DEFAULT_RESYNC,
    informer::{JobEvent, JobInformer},
    job::{stamp_identity, DEFAULT_NAMESPACE},
    metrics,
    reconcile::{reconcile, Action},
    Error, Result,
};

const DEFAULT_EVENT_BUFFER: usize = 100;
const ERROR_SINK_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ManagerState {
    Idle,
    Running,
    Stopped,
}

struct Lifecycle {
    state: ManagerState,
    shutdown: Option<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct JobManager {
    api: Arc<dyn JobApi>,
    lifecycle: Mutex<Lifecycle>,
    errors: broadcast::Sender<Arc<Error>>,
    event_buffer: usize,
}

/// Zero means "use the default" so a resync always happens.
pub fn effective_resync(resync: Duration) -> Duration {
    if resync.is_zero() {
        DEFAULT_RESYNC
    } else {
        resync
    }
}

impl JobManager {
    pub fn new(api: Arc<dyn JobApi>) -> Self {
        let (errors, _) = broadcast::channel(ERROR_SINK_CAPACITY);
        Self {
            api,
            lifecycle: Mutex::new(Lifecycle {
                state: ManagerState::Idle,
                shutdown: None,
                tasks: Vec::new(),
            }),
            errors,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    /// Uses `client` when given, otherwise the pod's in-cluster credentials.
    /// A bootstrap error is not retryable and should end the process.
    pub fn connect(client: Option<Client>) -> Result<Self> {
        let api = match client {
            Some(client) => KubeJobApi::new(client),
            None => KubeJobApi::in_cluster()?,
        };
        Ok(Self::new(Arc::new(api)))
    }

    pub fn with_event_buffer(mut self, capacity: usize) -> Self {
        self.event_buffer = capacity.max(1);
        self
    }

    /// Receives every cleanup failure from the reconcile loop. Failures are
    /// dropped when nobody is subscribed.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<Arc<Error>> {
        self.errors.subscribe()
    }

    pub fn state(&self) -> ManagerState {
        self.lock().state
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        // Poisoning is ignored: fields are only ever assigned whole.
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Submits `job` with a fresh identity label, in the default namespace
    /// if none is set.
    pub async fn create(&self, mut job: Job) -> Result<Job> {
        let namespace = job
            .metadata
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        job.metadata.namespace = Some(namespace.clone());
        let id = stamp_identity(&mut job);

        let created = self.api.create(&namespace, &job).await?;
        metrics::JOBS_CREATED_TOTAL.inc();
        info!("Created job {}/{} ({})", namespace, created.name_any(), id);
        Ok(created)
    }

    pub async fn get(&self, name: &str, namespace: &str) -> Result<Job> {
        self.api.get(namespace, name).await
    }

    /// Replaces the stored job. Fails with a conflict if `job` carries a stale
    /// resource version; re-fetch and retry in that case.
    pub async fn update(&self, job: &Job) -> Result<Job> {
        let namespace = job
            .namespace()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        self.api.replace(&namespace, job).await
    }

    /// Deletes the job and lets the cluster remove its pods in the background.
    /// Deleting a job that does not exist is an error.
    pub async fn delete(&self, name: &str, namespace: &str) -> Result<()> {
        self.api.delete(namespace, name).await?;
        info!("Deleted job {}/{}", namespace, name);
        Ok(())
    }

    /// Lists jobs in `namespace`; an empty namespace lists the whole cluster.
    pub async fn list(&self, namespace: &str) -> Result<Vec<Job>> {
        self.api.list(namespace).await
    }

    /// Starts watching jobs and reaping finished ones.
    ///
    /// The watch always covers the whole cluster; a non-empty `namespace`
    /// restricts which jobs get reaped. Calling this while running does
    /// nothing. A stopped manager cannot be restarted. Must be called from
    /// within a Tokio runtime.
    pub fn start(&self, namespace: &str, resync: Duration) -> Result<()> {
        let mut lifecycle = self.lock();
        match lifecycle.state {
            ManagerState::Running => {
                debug!("Job manager already running");
                return Ok(());
            }
            ManagerState::Stopped => return Err(Error::AlreadyStopped),
            ManagerState::Idle => {}
        }

        let resync = effective_resync(resync);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (events_tx, events_rx) = mpsc::channel(self.event_buffer);

        let informer = JobInformer::new(self.api.clone(), resync);
        let informer_shutdown = shutdown_rx.clone();
        let informer_task = tokio::spawn(async move {
            informer.run(events_tx, informer_shutdown).await;
        });

        let reaper = Reaper {
            api: self.api.clone(),
            errors: self.errors.clone(),
            namespace: namespace.to_string(),
        };
        let reaper_task = tokio::spawn(reaper.run(events_rx, shutdown_rx));

        lifecycle.shutdown = Some(shutdown_tx);
        lifecycle.tasks = vec![informer_task, reaper_task];
        lifecycle.state = ManagerState::Running;

        if namespace.is_empty() {
            info!("Job manager started for all namespaces");
        } else {
            info!("Job manager started for namespace {}", namespace);
        }
        Ok(())
    }

    /// Stops delivering events. Safe to call in any state and more than once.
    /// A deletion already in flight is allowed to finish.
    pub fn stop(&self) {
        let mut lifecycle = self.lock();
        if lifecycle.state == ManagerState::Stopped {
            return;
        }
        if let Some(shutdown) = lifecycle.shutdown.take() {
            let _ = shutdown.send(true);
        }
        lifecycle.state = ManagerState::Stopped;
        info!("Job manager stopped");
    }

    /// Stops and waits for the background tasks to exit.
    pub async fn shutdown(&self) {
        self.stop();
        let tasks = std::mem::take(&mut self.lock().tasks);
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Job manager task ended abnormally: {}", e);
            }
        }
    }
}

/// Single consumer of informer events.
struct Reaper {
    api: Arc<dyn JobApi>,
    errors: broadcast::Sender<Arc<Error>>,
    namespace: String,
}

impl Reaper {
    async fn run(self, mut events: mpsc::Receiver<JobEvent>, mut shutdown: watch::Receiver<bool>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if *shutdown.borrow() {
                break;
            }
            self.handle(event).await;
        }
        debug!("Reconcile loop exited");
    }

    async fn handle(&self, event: JobEvent) {
        let (previous, current) = match event {
            JobEvent::Updated { previous, current } => (previous, current),
            JobEvent::Added(_) | JobEvent::Deleted(_) => return,
        };

        if !self.namespace.is_empty()
            && current.namespace().as_deref() != Some(self.namespace.as_str())
        {
            return;
        }

        match reconcile(&previous, &current) {
            Action::Ignore(reason) => {
                debug!("Skipping job {}: {:?}", current.name_any(), reason);
            }
            Action::Delete { name, namespace } => {
                match self.api.delete(&namespace, &name).await {
                    Ok(()) => {
                        metrics::JOBS_REAPED_TOTAL.inc();
                        info!("Deleted finished job {}/{}", namespace, name);
                    }
                    Err(e) => {
                        metrics::REAP_FAILURES_TOTAL.inc();
                        warn!("Failed to delete finished job {}/{}: {}", namespace, name, e);
                        // No subscribers is fine; the error is dropped.
                        let _ = self.errors.send(Arc::new(e));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{JobWatchStream, MockJobApi};
    use crate::job::{new_job, IDENTITY_LABEL};
    use crate::reconcile::tests::job_with_status;
    use crate::test_support::api_error;
    use async_trait::async_trait;
    use futures::channel::mpsc as fmpsc;
    use futures::{stream, StreamExt};
    use kube::runtime::watcher;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::timeout;
    use tokio_test::assert_ok;

    type WatchItem = Result<watcher::Event<Job>>;

    /// In-memory cluster: a hand-fed watch stream plus a record of deletes.
    struct FakeCluster {
        watch_rx: Mutex<Option<fmpsc::UnboundedReceiver<WatchItem>>>,
        watch_calls: AtomicUsize,
        deletes: mpsc::UnboundedSender<(String, String)>,
        missing: HashSet<String>,
    }

    struct Harness {
        cluster: Arc<FakeCluster>,
        feed: fmpsc::UnboundedSender<WatchItem>,
        deletes: mpsc::UnboundedReceiver<(String, String)>,
    }

    impl Harness {
        fn new(missing: &[&str]) -> Self {
            let (feed, watch_rx) = fmpsc::unbounded();
            let (deletes_tx, deletes) = mpsc::unbounded_channel();
            let cluster = Arc::new(FakeCluster {
                watch_rx: Mutex::new(Some(watch_rx)),
                watch_calls: AtomicUsize::new(0),
                deletes: deletes_tx,
                missing: missing.iter().map(|s| s.to_string()).collect(),
            });
            Self {
                cluster,
                feed,
                deletes,
            }
        }

        fn manager(&self) -> JobManager {
            JobManager::new(self.cluster.clone())
        }

        /// Feeds a running-then-finished pair for `name`.
        fn finish(&self, name: &str, namespace: &str) {
            self.apply(job_with_status(name, namespace, 1, None));
            self.apply(job_with_status(name, namespace, 0, Some("Complete")));
        }

        fn apply(&self, job: Job) {
            let _ = self.feed.unbounded_send(Ok(watcher::Event::Applied(job)));
        }

        async fn next_delete(&mut self) -> (String, String) {
            timeout(Duration::from_secs(5), self.deletes.recv())
                .await
                .expect("timed out waiting for a delete")
                .expect("delete channel closed")
        }
    }

    #[async_trait]
    impl JobApi for FakeCluster {
        async fn create(&self, _namespace: &str, job: &Job) -> Result<Job> {
            Ok(job.clone())
        }

        async fn get(&self, _namespace: &str, _name: &str) -> Result<Job> {
            Err(api_error(404, "NotFound"))
        }

        async fn replace(&self, _namespace: &str, job: &Job) -> Result<Job> {
            Ok(job.clone())
        }

        async fn delete(&self, namespace: &str, name: &str) -> Result<()> {
            let _ = self.deletes.send((name.to_string(), namespace.to_string()));
            if self.missing.contains(name) {
                return Err(api_error(404, "NotFound"));
            }
            Ok(())
        }

        async fn list(&self, _namespace: &str) -> Result<Vec<Job>> {
            Ok(Vec::new())
        }

        fn watch(&self) -> JobWatchStream {
            self.watch_calls.fetch_add(1, Ordering::SeqCst);
            match self.watch_rx.lock().unwrap().take() {
                Some(rx) => rx.boxed(),
                None => stream::pending::<WatchItem>().boxed(),
            }
        }
    }

    #[tokio::test]
    async fn create_defaults_namespace_and_stamps_identity() {
        let mut api = MockJobApi::new();
        api.expect_create()
            .withf(|namespace, _| namespace == "default")
            .times(2)
            .returning(|_, job| Ok(job.clone()));
        let manager = JobManager::new(Arc::new(api));

        let mut job = new_job("batch-1", "alpine", ["echo", "hi"]);
        job.metadata.namespace = None;
        let first = manager.create(job.clone()).await.unwrap();
        let second = manager.create(job).await.unwrap();

        assert_eq!(first.metadata.namespace.as_deref(), Some("default"));
        let first_labels = first.metadata.labels.unwrap();
        let second_labels = second.metadata.labels.unwrap();
        assert_eq!(first_labels.len(), 1);
        assert_ne!(
            first_labels.get(IDENTITY_LABEL),
            second_labels.get(IDENTITY_LABEL)
        );
    }

    #[tokio::test]
    async fn create_keeps_caller_labels() {
        let mut api = MockJobApi::new();
        api.expect_create()
            .withf(|namespace, _| namespace == "batch")
            .returning(|_, job| Ok(job.clone()));
        let manager = JobManager::new(Arc::new(api));

        let job = crate::JobBuilder::new("etl", "alpine")
            .namespace("batch")
            .label("team", "data")
            .build()
            .unwrap();
        let created = manager.create(job).await.unwrap();
        let labels = created.metadata.labels.unwrap();
        assert_eq!(labels.len(), 2);
        assert!(labels.contains_key(IDENTITY_LABEL));
    }

    #[tokio::test]
    async fn crud_errors_pass_through() {
        let mut api = MockJobApi::new();
        api.expect_create()
            .returning(|_, _| Err(api_error(409, "AlreadyExists")));
        api.expect_get()
            .withf(|namespace, name| namespace == "default" && name == "nope")
            .returning(|_, _| Err(api_error(404, "NotFound")));
        api.expect_replace()
            .returning(|_, _| Err(api_error(409, "Conflict")));
        api.expect_delete()
            .returning(|_, _| Err(api_error(404, "NotFound")));
        let manager = JobManager::new(Arc::new(api));

        let job = new_job("batch-1", "alpine", ["true"]);
        assert!(manager.create(job.clone()).await.unwrap_err().is_already_exists());
        assert!(manager.get("nope", "default").await.unwrap_err().is_not_found());
        assert!(manager.update(&job).await.unwrap_err().is_conflict());
        assert!(manager.delete("batch-1", "default").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn list_passes_namespace_through() {
        let mut api = MockJobApi::new();
        api.expect_list()
            .withf(|namespace| namespace.is_empty())
            .times(1)
            .returning(|_| Ok(vec![job_with_status("a", "x", 0, None)]));
        let manager = JobManager::new(Arc::new(api));

        let jobs = assert_ok!(manager.list("").await);
        assert_eq!(jobs.len(), 1);
    }

    #[test]
    fn zero_resync_uses_default() {
        assert_eq!(effective_resync(Duration::ZERO), DEFAULT_RESYNC);
        assert_eq!(
            effective_resync(Duration::from_secs(5)),
            Duration::from_secs(5)
        );
    }

    #[tokio::test]
    async fn finished_job_is_deleted_once() {
        let mut harness = Harness::new(&[]);
        let manager = harness.manager();
        manager.start("", Duration::from_secs(3600)).unwrap();

        harness.finish("batch-1", "default");
        assert_eq!(
            harness.next_delete().await,
            ("batch-1".to_string(), "default".to_string())
        );

        // Redelivery of the finished job is a no-op; the marker proves it.
        harness.apply(job_with_status("batch-1", "default", 0, Some("Complete")));
        harness.finish("marker", "default");
        assert_eq!(harness.next_delete().await.0, "marker");

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn running_job_is_not_deleted() {
        let mut harness = Harness::new(&[]);
        let manager = harness.manager();
        manager.start("", Duration::from_secs(3600)).unwrap();

        harness.apply(job_with_status("busy", "default", 1, None));
        harness.apply(job_with_status("busy", "default", 3, None));
        harness.finish("marker", "default");
        assert_eq!(harness.next_delete().await.0, "marker");

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn failed_cleanup_does_not_stop_the_loop() {
        let mut harness = Harness::new(&["ghost"]);
        let manager = harness.manager();
        manager.start("", Duration::from_secs(3600)).unwrap();

        harness.finish("ghost", "default");
        harness.finish("batch-2", "default");
        assert_eq!(harness.next_delete().await.0, "ghost");
        assert_eq!(harness.next_delete().await.0, "batch-2");
        assert_eq!(manager.state(), ManagerState::Running);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn cleanup_errors_reach_subscribers() {
        let mut harness = Harness::new(&["ghost"]);
        let manager = harness.manager();
        let mut errors = manager.subscribe_errors();
        let mut other = manager.subscribe_errors();
        manager.start("", Duration::from_secs(3600)).unwrap();

        harness.finish("ghost", "default");
        harness.next_delete().await;

        let err = timeout(Duration::from_secs(5), errors.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(err.is_not_found());
        assert!(other.recv().await.unwrap().is_not_found());

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn namespace_restricts_reaping() {
        let mut harness = Harness::new(&[]);
        let manager = harness.manager();
        manager.start("batch", Duration::from_secs(3600)).unwrap();

        harness.finish("elsewhere", "default");
        harness.finish("mine", "batch");
        assert_eq!(
            harness.next_delete().await,
            ("mine".to_string(), "batch".to_string())
        );

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn second_start_does_not_resubscribe() {
        let mut harness = Harness::new(&[]);
        let manager = harness.manager();
        manager.start("", Duration::ZERO).unwrap();
        manager.start("", Duration::ZERO).unwrap();

        harness.finish("batch-1", "default");
        harness.next_delete().await;
        assert_eq!(harness.cluster.watch_calls.load(Ordering::SeqCst), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn lifecycle_transitions() {
        let harness = Harness::new(&[]);
        let manager = harness.manager();
        assert_eq!(manager.state(), ManagerState::Idle);

        manager.start("", Duration::ZERO).unwrap();
        assert_eq!(manager.state(), ManagerState::Running);

        manager.stop();
        manager.stop();
        assert_eq!(manager.state(), ManagerState::Stopped);
        assert!(matches!(
            manager.start("", Duration::ZERO),
            Err(Error::AlreadyStopped)
        ));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn stop_before_start_is_safe() {
        let harness = Harness::new(&[]);
        let manager = harness.manager();
        manager.stop();
        manager.shutdown().await;
        assert_eq!(manager.state(), ManagerState::Stopped);
        assert_eq!(harness.cluster.watch_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_deletes_after_shutdown() {
        let mut harness = Harness::new(&[]);
        let manager = harness.manager();
        manager.start("", Duration::from_secs(3600)).unwrap();

        harness.finish("batch-1", "default");
        harness.next_delete().await;
        manager.shutdown().await;

        harness.finish("late", "default");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(harness.deletes.try_recv().is_err());
    }
}
