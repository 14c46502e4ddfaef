//! Typed job change feed built on top of the raw watch stream.
//!
//! The informer remembers the last version of every job it has seen so that
//! each update can be delivered as a `(previous, current)` pair, and it
//! redelivers the whole cache every resync period.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::batch::v1::Job;
use kube::{runtime::watcher, ResourceExt};
use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{cluster::JobApi, metrics};

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Added(Job),
    Updated {
        previous: Box<Job>,
        current: Box<Job>,
    },
    Deleted(Job),
}

impl JobEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            JobEvent::Added(_) => "added",
            JobEvent::Updated { .. } => "updated",
            JobEvent::Deleted(_) => "deleted",
        }
    }
}

fn cache_key(job: &Job) -> String {
    format!("{}/{}", job.namespace().unwrap_or_default(), job.name_any())
}

pub struct JobInformer {
    api: Arc<dyn JobApi>,
    resync: Duration,
    cache: HashMap<String, Job>,
}

impl JobInformer {
    pub fn new(api: Arc<dyn JobApi>, resync: Duration) -> Self {
        Self {
            api,
            resync,
            cache: HashMap::new(),
        }
    }

    /// Pumps events into `tx` until `shutdown` flips, the watch stream ends,
    /// or the receiving side goes away.
    pub async fn run(mut self, tx: mpsc::Sender<JobEvent>, mut shutdown: watch::Receiver<bool>) {
        if *shutdown.borrow() {
            return;
        }

        info!("Starting job informer (resync every {:?})", self.resync);
        let mut stream = self.api.watch();
        let mut ticker = time::interval_at(Instant::now() + self.resync, self.resync);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let events = tokio::select! {
                _ = shutdown.changed() => break,
                _ = ticker.tick() => self.resync(),
                next = stream.next() => match next {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(e)) => {
                        metrics::WATCH_ERRORS_TOTAL.inc();
                        warn!("Job watch error: {}", e);
                        continue;
                    }
                    None => {
                        info!("Job watch stream ended");
                        break;
                    }
                },
            };

            for event in events {
                metrics::WATCH_EVENTS_TOTAL
                    .with_label_values(&[event.kind()])
                    .inc();
                tokio::select! {
                    sent = tx.send(event) => {
                        if sent.is_err() {
                            debug!("Event receiver dropped, stopping informer");
                            return;
                        }
                    }
                    _ = shutdown.changed() => return,
                }
            }
        }

        info!("Job informer stopped");
    }

    /// Folds one watch event into the cache and returns what changed.
    pub fn apply(&mut self, event: watcher::Event<Job>) -> Vec<JobEvent> {
        match event {
            watcher::Event::Applied(job) => vec![self.upsert(job)],
            watcher::Event::Deleted(job) => {
                self.cache.remove(&cache_key(&job));
                vec![JobEvent::Deleted(job)]
            }
            watcher::Event::Restarted(jobs) => {
                let listed: HashSet<String> = jobs.iter().map(cache_key).collect();
                let mut stale: Vec<String> = self
                    .cache
                    .keys()
                    .filter(|key| !listed.contains(*key))
                    .cloned()
                    .collect();
                stale.sort();

                let mut events: Vec<JobEvent> = stale
                    .into_iter()
                    .filter_map(|key| self.cache.remove(&key))
                    .map(JobEvent::Deleted)
                    .collect();
                events.extend(jobs.into_iter().map(|job| self.upsert(job)));
                events
            }
        }
    }

    /// Redelivers every cached job as an update to itself.
    pub fn resync(&self) -> Vec<JobEvent> {
        debug!("Resyncing {} cached job(s)", self.cache.len());
        let mut keys: Vec<&String> = self.cache.keys().collect();
        keys.sort();
        keys.into_iter()
            .map(|key| {
                let job = &self.cache[key];
                JobEvent::Updated {
                    previous: Box::new(job.clone()),
                    current: Box::new(job.clone()),
                }
            })
            .collect()
    }

    fn upsert(&mut self, job: Job) -> JobEvent {
        match self.cache.insert(cache_key(&job), job.clone()) {
            Some(previous) => JobEvent::Updated {
                previous: Box::new(previous),
                current: Box::new(job),
            },
            None => JobEvent::Added(job),
        }
    }
}
