//! Job construction and identity labelling.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use uuid::Uuid;

use crate::{Error, Result};

pub const DEFAULT_NAMESPACE: &str = "default";

/// Label stamped on every job submitted through the manager.
pub const IDENTITY_LABEL: &str = "kobs-id";

const RESTART_POLICY_NEVER: &str = "Never";

/// Generates a new identity value.
///
/// UUIDv7 strings sort by creation time and stay within the 63 character
/// label value limit.
pub fn new_identity() -> String {
    Uuid::now_v7().hyphenated().to_string()
}

/// Writes a fresh identity label onto `job`, creating the label map if needed.
pub(crate) fn stamp_identity(job: &mut Job) -> String {
    let id = new_identity();
    job.metadata
        .labels
        .get_or_insert_with(BTreeMap::new)
        .insert(IDENTITY_LABEL.to_string(), id.clone());
    id
}

/// Builds a never-restarting job in the default namespace running `command`
/// in `image`. Parallelism, completions, deadlines and backoff are left to
/// cluster defaults.
pub fn new_job<I, S>(name: &str, image: &str, command: I) -> Job
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let command = command.into_iter().map(Into::into).collect();
    manifest(name, DEFAULT_NAMESPACE, image, command, Vec::new(), None, None)
}

/// Builder for jobs that need more than [`new_job`] offers.
#[derive(Debug, Clone, Default)]
pub struct JobBuilder {
    name: String,
    image: String,
    namespace: Option<String>,
    command: Vec<String>,
    args: Vec<String>,
    env: Vec<EnvVar>,
    labels: BTreeMap<String, String>,
}

impl JobBuilder {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push(EnvVar {
            name: name.into(),
            value: Some(value.into()),
            ..Default::default()
        });
        self
    }

    /// Adds a label to the job. The identity label is reserved and is
    /// replaced when the job is created.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn build(self) -> Result<Job> {
        if self.name.trim().is_empty() {
            return Err(Error::Validation("job name must not be empty".to_string()));
        }
        if self.image.trim().is_empty() {
            return Err(Error::Validation(format!(
                "job '{}' has no container image",
                self.name
            )));
        }

        let namespace = self
            .namespace
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let env = (!self.env.is_empty()).then_some(self.env);
        let labels = (!self.labels.is_empty()).then_some(self.labels);

        Ok(manifest(
            &self.name,
            &namespace,
            &self.image,
            self.command,
            self.args,
            env,
            labels,
        ))
    }
}

fn manifest(
    name: &str,
    namespace: &str,
    image: &str,
    command: Vec<String>,
    args: Vec<String>,
    env: Option<Vec<EnvVar>>,
    labels: Option<BTreeMap<String, String>>,
) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels,
            ..Default::default()
        },
        spec: Some(JobSpec {
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    name: Some(name.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: name.to_string(),
                        image: Some(image.to_string()),
                        command: Some(command),
                        args: Some(args),
                        env,
                        ..Default::default()
                    }],
                    restart_policy: Some(RESTART_POLICY_NEVER.to_string()),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}
