pub mod cluster;
pub mod config;
pub mod informer;
pub mod job;
pub mod manager;
pub mod metrics;
pub mod reconcile;
#[cfg(feature = "server")]
pub mod server;

pub use cluster::{JobApi, KubeJobApi};
pub use job::{new_job, JobBuilder, DEFAULT_NAMESPACE, IDENTITY_LABEL};
pub use manager::{JobManager, ManagerState};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),
    #[error("Bootstrap error: {0}")]
    Bootstrap(String),
    #[error("Watch error: {0}")]
    Watch(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Manager already stopped; create a new manager to start again")]
    AlreadyStopped,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    fn api_status(&self) -> Option<(u16, &str)> {
        match self {
            Error::Kubernetes(kube::Error::Api(resp)) => Some((resp.code, resp.reason.as_str())),
            _ => None,
        }
    }

    /// The requested job does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self.api_status(), Some((404, _)))
    }

    /// Optimistic concurrency failure: the stored resource version moved on.
    pub fn is_conflict(&self) -> bool {
        matches!(self.api_status(), Some((409, reason)) if reason != "AlreadyExists")
    }

    /// A job with the same name already exists in the namespace.
    pub fn is_already_exists(&self) -> bool {
        matches!(self.api_status(), Some((409, "AlreadyExists")))
    }
}

pub type Result<T> = std::result::Result<T, Error>;


#[cfg(test)]
mod tests {
    use super::test_support::api_error;

    #[test]
    fn classifies_api_errors() {
        assert!(api_error(404, "NotFound").is_not_found());
        assert!(api_error(409, "Conflict").is_conflict());
        assert!(!api_error(409, "Conflict").is_already_exists());
        assert!(api_error(409, "AlreadyExists").is_already_exists());
        assert!(!api_error(409, "AlreadyExists").is_conflict());
        assert!(!api_error(500, "InternalError").is_not_found());
    }

    #[test]
    fn non_api_errors_are_unclassified() {
        let err = crate::Error::Watch("stream reset".to_string());
        assert!(!err.is_not_found());
        assert!(!err.is_conflict());
    }
}
