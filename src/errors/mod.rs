use thiserror::Error;

use crate::predicate::PredicateError;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error(transparent)]
    Selection(#[from] SelectionError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Proxmox API error: {0}")]
    Api(#[from] ApiError),

    #[error("invalid provider data: {0}")]
    InvalidConfig(#[from] serde_yaml::Error),

    #[error("failed to pick storage for additional disk {index}: {source}")]
    AdditionalDisk {
        index: usize,
        #[source]
        source: SelectionError,
    },

    #[error("{0}")]
    InconsistentState(String),

    #[error("failed to build cloud-init volume: {0}")]
    CloudInit(String),

    #[error("failed to generate schematic: {0}")]
    Schematic(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),
}

impl ProviderError {
    /// Cancellation is not an operational fault; callers use this to keep it
    /// out of error logs.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProviderError::Cancelled(_))
    }

    pub fn inconsistent(message: impl Into<String>) -> Self {
        ProviderError::InconsistentState(message.into())
    }
}

/// Host and storage selection failures. All of them are terminal and carry
/// the identifier or expression the operator has to fix.
#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("no nodes available")]
    NoNodes,

    #[error("specified node {node:?} not found in cluster")]
    NodeNotFound { node: String },

    #[error("specified node {node:?} is not online (status: {status})")]
    NodeOffline { node: String, status: String },

    #[error("failed to pick the disk: no matches for the condition \"{selector}\"")]
    NoStorageMatch { selector: String },

    #[error("invalid storage selector \"{selector}\": {source}")]
    InvalidSelector {
        selector: String,
        #[source]
        source: PredicateError,
    },

    #[error("failed to evaluate storage selector \"{selector}\" for storage {storage:?}: {source}")]
    SelectorEvaluation {
        selector: String,
        storage: String,
        #[source]
        source: PredicateError,
    },

    #[error("node {node:?} has no storage accepting ISO images")]
    NoIsoStorage { node: String },

    #[error("failed to list storages on node {node:?}: {source}")]
    StorageListing {
        node: String,
        #[source]
        source: ApiError,
    },
}

#[derive(Error, Debug)]
pub enum TaskError {
    /// The remote task finished without success. `status` is the task status
    /// text exactly as Proxmox reported it.
    #[error("{status}{}", .exit_status.as_deref().map(|e| format!(" ({e})")).unwrap_or_default())]
    Failed {
        upid: String,
        status: String,
        exit_status: Option<String>,
    },

    #[error("malformed task id {upid:?}")]
    MalformedUpid { upid: String },
}

impl TaskError {
    pub fn status(&self) -> Option<&str> {
        match self {
            TaskError::Failed { status, .. } => Some(status),
            TaskError::MalformedUpid { .. } => None,
        }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{method} {path} returned status {status}: {body}")]
    Status {
        method: String,
        path: String,
        status: u16,
        body: String,
    },

    #[error("unexpected response from {path}: {message}")]
    Decode { path: String, message: String },

    #[error("{resource} does not exist")]
    NotFound { resource: String },

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("invalid API endpoint {url:?}: {message}")]
    InvalidEndpoint { url: String, message: String },
}

impl ApiError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound { .. })
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_quotes_selector() {
        let err = ProviderError::from(SelectionError::NoStorageMatch {
            selector: r#"storageType == "zfspool""#.to_string(),
        });
        assert!(err.to_string().contains(r#"storageType == "zfspool""#));
    }

    #[test]
    fn test_task_failure_displays_remote_status_verbatim() {
        let err = ProviderError::from(TaskError::Failed {
            upid: "UPID:pve1:0001:0002:0003:qmstart:100:root@pam:".to_string(),
            status: "stopped".to_string(),
            exit_status: Some("unable to start".to_string()),
        });
        assert_eq!(err.to_string(), "stopped (unable to start)");
    }

    #[test]
    fn test_cancelled_is_distinct() {
        assert!(ProviderError::Cancelled("context canceled".into()).is_cancelled());
        assert!(!ProviderError::inconsistent("broken").is_cancelled());
    }
}
