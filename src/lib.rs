use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("SerializationError: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Kube Error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Failed to build request: {0}")]
    RequestError(#[from] kube::core::request::Error),

    #[error("Invalid object key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    #[error("Object {0} has no logical cluster annotation")]
    MissingLogicalCluster(String),

    #[error("Invalid logical cluster path {0:?}")]
    InvalidLogicalClusterPath(String),

    #[error("Index {0} does not exist")]
    IndexNotFound(String),

    #[error("Index {0} is already registered")]
    IndexAlreadyRegistered(String),

    #[error("The {kind} {key} does not exist")]
    NotFound { kind: String, key: String },

    #[error("The {kind} reference {key} resolves to {count} different objects")]
    AmbiguousReference {
        kind: String,
        key: String,
        count: usize,
    },

    #[error("{}", join_errors(.0))]
    Aggregate(Vec<Error>),

    #[error("Patching status of {key} did not complete within {timeout:?}")]
    PatchTimeout { key: String, timeout: Duration },

    #[error("Reconcile of {key} panicked: {message}")]
    Panicked { key: String, message: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Cache of {0} stopped before it synced")]
    CacheNotSynced(&'static str),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

fn join_errors(errors: &[Error]) -> String {
    match errors {
        [single] => single.to_string(),
        errors => format!(
            "[{}]",
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

impl Error {
    /// Aggregates errors into a single one, flattening nested aggregates.
    /// Returns `None` if there is nothing to aggregate.
    pub fn aggregate(errors: Vec<Error>) -> Option<Error> {
        let mut flat = Vec::with_capacity(errors.len());
        for err in errors {
            match err {
                Error::Aggregate(inner) => flat.extend(inner),
                err => flat.push(err),
            }
        }
        match flat.len() {
            0 => None,
            1 => flat.pop(),
            _ => Some(Error::Aggregate(flat)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::KubeError(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    pub fn metric_label(&self) -> &'static str {
        match self {
            Error::SerializationError(_) => "SerializationError",
            Error::KubeError(_) => "KubeError",
            Error::RequestError(_) => "RequestError",
            Error::InvalidKey { .. } => "InvalidKey",
            Error::MissingLogicalCluster(_) => "MissingLogicalCluster",
            Error::InvalidLogicalClusterPath(_) => "InvalidLogicalClusterPath",
            Error::IndexNotFound(_) => "IndexNotFound",
            Error::IndexAlreadyRegistered(_) => "IndexAlreadyRegistered",
            Error::NotFound { .. } => "NotFound",
            Error::AmbiguousReference { .. } => "AmbiguousReference",
            Error::Aggregate(_) => "Aggregate",
            Error::PatchTimeout { .. } => "PatchTimeout",
            Error::Panicked { .. } => "Panicked",
            Error::InvalidConfig(_) => "InvalidConfig",
            Error::CacheNotSynced(_) => "CacheNotSynced",
        }
    }
}

pub mod controllers;

/// Composite keys for queue entries and indices
pub mod keys;

/// Logical cluster names and paths
pub mod logicalcluster;

/// Rate limited work queue
pub mod queue;

/// Indexed object cache and the watches feeding it
pub mod informer;
pub mod store;

/// Process-wide error sink
pub mod runtime;

/// Log and trace integrations
pub mod telemetry;

/// Metrics
mod metrics;

pub use controllers::{Diagnostics, State};
pub use metrics::Metrics;

/// External CRDs
pub mod resources;

#[cfg(test)]
mod tests {
    use super::*;

    fn not_found(key: &str) -> Error {
        Error::NotFound {
            kind: "APIExport".into(),
            key: key.into(),
        }
    }

    #[test]
    fn aggregate_of_nothing_is_none() {
        assert!(Error::aggregate(vec![]).is_none());
    }

    #[test]
    fn aggregate_of_one_is_unwrapped() {
        let err = Error::aggregate(vec![not_found("root|a")]).unwrap();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn aggregate_flattens_nested_aggregates() {
        let nested = Error::Aggregate(vec![not_found("root|a"), not_found("root|b")]);
        let err = Error::aggregate(vec![nested, not_found("root|c")]).unwrap();
        match err {
            Error::Aggregate(errors) => assert_eq!(errors.len(), 3),
            other => panic!("expected aggregate, got {other:?}"),
        }
    }

    #[test]
    fn aggregate_message_joins_members() {
        let err = Error::aggregate(vec![not_found("root|a"), not_found("root|b")]).unwrap();
        assert_eq!(
            err.to_string(),
            "[The APIExport root|a does not exist, The APIExport root|b does not exist]"
        );
    }
}
