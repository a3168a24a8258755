use std::fmt;
use std::sync::OnceLock;

use kube::{Resource, ResourceExt};
use regex::Regex;

use crate::{Error, Result};

/// Annotation carrying the logical cluster an object lives in
pub const LOGICAL_CLUSTER_ANNOTATION: &str = "kcp.io/cluster";

/// Annotation carrying the logical path of objects that are referenced by path by other objects.
/// If this annotation exists, the system maintains its value.
pub const LOGICAL_CLUSTER_PATH_ANNOTATION: &str = "kcp.io/path";

/// The name of a single logical cluster, eg `2x7x1a0b8pqm2j7c`
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogicalClusterName(String);

impl LogicalClusterName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn path(&self) -> LogicalClusterPath {
        LogicalClusterPath(self.0.clone())
    }
}

impl fmt::Display for LogicalClusterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A colon-separated path through the workspace hierarchy, eg `root:org:team`.
/// A single cluster name is a valid one-segment path.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LogicalClusterPath(String);

fn path_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(:[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
    })
}

impl LogicalClusterPath {
    pub fn parse(path: &str) -> Result<Self> {
        if !path_regex().is_match(path) {
            return Err(Error::InvalidLogicalClusterPath(path.to_owned()));
        }
        Ok(Self(path.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LogicalClusterPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns the logical cluster an object lives in
pub fn cluster_of<K: Resource>(obj: &K) -> Result<LogicalClusterName> {
    match obj.annotations().get(LOGICAL_CLUSTER_ANNOTATION) {
        Some(cluster) if !cluster.is_empty() => Ok(LogicalClusterName::new(cluster.as_str())),
        _ => Err(Error::MissingLogicalCluster(obj.name_any())),
    }
}

/// Returns the logical path alias of an object, if it carries a valid one
pub fn path_of<K: Resource>(obj: &K) -> Option<LogicalClusterPath> {
    obj.annotations()
        .get(LOGICAL_CLUSTER_PATH_ANNOTATION)
        .filter(|p| !p.is_empty())
        .and_then(|p| LogicalClusterPath::parse(p).ok())
}
