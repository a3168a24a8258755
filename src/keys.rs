use std::fmt;
use std::str::FromStr;

use kube::{Resource, ResourceExt};

use crate::logicalcluster::{cluster_of, LogicalClusterName};
use crate::{Error, Result};

const CLUSTER_SEPARATOR: char = '|';
const NAMESPACE_SEPARATOR: char = '/';

/// Identifies an object across all logical clusters.
///
/// The textual form is `cluster|namespace/name`, or `cluster|name` for cluster scoped objects.
/// It is used for work queue entries as well as index values.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    pub cluster: LogicalClusterName,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(cluster: LogicalClusterName, namespace: Option<String>, name: impl Into<String>) -> Self {
        Self {
            cluster,
            namespace: namespace.filter(|ns| !ns.is_empty()),
            name: name.into(),
        }
    }

    pub fn cluster_scoped(cluster: LogicalClusterName, name: impl Into<String>) -> Self {
        Self::new(cluster, None, name)
    }

    pub fn for_object<K: Resource>(obj: &K) -> Result<Self> {
        let name = obj.meta().name.clone().filter(|n| !n.is_empty()).ok_or_else(|| {
            Error::InvalidKey {
                key: obj.name_any(),
                reason: "object has no name".into(),
            }
        })?;
        Ok(Self::new(cluster_of(obj)?, obj.namespace(), name))
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(
                f,
                "{}{CLUSTER_SEPARATOR}{ns}{NAMESPACE_SEPARATOR}{}",
                self.cluster, self.name
            ),
            None => write!(f, "{}{CLUSTER_SEPARATOR}{}", self.cluster, self.name),
        }
    }
}

impl FromStr for ObjectKey {
    type Err = Error;

    fn from_str(key: &str) -> Result<Self> {
        let invalid = |reason: &str| Error::InvalidKey {
            key: key.to_owned(),
            reason: reason.to_owned(),
        };

        let (cluster, rest) = key
            .split_once(CLUSTER_SEPARATOR)
            .ok_or_else(|| invalid("missing cluster separator"))?;
        if cluster.is_empty() {
            return Err(invalid("empty cluster"));
        }
        if rest.contains(CLUSTER_SEPARATOR) {
            return Err(invalid("more than one cluster separator"));
        }

        let (namespace, name) = match rest.split_once(NAMESPACE_SEPARATOR) {
            Some((ns, name)) if ns.is_empty() => return Err(invalid(&format!("empty namespace for {name}"))),
            Some((ns, name)) => (Some(ns.to_owned()), name),
            None => (None, rest),
        };
        if name.is_empty() {
            return Err(invalid("empty name"));
        }
        if name.contains(NAMESPACE_SEPARATOR) {
            return Err(invalid("more than one namespace separator"));
        }

        Ok(Self::new(LogicalClusterName::new(cluster), namespace, name))
    }
}

/// Composite key addressing an object by `clusterOrPath|name`.
/// Used by indices that map references to the objects declaring them.
pub fn reference_key(cluster_or_path: &str, name: &str) -> String {
    format!("{cluster_or_path}{CLUSTER_SEPARATOR}{name}")
}
