use std::collections::BTreeSet;
use std::sync::Arc;

use kube::{Resource, ResourceExt};
use tracing::*;

use crate::keys::reference_key;
use crate::logicalcluster::{cluster_of, path_of, LogicalClusterPath};
use crate::resources::apiexports::ApiExport;
use crate::resources::synctargets::SyncTarget;
use crate::store::Indexer;
use crate::{Error, Result};

/// SyncTargets by the `path|name` of every APIExport they declare
pub const INDEX_SYNC_TARGETS_BY_EXPORT: &str = "kcp-synctarget-export-controllerByExport";
/// APIExports by the `cluster|name` of every APIResourceSchema they serve
pub const INDEX_API_EXPORTS_BY_API_RESOURCE_SCHEMA: &str =
    "kcp-synctarget-export-controllerByAPIResourceSchema";
/// Objects by `cluster|name` and, if annotated, `path|name`
pub const INDEX_BY_LOGICAL_CLUSTER_PATH_AND_NAME: &str = "ByLogicalClusterPathAndName";

pub fn index_sync_targets_by_exports(sync_target: &SyncTarget) -> Vec<String> {
    let cluster = match cluster_of(sync_target) {
        Ok(cluster) => cluster,
        Err(err) => {
            warn!("Not indexing SyncTarget: {err}");
            return vec![];
        }
    };

    let mut keys = BTreeSet::new();
    for reference in &sync_target.spec.supported_api_exports {
        match reference.resolve_path(&cluster) {
            Ok(path) => {
                keys.insert(reference_key(path.as_str(), &reference.export));
            }
            Err(err) => warn!(
                "Not indexing export reference of SyncTarget {cluster}|{}: {err}",
                sync_target.name_any()
            ),
        }
    }
    keys.into_iter().collect()
}

pub fn index_api_exports_by_api_resource_schemas(export: &ApiExport) -> Vec<String> {
    let Ok(cluster) = cluster_of(export) else {
        return vec![];
    };
    export
        .spec
        .latest_resource_schemas
        .iter()
        .map(|schema| reference_key(cluster.as_str(), schema))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

pub fn index_by_logical_cluster_path_and_name<K: Resource>(obj: &K) -> Vec<String> {
    let Ok(cluster) = cluster_of(obj) else {
        return vec![];
    };
    let name = obj.name_any();
    let mut keys = vec![reference_key(cluster.as_str(), &name)];
    if let Some(path) = path_of(obj) {
        let key = reference_key(path.as_str(), &name);
        if !keys.contains(&key) {
            keys.push(key);
        }
    }
    keys
}

/// Looks up an object by logical cluster path or cluster name, and name.
///
/// A path alias and a cluster name must designate the same object; if a key matches more than one
/// object this is reported as a data integrity problem rather than picking one of them.
pub fn get_by_path_and_name<K: Resource>(
    indexer: &impl Indexer<K>,
    path: &LogicalClusterPath,
    name: &str,
) -> Result<Arc<K>>
where
    K::DynamicType: Default,
{
    let key = reference_key(path.as_str(), name);
    let mut objects = indexer.by_index(INDEX_BY_LOGICAL_CLUSTER_PATH_AND_NAME, &key)?;
    let kind = K::kind(&Default::default()).to_string();
    match objects.len() {
        0 => Err(Error::NotFound { kind, key }),
        1 => Ok(objects.remove(0)),
        count => {
            warn!("Data integrity problem: {kind} {key} resolves to {count} objects");
            Err(Error::AmbiguousReference { kind, key, count })
        }
    }
}
