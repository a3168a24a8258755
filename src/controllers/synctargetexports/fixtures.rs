//! Object builders and fakes shared by the controller's tests

use std::collections::BTreeMap;
use std::sync::Arc;

use kube::api::ObjectMeta;
use kube::ResourceExt;

use crate::logicalcluster::{
    cluster_of, path_of, LogicalClusterName, LogicalClusterPath, LOGICAL_CLUSTER_ANNOTATION,
    LOGICAL_CLUSTER_PATH_ANNOTATION,
};
use crate::resources::apiexports::{ApiExport, ApiExportSpec, ApiExportStatus};
use crate::resources::apiresourceimports::{ApiResourceImport, ApiResourceImportSpec, GroupVersion};
use crate::resources::apiresourceschemas::{
    ApiResourceSchema, ApiResourceSchemaSpec, ResourceNames, ResourceVersion,
};
use crate::resources::synctargets::{ExportReference, SyncTarget, SyncTargetSpec, SyncedResource};
use crate::{Error, Result};

use super::reconcilers::Lookups;

pub fn meta(cluster: &str, path: Option<&str>, name: &str) -> ObjectMeta {
    let mut annotations = BTreeMap::from([(LOGICAL_CLUSTER_ANNOTATION.to_string(), cluster.to_string())]);
    if let Some(path) = path {
        annotations.insert(LOGICAL_CLUSTER_PATH_ANNOTATION.to_string(), path.to_string());
    }
    ObjectMeta {
        name: Some(name.into()),
        uid: Some(format!("{cluster}-{name}-uid")),
        resource_version: Some("1".into()),
        generation: Some(1),
        annotations: Some(annotations),
        ..Default::default()
    }
}

pub fn sync_target(cluster: &str, name: &str, exports: Vec<ExportReference>) -> SyncTarget {
    SyncTarget {
        metadata: meta(cluster, None, name),
        spec: SyncTargetSpec {
            supported_api_exports: exports,
        },
        status: None,
    }
}

pub fn api_export(
    cluster: &str,
    path: Option<&str>,
    name: &str,
    schemas: &[&str],
    identity_hash: &str,
) -> ApiExport {
    ApiExport {
        metadata: meta(cluster, path, name),
        spec: ApiExportSpec {
            latest_resource_schemas: schemas.iter().map(|s| s.to_string()).collect(),
        },
        status: Some(ApiExportStatus {
            identity_hash: identity_hash.into(),
        }),
    }
}

pub fn schema(cluster: &str, name: &str, group: &str, plural: &str, versions: &[&str]) -> ApiResourceSchema {
    ApiResourceSchema {
        metadata: meta(cluster, None, name),
        spec: ApiResourceSchemaSpec {
            group: group.into(),
            names: ResourceNames {
                plural: plural.into(),
                kind: String::new(),
            },
            versions: versions
                .iter()
                .enumerate()
                .map(|(i, v)| ResourceVersion {
                    name: v.to_string(),
                    served: true,
                    storage: i == 0,
                })
                .collect(),
        },
    }
}

pub fn api_resource_import(
    cluster: &str,
    name: &str,
    location: &str,
    group: &str,
    version: &str,
    plural: &str,
    generation: i64,
) -> ApiResourceImport {
    let mut metadata = meta(cluster, None, name);
    metadata.generation = Some(generation);
    ApiResourceImport {
        metadata,
        spec: ApiResourceImportSpec {
            location: location.into(),
            group_version: GroupVersion {
                group: group.into(),
                version: version.into(),
            },
            plural: plural.into(),
        },
    }
}

pub fn synced(group: &str, version: &str, resource: &str, identity_hash: &str) -> SyncedResource {
    SyncedResource {
        group: group.into(),
        version: version.into(),
        resource: resource.into(),
        identity_hash: identity_hash.into(),
    }
}

/// In-memory [`Lookups`] resolving exports by cluster name or path annotation
#[derive(Default, Clone)]
pub struct FakeLookups {
    exports: Vec<Arc<ApiExport>>,
    schemas: Vec<Arc<ApiResourceSchema>>,
    imports: Vec<Arc<ApiResourceImport>>,
    fail_imports: bool,
}

impl FakeLookups {
    pub fn with_export(mut self, export: ApiExport) -> Self {
        self.exports.push(Arc::new(export));
        self
    }

    pub fn with_schema(mut self, schema: ApiResourceSchema) -> Self {
        self.schemas.push(Arc::new(schema));
        self
    }

    pub fn with_import(mut self, import: ApiResourceImport) -> Self {
        self.imports.push(Arc::new(import));
        self
    }

    pub fn failing_imports(mut self) -> Self {
        self.fail_imports = true;
        self
    }
}

impl Lookups for FakeLookups {
    fn get_api_export(&self, path: &LogicalClusterPath, name: &str) -> Result<Arc<ApiExport>> {
        self.exports
            .iter()
            .find(|e| {
                let by_cluster = cluster_of(e.as_ref()).is_ok_and(|c| c.as_str() == path.as_str());
                let by_path = path_of(e.as_ref()).is_some_and(|p| &p == path);
                e.name_any() == name && (by_cluster || by_path)
            })
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "APIExport".into(),
                key: format!("{path}|{name}"),
            })
    }

    fn get_resource_schema(
        &self,
        cluster: &LogicalClusterName,
        name: &str,
    ) -> Result<Arc<ApiResourceSchema>> {
        self.schemas
            .iter()
            .find(|s| s.name_any() == name && cluster_of(s.as_ref()).is_ok_and(|c| &c == cluster))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "APIResourceSchema".into(),
                key: format!("{cluster}|{name}"),
            })
    }

    fn list_api_resource_imports(
        &self,
        cluster: &LogicalClusterName,
    ) -> Result<Vec<Arc<ApiResourceImport>>> {
        if self.fail_imports {
            return Err(Error::IndexNotFound("imports".into()));
        }
        Ok(self
            .imports
            .iter()
            .filter(|i| cluster_of(i.as_ref()).is_ok_and(|c| &c == cluster))
            .cloned()
            .collect())
    }
}
