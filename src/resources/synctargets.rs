use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::logicalcluster::{LogicalClusterName, LogicalClusterPath};
use crate::Result;

/// SyncTarget describes a member cluster capable of running workloads.
/// It declares the APIExports it wants to support; the controller reports in status
/// which resources of those exports it can actually sync.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "SyncTarget",
    group = "workload.kcp.io",
    version = "v1alpha1",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "SyncTargetStatus")]
#[serde(rename_all = "camelCase")]
pub struct SyncTargetSpec {
    /// The APIExports this SyncTarget wants to support. A reference without a path
    /// refers to an APIExport in the same logical cluster as the SyncTarget.
    #[serde(default, rename = "supportedAPIExports", skip_serializing_if = "Vec::is_empty")]
    pub supported_api_exports: Vec<ExportReference>,
}

/// Reference to an APIExport by logical cluster path and name
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub struct ExportReference {
    /// Logical cluster path of the APIExport. Defaults to the logical cluster of the referencing object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Name of the APIExport
    pub export: String,
}

impl ExportReference {
    pub fn local(export: impl Into<String>) -> Self {
        Self {
            path: None,
            export: export.into(),
        }
    }

    pub fn with_path(path: impl Into<String>, export: impl Into<String>) -> Self {
        Self {
            path: Some(path.into()),
            export: export.into(),
        }
    }

    /// The path this reference points into, defaulting to `local` when unset
    pub fn resolve_path(&self, local: &LogicalClusterName) -> Result<LogicalClusterPath> {
        match self.path.as_deref() {
            None | Some("") => Ok(local.path()),
            Some(path) => LogicalClusterPath::parse(path),
        }
    }
}

/// Status of the SyncTarget, written exclusively by the controller
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncTargetStatus {
    /// Resources of the supported APIExports that are backed by an APIResourceImport at this SyncTarget
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub synced_resources: Vec<SyncedResource>,
}

/// A resource this SyncTarget can serve. Ordering is by group, version, resource and identity hash.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncedResource {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub resource: String,
    /// Identity hash of the APIExport serving the resource
    #[serde(default)]
    pub identity_hash: String,
}

impl SyncTarget {
    pub fn synced_resources(&self) -> &[SyncedResource] {
        self.status
            .as_ref()
            .map(|s| s.synced_resources.as_slice())
            .unwrap_or_default()
    }
}
