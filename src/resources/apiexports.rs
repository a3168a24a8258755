use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// APIExport offers a set of APIResourceSchemas for consumption by other logical clusters.
/// It may be referenced by its logical cluster name or by the logical path recorded in the
/// `kcp.io/path` annotation.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "APIExport",
    root = "ApiExport",
    group = "apis.kcp.io",
    version = "v1alpha1",
    derive = "PartialEq",
    derive = "Default"
)]
#[kube(status = "ApiExportStatus")]
#[serde(rename_all = "camelCase")]
pub struct ApiExportSpec {
    /// Names of the APIResourceSchemas currently served by this export, in the same logical cluster.
    /// For each group and resource only the last entry is authoritative.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub latest_resource_schemas: Vec<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApiExportStatus {
    /// Identity of the export, distinguishing its resources from same-named resources of other exports
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub identity_hash: String,
}

impl ApiExport {
    pub fn identity_hash(&self) -> &str {
        self.status
            .as_ref()
            .map(|s| s.identity_hash.as_str())
            .unwrap_or_default()
    }
}
