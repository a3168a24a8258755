use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// APIResourceImport declares that a resource type is available for syncing at a location.
/// The location is the name of a SyncTarget in the same logical cluster.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "APIResourceImport",
    root = "ApiResourceImport",
    group = "apiresource.kcp.io",
    version = "v1alpha1",
    derive = "PartialEq",
    derive = "Default",
    printcolumn = r#"{"name":"Location", "type":"string", "jsonPath":".spec.location"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApiResourceImportSpec {
    /// Name of the SyncTarget this import was discovered at
    pub location: String,
    pub group_version: GroupVersion,
    /// Plural name of the imported resource
    pub plural: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct GroupVersion {
    #[serde(default)]
    pub group: String,
    pub version: String,
}

impl ApiResourceImport {
    /// Whether this import makes the given group/version/resource available
    pub fn supports(&self, group: &str, version: &str, resource: &str) -> bool {
        self.spec.group_version.group == group
            && self.spec.group_version.version == version
            && self.spec.plural == resource
    }
}
