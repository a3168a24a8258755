use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// APIResourceSchema describes one resource type served by an APIExport.
/// Schemas are immutable; a new version of a resource is a new schema object.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    kind = "APIResourceSchema",
    root = "ApiResourceSchema",
    group = "apis.kcp.io",
    version = "v1alpha1",
    derive = "PartialEq",
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct ApiResourceSchemaSpec {
    /// API group of the resource; empty for the core group
    #[serde(default)]
    pub group: String,
    pub names: ResourceNames,
    #[serde(default)]
    pub versions: Vec<ResourceVersion>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceNames {
    /// Plural name used in the resource path, eg `cowboys`
    pub plural: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub kind: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct ResourceVersion {
    pub name: String,
    #[serde(default)]
    pub served: bool,
    #[serde(default)]
    pub storage: bool,
}

impl ApiResourceSchema {
    pub fn served_versions(&self) -> impl Iterator<Item = &str> {
        self.spec
            .versions
            .iter()
            .filter(|v| v.served)
            .map(|v| v.name.as_str())
    }
}
