use std::future::Future;
use std::time::Duration;

use kube::api::{Patch, PatchParams};
use kube::{Client, Resource, ResourceExt};
use serde_json::{json, Map, Value};
use tracing::*;

use crate::logicalcluster::{cluster_of, LogicalClusterName};
use crate::resources::synctargets::SyncTarget;
use crate::{Error, Result};

/// Applies merge patches to the status subresource of a SyncTarget
pub trait StatusPatcher: Send + Sync {
    fn patch_status(
        &self,
        cluster: &LogicalClusterName,
        name: &str,
        patch: Value,
    ) -> impl Future<Output = Result<SyncTarget>> + Send;
}

/// [`StatusPatcher`] addressing each logical cluster through its `/clusters/<cluster>` prefix
#[derive(Clone)]
pub struct KubeStatusPatcher {
    client: Client,
}

impl KubeStatusPatcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn url_path(cluster: &LogicalClusterName) -> String {
        format!("/clusters/{cluster}{}", SyncTarget::url_path(&(), None))
    }
}

impl StatusPatcher for KubeStatusPatcher {
    async fn patch_status(
        &self,
        cluster: &LogicalClusterName,
        name: &str,
        patch: Value,
    ) -> Result<SyncTarget> {
        let request = kube::core::Request::new(Self::url_path(cluster)).patch_subresource(
            "status",
            name,
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )?;
        Ok(self.client.request::<SyncTarget>(request).await?)
    }
}

/// Writes reconciled status back, skipping the call when nothing changed
pub struct Persister<P> {
    patcher: P,
    timeout: Duration,
}

impl<P: StatusPatcher> Persister<P> {
    pub fn new(patcher: P, timeout: Duration) -> Self {
        Self { patcher, timeout }
    }

    /// Persists the status of `new` if it differs from the status of `old`.
    /// Returns whether a patch was sent.
    pub async fn persist(&self, old: &SyncTarget, new: &SyncTarget) -> Result<bool> {
        if old.status.clone().unwrap_or_default() == new.status.clone().unwrap_or_default() {
            return Ok(false);
        }

        let cluster = cluster_of(old)?;
        let name = old.name_any();
        let patch = status_patch(old, new)?;
        debug!("Patching status of {cluster}|{name} with {patch}");

        match tokio::time::timeout(self.timeout, self.patcher.patch_status(&cluster, &name, patch)).await {
            Ok(res) => res.map(|_| true),
            Err(_) => Err(Error::PatchTimeout {
                key: format!("{cluster}|{name}"),
                timeout: self.timeout,
            }),
        }
    }
}

/// The merge patch turning the observed status of `old` into the status of `new`.
///
/// The patch carries the uid and resourceVersion of `old`, so the API server rejects it
/// when the object was replaced or changed since it was observed.
pub fn status_patch(old: &SyncTarget, new: &SyncTarget) -> Result<Value> {
    let before = json!({ "status": serde_json::to_value(&old.status)? });
    let after = json!({
        "metadata": {
            "uid": old.metadata.uid,
            "resourceVersion": old.metadata.resource_version,
        },
        "status": serde_json::to_value(&new.status)?,
    });
    Ok(create_merge_patch(&before, &after))
}

/// Computes a JSON merge patch (RFC 7386) that turns `original` into `modified`
pub fn create_merge_patch(original: &Value, modified: &Value) -> Value {
    let (Value::Object(original), Value::Object(modified)) = (original, modified) else {
        return modified.clone();
    };

    let mut patch = Map::new();
    for key in original.keys() {
        if !modified.contains_key(key) {
            patch.insert(key.clone(), Value::Null);
        }
    }
    for (key, value) in modified {
        match original.get(key) {
            Some(old) if old == value => {}
            Some(old @ Value::Object(_)) if value.is_object() => {
                patch.insert(key.clone(), create_merge_patch(old, value));
            }
            _ => {
                patch.insert(key.clone(), value.clone());
            }
        }
    }
    Value::Object(patch)
}
