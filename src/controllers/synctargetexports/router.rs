use std::collections::BTreeSet;

use kube::ResourceExt;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::informer::Notification;
use crate::keys::{reference_key, ObjectKey};
use crate::logicalcluster::{cluster_of, path_of};
use crate::queue::WorkQueue;
use crate::resources::apiexports::ApiExport;
use crate::resources::apiresourceimports::ApiResourceImport;
use crate::resources::apiresourceschemas::ApiResourceSchema;
use crate::resources::synctargets::SyncTarget;
use crate::runtime::handle_error;
use crate::store::{Indexer, Store};
use crate::{Error, Metrics, Result};

use super::indexes::{INDEX_API_EXPORTS_BY_API_RESOURCE_SCHEMA, INDEX_SYNC_TARGETS_BY_EXPORT};

/// A notification from one of the four watched collections
#[derive(Debug, Clone)]
pub enum WatchEvent {
    SyncTarget(Notification<SyncTarget>),
    ApiExport(Notification<ApiExport>),
    ApiResourceSchema(Notification<ApiResourceSchema>),
    ApiResourceImport(Notification<ApiResourceImport>),
}

impl WatchEvent {
    fn kind(&self) -> &'static str {
        match self {
            WatchEvent::SyncTarget(_) => "SyncTarget",
            WatchEvent::ApiExport(_) => "APIExport",
            WatchEvent::ApiResourceSchema(_) => "APIResourceSchema",
            WatchEvent::ApiResourceImport(_) => "APIResourceImport",
        }
    }
}

fn object<K>(notification: &Notification<K>) -> &K {
    match notification {
        Notification::Add(obj) | Notification::Delete(obj) => obj.as_ref(),
        Notification::Update { new, .. } => new.as_ref(),
    }
}

/// A SyncTarget is enqueued when it appears or disappears, and on updates touching
/// its supported exports or its synced resources.
pub fn sync_target_keys(notification: &Notification<SyncTarget>) -> Result<Vec<ObjectKey>> {
    match notification {
        Notification::Update { old, new }
            if old.spec.supported_api_exports == new.spec.supported_api_exports
                && old.synced_resources() == new.synced_resources() =>
        {
            Ok(vec![])
        }
        notification => Ok(vec![ObjectKey::for_object(object(notification))?]),
    }
}

/// SyncTargets declaring `export`, by its logical cluster name or by its path alias
pub fn api_export_keys(
    export: &ApiExport,
    sync_targets: &impl Indexer<SyncTarget>,
) -> Result<BTreeSet<ObjectKey>> {
    let name = export.name_any();
    let mut references = vec![reference_key(cluster_of(export)?.as_str(), &name)];
    if let Some(path) = path_of(export) {
        references.push(reference_key(path.as_str(), &name));
    }

    let mut keys = BTreeSet::new();
    for reference in references {
        keys.extend(sync_targets.index_keys(INDEX_SYNC_TARGETS_BY_EXPORT, &reference)?);
    }
    Ok(keys)
}

/// SyncTargets declaring any APIExport that serves `schema`.
/// Exports whose SyncTargets cannot be determined are reported and skipped.
pub fn api_resource_schema_keys(
    schema: &ApiResourceSchema,
    api_exports: &impl Indexer<ApiExport>,
    sync_targets: &impl Indexer<SyncTarget>,
) -> Result<BTreeSet<ObjectKey>> {
    let reference = reference_key(cluster_of(schema)?.as_str(), &schema.name_any());
    let mut keys = BTreeSet::new();
    for export in api_exports.by_index(INDEX_API_EXPORTS_BY_API_RESOURCE_SCHEMA, &reference)? {
        match api_export_keys(&export, sync_targets) {
            Ok(found) => keys.extend(found),
            Err(err) => handle_error(format!(
                "Failed to route APIResourceSchema {reference} through APIExport {}: {err}",
                export.name_any()
            )),
        }
    }
    Ok(keys)
}

/// The SyncTarget an APIResourceImport is located at, on creation and on spec changes.
/// Deleting an import does not enqueue anything.
pub fn api_resource_import_keys(notification: &Notification<ApiResourceImport>) -> Result<Option<ObjectKey>> {
    let import = match notification {
        Notification::Add(import) => import,
        Notification::Update { old, new } if old.metadata.generation != new.metadata.generation => new,
        Notification::Update { .. } | Notification::Delete(_) => return Ok(None),
    };

    let cluster = cluster_of(import.as_ref())?;
    if import.spec.location.is_empty() {
        return Err(Error::InvalidKey {
            key: format!("{cluster}|{}", import.name_any()),
            reason: "APIResourceImport has no location".into(),
        });
    }
    Ok(Some(ObjectKey::cluster_scoped(cluster, &import.spec.location)))
}

/// Maps watch notifications of all four collections onto SyncTarget keys and queues them
#[derive(Clone)]
pub struct EventRouter {
    pub queue: WorkQueue<ObjectKey>,
    pub sync_targets: Store<SyncTarget>,
    pub api_exports: Store<ApiExport>,
    pub metrics: Metrics,
}

impl EventRouter {
    pub fn route(&self, event: WatchEvent) {
        let keys = match &event {
            WatchEvent::SyncTarget(n) => sync_target_keys(n),
            WatchEvent::ApiExport(n) => {
                api_export_keys(object(n), &self.sync_targets).map(|keys| keys.into_iter().collect())
            }
            WatchEvent::ApiResourceSchema(n) => {
                api_resource_schema_keys(object(n), &self.api_exports, &self.sync_targets)
                    .map(|keys| keys.into_iter().collect())
            }
            WatchEvent::ApiResourceImport(n) => {
                api_resource_import_keys(n).map(|key| key.into_iter().collect())
            }
        };

        match keys {
            Ok(keys) => {
                for key in keys {
                    debug!("Queueing SyncTarget {key} for {} change", event.kind());
                    self.queue.add(key);
                }
            }
            Err(err) => {
                self.metrics.routing_failure(event.kind(), &err);
                handle_error(format!("Failed to route {} event: {err}", event.kind()));
            }
        }
    }

    /// Routes events until `token` is cancelled or all senders are gone
    pub async fn run(self, mut events: UnboundedReceiver<WatchEvent>, token: CancellationToken) {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                event = events.recv() => match event {
                    Some(event) => self.route(event),
                    None => return,
                }
            }
        }
    }
}
