use std::sync::Arc;

use tracing::*;

use crate::logicalcluster::{cluster_of, LogicalClusterName, LogicalClusterPath};
use crate::resources::apiexports::ApiExport;
use crate::resources::apiresourceimports::ApiResourceImport;
use crate::resources::apiresourceschemas::ApiResourceSchema;
use crate::resources::synctargets::{SyncTarget, SyncedResource};
use crate::store::Store;
use crate::{Error, Result};

use super::indexes::get_by_path_and_name;

pub mod compatibility;
pub mod exports;

/// Read-only access to the objects a SyncTarget's status is derived from
pub trait Lookups: Send + Sync {
    fn get_api_export(&self, path: &LogicalClusterPath, name: &str) -> Result<Arc<ApiExport>>;

    fn get_resource_schema(
        &self,
        cluster: &LogicalClusterName,
        name: &str,
    ) -> Result<Arc<ApiResourceSchema>>;

    fn list_api_resource_imports(
        &self,
        cluster: &LogicalClusterName,
    ) -> Result<Vec<Arc<ApiResourceImport>>>;
}

/// [`Lookups`] served from the informer caches
#[derive(Clone)]
pub struct StoreLookups {
    pub api_exports: Store<ApiExport>,
    pub resource_schemas: Store<ApiResourceSchema>,
    pub api_resource_imports: Store<ApiResourceImport>,
}

impl Lookups for StoreLookups {
    fn get_api_export(&self, path: &LogicalClusterPath, name: &str) -> Result<Arc<ApiExport>> {
        get_by_path_and_name(&self.api_exports, path, name)
    }

    fn get_resource_schema(
        &self,
        cluster: &LogicalClusterName,
        name: &str,
    ) -> Result<Arc<ApiResourceSchema>> {
        self.resource_schemas
            .get(cluster, None, name)
            .ok_or_else(|| Error::NotFound {
                kind: "APIResourceSchema".into(),
                key: format!("{cluster}|{name}"),
            })
    }

    fn list_api_resource_imports(
        &self,
        cluster: &LogicalClusterName,
    ) -> Result<Vec<Arc<ApiResourceImport>>> {
        Ok(self.api_resource_imports.list_cluster(cluster))
    }
}

/// The working state threaded through the reconcilers of one pass
#[derive(Debug)]
pub struct Reconciliation {
    /// Working copy of the SyncTarget; status changes made here are what gets persisted
    pub sync_target: SyncTarget,
    pub cluster: LogicalClusterName,
    /// Resources of the declared exports that could be resolved
    pub resolved: Vec<SyncedResource>,
}

/// One step of a reconcile pass
pub trait Reconciler: Send + Sync {
    fn name(&self) -> &'static str;

    fn reconcile(&self, reconciliation: &mut Reconciliation, lookups: &dyn Lookups) -> Result<()>;
}

/// The result of running a [`Chain`]: the updated working copy, and the errors of all steps
#[derive(Debug)]
pub struct Outcome {
    pub sync_target: SyncTarget,
    pub error: Option<Error>,
}

/// An ordered list of reconcilers. Every reconciler runs, whether or not an earlier one failed.
pub struct Chain {
    reconcilers: Vec<Box<dyn Reconciler>>,
}

impl Default for Chain {
    fn default() -> Self {
        Self::new(vec![
            Box::new(exports::ExportReconciler),
            Box::new(compatibility::ApiCompatibleReconciler),
        ])
    }
}

impl Chain {
    pub fn new(reconcilers: Vec<Box<dyn Reconciler>>) -> Self {
        Self { reconcilers }
    }

    pub fn run(&self, sync_target: &SyncTarget, lookups: &dyn Lookups) -> Outcome {
        let cluster = match cluster_of(sync_target) {
            Ok(cluster) => cluster,
            Err(err) => {
                return Outcome {
                    sync_target: sync_target.clone(),
                    error: Some(err),
                }
            }
        };

        let mut reconciliation = Reconciliation {
            sync_target: sync_target.clone(),
            cluster,
            resolved: vec![],
        };

        let mut errors = vec![];
        for reconciler in &self.reconcilers {
            if let Err(err) = reconciler.reconcile(&mut reconciliation, lookups) {
                debug!("Reconciler {} failed: {err}", reconciler.name());
                errors.push(err);
            }
        }

        Outcome {
            sync_target: reconciliation.sync_target,
            error: Error::aggregate(errors),
        }
    }
}
