use std::collections::BTreeSet;

use kube::ResourceExt;
use tracing::*;

use crate::resources::synctargets::SyncedResource;
use crate::Result;

use super::{Lookups, Reconciler, Reconciliation};

/// Narrows the resolved resources down to those an APIResourceImport at this SyncTarget supports,
/// and records them in status
pub struct ApiCompatibleReconciler;

impl Reconciler for ApiCompatibleReconciler {
    fn name(&self) -> &'static str {
        "compatibility"
    }

    fn reconcile(&self, r: &mut Reconciliation, lookups: &dyn Lookups) -> Result<()> {
        let location = r.sync_target.name_any();
        let imports: Vec<_> = lookups
            .list_api_resource_imports(&r.cluster)?
            .into_iter()
            .filter(|import| import.spec.location == location)
            .collect();

        let synced: BTreeSet<SyncedResource> = r
            .resolved
            .iter()
            .filter(|resource| {
                imports
                    .iter()
                    .any(|import| import.supports(&resource.group, &resource.version, &resource.resource))
            })
            .cloned()
            .collect();

        debug!(
            "{} of {} resolved resources are importable at {}|{location}",
            synced.len(),
            r.resolved.len(),
            r.cluster
        );
        r.sync_target.status.get_or_insert_default().synced_resources = synced.into_iter().collect();
        Ok(())
    }
}
