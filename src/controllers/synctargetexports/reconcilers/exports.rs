use std::collections::BTreeMap;

use kube::ResourceExt;
use tracing::*;

use crate::logicalcluster::cluster_of;
use crate::resources::apiexports::ApiExport;
use crate::resources::synctargets::{ExportReference, SyncedResource};
use crate::{Error, Result};

use super::{Lookups, Reconciler, Reconciliation};

/// Resolves the declared APIExports of a SyncTarget into the resources they currently serve
pub struct ExportReconciler;

impl Reconciler for ExportReconciler {
    fn name(&self) -> &'static str {
        "exports"
    }

    fn reconcile(&self, r: &mut Reconciliation, lookups: &dyn Lookups) -> Result<()> {
        let mut errors = vec![];
        let mut resolved = vec![];

        for reference in &r.sync_target.spec.supported_api_exports {
            match resolve_reference(r, reference, lookups) {
                Ok((export, resources, schema_error)) => {
                    trace!(
                        "Export {} of {} serves {} resources",
                        export,
                        r.cluster,
                        resources.len()
                    );
                    resolved.extend(resources);
                    errors.extend(schema_error);
                }
                Err(err) => errors.push(err),
            }
        }

        r.resolved = resolved;
        Error::aggregate(errors).map_or(Ok(()), Err)
    }
}

fn resolve_reference(
    r: &Reconciliation,
    reference: &ExportReference,
    lookups: &dyn Lookups,
) -> Result<(String, Vec<SyncedResource>, Option<Error>)> {
    let path = reference.resolve_path(&r.cluster)?;
    let export = lookups.get_api_export(&path, &reference.export)?;
    let (resources, schema_error) = export_resources(&export, lookups)?;
    Ok((format!("{path}|{}", export.name_any()), resources, schema_error))
}

/// The served resources of an export, one per served version of its latest schemas.
///
/// A schema listed later replaces an earlier one for the same group and resource.
/// Schemas that cannot be found are skipped and returned as a single error next to
/// the resources of the ones that resolved.
pub fn export_resources(
    export: &ApiExport,
    lookups: &dyn Lookups,
) -> Result<(Vec<SyncedResource>, Option<Error>)> {
    let cluster = cluster_of(export)?;
    let identity_hash = export.identity_hash();

    let mut errors = vec![];
    let mut latest = BTreeMap::new();
    for name in &export.spec.latest_resource_schemas {
        match lookups.get_resource_schema(&cluster, name) {
            Ok(schema) => {
                let group_resource = (schema.spec.group.clone(), schema.spec.names.plural.clone());
                latest.insert(group_resource, schema);
            }
            Err(err) => errors.push(err),
        }
    }
    let resources = latest
        .into_values()
        .flat_map(|schema| {
            schema
                .served_versions()
                .map(|version| SyncedResource {
                    group: schema.spec.group.clone(),
                    version: version.to_owned(),
                    resource: schema.spec.names.plural.clone(),
                    identity_hash: identity_hash.to_owned(),
                })
                .collect::<Vec<_>>()
        })
        .collect();
    Ok((resources, Error::aggregate(errors)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controllers::synctargetexports::fixtures::*;
    use crate::logicalcluster::LogicalClusterName;

    fn reconcile(lookups: &FakeLookups, refs: Vec<ExportReference>) -> (Reconciliation, Result<()>) {
        let mut r = Reconciliation {
            sync_target: sync_target("root", "target", refs),
            cluster: LogicalClusterName::new("root"),
            resolved: vec![],
        };
        let res = ExportReconciler.reconcile(&mut r, lookups);
        (r, res)
    }

    #[test]
    fn resolves_local_and_pathed_references() {
        let lookups = FakeLookups::default()
            .with_export(api_export("root", None, "kubernetes", &["v1.services"], "kube-hash"))
            .with_schema(schema("root", "v1.services", "", "services", &["v1"]))
            .with_export(api_export(
                "provider",
                Some("root:org"),
                "today-cowboys",
                &["today.cowboys.wildwest.dev"],
                "cowboy-hash",
            ))
            .with_schema(schema(
                "provider",
                "today.cowboys.wildwest.dev",
                "wildwest.dev",
                "cowboys",
                &["v1alpha1"],
            ));

        let (r, res) = reconcile(
            &lookups,
            vec![
                ExportReference::local("kubernetes"),
                ExportReference::with_path("root:org", "today-cowboys"),
            ],
        );
        res.unwrap();
        assert_eq!(
            r.resolved,
            vec![
                synced("", "v1", "services", "kube-hash"),
                synced("wildwest.dev", "v1alpha1", "cowboys", "cowboy-hash"),
            ]
        );
    }

    #[test]
    fn missing_export_does_not_stop_other_references() {
        let lookups = FakeLookups::default()
            .with_export(api_export("root", None, "kubernetes", &["v1.services"], "kube-hash"))
            .with_schema(schema("root", "v1.services", "", "services", &["v1"]));

        let (r, res) = reconcile(
            &lookups,
            vec![
                ExportReference::with_path("root:missing", "gone"),
                ExportReference::local("kubernetes"),
                ExportReference::with_path("Invalid Path", "bad"),
            ],
        );
        assert_eq!(r.resolved, vec![synced("", "v1", "services", "kube-hash")]);
        match res {
            Err(Error::Aggregate(errors)) => {
                assert!(matches!(errors[0], Error::NotFound { .. }));
                assert!(matches!(errors[1], Error::InvalidLogicalClusterPath(_)));
            }
            other => panic!("expected two errors, got {other:?}"),
        }
    }

    #[test]
    fn missing_schema_fails_its_export() {
        let lookups = FakeLookups::default().with_export(api_export(
            "root",
            None,
            "today-cowboys",
            &["today.cowboys.wildwest.dev"],
            "hash",
        ));
        let (r, res) = reconcile(&lookups, vec![ExportReference::local("today-cowboys")]);
        assert!(r.resolved.is_empty());
        assert!(matches!(res, Err(Error::NotFound { .. })));
    }

    #[test]
    fn missing_schema_keeps_resolved_siblings() {
        let lookups = FakeLookups::default()
            .with_export(api_export("root", None, "e", &["services", "gone"], "hash"))
            .with_schema(schema("root", "services", "", "services", &["v1"]));

        let (r, res) = reconcile(&lookups, vec![ExportReference::local("e")]);
        assert_eq!(r.resolved, vec![synced("", "v1", "services", "hash")]);
        assert!(matches!(res, Err(Error::NotFound { .. })));
    }

    #[test]
    fn last_schema_per_group_resource_wins() {
        let lookups = FakeLookups::default()
            .with_export(api_export(
                "root",
                None,
                "today-cowboys",
                &["yesterday.cowboys.wildwest.dev", "today.cowboys.wildwest.dev"],
                "hash",
            ))
            .with_schema(schema(
                "root",
                "yesterday.cowboys.wildwest.dev",
                "wildwest.dev",
                "cowboys",
                &["v1alpha1"],
            ))
            .with_schema(schema(
                "root",
                "today.cowboys.wildwest.dev",
                "wildwest.dev",
                "cowboys",
                &["v1beta1"],
            ));

        let (r, res) = reconcile(&lookups, vec![ExportReference::local("today-cowboys")]);
        res.unwrap();
        assert_eq!(r.resolved, vec![synced("wildwest.dev", "v1beta1", "cowboys", "hash")]);
    }

    #[test]
    fn only_served_versions_are_resolved() {
        let mut cowboys = schema("root", "cowboys", "wildwest.dev", "cowboys", &["v1", "v2"]);
        cowboys.spec.versions[0].served = false;
        let lookups = FakeLookups::default()
            .with_export(api_export("root", None, "e", &["cowboys"], "hash"))
            .with_schema(cowboys);

        let (r, res) = reconcile(&lookups, vec![ExportReference::local("e")]);
        res.unwrap();
        assert_eq!(r.resolved, vec![synced("wildwest.dev", "v2", "cowboys", "hash")]);
    }
}
