use std::fmt::Debug;
use std::sync::Arc;

use kube::api::{Api, ListParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::controllers::{ControllerConfig, State};
use crate::informer::{self, Notification};
use crate::keys::ObjectKey;
use crate::queue::{default_controller_rate_limiter, WorkQueue};
use crate::resources::apiexports::ApiExport;
use crate::resources::apiresourceimports::ApiResourceImport;
use crate::resources::apiresourceschemas::ApiResourceSchema;
use crate::resources::synctargets::SyncTarget;
use crate::store::Store;
use crate::{Error, Metrics, Result};

pub mod controller;
pub mod indexes;
pub mod persister;
pub mod reconcilers;
pub mod router;

#[cfg(test)]
pub(crate) mod fixtures;

use controller::{Controller, CONTROLLER_NAME};
use indexes::*;
use persister::{KubeStatusPatcher, Persister};
use reconcilers::StoreLookups;
use router::{EventRouter, WatchEvent};

/// The caches of the four watched kinds, with the indices this controller needs registered
#[derive(Clone, Debug)]
pub struct Stores {
    pub sync_targets: Store<SyncTarget>,
    pub api_exports: Store<ApiExport>,
    pub resource_schemas: Store<ApiResourceSchema>,
    pub api_resource_imports: Store<ApiResourceImport>,
}

impl Stores {
    pub fn new() -> Result<Self> {
        let sync_targets = Store::new();
        sync_targets.add_index(INDEX_SYNC_TARGETS_BY_EXPORT, index_sync_targets_by_exports)?;

        let api_exports = Store::new();
        api_exports.add_index(
            INDEX_API_EXPORTS_BY_API_RESOURCE_SCHEMA,
            index_api_exports_by_api_resource_schemas,
        )?;
        api_exports.add_index_if_not_present(
            INDEX_BY_LOGICAL_CLUSTER_PATH_AND_NAME,
            index_by_logical_cluster_path_and_name::<ApiExport>,
        )?;

        Ok(Self {
            sync_targets,
            api_exports,
            resource_schemas: Store::new(),
            api_resource_imports: Store::new(),
        })
    }

    pub fn lookups(&self) -> StoreLookups {
        StoreLookups {
            api_exports: self.api_exports.clone(),
            resource_schemas: self.resource_schemas.clone(),
            api_resource_imports: self.api_resource_imports.clone(),
        }
    }
}

/// Clients for the kcp front proxy: the first addresses single logical clusters by path prefix,
/// the second watches across all logical clusters through the `/clusters/*` endpoint.
///
/// kcp kubeconfigs usually point into one workspace (`https://host:6443/clusters/root`);
/// that workspace segment is dropped so both clients start from the server root.
pub fn clients(mut config: kube::Config) -> Result<(Client, Client)> {
    config.cluster_url = server_url(&config.cluster_url)?;
    let mut wildcard = config.clone();
    wildcard.cluster_url = wildcard_url(&config.cluster_url)?;
    Ok((Client::try_from(config)?, Client::try_from(wildcard)?))
}

fn server_url(cluster_url: &http::Uri) -> Result<http::Uri> {
    let url = cluster_url.to_string();
    let url = url.trim_end_matches('/');
    let base = match url.rsplit_once('/') {
        Some((prefix, cluster)) if !cluster.is_empty() => prefix.strip_suffix("/clusters").unwrap_or(url),
        _ => url,
    };
    parse_url(base, cluster_url)
}

fn wildcard_url(server: &http::Uri) -> Result<http::Uri> {
    let url = format!("{}/clusters/*", server.to_string().trim_end_matches('/'));
    parse_url(&url, server)
}

fn parse_url(url: &str, configured: &http::Uri) -> Result<http::Uri> {
    url.parse()
        .map_err(|err| Error::InvalidConfig(format!("cluster url {configured}: {err}")))
}

async fn ensure_listable<K>(api: &Api<K>) -> Result<()>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug,
{
    if let Err(err) = api.list(&ListParams::default().limit(1)).await {
        error!("{} is not queryable; {err:?}. Is the CRD installed?", K::kind(&()));
        return Err(err.into());
    }
    Ok(())
}

fn spawn_informer<K>(
    api: Api<K>,
    store: Store<K>,
    events: UnboundedSender<WatchEvent>,
    wrap: fn(Notification<K>) -> WatchEvent,
    token: CancellationToken,
) -> (JoinHandle<()>, watch::Receiver<bool>)
where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    let (synced_tx, synced_rx) = watch::channel(false);
    let handler = move |notification| {
        if events.send(wrap(notification)).is_err() {
            trace!("Dropping notification, router has stopped");
        }
    };
    let handle = tokio::spawn(informer::run(api, store, handler, synced_tx, token));
    (handle, synced_rx)
}

/// Runs the SyncTarget export controller until `token` is cancelled
pub async fn run(
    client: Client,
    watch_client: Client,
    metrics: Metrics,
    state: State,
    config: ControllerConfig,
    token: CancellationToken,
) -> Result<()> {
    let sync_target_api = Api::<SyncTarget>::all(watch_client.clone());
    let export_api = Api::<ApiExport>::all(watch_client.clone());
    let schema_api = Api::<ApiResourceSchema>::all(watch_client.clone());
    let import_api = Api::<ApiResourceImport>::all(watch_client);

    ensure_listable(&sync_target_api).await?;
    ensure_listable(&export_api).await?;
    ensure_listable(&schema_api).await?;
    ensure_listable(&import_api).await?;

    let stores = Stores::new()?;
    let queue: WorkQueue<ObjectKey> = WorkQueue::new(
        CONTROLLER_NAME,
        default_controller_rate_limiter(config.backoff_base, config.backoff_max),
    );

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let informers = [
        (
            "SyncTarget",
            spawn_informer(
                sync_target_api,
                stores.sync_targets.clone(),
                events_tx.clone(),
                WatchEvent::SyncTarget,
                token.clone(),
            ),
        ),
        (
            "APIExport",
            spawn_informer(
                export_api,
                stores.api_exports.clone(),
                events_tx.clone(),
                WatchEvent::ApiExport,
                token.clone(),
            ),
        ),
        (
            "APIResourceSchema",
            spawn_informer(
                schema_api,
                stores.resource_schemas.clone(),
                events_tx.clone(),
                WatchEvent::ApiResourceSchema,
                token.clone(),
            ),
        ),
        (
            "APIResourceImport",
            spawn_informer(
                import_api,
                stores.api_resource_imports.clone(),
                events_tx,
                WatchEvent::ApiResourceImport,
                token.clone(),
            ),
        ),
    ];

    let router = EventRouter {
        queue: queue.clone(),
        sync_targets: stores.sync_targets.clone(),
        api_exports: stores.api_exports.clone(),
        metrics: metrics.clone(),
    };
    let router = tokio::spawn(router.run(events_rx, token.clone()));

    let mut handles = vec![router];
    for (kind, (handle, mut synced)) in informers {
        tokio::select! {
            _ = token.cancelled() => return Ok(()),
            res = synced.wait_for(|synced| *synced) => {
                res.map_err(|_| Error::CacheNotSynced(kind))?;
            }
        }
        info!("Cache of {kind} synced");
        handles.push(handle);
    }

    let controller = Arc::new(Controller::new(
        queue,
        stores.sync_targets.clone(),
        Arc::new(stores.lookups()),
        Persister::new(KubeStatusPatcher::new(client), config.patch_timeout),
        metrics,
        state.diagnostics.clone(),
    ));
    controller.start(config.workers, token).await;

    for res in futures::future::join_all(handles).await {
        if let Err(err) = res {
            crate::runtime::handle_error(format!("{CONTROLLER_NAME} task failed: {err}"));
        }
    }
    Ok(())
}
