use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::controllers::Diagnostics;
use crate::keys::ObjectKey;
use crate::queue::WorkQueue;
use crate::resources::synctargets::SyncTarget;
use crate::runtime::{handle_error, panic_message};
use crate::store::{Indexer, Store};
use crate::{telemetry, Error, Metrics, Result};

use super::persister::{Persister, StatusPatcher};
use super::reconcilers::{Chain, Lookups};

pub const CONTROLLER_NAME: &str = "kcp-synctarget-export-controller";

/// Keeps the synced resources of every SyncTarget in line with its supported APIExports
/// and the APIResourceImports found at it
pub struct Controller<P> {
    queue: WorkQueue<ObjectKey>,
    sync_targets: Store<SyncTarget>,
    lookups: Arc<dyn Lookups>,
    chain: Chain,
    persister: Persister<P>,
    metrics: Metrics,
    diagnostics: Arc<RwLock<Diagnostics>>,
}

impl<P: StatusPatcher + 'static> Controller<P> {
    pub fn new(
        queue: WorkQueue<ObjectKey>,
        sync_targets: Store<SyncTarget>,
        lookups: Arc<dyn Lookups>,
        persister: Persister<P>,
        metrics: Metrics,
        diagnostics: Arc<RwLock<Diagnostics>>,
    ) -> Self {
        Self {
            queue,
            sync_targets,
            lookups,
            chain: Chain::default(),
            persister,
            metrics,
            diagnostics,
        }
    }

    pub fn with_chain(mut self, chain: Chain) -> Self {
        self.chain = chain;
        self
    }

    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    /// Runs `workers` workers until `token` is cancelled, then shuts the queue down
    /// and waits for the workers to finish the items they are processing.
    pub async fn start(self: Arc<Self>, workers: usize, token: CancellationToken) {
        info!("Starting {CONTROLLER_NAME} with {workers} workers");
        let handles: Vec<_> = (0..workers)
            .map(|_| {
                let controller = self.clone();
                tokio::spawn(async move { while controller.process_next_work_item().await {} })
            })
            .collect();

        token.cancelled().await;
        info!("Shutting down {CONTROLLER_NAME}");
        self.queue.shutdown();
        for res in futures::future::join_all(handles).await {
            if let Err(err) = res {
                handle_error(format!("{CONTROLLER_NAME} worker failed: {err}"));
            }
        }
    }

    /// Processes one item from the queue. Returns false once the queue has shut down.
    pub async fn process_next_work_item(&self) -> bool {
        let Some(key) = self.queue.get().await else {
            return false;
        };

        let res = AssertUnwindSafe(self.process(&key))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(Error::Panicked {
                    key: key.to_string(),
                    message: panic_message(payload.as_ref()),
                })
            });

        match res {
            Ok(()) => self.queue.forget(&key),
            Err(err) => {
                warn!("Reconcile of SyncTarget {key} failed: {err}");
                self.metrics.reconcile_failure::<SyncTarget>(&key, &err);
                self.queue.add_rate_limited(key.clone());
            }
        }
        self.queue.done(&key);
        true
    }

    #[instrument(skip(self), fields(trace_id))]
    async fn process(&self, key: &ObjectKey) -> Result<()> {
        if let Some(trace_id) = telemetry::get_trace_id() {
            Span::current().record("trace_id", field::display(&trace_id));
        }
        let _timer = self.metrics.count_and_measure::<SyncTarget>();
        self.diagnostics.write().await.last_event = Utc::now();

        let Some(current) = self.sync_targets.get_by_key(key) else {
            debug!("SyncTarget {key} no longer exists");
            return Ok(());
        };

        info!("Reconciling SyncTarget {key}");
        let outcome = self.chain.run(&current, self.lookups.as_ref());

        // partial results are persisted even when a reconciler failed
        let mut errors = outcome.error.into_iter().collect::<Vec<_>>();
        match self.persister.persist(&current, &outcome.sync_target).await {
            Ok(true) => self.metrics.status_patches.inc(),
            Ok(false) => {}
            Err(err) if err.is_not_found() => debug!("SyncTarget {key} was deleted before its status was patched"),
            Err(err) => errors.push(err),
        }
        Error::aggregate(errors).map_or(Ok(()), Err)
    }
}
