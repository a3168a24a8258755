use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;

use futures::StreamExt;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::*;

use crate::keys::ObjectKey;
use crate::runtime::handle_error;
use crate::store::Store;

/// A change to a cached object, as seen by event handlers
#[derive(Debug, Clone)]
pub enum Notification<K> {
    Add(Arc<K>),
    Update { old: Arc<K>, new: Arc<K> },
    Delete(Arc<K>),
}

/// Applies watch events to a [`Store`] and derives the notifications for event handlers
pub struct Informer<K> {
    store: Store<K>,
    /// keys seen during an ongoing re-list
    relisted: Option<HashSet<ObjectKey>>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + Debug,
{
    pub fn new(store: Store<K>) -> Self {
        Self {
            store,
            relisted: None,
        }
    }

    pub fn handle(&mut self, event: watcher::Event<K>) -> Vec<Notification<K>> {
        match event {
            watcher::Event::Apply(obj) => self.apply(obj).into_iter().collect(),
            watcher::Event::Delete(obj) => match self.store.delete(&obj) {
                Ok(cached) => {
                    vec![Notification::Delete(cached.unwrap_or_else(|| Arc::new(obj)))]
                }
                Err(err) => {
                    handle_error(err);
                    vec![]
                }
            },
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                vec![]
            }
            watcher::Event::InitApply(obj) => {
                match (ObjectKey::for_object(&obj), self.relisted.as_mut()) {
                    (Ok(key), Some(relisted)) => {
                        relisted.insert(key);
                    }
                    (Err(err), _) => {
                        handle_error(err);
                        return vec![];
                    }
                    (Ok(_), None) => {}
                }
                self.apply(obj).into_iter().collect()
            }
            watcher::Event::InitDone => {
                let Some(relisted) = self.relisted.take() else {
                    return vec![];
                };
                // anything we did not see again was deleted while we were not watching
                self.store
                    .keys()
                    .into_iter()
                    .filter(|key| !relisted.contains(key))
                    .filter_map(|key| {
                        debug!("Dropping {key} missing from re-list");
                        self.store.delete_key(&key)
                    })
                    .map(Notification::Delete)
                    .collect()
            }
        }
    }

    fn apply(&self, obj: K) -> Option<Notification<K>> {
        let new = Arc::new(obj);
        match self.store.apply(new.clone()) {
            Ok(Some(old)) => Some(Notification::Update { old, new }),
            Ok(None) => Some(Notification::Add(new)),
            Err(err) => {
                handle_error(err);
                None
            }
        }
    }
}

/// Watches all objects of a kind, keeps `store` up to date and hands every notification to `handler`.
/// `synced` flips to true once the initial listing is in the store.
/// Watch errors are retried with the default exponential backoff. Returns once `token` is cancelled.
pub async fn run<K>(
    api: Api<K>,
    store: Store<K>,
    handler: impl Fn(Notification<K>) + Send,
    synced: watch::Sender<bool>,
    token: CancellationToken,
) where
    K: Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static,
{
    let mut informer = Informer::new(store);
    let mut events = watcher(api, watcher::Config::default())
        .default_backoff()
        .boxed();

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            event = events.next() => match event {
                Some(Ok(event)) => {
                    let init_done = matches!(event, watcher::Event::InitDone);
                    for notification in informer.handle(event) {
                        handler(notification);
                    }
                    if init_done && !*synced.borrow() {
                        debug!("Cache of {} synced with {} objects", std::any::type_name::<K>(), informer.store.len());
                        synced.send_replace(true);
                    }
                }
                Some(Err(err)) => warn!("watch of {} failed: {err}", std::any::type_name::<K>()),
                None => return,
            }
        }
    }
}
