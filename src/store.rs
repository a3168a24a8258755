use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use kube::Resource;
use parking_lot::RwLock;

use crate::keys::ObjectKey;
use crate::logicalcluster::LogicalClusterName;
use crate::{Error, Result};

/// Derives the index values an object contributes to an index
pub type IndexFunc<K> = Arc<dyn Fn(&K) -> Vec<String> + Send + Sync>;

/// Read access to an indexed collection
pub trait Indexer<K> {
    fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<K>>;

    /// Keys of all objects contributing `value` to the index named `index`
    fn index_keys(&self, index: &str, value: &str) -> Result<Vec<ObjectKey>>;

    /// All objects contributing `value` to the index named `index`
    fn by_index(&self, index: &str, value: &str) -> Result<Vec<Arc<K>>>;
}

struct Inner<K> {
    objects: BTreeMap<ObjectKey, Arc<K>>,
    indexers: HashMap<String, IndexFunc<K>>,
    indices: HashMap<String, HashMap<String, BTreeSet<ObjectKey>>>,
}

impl<K> Inner<K> {
    fn index_object(&mut self, key: &ObjectKey, obj: &K) {
        for (name, index_fn) in &self.indexers {
            let index = self.indices.entry(name.clone()).or_default();
            for value in index_fn(obj) {
                index.entry(value).or_default().insert(key.clone());
            }
        }
    }

    fn unindex_object(&mut self, key: &ObjectKey, obj: &K) {
        for (name, index_fn) in &self.indexers {
            let Some(index) = self.indices.get_mut(name) else {
                continue;
            };
            for value in index_fn(obj) {
                if let Some(keys) = index.get_mut(&value) {
                    keys.remove(key);
                    if keys.is_empty() {
                        index.remove(&value);
                    }
                }
            }
        }
    }

    fn index(&self, index: &str) -> Result<Option<&HashMap<String, BTreeSet<ObjectKey>>>> {
        if !self.indexers.contains_key(index) {
            return Err(Error::IndexNotFound(index.to_owned()));
        }
        Ok(self.indices.get(index))
    }
}

/// A thread safe cache of one kind of object across all logical clusters, with named secondary indices.
///
/// Every mutation updates the objects and all indices under a single write lock,
/// so readers never observe an object without its index entries or vice versa.
pub struct Store<K> {
    inner: Arc<RwLock<Inner<K>>>,
}

impl<K> Clone for Store<K> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K> Default for Store<K> {
    fn default() -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner {
                objects: BTreeMap::new(),
                indexers: HashMap::new(),
                indices: HashMap::new(),
            })),
        }
    }
}

impl<K> fmt::Debug for Store<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("Store")
            .field("objects", &inner.objects.len())
            .field("indices", &inner.indexers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl<K: Resource> Store<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named index and builds it from the objects already cached
    pub fn add_index(
        &self,
        name: impl Into<String>,
        index_fn: impl Fn(&K) -> Vec<String> + Send + Sync + 'static,
    ) -> Result<()> {
        let name = name.into();
        let mut inner = self.inner.write();
        if inner.indexers.contains_key(&name) {
            return Err(Error::IndexAlreadyRegistered(name));
        }

        let index_fn: IndexFunc<K> = Arc::new(index_fn);
        let mut index: HashMap<String, BTreeSet<ObjectKey>> = HashMap::new();
        for (key, obj) in &inner.objects {
            for value in index_fn(obj) {
                index.entry(value).or_default().insert(key.clone());
            }
        }
        inner.indices.insert(name.clone(), index);
        inner.indexers.insert(name, index_fn);
        Ok(())
    }

    /// Registers a named index unless one with that name already exists.
    /// Used for indices shared between controllers watching the same kind.
    pub fn add_index_if_not_present(
        &self,
        name: impl Into<String>,
        index_fn: impl Fn(&K) -> Vec<String> + Send + Sync + 'static,
    ) -> Result<()> {
        match self.add_index(name, index_fn) {
            Err(Error::IndexAlreadyRegistered(_)) => Ok(()),
            res => res,
        }
    }

    pub fn get(&self, cluster: &LogicalClusterName, namespace: Option<&str>, name: &str) -> Option<Arc<K>> {
        self.get_by_key(&ObjectKey::new(
            cluster.clone(),
            namespace.map(str::to_owned),
            name,
        ))
    }

    pub fn list_cluster(&self, cluster: &LogicalClusterName) -> Vec<Arc<K>> {
        self.inner
            .read()
            .objects
            .iter()
            .filter(|(key, _)| &key.cluster == cluster)
            .map(|(_, obj)| obj.clone())
            .collect()
    }

    pub fn keys(&self) -> Vec<ObjectKey> {
        self.inner.read().objects.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Adds or replaces an object, returning the object it replaced
    pub fn apply(&self, obj: Arc<K>) -> Result<Option<Arc<K>>> {
        let key = ObjectKey::for_object(obj.as_ref())?;
        let mut inner = self.inner.write();
        let old = inner.objects.insert(key.clone(), obj.clone());
        if let Some(old) = &old {
            inner.unindex_object(&key, old);
        }
        inner.index_object(&key, &obj);
        Ok(old)
    }

    /// Removes an object, returning the cached copy if there was one
    pub fn delete(&self, obj: &K) -> Result<Option<Arc<K>>> {
        let key = ObjectKey::for_object(obj)?;
        Ok(self.delete_key(&key))
    }

    pub fn delete_key(&self, key: &ObjectKey) -> Option<Arc<K>> {
        let mut inner = self.inner.write();
        let old = inner.objects.remove(key)?;
        inner.unindex_object(key, &old);
        Some(old)
    }
}

impl<K: Resource> Indexer<K> for Store<K> {
    fn get_by_key(&self, key: &ObjectKey) -> Option<Arc<K>> {
        self.inner.read().objects.get(key).cloned()
    }

    fn index_keys(&self, index: &str, value: &str) -> Result<Vec<ObjectKey>> {
        let inner = self.inner.read();
        Ok(inner
            .index(index)?
            .and_then(|index| index.get(value))
            .map(|keys| keys.iter().cloned().collect())
            .unwrap_or_default())
    }

    fn by_index(&self, index: &str, value: &str) -> Result<Vec<Arc<K>>> {
        let inner = self.inner.read();
        let Some(keys) = inner.index(index)?.and_then(|index| index.get(value)) else {
            return Ok(vec![]);
        };
        Ok(keys
            .iter()
            .filter_map(|key| inner.objects.get(key).cloned())
            .collect())
    }
}
