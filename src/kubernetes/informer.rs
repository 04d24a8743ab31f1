//! Local object caches fed by a watch-event stream, queryable by key and by
//! secondary index, with change callbacks.

use std::collections::BTreeSet;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use futures::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::client;
use super::resource::{object_key, Resource};
use super::watch::Event;

// How long to wait before polling the watch stream again after an error.
const ERROR_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Secondary index function: maps an object to the index value it belongs
/// to, or `None` to leave it out of the index.
pub type IndexFunc<R> = fn(&R) -> Option<String>;

struct StoreInner<R> {
    objects: AHashMap<String, Arc<R>>,

    // index name -> index value -> object keys
    indices: AHashMap<&'static str, AHashMap<String, BTreeSet<String>>>,
}

/// A shared, keyed object cache. Clones are handles to the same cache.
pub struct Store<R> {
    index_funcs: Arc<Vec<(&'static str, IndexFunc<R>)>>,
    inner: Arc<RwLock<StoreInner<R>>>,
}

impl<R> Clone for Store<R> {
    fn clone(&self) -> Self {
        Self {
            index_funcs: Arc::clone(&self.index_funcs),
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Resource> Store<R> {
    fn new(index_funcs: Vec<(&'static str, IndexFunc<R>)>) -> Self {
        let indices = index_funcs
            .iter()
            .map(|(name, _)| (*name, AHashMap::new()))
            .collect();

        Self {
            index_funcs: Arc::new(index_funcs),
            inner: Arc::new(RwLock::new(StoreInner {
                objects: AHashMap::new(),
                indices,
            })),
        }
    }

    pub fn get_by_key(&self, key: &str) -> Option<Arc<R>> {
        self.inner.read().objects.get(key).cloned()
    }

    /// Objects whose `index` function evaluates to `value`.
    pub fn by_index(&self, index: &str, value: &str) -> Vec<Arc<R>> {
        let inner = self.inner.read();
        let Some(keys) = inner.indices.get(index).and_then(|idx| idx.get(value)) else {
            return Vec::new();
        };

        keys.iter()
            .filter_map(|key| inner.objects.get(key).cloned())
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.read().objects.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().objects.is_empty()
    }

    fn upsert(&self, obj: Arc<R>) {
        let key = object_key(obj.metadata());
        let mut inner = self.inner.write();
        self.unindex(&mut inner, &key);
        self.index(&mut inner, &key, &obj);
        inner.objects.insert(key, obj);
    }

    fn remove(&self, key: &str) {
        let mut inner = self.inner.write();
        self.unindex(&mut inner, key);
        inner.objects.remove(key);
    }

    /// Swap the whole cache content, returning the objects that were present
    /// before but are not any longer.
    fn replace(&self, objects: Vec<Arc<R>>) -> Vec<Arc<R>> {
        let mut inner = self.inner.write();

        let mut fresh = AHashMap::with_capacity(objects.len());
        for obj in objects {
            fresh.insert(object_key(obj.metadata()), obj);
        }

        let removed = inner
            .objects
            .values()
            .filter(|obj| !fresh.contains_key(&object_key(obj.metadata())))
            .cloned()
            .collect();

        inner.objects = fresh;
        for index in inner.indices.values_mut() {
            index.clear();
        }
        let entries: Vec<(String, Arc<R>)> = inner
            .objects
            .iter()
            .map(|(key, obj)| (key.clone(), Arc::clone(obj)))
            .collect();
        for (key, obj) in entries {
            self.index(&mut inner, &key, &obj);
        }

        removed
    }

    fn index(&self, inner: &mut StoreInner<R>, key: &str, obj: &R) {
        for (name, func) in self.index_funcs.iter() {
            if let Some(value) = func(obj) {
                if let Some(index) = inner.indices.get_mut(name) {
                    index.entry(value).or_default().insert(key.to_string());
                }
            }
        }
    }

    fn unindex(&self, inner: &mut StoreInner<R>, key: &str) {
        for index in inner.indices.values_mut() {
            for keys in index.values_mut() {
                keys.remove(key);
            }
        }
    }
}

/// Callbacks fired on cache changes. The initial listing is replayed as a
/// sequence of `on_add` calls once the cache has synced.
pub trait EventHandler<R>: Send + Sync {
    fn on_add(&self, obj: &Arc<R>);
    fn on_update(&self, obj: &Arc<R>);
    fn on_delete(&self, obj: &Arc<R>);
}

/// A cache kept in sync with the cluster by a watch-event stream, shared
/// between the task driving it and any number of readers.
pub struct SharedInformer<R> {
    store: Store<R>,
    handlers: RwLock<Vec<Box<dyn EventHandler<R>>>>,

    // Objects collected between `Init` and `InitDone`.
    buffer: Mutex<Vec<Arc<R>>>,

    synced: watch::Sender<bool>,
}

impl<R: Resource> SharedInformer<R> {
    pub fn new() -> Self {
        Self::with_indices(Vec::new())
    }

    pub fn with_indices(indices: Vec<(&'static str, IndexFunc<R>)>) -> Self {
        let (synced, _) = watch::channel(false);

        Self {
            store: Store::new(indices),
            handlers: RwLock::new(Vec::new()),
            buffer: Mutex::new(Vec::new()),
            synced,
        }
    }

    /// A handle to the cache behind this informer.
    pub fn store(&self) -> Store<R> {
        self.store.clone()
    }

    /// Register change callbacks. Handlers added after the initial sync
    /// miss the replay of the initial listing.
    pub fn add_event_handler(&self, handler: impl EventHandler<R> + 'static) {
        self.handlers.write().push(Box::new(handler));
    }

    pub fn has_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Wait until the cache has seen a complete listing. Returns false when
    /// the context is canceled first, or when the informer is gone without
    /// ever syncing.
    pub async fn wait_for_sync(&self, ctx: &CancellationToken) -> bool {
        let mut synced = self.synced.subscribe();

        tokio::select! {
            _ = ctx.cancelled() => false,
            result = synced.wait_for(|synced| *synced) => result.is_ok(),
        }
    }

    /// Drive the cache from a watch-event stream until the context is
    /// canceled or the stream ends.
    pub async fn run<S>(&self, ctx: CancellationToken, stream: S)
    where
        S: Stream<Item = Result<Event<R>, client::Error>>,
    {
        let mut stream = pin!(stream);

        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                item = stream.next() => match item {
                    Some(Ok(event)) => self.apply(event),
                    Some(Err(err)) => {
                        debug!(message = "watch stream error", %err);

                        tokio::select! {
                            _ = ctx.cancelled() => return,
                            _ = tokio::time::sleep(ERROR_RETRY_DELAY) => {}
                        }
                    }
                    None => return,
                },
            }
        }
    }

    fn apply(&self, event: Event<R>) {
        match event {
            Event::Init => self.buffer.lock().clear(),

            Event::InitApply(obj) => self.buffer.lock().push(Arc::new(obj)),

            Event::InitDone => {
                let objects = std::mem::take(&mut *self.buffer.lock());
                let removed = self.store.replace(objects.clone());
                self.synced.send_replace(true);

                let handlers = self.handlers.read();
                for obj in &objects {
                    for handler in handlers.iter() {
                        handler.on_add(obj);
                    }
                }
                // Objects that disappeared while the stream was relisting.
                for obj in &removed {
                    for handler in handlers.iter() {
                        handler.on_delete(obj);
                    }
                }
            }

            Event::Apply(obj) => {
                let obj = Arc::new(obj);
                let existed = self
                    .store
                    .get_by_key(&object_key(obj.metadata()))
                    .is_some();
                self.store.upsert(Arc::clone(&obj));

                for handler in self.handlers.read().iter() {
                    if existed {
                        handler.on_update(&obj);
                    } else {
                        handler.on_add(&obj);
                    }
                }
            }

            Event::Delete(obj) => {
                let obj = Arc::new(obj);
                self.store.remove(&object_key(obj.metadata()));

                for handler in self.handlers.read().iter() {
                    handler.on_delete(&obj);
                }
            }
        }
    }
}

impl<R: Resource> Default for SharedInformer<R> {
    fn default() -> Self {
        Self::new()
    }
}
