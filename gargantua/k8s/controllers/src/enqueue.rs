use crate::queue::WorkQueue;
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use gargantua_k8s_api::ResourceId;
use kube::Resource;
use kubert::index::{IndexNamespacedResource, NamespacedRemoved};
use parking_lot::RwLock;
use std::sync::Arc;

type Mapper<K> = Box<dyn Fn(&K) -> Vec<ResourceId> + Send + Sync>;

/// Feeds watch updates into a controller's queue.
///
/// Each update is mapped to the keys it affects, e.g. a `Machine` to its owning `MachineSet`.
/// The keys an object last mapped to are remembered, so moving or deleting an object also
/// enqueues the keys it previously affected.
pub struct Enqueue<K> {
    queue: WorkQueue<ResourceId>,
    map: Mapper<K>,
    last: HashMap<ResourceId, Vec<ResourceId>>,
}

// === impl Enqueue ===

impl<K: Resource + 'static> Enqueue<K> {
    /// Enqueues each object by its own key.
    pub fn new(queue: WorkQueue<ResourceId>) -> Self {
        Self::mapped(queue, |obj: &K| ResourceId::of(obj).into_iter().collect())
    }

    pub fn mapped(
        queue: WorkQueue<ResourceId>,
        map: impl Fn(&K) -> Vec<ResourceId> + Send + Sync + 'static,
    ) -> Self {
        Self {
            queue,
            map: Box::new(map),
            last: HashMap::default(),
        }
    }

    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }

    fn enqueue(&self, keys: impl IntoIterator<Item = ResourceId>) {
        let mut seen = HashSet::default();
        for key in keys {
            if seen.insert(key.clone()) {
                self.queue.add(key);
            }
        }
    }
}

impl<K: Resource + 'static> IndexNamespacedResource<K> for Enqueue<K> {
    fn apply(&mut self, resource: K) {
        let Some(id) = ResourceId::of(&resource) else {
            return;
        };
        let keys = (self.map)(&resource);
        let prior = self.last.insert(id, keys.clone()).unwrap_or_default();
        self.enqueue(prior.into_iter().chain(keys));
    }

    fn delete(&mut self, namespace: String, name: String) {
        if let Some(keys) = self.last.remove(&ResourceId::new(namespace, name)) {
            self.enqueue(keys);
        }
    }

    fn reset(&mut self, resources: Vec<K>, removed: NamespacedRemoved) {
        for (namespace, names) in removed {
            for name in names {
                IndexNamespacedResource::<K>::delete(self, namespace.clone(), name);
            }
        }
        for resource in resources {
            self.apply(resource);
        }
    }
}

/// Maps an object to the keys named by one of its labels.
pub fn by_label<K: Resource>(key: &'static str) -> impl Fn(&K) -> Vec<ResourceId> + Send + Sync {
    move |obj: &K| {
        let meta = obj.meta();
        gargantua_k8s_api::labels::get(meta, key)
            .map(|name| ResourceId::new(meta.namespace.clone().unwrap_or_default(), name))
            .into_iter()
            .collect()
    }
}
