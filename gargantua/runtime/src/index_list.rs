use kubert::index::{IndexNamespacedResource, NamespacedRemoved};
use parking_lot::RwLock;
use std::sync::Arc;

/// Fans a single watch out to several indexes.
pub struct IndexList<A, T> {
    index: Arc<RwLock<A>>,
    tail: T,
}

/// Terminates an [`IndexList`].
pub struct End(());

impl<A, T, R> IndexNamespacedResource<R> for IndexList<A, T>
where
    A: IndexNamespacedResource<R>,
    T: IndexNamespacedResource<R>,
    R: Clone,
{
    fn apply(&mut self, resource: R) {
        self.tail.apply(resource.clone());
        self.index.write().apply(resource);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.tail.delete(namespace.clone(), name.clone());
        self.index.write().delete(namespace, name);
    }

    fn reset(&mut self, resources: Vec<R>, removed: NamespacedRemoved) {
        self.tail.reset(resources.clone(), removed.clone());
        self.index.write().reset(resources, removed);
    }
}

impl<R> IndexNamespacedResource<R> for End {
    fn apply(&mut self, _: R) {}

    fn delete(&mut self, _: String, _: String) {}

    fn reset(&mut self, _: Vec<R>, _: NamespacedRemoved) {}
}

impl<A> IndexList<A, End> {
    pub fn new(index: Arc<RwLock<A>>) -> Self {
        IndexList {
            index,
            tail: End(()),
        }
    }
}

impl<A, T> IndexList<A, T> {
    pub fn push<B>(self, index: Arc<RwLock<B>>) -> IndexList<B, IndexList<A, T>> {
        IndexList { index, tail: self }
    }

    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }
}
