use kube::ResourceExt;
use kubert::index::{ClusterRemoved, NamespacedRemoved};
use parking_lot::RwLock;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry,
};
use std::sync::Arc;

/// Wraps an index, counting the updates applied to it and tracking its size by kind.
pub struct IndexMetrics<T> {
    inner: T,

    index_size: Family<NamespacedIndexLabels, Gauge>,
    index_applies: Family<NamespacedIndexLabels, Counter>,
    index_deletes: Family<NamespacedIndexLabels, Counter>,
    index_resets: Family<IndexLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct NamespacedIndexLabels {
    namespace: String,
    kind: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct IndexLabels {
    kind: String,
}

/// Reports the number of resources of kind `R` an index holds in a namespace. Cluster-scoped
/// kinds ignore the namespace.
pub trait SizedIndex<R> {
    fn size(&self, namespace: &str) -> usize;
}

impl<T, R> SizedIndex<R> for Arc<RwLock<T>>
where
    T: SizedIndex<R>,
{
    fn size(&self, namespace: &str) -> usize {
        self.read().size(namespace)
    }
}

impl<T> IndexMetrics<T> {
    pub fn register(inner: T, prom: &mut Registry) -> Self {
        let index_size = Family::default();
        prom.register(
            "index_size",
            "Gauge of the number of resources in the index",
            index_size.clone(),
        );

        let index_applies = Family::default();
        prom.register(
            "index_applies",
            "Count of applies to the index",
            index_applies.clone(),
        );

        let index_deletes = Family::default();
        prom.register(
            "index_deletes",
            "Count of deletes to the index",
            index_deletes.clone(),
        );

        let index_resets = Family::default();
        prom.register(
            "index_resets",
            "Count of resets to the index",
            index_resets.clone(),
        );

        Self {
            inner,
            index_size,
            index_applies,
            index_deletes,
            index_resets,
        }
    }

    pub fn shared(self) -> Arc<RwLock<Self>> {
        Arc::new(RwLock::new(self))
    }

    fn labels(namespace: String, kind: &str) -> NamespacedIndexLabels {
        NamespacedIndexLabels {
            namespace,
            kind: kind.to_string(),
        }
    }

    fn record_reset(&self, kind: &str) {
        self.index_resets
            .get_or_create(&IndexLabels {
                kind: kind.to_string(),
            })
            .inc();
    }
}

impl<R, T> kubert::index::IndexNamespacedResource<R> for IndexMetrics<Arc<RwLock<T>>>
where
    T: SizedIndex<R>,
    T: kubert::index::IndexNamespacedResource<R>,
    R: ResourceExt<DynamicType = ()>,
{
    fn apply(&mut self, resource: R) {
        let kind = R::kind(&());
        let namespace = resource.namespace().unwrap_or_default();
        self.index_applies
            .get_or_create(&Self::labels(namespace.clone(), &kind))
            .inc();
        self.inner.write().apply(resource);
        let size = SizedIndex::<R>::size(&self.inner, &namespace);
        self.index_size
            .get_or_create(&Self::labels(namespace, &kind))
            .set(size as i64);
    }

    fn delete(&mut self, namespace: String, name: String) {
        let kind = R::kind(&());
        self.index_deletes
            .get_or_create(&Self::labels(namespace.clone(), &kind))
            .inc();
        kubert::index::IndexNamespacedResource::<R>::delete(
            &mut *self.inner.write(),
            namespace.clone(),
            name,
        );
        let size = SizedIndex::<R>::size(&self.inner, &namespace);
        self.index_size
            .get_or_create(&Self::labels(namespace, &kind))
            .set(size as i64);
    }

    fn reset(&mut self, resources: Vec<R>, removed: NamespacedRemoved) {
        let kind = R::kind(&());
        let mut namespaces = resources
            .iter()
            .flat_map(|r| r.namespace())
            .chain(removed.keys().cloned())
            .collect::<Vec<_>>();
        namespaces.sort();
        namespaces.dedup();
        self.record_reset(&kind);
        self.inner.write().reset(resources, removed);
        for ns in namespaces {
            let size = SizedIndex::<R>::size(&self.inner, &ns);
            self.index_size
                .get_or_create(&Self::labels(ns, &kind))
                .set(size as i64);
        }
    }
}

impl<R, T> kubert::index::IndexClusterResource<R> for IndexMetrics<Arc<RwLock<T>>>
where
    T: SizedIndex<R>,
    T: kubert::index::IndexClusterResource<R>,
    R: ResourceExt<DynamicType = ()>,
{
    fn apply(&mut self, resource: R) {
        let kind = R::kind(&());
        self.index_applies
            .get_or_create(&Self::labels(String::new(), &kind))
            .inc();
        self.inner.write().apply(resource);
        self.set_cluster_size::<R>(&kind);
    }

    fn delete(&mut self, name: String) {
        let kind = R::kind(&());
        self.index_deletes
            .get_or_create(&Self::labels(String::new(), &kind))
            .inc();
        kubert::index::IndexClusterResource::<R>::delete(&mut *self.inner.write(), name);
        self.set_cluster_size::<R>(&kind);
    }

    fn reset(&mut self, resources: Vec<R>, removed: ClusterRemoved) {
        let kind = R::kind(&());
        self.record_reset(&kind);
        self.inner.write().reset(resources, removed);
        self.set_cluster_size::<R>(&kind);
    }
}

impl<T> IndexMetrics<Arc<RwLock<T>>> {
    fn set_cluster_size<R>(&self, kind: &str)
    where
        T: SizedIndex<R>,
    {
        let size = SizedIndex::<R>::size(&self.inner, "");
        self.index_size
            .get_or_create(&Self::labels(String::new(), kind))
            .set(size as i64);
    }
}
