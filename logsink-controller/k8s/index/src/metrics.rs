use crate::Registry;
use kube::ResourceExt;
use kubert::index::{ClusterRemoved, IndexClusterResource, IndexNamespacedResource, NamespacedRemoved};
use logsink_controller_core::Scope;
use logsink_controller_k8s_api as k8s;
use parking_lot::RwLock;
use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family, gauge::Gauge},
    registry::Registry as Prom,
};
use std::sync::Arc;

/// Wraps an index to record the resource events it observes.
pub struct IndexMetrics<T> {
    inner: T,

    index_size: Family<IndexLabels, Gauge>,
    index_applies: Family<IndexLabels, Counter>,
    index_deletes: Family<IndexLabels, Counter>,
    index_resets: Family<IndexLabels, Counter>,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct IndexLabels {
    kind: String,
}

pub trait SizedIndex<R> {
    fn size(&self) -> usize;
}

impl SizedIndex<k8s::LogSink> for Registry {
    fn size(&self) -> usize {
        self.count(Scope::Namespace)
    }
}

impl SizedIndex<k8s::ClusterLogSink> for Registry {
    fn size(&self) -> usize {
        self.count(Scope::Cluster)
    }
}

impl<T> IndexMetrics<T> {
    pub fn register(inner: T, prom: &mut Prom) -> Self {
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

    fn labels<R: ResourceExt<DynamicType = ()>>() -> IndexLabels {
        IndexLabels {
            kind: R::kind(&()).to_string(),
        }
    }

    fn set_size<R: ResourceExt<DynamicType = ()>>(&self, size: usize) {
        self.index_size
            .get_or_create(&Self::labels::<R>())
            .set(size as i64);
    }
}

impl<R, T> IndexNamespacedResource<R> for IndexMetrics<Arc<RwLock<T>>>
where
    T: SizedIndex<R> + IndexNamespacedResource<R>,
    R: ResourceExt<DynamicType = ()>,
{
    fn apply(&mut self, resource: R) {
        self.index_applies.get_or_create(&Self::labels::<R>()).inc();
        self.inner.write().apply(resource);
        let size = SizedIndex::<R>::size(&*self.inner.read());
        self.set_size::<R>(size);
    }

    fn delete(&mut self, namespace: String, name: String) {
        self.index_deletes.get_or_create(&Self::labels::<R>()).inc();
        self.inner.write().delete(namespace, name);
        let size = SizedIndex::<R>::size(&*self.inner.read());
        self.set_size::<R>(size);
    }

    fn reset(&mut self, resources: Vec<R>, removed: NamespacedRemoved) {
        self.index_resets.get_or_create(&Self::labels::<R>()).inc();
        self.inner.write().reset(resources, removed);
        let size = SizedIndex::<R>::size(&*self.inner.read());
        self.set_size::<R>(size);
    }
}

impl<R, T> IndexClusterResource<R> for IndexMetrics<Arc<RwLock<T>>>
where
    T: SizedIndex<R> + IndexClusterResource<R>,
    R: ResourceExt<DynamicType = ()>,
{
    fn apply(&mut self, resource: R) {
        self.index_applies.get_or_create(&Self::labels::<R>()).inc();
        self.inner.write().apply(resource);
        let size = SizedIndex::<R>::size(&*self.inner.read());
        self.set_size::<R>(size);
    }

    fn delete(&mut self, name: String) {
        self.index_deletes.get_or_create(&Self::labels::<R>()).inc();
        self.inner.write().delete(name);
        let size = SizedIndex::<R>::size(&*self.inner.read());
        self.set_size::<R>(size);
    }

    fn reset(&mut self, resources: Vec<R>, removed: ClusterRemoved) {
        self.index_resets.get_or_create(&Self::labels::<R>()).inc();
        self.inner.write().reset(resources, removed);
        let size = SizedIndex::<R>::size(&*self.inner.read());
        self.set_size::<R>(size);
    }
}
