use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Weak;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::bucket::Bucket;
use crate::bucket::Idleness;
use crate::route::BucketKey;
use crate::spawn;

/// Owns every live [`Bucket`], keyed by [`BucketKey`].
///
/// Buckets are created on first use and dropped once they have sat empty
/// for the idle TTL, which keeps memory bounded for high-cardinality keys
/// such as per-message deletes. Clones share the same map.
#[derive(Clone, Debug)]
pub struct BucketRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Debug)]
pub(crate) struct RegistryInner {
    buckets: Mutex<HashMap<BucketKey, Arc<Bucket>>>,
    idle_ttl: Duration,
}

impl BucketRegistry {
    pub fn new(idle_ttl: Duration) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                buckets: Mutex::new(HashMap::new()),
                idle_ttl,
            }),
        }
    }

    pub fn idle_ttl(&self) -> Duration {
        self.inner.idle_ttl
    }

    /// Return the bucket for `key`, creating an unknown one if needed.
    ///
    /// The bucket is touched before the map lock is released, so an
    /// eviction can never race a caller that has just looked it up.
    pub fn get_or_create(&self, key: &BucketKey) -> Arc<Bucket> {
        let mut buckets = self.inner.buckets.lock();
        if let Some(bucket) = buckets.get(key) {
            bucket.touch();
            return Arc::clone(bucket);
        }
        debug!(bucket = %key, "creating bucket");
        let bucket = Bucket::new_in(key.clone(), Arc::downgrade(&self.inner));
        buckets.insert(key.clone(), Arc::clone(&bucket));
        bucket
    }

    pub fn get(&self, key: &BucketKey) -> Option<Arc<Bucket>> {
        self.inner.buckets.lock().get(key).cloned()
    }

    /// Mark `bucket` as used now and cancel any pending eviction.
    pub fn touch(&self, bucket: &Bucket) {
        bucket.touch();
    }

    /// Drop `bucket` once it has stayed idle for `ttl`.
    pub fn schedule_eviction(&self, bucket: &Arc<Bucket>, ttl: Duration) {
        self.inner.schedule_eviction(bucket, ttl);
    }

    pub fn len(&self) -> usize {
        self.inner.buckets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.buckets.lock().is_empty()
    }
}

enum Eviction {
    Done,
    Deferred(Instant),
}

impl RegistryInner {
    pub(crate) fn idle_ttl(&self) -> Duration {
        self.idle_ttl
    }

    pub(crate) fn schedule_eviction(self: &Arc<Self>, bucket: &Arc<Bucket>, ttl: Duration) {
        let registry = Arc::downgrade(self);
        let target = Arc::downgrade(bucket);
        let task = spawn(async move {
            let mut deadline = Instant::now() + ttl;
            loop {
                tokio::time::sleep_until(deadline).await;
                match try_evict(&registry, &target, ttl) {
                    Eviction::Done => return,
                    Eviction::Deferred(until) => deadline = until,
                }
            }
        });
        if let Some(task) = task {
            bucket.set_eviction(task.abort_handle());
        }
    }
}

fn try_evict(registry: &Weak<RegistryInner>, bucket: &Weak<Bucket>, ttl: Duration) -> Eviction {
    let (Some(registry), Some(bucket)) = (registry.upgrade(), bucket.upgrade()) else {
        return Eviction::Done;
    };
    let mut buckets = registry.buckets.lock();
    match bucket.idleness(ttl) {
        // Whoever holds it will schedule a new eviction when it goes idle.
        Idleness::Active => Eviction::Done,
        Idleness::Until(until) => Eviction::Deferred(until),
        Idleness::Expired => {
            let key = bucket.key();
            if buckets
                .get(key)
                .is_some_and(|current| Arc::ptr_eq(current, &bucket))
            {
                buckets.remove(key);
                debug!(bucket = %key, "evicted idle bucket");
            }
            Eviction::Done
        }
    }
}
