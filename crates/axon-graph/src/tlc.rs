//! Per-thread buffer state.
//!
//! Cheap-copy types draw their buffers from pools owned by the
//! publishing thread, so the hot path never contends on a shared pool.
//! The cache also parks auto-locked queue values and hands every
//! thread a process-unique UID used by the RPC layer.

use std::cell::RefCell;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use axon_core::{BufferPool, BufferRef, OwnedBuffer, TypeInfo, TypeUid};

static NEXT_THREAD_UID: AtomicU32 = AtomicU32::new(1);

thread_local! {
    static CACHE: RefCell<ThreadLocalCache> = RefCell::new(ThreadLocalCache::new());
}

pub struct ThreadLocalCache {
    thread_uid: u32,
    cc_pools: AHashMap<TypeUid, Arc<BufferPool>>,
    auto_locks: Vec<BufferRef>,
}

impl ThreadLocalCache {
    fn new() -> Self {
        Self {
            thread_uid: NEXT_THREAD_UID.fetch_add(1, Ordering::Relaxed),
            cc_pools: AHashMap::new(),
            auto_locks: Vec::new(),
        }
    }

    /// Run `f` with the calling thread's cache.
    pub fn with<R>(f: impl FnOnce(&mut ThreadLocalCache) -> R) -> R {
        CACHE.with(|cache| f(&mut cache.borrow_mut()))
    }

    /// Process-unique UID of the calling thread.
    pub fn thread_uid() -> u32 {
        Self::with(|tlc| tlc.thread_uid)
    }

    /// Fetch an unused cheap-copy buffer from this thread's pool for
    /// the given type.
    pub fn get_unused(&mut self, data_type: &Arc<TypeInfo>) -> Option<OwnedBuffer> {
        let pool = self
            .cc_pools
            .entry(data_type.uid())
            .or_insert_with(|| BufferPool::new(data_type.clone(), false));
        pool.get_unused()
    }

    /// Keep a reference locked until this thread's cache is torn down.
    pub fn add_auto_lock(&mut self, reference: BufferRef) {
        self.auto_locks.push(reference);
    }

    /// Drop all auto-locked references now.
    pub fn release_all_locks(&mut self) {
        self.auto_locks.clear();
    }

    pub fn auto_lock_count(&self) -> usize {
        self.auto_locks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axon_core::TypeRegistry;

    #[test]
    fn thread_uids_are_unique() {
        let mine = ThreadLocalCache::thread_uid();
        let other = std::thread::spawn(ThreadLocalCache::thread_uid)
            .join()
            .unwrap();
        assert_ne!(mine, other);
        // Stable within a thread.
        assert_eq!(mine, ThreadLocalCache::thread_uid());
    }

    #[test]
    fn cheap_copy_pools_are_per_type() {
        let int_type = TypeRegistry::global().register_value::<i64>("Int64", true);
        let double_type = TypeRegistry::global().register_value::<f64>("Double", true);
        ThreadLocalCache::with(|tlc| {
            let a = tlc.get_unused(&int_type).unwrap();
            let b = tlc.get_unused(&double_type).unwrap();
            assert!(!Arc::ptr_eq(a.buffer().data_type(), b.buffer().data_type()));
        });
    }

    #[test]
    fn auto_locks_hold_until_release() {
        let int_type = TypeRegistry::global().register_value::<i64>("Int64", true);
        let pool = BufferPool::new(int_type, false);
        let owned = pool.get_unused().unwrap();
        let mut acc = axon_core::PublishAccounting::begin(owned, 1);
        let reference = acc.assign();
        acc.finish();
        let buffer = reference.buffer().clone();

        ThreadLocalCache::with(|tlc| tlc.add_auto_lock(reference.clone()));
        drop(reference);
        assert!(!buffer.is_unused());

        ThreadLocalCache::with(|tlc| tlc.release_all_locks());
        assert!(buffer.is_unused());
    }
}
