//! Buffer pools and the reuse-aware banked reference counter.
//!
//! A buffer carries four reference-counter banks; the active bank is
//! `reuse_counter mod 4`. Each bank stores `locks - 1`, so `-1` means
//! unlocked and `bank >= 0` means locked. Every recycle advances the
//! reuse counter, so a lock attempt against a stale reference lands on
//! a bank belonging to an earlier lifetime and is rejected without
//! corrupting the live bank.

use std::sync::atomic::{AtomicBool, AtomicI16, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::types::{PortValue, TypeInfo};

/// Number of reference-counter banks per buffer.
pub const REF_BANKS: usize = 4;

const BANK_MASK: u32 = REF_BANKS as u32 - 1;

/// One atomic, non-blocking reference-counter bank.
///
/// Stores one less than the actual number of references, so `-1` when
/// there are no locks. Once a bank has dropped back to `-1`, further
/// lock attempts on it fail without ruining the counter.
pub struct RefCounter {
    wrapped: AtomicI16,
}

impl RefCounter {
    const UNLOCKED: i16 = -1;

    fn new() -> Self {
        Self {
            wrapped: AtomicI16::new(Self::UNLOCKED),
        }
    }

    /// Number of locks currently held on this bank.
    pub fn locks(&self) -> i16 {
        self.wrapped.load(Ordering::Acquire) + 1
    }

    /// `bank >= 0` is the locked predicate.
    pub fn is_locked(&self) -> bool {
        self.wrapped.load(Ordering::Acquire) >= 0
    }

    /// Try to add `count` locks. Fails once the bank has reached `-1`.
    fn try_locks(&self, count: i16) -> bool {
        let mut cur = self.wrapped.load(Ordering::Relaxed);
        loop {
            if cur < 0 {
                return false;
            }
            match self.wrapped.compare_exchange_weak(
                cur,
                cur + count,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Add locks to a bank the caller already holds a lock on.
    fn add_locks(&self, count: i16) {
        let old = self.wrapped.fetch_add(count, Ordering::AcqRel);
        debug_assert!(old >= 0, "add_locks on an unlocked bank");
    }

    /// Initialize the lock count of a fresh (unused) buffer.
    fn set_locks(&self, count: i16) {
        debug_assert!(count > 0);
        self.wrapped.store(count - 1, Ordering::Release);
    }

    /// Release locks; returns true when the bank dropped below zero
    /// and the buffer must be recycled.
    fn release_locks(&self, count: i16) -> bool {
        let new = self.wrapped.fetch_sub(count, Ordering::AcqRel) - count;
        debug_assert!(new >= Self::UNLOCKED, "more locks released than acquired");
        new < 0
    }

    fn reset(&self) {
        self.wrapped.store(Self::UNLOCKED, Ordering::Release);
    }
}

/// A single reference-counted port data buffer.
///
/// Ownership is with the pool that created the buffer; the banked
/// reference counter decides when it returns there. The payload cell
/// is only written through an [`OwnedBuffer`] while the buffer is
/// flagged unused.
pub struct Buffer {
    banks: [RefCounter; REF_BANKS],
    reuse_counter: AtomicU32,
    unused: AtomicBool,
    data_type: Arc<TypeInfo>,
    /// Back-pointer to the owning pool; never an owning link.
    pool: Weak<BufferPool>,
    /// Self reference for handing out counted `BufferRef`s.
    me: Weak<Buffer>,
    value: std::cell::UnsafeCell<Box<dyn PortValue>>,
}

// SAFETY: the payload cell is only written while `unused` is true and
// the buffer is exclusively reachable through one `OwnedBuffer`; all
// shared access goes through `BufferRef`s, which hold a bank lock, and
// a buffer is never unused and locked at the same time.
unsafe impl Sync for Buffer {}
unsafe impl Send for Buffer {}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("type", &self.data_type.name())
            .field("reuse", &self.reuse_counter.load(Ordering::Relaxed))
            .field("unused", &self.unused.load(Ordering::Relaxed))
            .finish()
    }
}

impl Buffer {
    fn new(
        data_type: Arc<TypeInfo>,
        pool: Weak<BufferPool>,
        value: Box<dyn PortValue>,
    ) -> Arc<Buffer> {
        Arc::new_cyclic(|me| Self {
            banks: [
                RefCounter::new(),
                RefCounter::new(),
                RefCounter::new(),
                RefCounter::new(),
            ],
            reuse_counter: AtomicU32::new(0),
            unused: AtomicBool::new(true),
            data_type,
            pool,
            me: me.clone(),
            value: std::cell::UnsafeCell::new(value),
        })
    }

    fn me(&self) -> Arc<Buffer> {
        self.me.upgrade().expect("buffer outlived its last Arc")
    }

    pub fn data_type(&self) -> &Arc<TypeInfo> {
        &self.data_type
    }

    pub fn reuse_counter(&self) -> u32 {
        self.reuse_counter.load(Ordering::Acquire)
    }

    pub fn is_unused(&self) -> bool {
        self.unused.load(Ordering::Acquire)
    }

    pub fn bank(&self, index: usize) -> &RefCounter {
        &self.banks[index]
    }

    pub fn current_bank_index(&self) -> usize {
        (self.reuse_counter() & BANK_MASK) as usize
    }

    /// The bank selected by the current reuse counter. Only safe to
    /// reason about while the caller holds a lock on it.
    pub fn current_bank(&self) -> &RefCounter {
        &self.banks[self.current_bank_index()]
    }

    /// Shared payload access.
    pub fn value(&self) -> &dyn PortValue {
        // SAFETY: callers reach this through a `BufferRef` or an
        // `OwnedBuffer`; in both cases no mutable access can exist
        // concurrently (see the Sync impl above).
        unsafe { &**self.value.get() }
    }

    /// Try to take one read lock against the bank that was current
    /// when `reuse` was observed. Fails if the buffer has been
    /// recycled since.
    pub fn try_lock_at(&self, reuse: u32) -> Option<BufferRef> {
        let bank = (reuse & BANK_MASK) as u8;
        if !self.banks[bank as usize].try_locks(1) {
            return None;
        }
        if self.reuse_counter.load(Ordering::Acquire) != reuse {
            // Landed on a bank that has been reused in the meantime;
            // hand the stray lock straight back.
            self.release_on_bank(bank, 1);
            return None;
        }
        Some(BufferRef {
            buffer: self.me(),
            bank,
        })
    }

    /// Release `count` locks on the given bank, recycling the buffer
    /// when the bank drops below zero.
    pub fn release_on_bank(&self, bank: u8, count: i16) {
        if self.banks[bank as usize].release_locks(count) {
            self.recycle();
        }
    }

    fn recycle(&self) {
        debug_assert!(!self.is_unused(), "recycling an unused buffer");
        let reuse = self.reuse_counter.fetch_add(1, Ordering::AcqRel) + 1;
        self.banks[(reuse & BANK_MASK) as usize].reset();
        self.unused.store(true, Ordering::Release);
        if let Some(pool) = self.pool.upgrade() {
            pool.reclaim(self.me());
        }
    }
}

/// A read lock on a buffer. Cloning adds a lock, dropping releases it;
/// the last release recycles the buffer into its pool.
pub struct BufferRef {
    buffer: Arc<Buffer>,
    bank: u8,
}

impl BufferRef {
    /// Adopt one already-accounted lock (publish estimate accounting).
    pub fn adopt(buffer: Arc<Buffer>, bank: u8) -> Self {
        debug_assert!(buffer.banks[bank as usize].is_locked());
        Self { buffer, bank }
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    pub fn bank(&self) -> u8 {
        self.bank
    }

    pub fn value(&self) -> &dyn PortValue {
        self.buffer.value()
    }
}

impl Clone for BufferRef {
    fn clone(&self) -> Self {
        self.buffer.banks[self.bank as usize].add_locks(1);
        Self {
            buffer: self.buffer.clone(),
            bank: self.bank,
        }
    }
}

impl Drop for BufferRef {
    fn drop(&mut self) {
        self.buffer.release_on_bank(self.bank, 1);
    }
}

impl std::fmt::Debug for BufferRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BufferRef(bank {}, {:?})", self.bank, self.buffer)
    }
}

/// Exclusive handle to an unused buffer obtained from a pool.
///
/// Dropping the handle without publishing returns the buffer to its
/// pool untouched.
pub struct OwnedBuffer {
    buffer: Option<Arc<Buffer>>,
}

impl OwnedBuffer {
    pub fn buffer(&self) -> &Arc<Buffer> {
        self.buffer.as_ref().expect("handle already consumed")
    }

    pub fn value(&self) -> &dyn PortValue {
        self.buffer().value()
    }

    /// Mutable payload access.
    pub fn value_mut(&mut self) -> &mut dyn PortValue {
        let buffer = self.buffer.as_ref().expect("handle already consumed");
        debug_assert!(buffer.is_unused());
        // SAFETY: the buffer is flagged unused and this handle is the
        // only path to it; no bank lock can exist on an unused buffer,
        // so no shared reference to the payload is live.
        unsafe { &mut **buffer.value.get() }
    }

    /// Mark the buffer used with `locks` initial locks on the current
    /// bank and hand it over to publish accounting.
    pub fn commit(mut self, locks: i16) -> (Arc<Buffer>, u8) {
        let buffer = self.buffer.take().expect("handle already consumed");
        debug_assert!(buffer.is_unused());
        let bank = buffer.current_bank_index() as u8;
        buffer.unused.store(false, Ordering::Release);
        buffer.banks[bank as usize].set_locks(locks);
        (buffer, bank)
    }
}

impl Drop for OwnedBuffer {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            if let Some(pool) = buffer.pool.upgrade() {
                pool.reclaim(buffer);
            }
        }
    }
}

impl std::fmt::Debug for OwnedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OwnedBuffer({:?})", self.buffer)
    }
}

/// Pool of buffers of one type. Grows on demand; growth after the
/// first cycle's worst case has been absorbed is logged.
pub struct BufferPool {
    data_type: Arc<TypeInfo>,
    inter_thread: bool,
    free: Mutex<Vec<Arc<Buffer>>>,
    allocated: AtomicUsize,
    me: Weak<BufferPool>,
}

impl BufferPool {
    pub fn new(data_type: Arc<TypeInfo>, inter_thread: bool) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            data_type,
            inter_thread,
            free: Mutex::new(Vec::new()),
            allocated: AtomicUsize::new(0),
            me: me.clone(),
        })
    }

    pub fn data_type(&self) -> &Arc<TypeInfo> {
        &self.data_type
    }

    /// Number of buffers this pool has ever created.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }

    /// Fetch an unused buffer, creating and attaching one when the
    /// free list is empty. Returns `None` for types without a factory.
    pub fn get_unused(&self) -> Option<OwnedBuffer> {
        if let Some(buffer) = self.free.lock().pop() {
            debug_assert!(buffer.is_unused());
            return Some(OwnedBuffer {
                buffer: Some(buffer),
            });
        }

        let value = self.data_type.create_instance(self.inter_thread)?;
        let buffer = Buffer::new(self.data_type.clone(), self.me.clone(), value);
        let total = self.allocated.fetch_add(1, Ordering::Relaxed) + 1;
        if total > crate::MIN_POOL_BUFFERS {
            log::debug!(
                "buffer pool for '{}' grew to {} buffers",
                self.data_type.name(),
                total
            );
        }
        Some(OwnedBuffer {
            buffer: Some(buffer),
        })
    }

    fn reclaim(&self, buffer: Arc<Buffer>) {
        debug_assert!(buffer.is_unused());
        self.free.lock().push(buffer);
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("type", &self.data_type.name())
            .field("inter_thread", &self.inter_thread)
            .field("allocated", &self.allocated())
            .finish()
    }
}

/// Publish-path lock accounting: apply the estimate in one atomic
/// `set_locks`, assign references as targets accept, release the
/// shortfall in one atomic subtract.
pub struct PublishAccounting {
    buffer: Arc<Buffer>,
    bank: u8,
    estimate: i16,
    assigned: i16,
}

impl PublishAccounting {
    /// Commit an owned buffer with `estimate` locks (the publishing
    /// slot counts as the first assignment).
    pub fn begin(owned: OwnedBuffer, estimate: i16) -> Self {
        debug_assert!(estimate >= 1);
        let (buffer, bank) = owned.commit(estimate);
        Self {
            buffer,
            bank,
            estimate,
            assigned: 0,
        }
    }

    pub fn buffer(&self) -> &Arc<Buffer> {
        &self.buffer
    }

    /// Hand out one of the estimated locks.
    pub fn assign(&mut self) -> BufferRef {
        self.assigned += 1;
        debug_assert!(self.assigned <= self.estimate);
        BufferRef::adopt(self.buffer.clone(), self.bank)
    }

    /// Release the difference between estimate and assignments.
    pub fn finish(self) {}
}

impl Drop for PublishAccounting {
    fn drop(&mut self) {
        // Also covers a publish path abandoned mid-way: everything not
        // handed out is released in one subtract.
        let shortfall = self.estimate - self.assigned;
        if shortfall > 0 {
            self.buffer.release_on_bank(self.bank, shortfall);
        }
    }
}
