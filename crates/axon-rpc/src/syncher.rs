//! Per-thread synchronization slots for blocking method calls.
//!
//! A thread performing a synchronous call claims one of a fixed set
//! of syncher slots, tags the call with the slot index and its current
//! call index, ships the call, and parks on the slot's monitor. The
//! return path writes the call into the matching slot and notifies.
//! The call index advances exactly once per call, at completion, so a
//! return that arrives after a timeout carries `current - 1` and is
//! discarded.

use std::cell::RefCell;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::call::{CallError, CallStatus, MethodCall};
use axon_graph::ThreadLocalCache;

/// Size of the syncher pool; bounds how many threads may block in
/// synchronous calls concurrently. Intentionally small to surface
/// misuse.
pub const MAX_SYNCHERS: usize = 127;

struct SyncherState {
    /// Return value parked here by the receiver path.
    method_return: Option<Box<MethodCall>>,
    /// Advanced once per synchronous call, at completion.
    current_call_index: u16,
}

/// One synchronization slot.
pub struct MethodCallSyncher {
    index: u8,
    /// Owning thread UID; 0 when the slot is free.
    thread_uid: std::sync::atomic::AtomicU32,
    state: Mutex<SyncherState>,
    monitor: Condvar,
}

impl MethodCallSyncher {
    fn new(index: u8) -> Self {
        Self {
            index,
            thread_uid: std::sync::atomic::AtomicU32::new(0),
            state: Mutex::new(SyncherState {
                method_return: None,
                current_call_index: 0,
            }),
            monitor: Condvar::new(),
        }
    }

    pub fn index(&self) -> u8 {
        self.index
    }

    pub fn thread_uid(&self) -> u32 {
        self.thread_uid.load(std::sync::atomic::Ordering::Acquire)
    }

    pub fn current_call_index(&self) -> u16 {
        self.state.lock().current_call_index
    }

    /// Return the slot to the free pool.
    fn release(&self) {
        let mut state = self.state.lock();
        if let Some(stale) = state.method_return.take() {
            MethodCall::recycle(stale);
        }
        state.current_call_index = 0;
        drop(state);
        self.thread_uid
            .store(0, std::sync::atomic::Ordering::Release);
    }
}

fn slots() -> &'static [MethodCallSyncher] {
    static SLOTS: OnceLock<Vec<MethodCallSyncher>> = OnceLock::new();
    SLOTS.get_or_init(|| (0..MAX_SYNCHERS).map(|i| MethodCallSyncher::new(i as u8)).collect())
}

/// Access a syncher slot by index.
pub fn syncher(index: u8) -> &'static MethodCallSyncher {
    &slots()[index as usize]
}

struct SyncherClaim {
    index: u8,
}

impl Drop for SyncherClaim {
    fn drop(&mut self) {
        syncher(self.index).release();
    }
}

thread_local! {
    static MY_SYNCHER: RefCell<Option<SyncherClaim>> = const { RefCell::new(None) };
}

/// The calling thread's syncher, claimed on first use and released on
/// thread exit. `None` when the pool is exhausted.
fn claim_thread_syncher() -> Option<&'static MethodCallSyncher> {
    MY_SYNCHER.with(|claim| {
        let mut claim = claim.borrow_mut();
        if let Some(c) = claim.as_ref() {
            return Some(syncher(c.index));
        }
        let uid = ThreadLocalCache::thread_uid();
        for slot in slots() {
            if slot
                .thread_uid
                .compare_exchange(
                    0,
                    uid,
                    std::sync::atomic::Ordering::AcqRel,
                    std::sync::atomic::Ordering::Relaxed,
                )
                .is_ok()
            {
                *claim = Some(SyncherClaim { index: slot.index });
                return Some(slot);
            }
        }
        None
    })
}

/// Syncher slot index of the calling thread, if one is claimed.
pub fn this_thread_syncher_index() -> Option<u8> {
    MY_SYNCHER.with(|claim| claim.borrow().as_ref().map(|c| c.index))
}

/// Perform a blocking synchronous call. `invoke` ships the prepared
/// call towards the server; the caller parks on its syncher until the
/// matching return arrives or the timeout elapses.
///
/// `invoke` must not deliver the return synchronously on the calling
/// thread, the syncher monitor is held across it.
pub fn perform_synch_call(
    mut call: Box<MethodCall>,
    timeout: Duration,
    invoke: impl FnOnce(Box<MethodCall>),
) -> Result<Box<MethodCall>, CallError> {
    let Some(slot) = claim_thread_syncher() else {
        log::error!("syncher pool exhausted; too many threads block in synchronous calls");
        MethodCall::recycle(call);
        return Err(CallError::ProgrammingError);
    };

    let mut state = slot.state.lock();
    debug_assert!(state.method_return.is_none());
    call.syncher_id = slot.index as i8;
    call.thread_uid = slot.thread_uid();
    call.call_index = state.current_call_index;
    call.status = CallStatus::SynchCall;
    invoke(call);

    let deadline = Instant::now() + timeout;
    while state.method_return.is_none() {
        if slot.monitor.wait_until(&mut state, deadline).timed_out() {
            break;
        }
    }

    // Invalidate any still-incoming outdated return.
    state.current_call_index = state.current_call_index.wrapping_add(1);

    match state.method_return.take() {
        Some(ret) => {
            drop(state);
            if ret.has_exception() {
                let error = ret.exception.unwrap_or(CallError::ProgrammingError);
                MethodCall::recycle(ret);
                Err(error)
            } else {
                Ok(ret)
            }
        }
        None => Err(CallError::Timeout),
    }
}

/// Deliver a returning call to its caller's syncher. A return whose
/// call index no longer matches is discarded and recycled.
pub fn handle_method_return(call: Box<MethodCall>) {
    debug_assert!(call.is_returning(true));
    let index = call.syncher_id;
    if index < 0 || index as usize >= MAX_SYNCHERS {
        MethodCall::recycle(call);
        return;
    }
    let slot = syncher(index as u8);
    let mut state = slot.state.lock();
    if call.call_index == state.current_call_index && state.method_return.is_none() {
        state.method_return = Some(call);
        slot.monitor.notify_all();
    } else {
        drop(state);
        MethodCall::recycle(call);
    }
}
