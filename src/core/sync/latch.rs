/*!
 * Completion Latch
 *
 * One-shot rendezvous between the orchestrator and the worker thread.
 *
 * # Design
 *
 * A single atomic state word doubles as the parking address for
 * parking_lot_core, in the same way the futex wait strategy parks on its slot
 * counters. Settling never allocates and never takes a lock of its own, so
 * it can be driven from a signal handler running on the faulting thread.
 * Only the first settle call wins; later calls report `false`.
 */

use crate::core::types::FaultRecord;
use parking_lot_core::{park, unpark_all, ParkToken, UnparkToken};
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

const PENDING: u32 = 0;
const CLAIMED: u32 = 1;
const RETURNED: u32 = 2;
const FAULTED: u32 = 3;
const PANICKED: u32 = 4;

/// How the worker finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Closure returned normally
    Returned,
    /// Fault delivered and classified
    Faulted(FaultRecord),
    /// Closure panicked with an ordinary panic
    Panicked,
}

pub struct CompletionLatch {
    state: AtomicU32,
    record: UnsafeCell<Option<FaultRecord>>,
}

// `record` is written once by the thread that moves `state` to CLAIMED and
// read only after the Release store of a terminal state has been observed.
unsafe impl Sync for CompletionLatch {}

impl CompletionLatch {
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(PENDING),
            record: UnsafeCell::new(None),
        }
    }

    /// Settle as a normal return
    pub fn complete(&self) -> bool {
        self.settle(RETURNED, None)
    }

    /// Settle as a captured fault
    pub fn fault(&self, record: FaultRecord) -> bool {
        self.settle(FAULTED, Some(record))
    }

    /// Settle as an ordinary panic of the closure
    pub fn panicked(&self) -> bool {
        self.settle(PANICKED, None)
    }

    fn settle(&self, terminal: u32, record: Option<FaultRecord>) -> bool {
        if self
            .state
            .compare_exchange(PENDING, CLAIMED, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        unsafe {
            *self.record.get() = record;
        }
        self.state.store(terminal, Ordering::Release);

        unsafe {
            unpark_all(self.addr(), UnparkToken(0));
        }
        true
    }

    /// Non-blocking check
    pub fn try_get(&self) -> Option<Completion> {
        match self.state.load(Ordering::Acquire) {
            RETURNED => Some(Completion::Returned),
            PANICKED => Some(Completion::Panicked),
            FAULTED => {
                let record = unsafe { *self.record.get() };
                // FAULTED is only ever published together with a record
                record.map(Completion::Faulted)
            }
            _ => None,
        }
    }

    /// Block until the latch is settled
    pub fn wait(&self) -> Completion {
        loop {
            if let Some(completion) = self.try_get() {
                return completion;
            }

            unsafe {
                park(
                    self.addr(),
                    || {
                        let state = self.state.load(Ordering::Acquire);
                        state == PENDING || state == CLAIMED
                    },
                    || {},
                    |_key, _was_last| {},
                    ParkToken(0),
                    None,
                );
            }
        }
    }

    #[inline]
    fn addr(&self) -> usize {
        &self.state as *const AtomicU32 as usize
    }
}

impl Default for CompletionLatch {
    fn default() -> Self {
        Self::new()
    }
}
