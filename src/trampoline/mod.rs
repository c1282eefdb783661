/*!
 * Trampoline
 *
 * Redirection target for a thread whose register snapshot was rewritten by
 * the exception-port listener. The faulted thread resumes here, on its
 * landing stack, as though the faulting instruction had called it.
 *
 * The trampoline never unwinds: the frames below the fault were interrupted
 * at an arbitrary instruction and cannot be unwound through. It hands control
 * to the landing the bridge set for this thread, which delivers the fault and
 * parks the thread.
 */

pub mod snapshot;

pub use snapshot::{Arm64ThreadState, Redirect, RegisterSnapshot, StackSlot, X86ThreadState64};

use crate::core::errors::{escalate, BridgeError};
use std::cell::Cell;

/// Continuation run by a redirected thread; never returns
pub type Landing = fn() -> !;

thread_local! {
    static LANDING: Cell<Option<Landing>> = const { Cell::new(None) };
}

/// Set the landing for faults redirected on the current thread
pub fn set_landing(landing: Landing) {
    LANDING.with(|slot| slot.set(Some(landing)));
}

/// Remove the current thread's landing
pub fn clear_landing() {
    LANDING.with(|slot| slot.set(None));
}

/// Whether the current thread has a landing set
pub fn has_landing() -> bool {
    LANDING.with(|slot| slot.get().is_some())
}

/// Entry point installed into the faulted thread's instruction pointer
///
/// Never returns: returning would resume the faulting instruction and fault
/// again.
pub extern "C" fn fault_trampoline() -> ! {
    match LANDING.try_with(Cell::take).ok().flatten() {
        Some(landing) => landing(),
        None => escalate(BridgeError::Protocol(
            "trampoline reached on a thread with no landing".into(),
        )),
    }
}

/// Address of [`fault_trampoline`] as written into a register snapshot
#[inline]
pub fn trampoline_address() -> u64 {
    fault_trampoline as usize as u64
}
