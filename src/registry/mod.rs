/*!
 * Handler Registry
 *
 * Thread-scoped slot holding the one pending fault handler of a thread.
 *
 * The slot is only ever touched by its owning thread: by the closure runner
 * on normal completion, and by the fault delivery path, which also runs on
 * the faulting thread (signal handler or trampoline). Whichever of the two
 * calls [`unregister`] first receives the handler; the other gets `None`.
 * That is how the "finished normally" / "faulted" race is decided.
 *
 * The slot is a `const`-initialised `Cell`, so reading and clearing it does
 * not allocate and is usable from a signal handler.
 */

use crate::core::types::FaultRecord;
use std::cell::Cell;
use std::sync::Arc;

/// Callback receiving the classified fault
///
/// Shared rather than boxed so that fault delivery from signal context can
/// call it without freeing memory.
pub type FaultHandler = Arc<dyn Fn(FaultRecord) + Send + Sync>;

thread_local! {
    static SLOT: Cell<Option<FaultHandler>> = const { Cell::new(None) };
}

/// Register the fault handler of the current thread
///
/// # Panics
///
/// If the thread already has a handler registered. Fault interception does
/// not nest on a thread.
pub fn register(handler: FaultHandler) {
    SLOT.with(|slot| {
        let previous = slot.replace(Some(handler));
        if previous.is_some() {
            // Put the original back so the outer registration stays intact
            slot.set(previous);
            panic!("fault handler already registered on this thread; nested interception is not supported");
        }
    });
}

/// Remove and return the current thread's handler
///
/// Idempotent: only the first caller after [`register`] receives it.
pub fn unregister() -> Option<FaultHandler> {
    SLOT.try_with(Cell::take).ok().flatten()
}

/// Whether the current thread has a handler registered
pub fn is_registered() -> bool {
    SLOT.try_with(|slot| {
        let handler = slot.take();
        let present = handler.is_some();
        slot.set(handler);
        present
    })
    .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::FaultSignal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_handler(counter: Arc<AtomicUsize>) -> FaultHandler {
        Arc::new(move |_record| {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let counter = Arc::new(AtomicUsize::new(0));
        register(counting_handler(counter.clone()));
        assert!(is_registered());

        let first = unregister();
        let second = unregister();
        assert!(first.is_some());
        assert!(second.is_none());
        assert!(!is_registered());

        first.unwrap()(FaultRecord::new(FaultSignal::Ill));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_double_registration_panics_and_keeps_original() {
        let counter = Arc::new(AtomicUsize::new(0));
        register(counting_handler(counter.clone()));

        let result = std::panic::catch_unwind(|| register(Arc::new(|_| {})));
        assert!(result.is_err());

        unregister().expect("original handler kept")(FaultRecord::new(FaultSignal::Segv));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_slots_are_per_thread() {
        register(Arc::new(|_| {}));

        let other = std::thread::spawn(|| {
            assert!(!is_registered());
            register(Arc::new(|_| {}));
            unregister().is_some()
        });
        assert!(other.join().unwrap());

        assert!(unregister().is_some());
    }
}
