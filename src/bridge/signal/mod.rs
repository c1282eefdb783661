/*!
 * Signal Bridge
 *
 * POSIX fallback for targets without exception ports.
 *
 * On delivery the handler runs on the faulting thread, on the alternate
 * stack. It unmutes fatal reports, hands the fault to the thread's registered
 * handler and then parks the thread for good: the faulting instruction is
 * still next, so there is nowhere safe to return to. A fault on a thread with
 * no registered handler is re-raised with the default disposition; it is
 * never absorbed.
 *
 * Dispositions are process-wide and single-shot (`SA_RESETHAND`), so runs on
 * this bridge are serialized: a bridge holds `RUN_LOCK` from `prepare`
 * until it is dropped. A closure must therefore not wait on another thread's
 * `run`.
 */

mod altstack;
mod dispositions;

pub use altstack::AltStackLease;
pub use dispositions::TARGET_SIGNALS;

use super::{ArmedBridge, FaultBridge};
use crate::core::config::BridgeConfig;
use crate::core::errors::BridgeResult;
use crate::core::types::{FaultRecord, FaultSignal};
use crate::debugger;
use crate::registry;
use nix::sys::signal::{pthread_sigmask, raise, signal, SigHandler, SigSet, SigmaskHow, Signal};
use parking_lot::{Mutex, MutexGuard};
use std::os::raw::c_int;
use tracing::{debug, trace};

/// Held by the one bridge currently allowed to deliver faults
static RUN_LOCK: Mutex<()> = Mutex::new(());

/// Number of live process-wide installations
pub fn installations() -> usize {
    dispositions::users()
}

/// Process-wide half: the installed signal dispositions
pub struct SignalBridge {
    _serial: MutexGuard<'static, ()>,
}

impl FaultBridge for SignalBridge {
    type Armed = SignalArming;

    const NAME: &'static str = "signal";

    fn prepare(_config: &BridgeConfig) -> BridgeResult<Self> {
        let serial = match RUN_LOCK.try_lock() {
            Some(guard) => guard,
            None => {
                trace!("Waiting for the run in progress");
                RUN_LOCK.lock()
            }
        };
        // On error the guard is released on the way out
        dispositions::install(on_fault_signal)?;
        debug!(users = dispositions::users(), "Signal bridge prepared");
        Ok(Self { _serial: serial })
    }

    fn arm(config: &BridgeConfig) -> BridgeResult<SignalArming> {
        let stack = AltStackLease::acquire(config.alt_stack_size)?;
        Ok(SignalArming { _stack: stack })
    }
}

impl Drop for SignalBridge {
    // Runs before the fields drop, so the lock is released last
    fn drop(&mut self) {
        dispositions::uninstall();
    }
}

/// Thread-scoped half: the worker's alternate stack
pub struct SignalArming {
    _stack: AltStackLease,
}

impl ArmedBridge for SignalArming {
    fn disarm(self) {}
}

extern "C" fn on_fault_signal(signum: c_int) {
    debugger::set_muted(false);

    let record = FaultSignal::from_raw(signum).map(FaultRecord::new);
    let handler = match record {
        Some(_) => registry::unregister(),
        None => None,
    };

    match (handler, record) {
        (Some(handler), Some(record)) => {
            handler(record);
            // Dropping the last reference here could free memory in signal
            // context; the thread never runs again anyway
            std::mem::forget(handler);
            park_forever()
        }
        _ => reraise(signum),
    }
}

fn park_forever() -> ! {
    loop {
        unsafe {
            libc::pause();
        }
    }
}

fn reraise(signum: c_int) {
    let _ = pthread_sigmask(SigmaskHow::SIG_UNBLOCK, Some(&SigSet::all()), None);

    match Signal::try_from(signum) {
        Ok(sig) => {
            unsafe {
                let _ = signal(sig, SigHandler::SigDfl);
            }
            let _ = raise(sig);
        }
        Err(_) => unsafe {
            libc::raise(signum);
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    #[serial(signals)]
    fn test_prepared_bridges_are_exclusive() {
        let before = installations();
        let first = SignalBridge::prepare(&BridgeConfig::default()).unwrap();

        let (tx, rx) = mpsc::channel();
        let second = std::thread::spawn(move || {
            let bridge = SignalBridge::prepare(&BridgeConfig::default()).unwrap();
            tx.send(installations()).unwrap();
            drop(bridge);
        });

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        assert_eq!(installations(), before + 1);

        drop(first);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), before + 1);
        second.join().unwrap();
        assert_eq!(installations(), before);
    }
}
