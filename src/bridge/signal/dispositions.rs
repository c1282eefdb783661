/*!
 * Signal Dispositions
 *
 * Process-wide, reference-counted installation of the fault handler for the
 * fatal signals. One lock serializes every change; the first user saves the
 * prior dispositions and the last user restores them.
 */

use crate::core::errors::{BridgeError, BridgeResult};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use parking_lot::Mutex;
use std::os::raw::c_int;
use tracing::{debug, warn};

/// Signals intercepted while a run is active
pub const TARGET_SIGNALS: [Signal; 6] = [
    Signal::SIGILL,
    Signal::SIGABRT,
    Signal::SIGBUS,
    Signal::SIGSEGV,
    Signal::SIGFPE,
    Signal::SIGTRAP,
];

struct Registration {
    signal: Signal,
    previous: SigAction,
}

struct Installed {
    users: usize,
    saved: Vec<Registration>,
}

static INSTALLED: Mutex<Installed> = Mutex::new(Installed {
    users: 0,
    saved: Vec::new(),
});

fn fault_action(handler: extern "C" fn(c_int)) -> SigAction {
    // Single-fire, reentrant, and on the alternate stack so that stack
    // overflows can still be handled
    SigAction::new(
        SigHandler::Handler(handler),
        SaFlags::SA_NODEFER | SaFlags::SA_RESETHAND | SaFlags::SA_ONSTACK,
        SigSet::empty(),
    )
}

/// Install `handler` for every target signal, or add a user to the existing
/// installation
///
/// Existing installations are re-armed: a previous delivery will have reset
/// its signal to the default disposition.
pub fn install(handler: extern "C" fn(c_int)) -> BridgeResult<()> {
    let mut installed = INSTALLED.lock();
    let action = fault_action(handler);

    if installed.users == 0 {
        for signal in TARGET_SIGNALS {
            match unsafe { sigaction(signal, &action) } {
                Ok(previous) => installed.saved.push(Registration { signal, previous }),
                Err(source) => {
                    restore_all(&mut installed.saved);
                    return Err(BridgeError::SignalInstall {
                        signal: signal.as_str(),
                        source,
                    });
                }
            }
        }
        debug!(signals = TARGET_SIGNALS.len(), "Fault signal handlers installed");
    } else {
        for signal in TARGET_SIGNALS {
            if let Err(source) = unsafe { sigaction(signal, &action) } {
                return Err(BridgeError::SignalInstall {
                    signal: signal.as_str(),
                    source,
                });
            }
        }
    }

    installed.users += 1;
    Ok(())
}

/// Drop one user, restoring the prior dispositions when none remain
pub fn uninstall() {
    let mut installed = INSTALLED.lock();
    match installed.users {
        0 => warn!("Signal handler uninstall without matching install"),
        1 => {
            installed.users = 0;
            restore_all(&mut installed.saved);
            debug!("Fault signal handlers restored");
        }
        _ => installed.users -= 1,
    }
}

/// Current number of users
pub fn users() -> usize {
    INSTALLED.lock().users
}

fn restore_all(saved: &mut Vec<Registration>) {
    while let Some(registration) = saved.pop() {
        if let Err(err) = unsafe { sigaction(registration.signal, &registration.previous) } {
            warn!(signal = registration.signal.as_str(), error = %err, "Failed to restore signal disposition");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    extern "C" fn noop(_signal: c_int) {}

    fn current_handler(signal: Signal) -> SigHandler {
        // Read by swapping the current action in and straight back
        let default_action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        let current = unsafe { sigaction(signal, &default_action) }.unwrap();
        unsafe { sigaction(signal, &current) }.unwrap();
        current.handler()
    }

    #[test]
    #[serial(signals)]
    fn test_install_is_reference_counted() {
        let before = current_handler(Signal::SIGILL);

        install(noop).unwrap();
        install(noop).unwrap();
        assert_eq!(users(), 2);
        assert_eq!(current_handler(Signal::SIGILL), SigHandler::Handler(noop));

        uninstall();
        assert_eq!(users(), 1);
        assert_eq!(current_handler(Signal::SIGILL), SigHandler::Handler(noop));

        uninstall();
        assert_eq!(users(), 0);
        assert_eq!(current_handler(Signal::SIGILL), before);
    }

    #[test]
    #[serial(signals)]
    fn test_install_rearms_reset_signal() {
        install(noop).unwrap();

        // Simulate a single-fire delivery resetting the disposition
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        unsafe { sigaction(Signal::SIGSEGV, &default) }.unwrap();

        install(noop).unwrap();
        assert_eq!(current_handler(Signal::SIGSEGV), SigHandler::Handler(noop));

        uninstall();
        uninstall();
        assert_eq!(users(), 0);
    }

    #[test]
    #[serial(signals)]
    fn test_unbalanced_uninstall_is_harmless() {
        uninstall();
        assert_eq!(users(), 0);
    }
}
