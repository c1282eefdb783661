/*!
 * Fault Bridges
 *
 * Kernel-facing halves of fault interception. Exactly one bridge is compiled
 * in per target:
 *
 * - **ExceptionPortBridge** (`port`): macOS on x86_64/aarch64. A Mach
 *   exception port on the worker thread plus a listener thread that rewrites
 *   the trapped thread's registers to enter the trampoline.
 * - **SignalBridge** (`signal`): every other unix. Single-shot POSIX signal
 *   handlers on an alternate stack.
 *
 * Both plug into the orchestrator through [`FaultBridge`]: a process-wide
 * `prepare` on the calling thread, and a thread-scoped `arm` on the thread
 * that runs the closure.
 *
 * Both deliver a fault the same way: on the faulted thread, off its own
 * stack, the registered handler is called and the thread then parks for
 * good. Nothing unwinds through the frames that faulted.
 */

mod stack;

pub use stack::mapped_regions;

use crate::core::config::BridgeConfig;
use crate::core::errors::BridgeResult;

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "macos", any(target_arch = "x86_64", target_arch = "aarch64")))] {
        pub mod port;

        /// Bridge selected for this target
        pub type ActiveBridge = port::ExceptionPortBridge;

        /// Number of live process-wide bridge installations
        pub fn active_installations() -> usize {
            port::live_sessions()
        }
    } else if #[cfg(unix)] {
        pub mod signal;

        /// Bridge selected for this target
        pub type ActiveBridge = signal::SignalBridge;

        /// Number of live process-wide bridge installations
        pub fn active_installations() -> usize {
            signal::installations()
        }
    } else {
        compile_error!("fault-bridge requires a unix target");
    }
}

/// Strategy seam between the orchestrator and a bridge
pub trait FaultBridge: Sized {
    /// Thread-scoped state held by the worker while the closure runs
    type Armed: ArmedBridge;

    /// Short name used in logs
    const NAME: &'static str;

    /// Process-wide setup, performed on the calling thread
    fn prepare(config: &BridgeConfig) -> BridgeResult<Self>;

    /// Thread-scoped setup, performed on the thread about to run the closure
    fn arm(config: &BridgeConfig) -> BridgeResult<Self::Armed>;
}

/// Thread-scoped bridge state
pub trait ArmedBridge {
    /// Tear down on the arming thread after the closure returned or panicked
    ///
    /// Never reached on a faulted thread; the bridge tears its thread state
    /// down itself before delivering the fault.
    fn disarm(self);
}
