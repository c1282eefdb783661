/*!
 * Debugger Interaction
 *
 * Tracer detection, and suppression of the runtime's fatal-error reporting
 * while a fault is being provoked on purpose.
 *
 * Suppression is process-wide and reference counted: the first engaged
 * guard swaps the panic hook for one that consults a per-thread mute flag,
 * and the last guard to drop puts the previous hook back. Threads that are
 * muted have their reports routed to `tracing::debug!` instead of stderr.
 */

use parking_lot::Mutex;
use std::cell::Cell;
use std::panic::{self, PanicHookInfo};
use std::sync::Arc;
use tracing::debug;

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Sync + Send + 'static>;

thread_local! {
    static MUTED: Cell<bool> = const { Cell::new(false) };
}

struct Suppression {
    engaged: usize,
    previous: Option<Arc<PanicHook>>,
}

static SUPPRESSION: Mutex<Suppression> = Mutex::new(Suppression {
    engaged: 0,
    previous: None,
});

/// Process-wide hook replacement, held for the duration of one run
pub struct ReportSuppression {
    _private: (),
}

impl ReportSuppression {
    /// Engage suppression, installing the muting hook on first use
    pub fn engage() -> Self {
        let mut state = SUPPRESSION.lock();
        if state.engaged == 0 {
            let previous: Arc<PanicHook> = Arc::new(panic::take_hook());
            let delegate = previous.clone();
            panic::set_hook(Box::new(move |info| {
                if is_muted() {
                    debug!(report = %info, "Suppressed fatal report");
                } else {
                    delegate(info);
                }
            }));
            state.previous = Some(previous);
            debug!("Fatal report suppression installed");
        }
        state.engaged += 1;
        Self { _private: () }
    }

    /// Number of live guards
    pub fn engaged() -> usize {
        SUPPRESSION.lock().engaged
    }
}

impl Drop for ReportSuppression {
    fn drop(&mut self) {
        let mut state = SUPPRESSION.lock();
        state.engaged -= 1;
        if state.engaged > 0 {
            return;
        }

        if let Some(previous) = state.previous.take() {
            // Hooks cannot be swapped while this thread is panicking
            if std::thread::panicking() {
                state.previous = Some(previous);
                state.engaged = 0;
                return;
            }
            drop(panic::take_hook());
            panic::set_hook(Box::new(move |info| previous(info)));
            debug!("Fatal report suppression removed");
        }
    }
}

/// Mute or unmute fatal reports for the current thread
///
/// Only touches a thread-local `Cell`, so the signal bridge may call it from
/// a handler.
#[inline]
pub fn set_muted(muted: bool) {
    let _ = MUTED.try_with(|flag| flag.set(muted));
}

#[inline]
pub fn is_muted() -> bool {
    MUTED.try_with(Cell::get).unwrap_or(false)
}

/// Whether a tracer (debugger) is attached to this process
#[cfg(target_os = "linux")]
pub fn is_being_debugged() -> bool {
    let status = match std::fs::read_to_string("/proc/self/status") {
        Ok(status) => status,
        Err(_) => return false,
    };
    tracer_pid(&status).map(|pid| pid != 0).unwrap_or(false)
}

/// Whether a tracer (debugger) is attached to this process
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub fn is_being_debugged() -> bool {
    // sys/proc.h
    const P_TRACED: i32 = 0x0000_0800;

    let mut mib = [
        libc::CTL_KERN,
        libc::KERN_PROC,
        libc::KERN_PROC_PID,
        std::process::id() as libc::c_int,
    ];
    let mut info: libc::kinfo_proc = unsafe { std::mem::zeroed() };
    let mut size = std::mem::size_of::<libc::kinfo_proc>();

    let rc = unsafe {
        libc::sysctl(
            mib.as_mut_ptr(),
            mib.len() as libc::c_uint,
            &mut info as *mut _ as *mut libc::c_void,
            &mut size,
            std::ptr::null_mut(),
            0,
        )
    };
    rc == 0 && info.kp_proc.p_flag & P_TRACED != 0
}

/// Whether a tracer (debugger) is attached to this process
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "ios")))]
pub fn is_being_debugged() -> bool {
    false
}

#[cfg(any(target_os = "linux", test))]
fn tracer_pid(status: &str) -> Option<u32> {
    status
        .lines()
        .find_map(|line| line.strip_prefix("TracerPid:"))
        .and_then(|value| value.trim().parse().ok())
}
