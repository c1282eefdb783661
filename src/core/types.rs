/*!
 * Core Types
 * Fault records, signal identities and run outcomes shared by every bridge
 */

use serde::{Deserialize, Serialize};
use std::fmt;
use std::os::raw::c_int;

/// POSIX-style signal a captured fault maps to
///
/// Kept symbolic rather than as a raw number: signal numbering differs
/// between Darwin and Linux (`SIGBUS` is 10 on one and 7 on the other) and
/// `SIGEMT` only exists on the BSD family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FaultSignal {
    /// Illegal instruction
    Ill,
    /// Trace/breakpoint trap
    Trap,
    /// Abort
    Abrt,
    /// Emulator trap
    Emt,
    /// Arithmetic fault
    Fpe,
    /// Killed
    Kill,
    /// Bus error
    Bus,
    /// Invalid memory reference
    Segv,
    /// Bad system call
    Sys,
    /// Broken pipe
    Pipe,
}

impl FaultSignal {
    /// Every signal a fault can be translated into
    pub const ALL: [FaultSignal; 10] = [
        FaultSignal::Ill,
        FaultSignal::Trap,
        FaultSignal::Abrt,
        FaultSignal::Emt,
        FaultSignal::Fpe,
        FaultSignal::Kill,
        FaultSignal::Bus,
        FaultSignal::Segv,
        FaultSignal::Sys,
        FaultSignal::Pipe,
    ];

    /// Host signal number, `None` when the host has no such signal
    pub fn as_raw(self) -> Option<c_int> {
        let raw = match self {
            FaultSignal::Ill => libc::SIGILL,
            FaultSignal::Trap => libc::SIGTRAP,
            FaultSignal::Abrt => libc::SIGABRT,
            FaultSignal::Emt => return emt_signal(),
            FaultSignal::Fpe => libc::SIGFPE,
            FaultSignal::Kill => libc::SIGKILL,
            FaultSignal::Bus => libc::SIGBUS,
            FaultSignal::Segv => libc::SIGSEGV,
            FaultSignal::Sys => libc::SIGSYS,
            FaultSignal::Pipe => libc::SIGPIPE,
        };
        Some(raw)
    }

    /// Map a host signal number back to its symbolic form
    pub fn from_raw(raw: c_int) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|signal| signal.as_raw() == Some(raw))
    }

    /// Conventional `SIGxxx` name
    pub fn name(self) -> &'static str {
        match self {
            FaultSignal::Ill => "SIGILL",
            FaultSignal::Trap => "SIGTRAP",
            FaultSignal::Abrt => "SIGABRT",
            FaultSignal::Emt => "SIGEMT",
            FaultSignal::Fpe => "SIGFPE",
            FaultSignal::Kill => "SIGKILL",
            FaultSignal::Bus => "SIGBUS",
            FaultSignal::Segv => "SIGSEGV",
            FaultSignal::Sys => "SIGSYS",
            FaultSignal::Pipe => "SIGPIPE",
        }
    }

    /// Whether the signal denotes an invalid memory access
    pub fn is_memory_fault(self) -> bool {
        matches!(self, FaultSignal::Segv | FaultSignal::Bus)
    }
}

impl fmt::Display for FaultSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
fn emt_signal() -> Option<c_int> {
    Some(libc::SIGEMT)
}

#[cfg(not(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
fn emt_signal() -> Option<c_int> {
    None
}

/// Raw kernel exception triple that produced a fault on the exception-port path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionCode {
    pub class: i32,
    pub code: i64,
    pub subcode: i64,
}

/// A fault captured while running a target closure
///
/// There is deliberately no "empty" record: a run without a fault yields no
/// record at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultRecord {
    signal: FaultSignal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    exception: Option<ExceptionCode>,
}

impl FaultRecord {
    pub fn new(signal: FaultSignal) -> Self {
        Self {
            signal,
            exception: None,
        }
    }

    pub fn with_exception(mut self, exception: ExceptionCode) -> Self {
        self.exception = Some(exception);
        self
    }

    /// The captured signal
    #[inline]
    pub fn signal(&self) -> FaultSignal {
        self.signal
    }

    /// Host signal number of the captured signal
    #[inline]
    pub fn raw_signal(&self) -> Option<c_int> {
        self.signal.as_raw()
    }

    /// Kernel exception detail, present only on the exception-port path
    #[inline]
    pub fn exception(&self) -> Option<ExceptionCode> {
        self.exception
    }
}

impl fmt::Display for FaultRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.exception {
            Some(exc) => write!(
                f,
                "{} (exception {} code {:#x} subcode {:#x})",
                self.signal, exc.class, exc.code, exc.subcode
            ),
            None => write!(f, "{}", self.signal),
        }
    }
}

/// Result of running a closure under fault interception
#[derive(Debug)]
pub enum Outcome<T> {
    /// The closure returned normally
    Returned(T),
    /// The closure faulted; its return value is gone
    Faulted(FaultRecord),
    /// The closure was not executed because a debugger is attached
    Skipped,
}

impl<T> Outcome<T> {
    pub fn is_faulted(&self) -> bool {
        matches!(self, Outcome::Faulted(_))
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped)
    }

    /// The captured fault, if any
    pub fn fault(&self) -> Option<FaultRecord> {
        match self {
            Outcome::Faulted(record) => Some(*record),
            _ => None,
        }
    }

    /// The returned value, if the closure completed
    pub fn value(self) -> Option<T> {
        match self {
            Outcome::Returned(value) => Some(value),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_raw_roundtrip_for_host_signals() {
        for signal in FaultSignal::ALL {
            if let Some(raw) = signal.as_raw() {
                assert_eq!(FaultSignal::from_raw(raw), Some(signal));
            }
        }
        assert_eq!(FaultSignal::from_raw(0), None);
        assert_eq!(FaultSignal::from_raw(libc::SIGUSR1), None);
    }

    #[test]
    fn test_memory_fault_classes() {
        assert!(FaultSignal::Segv.is_memory_fault());
        assert!(FaultSignal::Bus.is_memory_fault());
        assert!(!FaultSignal::Ill.is_memory_fault());
    }

    #[test]
    fn test_record_serializes_without_absent_exception() {
        let record = FaultRecord::new(FaultSignal::Ill);
        let json = serde_json::to_string(&record).unwrap();
        assert_eq!(json, r#"{"signal":"ILL"}"#);

        let detailed = record.with_exception(ExceptionCode {
            class: 2,
            code: 1,
            subcode: 0,
        });
        let back: FaultRecord = serde_json::from_str(&serde_json::to_string(&detailed).unwrap()).unwrap();
        assert_eq!(back, detailed);
    }

    #[test]
    fn test_outcome_projections() {
        let returned: Outcome<u8> = Outcome::Returned(7);
        assert_eq!(returned.fault(), None);
        assert_eq!(returned.value(), Some(7));

        let faulted: Outcome<u8> = Outcome::Faulted(FaultRecord::new(FaultSignal::Segv));
        assert!(faulted.is_faulted());
        assert_eq!(faulted.fault().map(|r| r.signal()), Some(FaultSignal::Segv));
        assert_eq!(faulted.value(), None);

        assert!(Outcome::<()>::Skipped.is_skipped());
    }
}
