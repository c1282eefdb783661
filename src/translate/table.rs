/*!
 * Translation Tables
 */

use super::types::{codes, Arch, ExceptionClass};
use crate::core::types::FaultSignal;

/// Translate a kernel exception into a signal
///
/// `None` means the exception is not one this crate handles; callers must
/// leave it to the next handler rather than report a caught fault.
#[inline]
pub fn classify(class: i32, code: i64, subcode: i64, arch: Arch) -> Option<FaultSignal> {
    let class = ExceptionClass::from_raw(class)?;
    classify_machine(class, code, subcode, arch).or_else(|| classify_portable(class, code, subcode))
}

/// Architecture-specific overrides
pub fn classify_machine(
    class: ExceptionClass,
    code: i64,
    _subcode: i64,
    arch: Arch,
) -> Option<FaultSignal> {
    match arch {
        Arch::X86_64 => match class {
            // Map GP fault to SIGSEGV, otherwise defer
            ExceptionClass::BadAccess if code == codes::EXC_I386_GPFLT => Some(FaultSignal::Segv),
            ExceptionClass::BadInstruction => Some(FaultSignal::Ill),
            ExceptionClass::Arithmetic => Some(FaultSignal::Fpe),
            ExceptionClass::Software if code == codes::EXC_I386_BOUND => Some(FaultSignal::Trap),
            _ => None,
        },
        Arch::Aarch64 => match class {
            ExceptionClass::BadInstruction => Some(FaultSignal::Ill),
            ExceptionClass::Arithmetic => Some(FaultSignal::Fpe),
            _ => None,
        },
    }
}

/// Machine-independent table
pub fn classify_portable(class: ExceptionClass, code: i64, _subcode: i64) -> Option<FaultSignal> {
    match class {
        ExceptionClass::BadAccess => {
            if code == codes::KERN_INVALID_ADDRESS {
                Some(FaultSignal::Segv)
            } else {
                Some(FaultSignal::Bus)
            }
        }
        ExceptionClass::BadInstruction => Some(FaultSignal::Ill),
        ExceptionClass::Arithmetic => Some(FaultSignal::Fpe),
        ExceptionClass::Emulation => Some(FaultSignal::Emt),
        ExceptionClass::Software => match code {
            codes::EXC_UNIX_BAD_SYSCALL => Some(FaultSignal::Sys),
            codes::EXC_UNIX_BAD_PIPE => Some(FaultSignal::Pipe),
            codes::EXC_UNIX_ABORT => Some(FaultSignal::Abrt),
            codes::EXC_SOFT_SIGNAL => Some(FaultSignal::Kill),
            _ => None,
        },
        ExceptionClass::Breakpoint => Some(FaultSignal::Trap),
        _ => None,
    }
}
