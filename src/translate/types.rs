/*!
 * Exception Classes
 * Kernel exception identities and the codes the tables key on
 */

use serde::{Deserialize, Serialize};

/// High level exception classes (`mach/exception_types.h`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ExceptionClass {
    /// Could not access memory; code holds a `kern_return_t`
    BadAccess = 1,
    /// Illegal or undefined instruction or operand
    BadInstruction = 2,
    /// Arithmetic exception; code holds the exact cause
    Arithmetic = 3,
    /// Emulation support instruction encountered
    Emulation = 4,
    /// Software generated exception; 0x10000-0x1ffff are Unix emulation codes
    Software = 5,
    /// Trace, breakpoint, etc
    Breakpoint = 6,
    SysCall = 7,
    MachSysCall = 8,
    RpcAlert = 9,
    Crash = 10,
    Resource = 11,
    Guard = 12,
    CorpseNotify = 13,
}

impl ExceptionClass {
    pub fn from_raw(raw: i32) -> Option<Self> {
        let class = match raw {
            1 => ExceptionClass::BadAccess,
            2 => ExceptionClass::BadInstruction,
            3 => ExceptionClass::Arithmetic,
            4 => ExceptionClass::Emulation,
            5 => ExceptionClass::Software,
            6 => ExceptionClass::Breakpoint,
            7 => ExceptionClass::SysCall,
            8 => ExceptionClass::MachSysCall,
            9 => ExceptionClass::RpcAlert,
            10 => ExceptionClass::Crash,
            11 => ExceptionClass::Resource,
            12 => ExceptionClass::Guard,
            13 => ExceptionClass::CorpseNotify,
            _ => return None,
        };
        Some(class)
    }

    #[inline]
    pub fn raw(self) -> i32 {
        self as i32
    }
}

/// CPU architecture whose override table applies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arch {
    X86_64,
    Aarch64,
}

impl Arch {
    /// Architecture this crate was built for, if it has a table
    pub const fn current() -> Option<Arch> {
        if cfg!(target_arch = "x86_64") {
            Some(Arch::X86_64)
        } else if cfg!(target_arch = "aarch64") {
            Some(Arch::Aarch64)
        } else {
            None
        }
    }
}

/// Exception codes referenced by the translation tables
pub mod codes {
    /// `KERN_INVALID_ADDRESS`
    pub const KERN_INVALID_ADDRESS: i64 = 1;
    /// `KERN_PROTECTION_FAILURE`
    pub const KERN_PROTECTION_FAILURE: i64 = 2;

    /// `EXC_UNIX_BAD_SYSCALL`
    pub const EXC_UNIX_BAD_SYSCALL: i64 = 0x10000;
    /// `EXC_UNIX_BAD_PIPE`
    pub const EXC_UNIX_BAD_PIPE: i64 = 0x10001;
    /// `EXC_UNIX_ABORT`
    pub const EXC_UNIX_ABORT: i64 = 0x10002;
    /// `EXC_SOFT_SIGNAL`
    pub const EXC_SOFT_SIGNAL: i64 = 0x10003;

    /// General protection fault reported with `EXC_BAD_ACCESS`
    pub const EXC_I386_GPFLT: i64 = 13;
    /// Bound range exceeded (`#BR`)
    pub const EXC_I386_BOUND: i64 = 7;
}
