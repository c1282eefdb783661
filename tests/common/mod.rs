/*!
 * Fault Triggers
 * Closures that provoke one specific hardware fault
 */

#![allow(dead_code)]

use std::arch::asm;
use std::ptr;

/// Execute an undefined instruction
#[inline(always)]
pub fn illegal_instruction() {
    unsafe {
        #[cfg(target_arch = "x86_64")]
        asm!("ud2");
        #[cfg(target_arch = "aarch64")]
        asm!("udf #0");
    }
}

/// Execute a software breakpoint
pub fn breakpoint() {
    unsafe {
        #[cfg(target_arch = "x86_64")]
        asm!("int3");
        #[cfg(target_arch = "aarch64")]
        asm!("brk #0");
    }
}

/// Integer division by zero in hardware; aarch64 does not trap on it
#[cfg(target_arch = "x86_64")]
pub fn divide_by_zero() {
    unsafe {
        asm!(
            "xor edx, edx",
            "div ecx",
            in("ecx") 0u32,
            inout("eax") 1u32 => _,
            out("edx") _,
        );
    }
}

/// Read from a page mapped without any access rights
pub fn invalid_read() {
    let page = unsafe {
        libc::mmap(
            ptr::null_mut(),
            4096,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    assert_ne!(page, libc::MAP_FAILED);
    let value = unsafe { ptr::read_volatile(page as *const u64) };
    // Unreachable when the read faults
    std::hint::black_box(value);
}

/// Recurse until the thread's stack guard page is hit
#[allow(unconditional_recursion)]
#[inline(never)]
pub fn overflow_stack(depth: u64) -> u64 {
    let frame = std::hint::black_box([depth; 64]);
    overflow_stack(depth + 1).wrapping_add(frame[(depth % 64) as usize])
}
