/*!
 * Register Snapshots
 *
 * Value types mirroring the kernel's thread-state layouts, and the one
 * transform that redirects a trapped thread to the trampoline.
 *
 * The transform is pure: it takes a snapshot and the top of the stack the
 * thread should continue on, and returns the rewritten snapshot plus, where
 * the architecture passes return addresses on the stack, the single stack
 * slot the caller must store. The faulting stack itself is never written; it
 * may be the one that overflowed. All reinterpretation
 * of kernel state buffers as these types goes through [`RegisterSnapshot::from_words`]
 * and [`RegisterSnapshot::write_words`].
 */

use std::mem;

/// Width of a machine word on both supported architectures
const WORD: u64 = mem::size_of::<u64>() as u64;

/// Stack alignment at a call boundary on both supported ABIs
const STACK_ALIGN: u64 = 16;

/// Kernel register snapshot with a fixed flavor and layout
pub trait RegisterSnapshot: Copy + Sized {
    /// Thread-state flavor identifier
    const FLAVOR: i32;

    /// Size in 32-bit `natural_t` words, as the kernel counts state buffers
    const WORD_COUNT: u32 = (mem::size_of::<Self>() / mem::size_of::<u32>()) as u32;

    fn instruction_pointer(&self) -> u64;

    fn stack_pointer(&self) -> u64;

    /// Rewrite the control-transfer registers so the thread resumes at
    /// `target`, on the stack ending at `stack_top`, as though the faulting
    /// instruction had called it
    ///
    /// Returns `None` when `stack_top` leaves no room for a call frame.
    fn redirect(&self, target: u64, stack_top: u64) -> Option<Redirect<Self>>;

    /// Decode a kernel state buffer; the length must match exactly
    fn from_words(words: &[u32]) -> Option<Self> {
        if words.len() != Self::WORD_COUNT as usize {
            return None;
        }
        // Length checked above; the buffer is only 4-byte aligned
        Some(unsafe { std::ptr::read_unaligned(words.as_ptr() as *const Self) })
    }

    /// Encode into a kernel state buffer, returning the word count written
    fn write_words(&self, out: &mut [u32]) -> Option<u32> {
        if out.len() < Self::WORD_COUNT as usize {
            return None;
        }
        unsafe { std::ptr::write_unaligned(out.as_mut_ptr() as *mut Self, *self) };
        Some(Self::WORD_COUNT)
    }
}

/// A stack store the redirect requires before the thread resumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackSlot {
    pub addr: u64,
    pub value: u64,
}

impl StackSlot {
    /// Perform the store
    ///
    /// # Safety
    ///
    /// `addr` must be writable memory of the suspended thread's stack.
    pub unsafe fn write(&self) {
        std::ptr::write(self.addr as *mut u64, self.value);
    }
}

/// Result of redirecting a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Redirect<S> {
    pub state: S,
    pub stack_slot: Option<StackSlot>,
}

/// `x86_thread_state64_t`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct X86ThreadState64 {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u64,
    pub fs: u64,
    pub gs: u64,
}

impl RegisterSnapshot for X86ThreadState64 {
    /// `x86_THREAD_STATE64`
    const FLAVOR: i32 = 4;

    fn instruction_pointer(&self) -> u64 {
        self.rip
    }

    fn stack_pointer(&self) -> u64 {
        self.rsp
    }

    // Return addresses live on the stack: push the faulting rip, then jump
    fn redirect(&self, target: u64, stack_top: u64) -> Option<Redirect<Self>> {
        let rsp = (stack_top & !(STACK_ALIGN - 1))
            .checked_sub(WORD)
            .filter(|&sp| sp != 0)?;

        let mut state = *self;
        state.rsp = rsp;
        state.rip = target;

        Some(Redirect {
            state,
            stack_slot: Some(StackSlot {
                addr: rsp,
                value: self.rip,
            }),
        })
    }
}

/// `arm_thread_state64_t`
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Arm64ThreadState {
    pub x: [u64; 29],
    pub fp: u64,
    pub lr: u64,
    pub sp: u64,
    pub pc: u64,
    pub cpsr: u32,
    pub flags: u32,
}

impl RegisterSnapshot for Arm64ThreadState {
    /// `ARM_THREAD_STATE64`
    const FLAVOR: i32 = 6;

    fn instruction_pointer(&self) -> u64 {
        self.pc
    }

    fn stack_pointer(&self) -> u64 {
        self.sp
    }

    // Link-register architecture: stash the faulting pc in lr, then jump
    fn redirect(&self, target: u64, stack_top: u64) -> Option<Redirect<Self>> {
        let sp = stack_top & !(STACK_ALIGN - 1);
        if sp == 0 {
            return None;
        }

        let mut state = *self;
        state.sp = sp;
        state.lr = self.pc;
        state.pc = target;

        Some(Redirect {
            state,
            stack_slot: None,
        })
    }
}

/// Snapshot type of the architecture this crate was built for
#[cfg(target_arch = "x86_64")]
pub type NativeThreadState = X86ThreadState64;

#[cfg(target_arch = "aarch64")]
pub type NativeThreadState = Arm64ThreadState;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_kernel_word_counts() {
        // x86_THREAD_STATE64_COUNT and ARM_THREAD_STATE64_COUNT
        assert_eq!(X86ThreadState64::WORD_COUNT, 42);
        assert_eq!(Arm64ThreadState::WORD_COUNT, 68);
    }

    #[test]
    fn test_x86_redirect_pushes_return_address() {
        let original = X86ThreadState64 {
            rax: 1,
            rdi: 2,
            rsp: 0x5000_0123,
            rip: 0x1_0000_4242,
            rflags: 0x202,
            ..Default::default()
        };

        let redirect = original.redirect(0xdead_0000, 0x7000_1000).unwrap();
        let expected = X86ThreadState64 {
            rsp: 0x7000_0ff8,
            rip: 0xdead_0000,
            ..original
        };
        assert_eq!(redirect.state, expected);
        assert_eq!(
            redirect.stack_slot,
            Some(StackSlot {
                addr: 0x7000_0ff8,
                value: 0x1_0000_4242
            })
        );
    }

    #[test]
    fn test_x86_redirect_aligns_landing_stack() {
        let original = X86ThreadState64 {
            rsp: 0x5000_0123,
            rip: 0x4242,
            ..Default::default()
        };

        // Entry must look like a call from 16-byte aligned code
        let redirect = original.redirect(0x1000, 0x7000_100c).unwrap();
        assert_eq!(redirect.state.rsp, 0x7000_0ff8);
        assert_eq!(redirect.state.rsp % 16, 8);
        assert_eq!(redirect.stack_slot.map(|slot| slot.addr), Some(0x7000_0ff8));
    }

    #[test]
    fn test_x86_redirect_rejects_unusable_stack() {
        let state = X86ThreadState64::default();
        assert!(state.redirect(0x1000, 4).is_none());
        assert!(state.redirect(0x1000, 8).is_none());
        assert!(state.redirect(0x1000, 0).is_none());
        assert!(state.redirect(0x1000, 16).is_some());
    }

    #[test]
    fn test_arm64_redirect_uses_link_register() {
        let mut original = Arm64ThreadState {
            fp: 0x16f0_0000,
            lr: 0x1_0000_0100,
            sp: 0x16f0_0010,
            pc: 0x1_0000_0200,
            cpsr: 0x6000_0000,
            ..Default::default()
        };
        original.x[0] = 99;

        let redirect = original.redirect(0xbeef_0000, 0x2000_0018).unwrap();
        assert_eq!(redirect.stack_slot, None);
        assert_eq!(
            redirect.state,
            Arm64ThreadState {
                lr: 0x1_0000_0200,
                sp: 0x2000_0010,
                pc: 0xbeef_0000,
                ..original
            }
        );

        assert!(original.redirect(0xbeef_0000, 8).is_none());
    }

    #[test]
    fn test_word_buffer_roundtrip_checks_sizes() {
        let state = X86ThreadState64 {
            rsp: 0x10,
            rip: 0x20,
            gs: 0x30,
            ..Default::default()
        };

        let mut buffer = vec![0u32; 64];
        assert_eq!(state.write_words(&mut buffer), Some(42));
        assert_eq!(X86ThreadState64::from_words(&buffer[..42]), Some(state));

        // Exact length required on decode, sufficient capacity on encode
        assert_eq!(X86ThreadState64::from_words(&buffer[..41]), None);
        assert_eq!(X86ThreadState64::from_words(&buffer), None);
        assert_eq!(state.write_words(&mut buffer[..41]), None);
    }

    #[test]
    fn test_stack_slot_write() {
        let mut target = 0u64;
        let slot = StackSlot {
            addr: &mut target as *mut u64 as u64,
            value: 0xfeed,
        };
        unsafe { slot.write() };
        assert_eq!(target, 0xfeed);
    }
}
