/*!
 * Mach FFI
 *
 * Exception-port declarations and message layouts not covered by `mach2`.
 * Message structs mirror the MIG-generated `mach_exc` subsystem for the
 * `EXCEPTION_STATE | MACH_EXCEPTION_CODES` behavior.
 */

#![allow(non_camel_case_types)]

use mach2::kern_return::kern_return_t;
use mach2::message::{mach_msg_header_t, mach_msg_return_t, mach_msg_type_number_t};
use mach2::port::mach_port_t;

pub type exception_mask_t = u32;
pub type exception_behavior_t = i32;
pub type thread_state_flavor_t = i32;

// mach/exception_types.h
pub const EXC_MASK_BAD_ACCESS: exception_mask_t = 1 << 1;
pub const EXC_MASK_BAD_INSTRUCTION: exception_mask_t = 1 << 2;
pub const EXC_MASK_ARITHMETIC: exception_mask_t = 1 << 3;
pub const EXC_MASK_BREAKPOINT: exception_mask_t = 1 << 6;

pub const EXCEPTION_STATE: exception_behavior_t = 2;
pub const MACH_EXCEPTION_CODES: exception_behavior_t = 0x8000_0000u32 as i32;

/// Capacity of the saved exception-port table
pub const EXC_TYPES_COUNT: usize = 14;

/// Largest thread state the kernel sends, in `natural_t` words
pub const THREAD_STATE_MAX: usize = 1296;

/// `mach_exception_raise_state` request id; replies are `+ 100`
pub const MACH_EXCEPTION_RAISE_STATE_ID: i32 = 2406;
pub const MIG_REPLY_ID_OFFSET: i32 = 100;

pub const MACH_MSGH_BITS_REMOTE_MASK: u32 = 0x0000_001f;

// mach/message.h receive errors
pub const MACH_RCV_INVALID_NAME: mach_msg_return_t = 0x1000_4002;
pub const MACH_RCV_INTERRUPTED: mach_msg_return_t = 0x1000_4005;
pub const MACH_RCV_PORT_DIED: mach_msg_return_t = 0x1000_4009;

/// `NDR_record_t`
pub type NdrRecord = [u8; 8];

/// `__Request__mach_exception_raise_state_t`
#[repr(C, packed(4))]
pub struct ExceptionRaiseStateRequest {
    pub header: mach_msg_header_t,
    pub ndr: NdrRecord,
    pub exception: i32,
    pub code_count: mach_msg_type_number_t,
    pub code: [i64; 2],
    pub flavor: i32,
    pub old_state_count: mach_msg_type_number_t,
    pub old_state: [u32; THREAD_STATE_MAX],
}

/// Request plus room for the receive trailer
#[repr(C)]
pub struct ReceiveBuffer {
    pub request: ExceptionRaiseStateRequest,
    pub trailer: [u8; 512],
}

/// `__Reply__mach_exception_raise_state_t`
#[repr(C, packed(4))]
pub struct ExceptionRaiseStateReply {
    pub header: mach_msg_header_t,
    pub ndr: NdrRecord,
    pub ret_code: kern_return_t,
    pub flavor: i32,
    pub new_state_count: mach_msg_type_number_t,
    pub new_state: [u32; THREAD_STATE_MAX],
}

impl ExceptionRaiseStateReply {
    /// Bytes to send for a reply carrying `words` state words
    pub fn size_for(words: mach_msg_type_number_t) -> u32 {
        let fixed = std::mem::size_of::<Self>() - THREAD_STATE_MAX * std::mem::size_of::<u32>();
        (fixed + words as usize * std::mem::size_of::<u32>()) as u32
    }
}

extern "C" {
    pub fn thread_swap_exception_ports(
        thread: mach_port_t,
        exception_mask: exception_mask_t,
        new_port: mach_port_t,
        behavior: exception_behavior_t,
        new_flavor: thread_state_flavor_t,
        masks: *mut exception_mask_t,
        masks_count: *mut mach_msg_type_number_t,
        old_handlers: *mut mach_port_t,
        old_behaviors: *mut exception_behavior_t,
        old_flavors: *mut thread_state_flavor_t,
    ) -> kern_return_t;

    pub fn thread_set_exception_ports(
        thread: mach_port_t,
        exception_mask: exception_mask_t,
        new_port: mach_port_t,
        behavior: exception_behavior_t,
        new_flavor: thread_state_flavor_t,
    ) -> kern_return_t;
}
