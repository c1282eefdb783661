/*!
 * Exception Listener
 *
 * Receives one `mach_exception_raise_state` request for a worker thread and
 * answers with a register snapshot that resumes the thread in the
 * trampoline, on the session's landing stack. The worker stays suspended by
 * the kernel until the reply is sent, so the classified fault is stored in
 * [`PortShared`] first.
 *
 * The listener answers at most one request and exits. The landing restores
 * the thread's previous ports before anything else, so a later exception on
 * the worker goes to whoever handled it before the session.
 */

use super::ffi::{
    ExceptionRaiseStateReply, ExceptionRaiseStateRequest, ReceiveBuffer,
    MACH_EXCEPTION_RAISE_STATE_ID, MACH_MSGH_BITS_REMOTE_MASK, MACH_RCV_INTERRUPTED,
    MACH_RCV_INVALID_NAME, MACH_RCV_PORT_DIED, MIG_REPLY_ID_OFFSET, THREAD_STATE_MAX,
};
use crate::core::errors::{escalate, BridgeError};
use crate::core::types::{ExceptionCode, FaultRecord};
use crate::trampoline::snapshot::NativeThreadState;
use crate::trampoline::{trampoline_address, RegisterSnapshot, StackSlot};
use crate::translate::{classify, Arch};
use mach2::kern_return::{kern_return_t, KERN_FAILURE, KERN_INVALID_ARGUMENT, KERN_SUCCESS};
use mach2::message::{
    mach_msg, MACH_MSG_SUCCESS, MACH_MSG_TIMEOUT_NONE, MACH_RCV_MSG, MACH_SEND_MSG,
};
use mach2::port::{mach_port_t, MACH_PORT_NULL};
use parking_lot::Mutex;
use std::mem;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// State shared between a session and its listener
#[derive(Default)]
pub struct PortShared {
    fault: Mutex<Option<FaultRecord>>,
}

impl PortShared {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Take the recorded fault, if one was serviced
    pub fn take_fault(&self) -> Option<FaultRecord> {
        self.fault.lock().take()
    }

    fn record(&self, record: FaultRecord) {
        *self.fault.lock() = Some(record);
    }
}

/// What to answer for one request
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Disposition {
    /// Resume the thread in the trampoline
    Redirect {
        record: FaultRecord,
        state: NativeThreadState,
        slot: Option<StackSlot>,
    },
    /// Leave the exception to the next handler
    Decline(kern_return_t),
}

/// Decide how to answer `request`, redirecting to `target` on the stack
/// ending at `stack_top`
pub fn dispose(request: &ExceptionRaiseStateRequest, target: u64, stack_top: u64) -> Disposition {
    let code = request.code;
    let code_count = request.code_count as usize;
    let exception = ExceptionCode {
        class: request.exception,
        code: if code_count > 0 { code[0] } else { 0 },
        subcode: if code_count > 1 { code[1] } else { 0 },
    };

    let arch = match Arch::current() {
        Some(arch) => arch,
        None => return Disposition::Decline(KERN_FAILURE),
    };
    let signal = match classify(exception.class, exception.code, exception.subcode, arch) {
        Some(signal) => signal,
        None => return Disposition::Decline(KERN_FAILURE),
    };

    let count = request.old_state_count as usize;
    if request.flavor != NativeThreadState::FLAVOR || count > THREAD_STATE_MAX {
        return Disposition::Decline(KERN_INVALID_ARGUMENT);
    }
    let state = match NativeThreadState::from_words(&request.old_state[..count]) {
        Some(state) => state,
        None => return Disposition::Decline(KERN_INVALID_ARGUMENT),
    };
    let redirect = match state.redirect(target, stack_top) {
        Some(redirect) => redirect,
        None => return Disposition::Decline(KERN_INVALID_ARGUMENT),
    };

    Disposition::Redirect {
        record: FaultRecord::new(signal).with_exception(exception),
        state: redirect.state,
        slot: redirect.stack_slot,
    }
}

/// Build the reply message for `request`
pub fn build_reply(
    request: &ExceptionRaiseStateRequest,
    disposition: &Disposition,
) -> Box<ExceptionRaiseStateReply> {
    let mut reply: Box<ExceptionRaiseStateReply> = Box::new(unsafe { mem::zeroed() });

    let (ret_code, words) = match disposition {
        Disposition::Redirect { state, .. } => match state.write_words(&mut reply.new_state) {
            Some(words) => (KERN_SUCCESS, words),
            None => (KERN_INVALID_ARGUMENT, 0),
        },
        Disposition::Decline(ret_code) => (*ret_code, 0),
    };

    let header = request.header;
    reply.header.msgh_bits = header.msgh_bits & MACH_MSGH_BITS_REMOTE_MASK;
    reply.header.msgh_remote_port = header.msgh_remote_port;
    reply.header.msgh_local_port = MACH_PORT_NULL;
    reply.header.msgh_id = header.msgh_id + MIG_REPLY_ID_OFFSET;
    reply.header.msgh_size = ExceptionRaiseStateReply::size_for(words);
    reply.ndr = request.ndr;
    reply.ret_code = ret_code;
    reply.flavor = request.flavor;
    reply.new_state_count = words;
    reply
}

/// Service at most one request on `port`
///
/// Returns after replying, or when the port is destroyed without a fault.
pub fn listen(port: mach_port_t, shared: Arc<PortShared>, landing_top: u64) {
    let mut buffer: Box<ReceiveBuffer> = Box::new(unsafe { mem::zeroed() });

    loop {
        let rc = unsafe {
            mach_msg(
                &mut buffer.request.header,
                MACH_RCV_MSG,
                0,
                mem::size_of::<ReceiveBuffer>() as u32,
                port,
                MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            )
        };
        match rc {
            MACH_MSG_SUCCESS => break,
            MACH_RCV_INTERRUPTED => continue,
            MACH_RCV_PORT_DIED | MACH_RCV_INVALID_NAME => {
                trace!(port, "Exception port gone, listener exiting");
                return;
            }
            other => escalate(BridgeError::Protocol(format!(
                "exception port receive failed: {:#x}",
                other
            ))),
        }
    }

    let request = &buffer.request;
    let id = request.header.msgh_id;
    if id != MACH_EXCEPTION_RAISE_STATE_ID {
        escalate(BridgeError::Protocol(format!(
            "unexpected message id {} on exception port",
            id
        )));
    }

    let disposition = dispose(request, trampoline_address(), landing_top);
    if let Disposition::Redirect { record, slot, .. } = disposition {
        debug!(fault = %record, "Exception redirected to trampoline");
        if let Some(slot) = slot {
            // Inside the session's landing stack, which no thread runs on yet
            unsafe { slot.write() };
        }
        shared.record(record);
    } else {
        warn!(exception = request.exception, "Exception declined");
    }

    let mut reply = build_reply(request, &disposition);
    let size = reply.header.msgh_size;
    let rc = unsafe {
        mach_msg(
            &mut reply.header,
            MACH_SEND_MSG,
            size,
            0,
            MACH_PORT_NULL,
            MACH_MSG_TIMEOUT_NONE,
            MACH_PORT_NULL,
        )
    };
    if rc != MACH_MSG_SUCCESS {
        escalate(BridgeError::Protocol(format!(
            "exception reply failed: {:#x}",
            rc
        )));
    }
    trace!(port, "Exception serviced, listener exiting");
}
