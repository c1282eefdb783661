/*!
 * Alternate Signal Stacks
 *
 * Fault handlers run on a dedicated stack so that a stack overflow on the
 * worker can still be reported. The stacks come from the shared region pool.
 */

use crate::bridge::stack::{self, Region};
use crate::core::errors::{BridgeError, BridgeResult};
use std::io;
use std::mem;
use std::ptr;
use tracing::{debug, trace};

/// Alternate stack installed on the current thread for the duration of a run
pub struct AltStackLease {
    region: Option<Region>,
    previous: libc::stack_t,
}

impl AltStackLease {
    /// Ensure the current thread has an alternate stack of at least `size`
    /// bytes, installing one from the pool when necessary
    pub fn acquire(size: usize) -> BridgeResult<Self> {
        let mut previous: libc::stack_t = unsafe { mem::zeroed() };
        if unsafe { libc::sigaltstack(ptr::null(), &mut previous) } != 0 {
            return Err(BridgeError::Stack(io::Error::last_os_error()));
        }

        let enabled = previous.ss_flags & libc::SS_DISABLE == 0;
        let executing_on_it = previous.ss_flags & libc::SS_ONSTACK != 0;
        if executing_on_it || (enabled && previous.ss_size >= size) {
            trace!(size = previous.ss_size, "Existing alternate stack kept");
            return Ok(Self {
                region: None,
                previous,
            });
        }

        let region = stack::take(size)?;
        let stack = libc::stack_t {
            ss_sp: region.stack as *mut libc::c_void,
            ss_flags: 0,
            ss_size: region.size,
        };
        if unsafe { libc::sigaltstack(&stack, ptr::null_mut()) } != 0 {
            let err = io::Error::last_os_error();
            stack::release(region);
            return Err(BridgeError::Stack(err));
        }

        Ok(Self {
            region: Some(region),
            previous,
        })
    }

    /// Whether this lease installed a stack of its own
    pub fn installed(&self) -> bool {
        self.region.is_some()
    }
}

impl Drop for AltStackLease {
    fn drop(&mut self) {
        let region = match self.region.take() {
            Some(region) => region,
            None => return,
        };

        let rc = unsafe { libc::sigaltstack(&self.previous, ptr::null_mut()) };
        if rc != 0 {
            // Still registered with the kernel; leave it with this thread
            debug!(error = %io::Error::last_os_error(), "Could not restore previous alternate stack");
            return;
        }
        stack::release(region);
    }
}
