/*!
 * Stack Regions
 *
 * Guard-paged memory regions that a faulted thread continues on: the
 * alternate signal stack on the signal bridge, the landing stack on the
 * exception-port bridge.
 *
 * Regions are mapped lazily and never unmapped. A region handed to a thread
 * that faulted stays with that parked thread; a region released after a
 * normal run goes back to a process-wide pool for the next run.
 */

use crate::core::errors::{BridgeError, BridgeResult};
use parking_lot::Mutex;
use std::io;
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// A mapped stack region (addresses kept as integers so the pool is `Send`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Region {
    pub stack: usize,
    pub size: usize,
}

impl Region {
    /// One past the highest usable byte
    pub fn top(&self) -> usize {
        self.stack + self.size
    }
}

static POOL: Mutex<Vec<Region>> = Mutex::new(Vec::new());
static MAPPED: AtomicUsize = AtomicUsize::new(0);

/// Number of regions ever mapped by this process
pub fn mapped_regions() -> usize {
    MAPPED.load(Ordering::Relaxed)
}

fn page_size() -> usize {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

fn map_region(size: usize) -> BridgeResult<Region> {
    let page = page_size();
    let size = size.div_ceil(page) * page;
    let total = size + page;

    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            total,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANON,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(BridgeError::Stack(io::Error::last_os_error()));
    }

    // Lowest page stays PROT_NONE as a guard
    let stack = base as usize + page;
    let rc = unsafe {
        libc::mprotect(
            stack as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        unsafe { libc::munmap(base, total) };
        return Err(BridgeError::Stack(err));
    }

    MAPPED.fetch_add(1, Ordering::Relaxed);
    debug!(size, "Mapped stack region");
    Ok(Region { stack, size })
}

/// Hand out a region of at least `size` bytes, reusing a pooled one if possible
pub(crate) fn take(size: usize) -> BridgeResult<Region> {
    let mut pool = POOL.lock();
    // Best fit, so small requests do not drain the large regions
    let best = pool
        .iter()
        .enumerate()
        .filter(|(_, region)| region.size >= size)
        .min_by_key(|(_, region)| region.size)
        .map(|(index, _)| index);
    if let Some(index) = best {
        return Ok(pool.swap_remove(index));
    }
    drop(pool);
    map_region(size)
}

/// Return a region no thread is running on anymore
pub(crate) fn release(region: Region) {
    POOL.lock().push(region);
}
