/*!
 * Exception Port Bridge
 *
 * macOS interception through a per-thread Mach exception port.
 *
 * Each run opens a [`PortSession`] on the worker thread, which sets up the
 * port in stages:
 *
 * 1. allocate a receive right
 * 2. insert a send right under the same name
 * 3. swap it in as the thread's exception port, saving the previous ports
 * 4. start the listener
 *
 * Teardown walks the stages back: the saved ports are restored, the port is
 * destroyed (which wakes an idle listener with `MACH_RCV_PORT_DIED`) and the
 * listener is joined. A session that fails part way tears down exactly the
 * stages it reached.
 *
 * The session lives in a thread-local of the worker. When the listener
 * redirects a fault, the worker resumes in the trampoline on the session's
 * landing stack and reaches `land`, which tears the session down, hands the
 * fault to the registered handler and parks the worker for good. The frames
 * that faulted are never unwound or returned to.
 */

mod ffi;
mod listener;

pub use listener::PortShared;

use super::stack::{self, Region};
use super::{ArmedBridge, FaultBridge};
use crate::core::config::BridgeConfig;
use crate::core::errors::{escalate, BridgeError, BridgeResult};
use crate::debugger;
use crate::registry;
use crate::trampoline::snapshot::NativeThreadState;
use crate::trampoline::{self, RegisterSnapshot};
use ffi::{
    exception_behavior_t, exception_mask_t, thread_state_flavor_t, thread_set_exception_ports,
    thread_swap_exception_ports, EXCEPTION_STATE, EXC_MASK_ARITHMETIC, EXC_MASK_BAD_ACCESS,
    EXC_MASK_BAD_INSTRUCTION, EXC_TYPES_COUNT, MACH_EXCEPTION_CODES,
};
use mach2::kern_return::KERN_SUCCESS;
use mach2::mach_init::mach_thread_self;
use mach2::mach_port::{
    mach_port_allocate, mach_port_deallocate, mach_port_insert_right, mach_port_mod_refs,
};
use mach2::message::{mach_msg_type_number_t, MACH_MSG_TYPE_MAKE_SEND};
use mach2::port::{mach_port_t, MACH_PORT_NULL, MACH_PORT_RIGHT_RECEIVE};
use mach2::traps::mach_task_self;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, trace, warn};

static LIVE_SESSIONS: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static ACTIVE: RefCell<Option<PortSession>> = const { RefCell::new(None) };
}

/// Number of sessions currently holding an exception port
pub fn live_sessions() -> usize {
    LIVE_SESSIONS.load(Ordering::Acquire)
}

/// Exceptions routed to the session port
#[cfg(target_arch = "aarch64")]
const EXCEPTION_MASK: exception_mask_t =
    EXC_MASK_BAD_ACCESS | EXC_MASK_BAD_INSTRUCTION | EXC_MASK_ARITHMETIC | ffi::EXC_MASK_BREAKPOINT;

// x86_64 breakpoints are left to the debugger
#[cfg(not(target_arch = "aarch64"))]
const EXCEPTION_MASK: exception_mask_t =
    EXC_MASK_BAD_ACCESS | EXC_MASK_BAD_INSTRUCTION | EXC_MASK_ARITHMETIC;

/// Process-wide half; the port bridge keeps no process-wide state
pub struct ExceptionPortBridge {
    _private: (),
}

impl FaultBridge for ExceptionPortBridge {
    type Armed = PortArming;

    const NAME: &'static str = "exception-port";

    fn prepare(_config: &BridgeConfig) -> BridgeResult<Self> {
        Ok(Self { _private: () })
    }

    fn arm(config: &BridgeConfig) -> BridgeResult<PortArming> {
        let session = PortSession::open(config)?;
        ACTIVE.with(|slot| *slot.borrow_mut() = Some(session));
        trampoline::set_landing(land);
        Ok(PortArming {
            _thread_bound: PhantomData,
        })
    }
}

/// Thread-scoped half: the session parked in the worker's thread-local
pub struct PortArming {
    _thread_bound: PhantomData<*const ()>,
}

impl ArmedBridge for PortArming {
    fn disarm(self) {}
}

impl Drop for PortArming {
    fn drop(&mut self) {
        trampoline::clear_landing();
        let session = ACTIVE.with(|slot| slot.borrow_mut().take());
        drop(session);
    }
}

/// Where a redirected worker continues, on the landing stack
fn land() -> ! {
    let session = ACTIVE
        .try_with(|slot| slot.try_borrow_mut().ok().and_then(|mut slot| slot.take()))
        .ok()
        .flatten();

    let record = match session {
        Some(mut session) => {
            // Running on it now; it stays with this thread
            session.landing = None;
            session.teardown();
            session.shared.take_fault()
        }
        None => None,
    };
    debugger::set_muted(false);

    match (registry::unregister(), record) {
        (Some(handler), Some(record)) => handler(record),
        _ => escalate(BridgeError::Protocol(
            "trampoline reached without a captured fault".into(),
        )),
    }

    trace!("Faulted worker parked");
    loop {
        std::thread::park();
    }
}

/// How far a session got through setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Stage {
    Idle,
    PortAllocated,
    PortConfigured,
    InstalledOnThread,
    ListenerRunning,
}

/// Exception ports a thread had before the session replaced them
struct SavedPorts {
    count: mach_msg_type_number_t,
    masks: [exception_mask_t; EXC_TYPES_COUNT],
    handlers: [mach_port_t; EXC_TYPES_COUNT],
    behaviors: [exception_behavior_t; EXC_TYPES_COUNT],
    flavors: [thread_state_flavor_t; EXC_TYPES_COUNT],
}

impl SavedPorts {
    fn empty() -> Self {
        Self {
            count: EXC_TYPES_COUNT as mach_msg_type_number_t,
            masks: [0; EXC_TYPES_COUNT],
            handlers: [MACH_PORT_NULL; EXC_TYPES_COUNT],
            behaviors: [0; EXC_TYPES_COUNT],
            flavors: [0; EXC_TYPES_COUNT],
        }
    }
}

/// One exception port bound to the thread that opened it
pub struct PortSession {
    stage: Stage,
    port: mach_port_t,
    thread: mach_port_t,
    saved: SavedPorts,
    shared: Arc<PortShared>,
    listener: Option<JoinHandle<()>>,
    landing: Option<Region>,
}

impl PortSession {
    /// Open a session on the current thread
    pub fn open(config: &BridgeConfig) -> BridgeResult<Self> {
        let mut session = Self {
            stage: Stage::Idle,
            port: MACH_PORT_NULL,
            thread: MACH_PORT_NULL,
            saved: SavedPorts::empty(),
            shared: PortShared::new(),
            listener: None,
            landing: Some(stack::take(config.alt_stack_size)?),
        };
        // On error, Drop tears down whatever stages were reached
        session.advance(config)?;
        Ok(session)
    }

    fn advance(&mut self, config: &BridgeConfig) -> BridgeResult<()> {
        let task = unsafe { mach_task_self() };

        let rc = unsafe { mach_port_allocate(task, MACH_PORT_RIGHT_RECEIVE, &mut self.port) };
        if rc != KERN_SUCCESS {
            return Err(BridgeError::PortAllocation(rc));
        }
        self.stage = Stage::PortAllocated;
        LIVE_SESSIONS.fetch_add(1, Ordering::AcqRel);

        let rc = unsafe { mach_port_insert_right(task, self.port, self.port, MACH_MSG_TYPE_MAKE_SEND) };
        if rc != KERN_SUCCESS {
            return Err(BridgeError::PortConfiguration(rc));
        }
        self.stage = Stage::PortConfigured;

        self.thread = unsafe { mach_thread_self() };
        let saved = &mut self.saved;
        let rc = unsafe {
            thread_swap_exception_ports(
                self.thread,
                EXCEPTION_MASK,
                self.port,
                EXCEPTION_STATE | MACH_EXCEPTION_CODES,
                NativeThreadState::FLAVOR,
                saved.masks.as_mut_ptr(),
                &mut saved.count,
                saved.handlers.as_mut_ptr(),
                saved.behaviors.as_mut_ptr(),
                saved.flavors.as_mut_ptr(),
            )
        };
        if rc != KERN_SUCCESS {
            saved.count = 0;
            return Err(BridgeError::PortSwap(rc));
        }
        self.stage = Stage::InstalledOnThread;

        let port = self.port;
        let shared = self.shared.clone();
        let landing_top = self.landing.map_or(0, |region| region.top() as u64);
        let listener = std::thread::Builder::new()
            .name(config.listener_name.clone())
            .spawn(move || listener::listen(port, shared, landing_top))
            .map_err(|e| BridgeError::spawn("exception listener", e))?;
        self.listener = Some(listener);
        self.stage = Stage::ListenerRunning;

        debug!(port = self.port, saved = self.saved.count, "Exception port session open");
        Ok(())
    }

    fn teardown(&mut self) {
        if self.stage >= Stage::InstalledOnThread {
            self.restore_ports();
        }

        if self.stage >= Stage::PortAllocated {
            let task = unsafe { mach_task_self() };
            let rc = unsafe { mach_port_mod_refs(task, self.port, MACH_PORT_RIGHT_RECEIVE, -1) };
            if rc != KERN_SUCCESS {
                warn!(rc, "Could not destroy exception port receive right");
            }
            if self.stage >= Stage::PortConfigured {
                unsafe { mach_port_deallocate(task, self.port) };
            }
            LIVE_SESSIONS.fetch_sub(1, Ordering::AcqRel);
        }

        if let Some(listener) = self.listener.take() {
            if listener.join().is_err() {
                warn!("Exception listener panicked");
            }
        }

        if self.thread != MACH_PORT_NULL {
            unsafe { mach_port_deallocate(mach_task_self(), self.thread) };
            self.thread = MACH_PORT_NULL;
        }

        if let Some(region) = self.landing.take() {
            stack::release(region);
        }

        self.stage = Stage::Idle;
    }

    fn restore_ports(&mut self) {
        let saved = &self.saved;
        let count = (saved.count as usize).min(EXC_TYPES_COUNT);
        for i in 0..count {
            let rc = unsafe {
                thread_set_exception_ports(
                    self.thread,
                    saved.masks[i],
                    saved.handlers[i],
                    saved.behaviors[i],
                    saved.flavors[i],
                )
            };
            if rc != KERN_SUCCESS {
                warn!(rc, mask = saved.masks[i], "Could not restore exception port");
            }
            // The swap handed us a send right on each saved port
            if saved.handlers[i] != MACH_PORT_NULL {
                unsafe { mach_port_deallocate(mach_task_self(), saved.handlers[i]) };
            }
        }
        // Anything not covered by a saved entry had no port before
        let covered = saved.masks[..count].iter().fold(0, |acc, mask| acc | mask);
        let uncovered = EXCEPTION_MASK & !covered;
        if uncovered != 0 {
            unsafe {
                thread_set_exception_ports(
                    self.thread,
                    uncovered,
                    MACH_PORT_NULL,
                    EXCEPTION_STATE | MACH_EXCEPTION_CODES,
                    NativeThreadState::FLAVOR,
                )
            };
        }
    }
}

impl Drop for PortSession {
    fn drop(&mut self) {
        if self.stage != Stage::Idle || self.listener.is_some() || self.landing.is_some() {
            self.teardown();
        }
    }
}
