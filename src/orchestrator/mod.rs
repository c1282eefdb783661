/*!
 * Orchestrator
 *
 * Runs one closure under fault interception.
 *
 * # Sequence
 *
 * On the calling thread:
 * 1. apply the skip policy (debugger attached)
 * 2. engage fatal-report suppression
 * 3. prepare the process-wide half of the bridge
 * 4. spawn the worker and block on the completion latch
 * 5. join the worker, or detach it when a fault parked it
 * 6. drop the bridge, then the suppression
 *
 * On the worker thread:
 * 1. arm the thread-scoped half of the bridge
 * 2. register the fault handler
 * 3. run the closure inside `catch_unwind`
 * 4. unregister, disarm, settle the latch
 *
 * A fault never comes back through step 4: the bridge calls the registered
 * handler on the faulted worker, which settles the latch, and the worker
 * parks for good. The closure always runs on a dedicated worker so that the
 * thread whose exception port or alternate stack is configured is the one
 * that faults, and so that a parked thread is never the caller's.
 */

use crate::bridge::{ActiveBridge, ArmedBridge, FaultBridge};
use crate::capture::{Captured, CapturedOutput, OutputCapture};
use crate::core::config::BridgeConfig;
use crate::core::errors::{escalate, BridgeError};
use crate::core::sync::{Completion, CompletionLatch};
use crate::core::types::{FaultRecord, Outcome};
use crate::debugger::{self, ReportSuppression};
use crate::monitoring::RunSpan;
use crate::registry::{self, FaultHandler};
use parking_lot::Mutex;
use std::any::Any;
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, warn};

type PanicPayload = Box<dyn Any + Send + 'static>;

thread_local! {
    static IN_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Run `f` and report the fault it raised, if any
///
/// Returns `None` when `f` returned normally. Panics of `f` that are not
/// faults propagate to the caller.
///
/// # Panics
///
/// When called from inside another `run` closure.
pub fn run<F, T>(f: F) -> Option<FaultRecord>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    FaultCatcher::default().catch(f).fault()
}

/// Run `f` and hand back either its value or the fault it raised
pub fn catch_fault<F, T>(f: F) -> Outcome<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    FaultCatcher::default().catch(f)
}

/// Like [`run`], also returning what was written to stdout and stderr
pub fn run_captured<F, T>(f: F) -> (Option<FaultRecord>, CapturedOutput)
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let captured = FaultCatcher::default().catch_captured(f);
    (captured.outcome.fault(), captured.output)
}

/// Reusable, configured entry point
#[derive(Debug, Clone, Default)]
pub struct FaultCatcher {
    config: BridgeConfig,
}

impl FaultCatcher {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }

    /// Configuration loaded with [`BridgeConfig::from_env`]
    pub fn from_env() -> Self {
        Self::new(BridgeConfig::from_env())
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Run `f` on a worker thread with the target's bridge installed
    pub fn catch<F, T>(&self, f: F) -> Outcome<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        catch_with::<ActiveBridge, F, T>(&self.config, f)
    }

    /// [`catch`](Self::catch) with standard output and error captured
    ///
    /// Output of a closure that panics is discarded with the panic.
    pub fn catch_captured<F, T>(&self, f: F) -> Captured<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        // Before taking the capture lock, which a nested call would wait on forever
        assert_not_nested();

        let capture = OutputCapture::begin().unwrap_or_else(|e| escalate(e));
        let outcome = self.catch(f);
        let output = capture.finish().unwrap_or_else(|e| escalate(e));
        Captured { outcome, output }
    }
}

fn assert_not_nested() {
    assert!(
        !IN_WORKER.with(Cell::get),
        "fault interception is not reentrant: run called from inside a run closure"
    );
}

/// Rendezvous shared by the caller and the worker
struct RunState<T> {
    latch: CompletionLatch,
    value: Mutex<Option<T>>,
    panic: Mutex<Option<PanicPayload>>,
}

impl<T> RunState<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            latch: CompletionLatch::new(),
            value: Mutex::new(None),
            panic: Mutex::new(None),
        })
    }
}

pub(crate) fn catch_with<B, F, T>(config: &BridgeConfig, f: F) -> Outcome<T>
where
    B: FaultBridge,
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    assert_not_nested();

    if config.skip_if_being_debugged && debugger::is_being_debugged() {
        info!("Debugger attached, closure skipped");
        return Outcome::Skipped;
    }

    let run_span = RunSpan::new(&config.worker_name, B::NAME);
    let _enter = run_span.span().clone().entered();

    let suppression = config.suppress_fatal_reports.then(ReportSuppression::engage);
    let bridge = B::prepare(config).unwrap_or_else(|e| escalate(e));

    let state = RunState::<T>::new();
    let worker = {
        let state = state.clone();
        let config = config.clone();
        std::thread::Builder::new()
            .name(config.worker_name.clone())
            .spawn(move || worker_main::<B, F, T>(&config, &state, f))
            .unwrap_or_else(|e| escalate(BridgeError::spawn("worker", e)))
    };
    debug!("Worker started");

    let completion = state.latch.wait();
    debug!(?completion, "Worker settled");

    match completion {
        Completion::Faulted(_) => {
            // Parked for good; dropping the handle detaches it
            drop(worker);
        }
        _ => {
            if let Err(payload) = worker.join() {
                warn!("Worker panicked outside the closure");
                state.panic.lock().get_or_insert(payload);
            }
        }
    }

    drop(bridge);
    drop(suppression);

    match completion {
        Completion::Returned => match state.value.lock().take() {
            Some(value) => {
                run_span.finish("returned");
                Outcome::Returned(value)
            }
            None => escalate(BridgeError::Protocol(
                "worker returned without a value".into(),
            )),
        },
        Completion::Faulted(record) => {
            info!(fault = %record, "Fault caught");
            run_span.finish(record.signal().name());
            Outcome::Faulted(record)
        }
        Completion::Panicked => match state.panic.lock().take() {
            Some(payload) => {
                run_span.finish("panicked");
                panic::resume_unwind(payload)
            }
            None => escalate(BridgeError::Protocol(
                "worker panicked without a payload".into(),
            )),
        },
    }
}

fn worker_main<B, F, T>(config: &BridgeConfig, state: &Arc<RunState<T>>, f: F)
where
    B: FaultBridge,
    F: FnOnce() -> T,
    T: Send + 'static,
{
    IN_WORKER.with(|flag| flag.set(true));
    if config.suppress_fatal_reports {
        debugger::set_muted(true);
    }

    let armed = B::arm(config).unwrap_or_else(|e| escalate(e));

    let handler: FaultHandler = {
        let state = state.clone();
        Arc::new(move |record: FaultRecord| {
            state.latch.fault(record);
        })
    };
    registry::register(handler);

    let result = panic::catch_unwind(AssertUnwindSafe(f));
    registry::unregister();
    armed.disarm();
    debugger::set_muted(false);

    match result {
        Ok(value) => {
            *state.value.lock() = Some(value);
            state.latch.complete();
        }
        Err(payload) => {
            *state.panic.lock() = Some(payload);
            state.latch.panicked();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::BridgeResult;
    use crate::core::types::FaultSignal;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static PREPARED: AtomicUsize = AtomicUsize::new(0);
    static ARMED: AtomicUsize = AtomicUsize::new(0);

    /// Bridge whose "faults" are raised by calling [`scripted_fault`]
    struct ScriptedBridge;

    struct ScriptedArming;

    impl FaultBridge for ScriptedBridge {
        type Armed = ScriptedArming;
        const NAME: &'static str = "scripted";

        fn prepare(_config: &BridgeConfig) -> BridgeResult<Self> {
            PREPARED.fetch_add(1, Ordering::SeqCst);
            Ok(ScriptedBridge)
        }

        fn arm(_config: &BridgeConfig) -> BridgeResult<ScriptedArming> {
            ARMED.fetch_add(1, Ordering::SeqCst);
            Ok(ScriptedArming)
        }
    }

    impl Drop for ScriptedBridge {
        fn drop(&mut self) {
            PREPARED.fetch_sub(1, Ordering::SeqCst);
        }
    }

    impl ArmedBridge for ScriptedArming {
        fn disarm(self) {
            ARMED.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Deliver a fault the way the real bridges do: tear down, hand the
    /// record to the registered handler, park
    fn scripted_fault(signal: FaultSignal) -> ! {
        ARMED.fetch_sub(1, Ordering::SeqCst);
        let handler = registry::unregister().expect("handler registered");
        handler(FaultRecord::new(signal));
        loop {
            std::thread::park();
        }
    }

    #[test]
    #[serial_test::serial(panic_hook)]
    fn test_value_is_returned_and_bridge_released() {
        let outcome = catch_with::<ScriptedBridge, _, _>(&BridgeConfig::default(), || 40 + 2);
        assert_eq!(outcome.value(), Some(42));
        assert_eq!(PREPARED.load(Ordering::SeqCst), 0);
        assert_eq!(ARMED.load(Ordering::SeqCst), 0);
    }

    #[test]
    #[serial_test::serial(panic_hook)]
    fn test_delivered_fault_settles_run() {
        let outcome = catch_with::<ScriptedBridge, _, ()>(&BridgeConfig::default(), || {
            scripted_fault(FaultSignal::Bus)
        });
        assert_eq!(outcome.fault(), Some(FaultRecord::new(FaultSignal::Bus)));
        assert_eq!(PREPARED.load(Ordering::SeqCst), 0);
        assert_eq!(ARMED.load(Ordering::SeqCst), 0);
    }

    #[test]
    #[serial_test::serial(panic_hook)]
    fn test_ordinary_panic_is_resumed_on_caller() {
        let result = panic::catch_unwind(|| {
            catch_with::<ScriptedBridge, _, ()>(&BridgeConfig::default(), || panic!("not a fault"))
        });
        let payload = result.unwrap_err();
        assert_eq!(payload.downcast_ref::<&str>(), Some(&"not a fault"));
        assert_eq!(PREPARED.load(Ordering::SeqCst), 0);
    }

    #[test]
    #[serial_test::serial(panic_hook)]
    fn test_handler_is_gone_after_run() {
        let outcome = catch_with::<ScriptedBridge, _, _>(&BridgeConfig::default(), || {
            registry::is_registered()
        });
        // Registered while the closure ran
        assert_eq!(outcome.value(), Some(true));
        assert!(!registry::is_registered());
    }

    #[test]
    #[serial_test::serial(panic_hook)]
    fn test_nested_run_is_rejected() {
        let result = panic::catch_unwind(|| {
            catch_with::<ScriptedBridge, _, _>(&BridgeConfig::default(), || {
                catch_with::<ScriptedBridge, _, _>(&BridgeConfig::default(), || ()).is_faulted()
            })
        });
        let payload = result.unwrap_err();
        let message = payload.downcast_ref::<&str>().copied().unwrap_or_default();
        assert!(message.contains("not reentrant"));
        assert_eq!(PREPARED.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_catcher_keeps_config() {
        let config = BridgeConfig::default().with_worker_name("catcher-worker");
        let catcher = FaultCatcher::new(config.clone());
        assert_eq!(catcher.config(), &config);
    }
}
