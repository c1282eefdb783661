/*!
 * Fault Bridge Tests
 * Real hardware faults raised inside `run` and `catch_fault`
 */

mod common;

use fault_bridge::{catch_fault, run, FaultCatcher, FaultSignal, Outcome};
use serial_test::serial;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
#[serial(signals)]
fn test_illegal_instruction_is_caught() {
    let record = run(common::illegal_instruction).expect("fault expected");
    assert_eq!(record.signal(), FaultSignal::Ill);
    assert_eq!(record.raw_signal(), Some(libc::SIGILL));
}

#[test]
#[serial(signals)]
fn test_invalid_memory_access_is_caught() {
    let record = run(common::invalid_read).expect("fault expected");
    assert!(
        matches!(record.signal(), FaultSignal::Segv | FaultSignal::Bus),
        "unexpected {}",
        record
    );
    assert!(record.signal().is_memory_fault());
}

#[cfg(target_arch = "x86_64")]
#[test]
#[serial(signals)]
fn test_divide_by_zero_is_caught() {
    let record = run(common::divide_by_zero).expect("fault expected");
    assert_eq!(record.signal(), FaultSignal::Fpe);
}

// x86_64 Darwin leaves breakpoints to the debugger
#[cfg(not(all(target_os = "macos", target_arch = "x86_64")))]
#[test]
#[serial(signals)]
fn test_breakpoint_is_caught() {
    let record = run(common::breakpoint).expect("fault expected");
    assert_eq!(record.signal(), FaultSignal::Trap);
}

#[cfg(target_os = "macos")]
#[test]
#[serial(signals)]
fn test_exception_detail_is_recorded() {
    let record = run(common::illegal_instruction).expect("fault expected");
    let exception = record.exception().expect("exception-port detail");
    // EXC_BAD_INSTRUCTION
    assert_eq!(exception.class, 2);
}

#[test]
#[serial(signals)]
fn test_stack_overflow_is_caught() {
    let record = run(|| common::overflow_stack(0)).expect("fault expected");
    assert!(
        matches!(record.signal(), FaultSignal::Segv | FaultSignal::Bus),
        "unexpected {}",
        record
    );
}

#[test]
#[serial(signals)]
fn test_fault_in_frame_with_pending_destructors() {
    struct Guard(Arc<AtomicUsize>);

    impl Drop for Guard {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    let drops = Arc::new(AtomicUsize::new(0));
    let shared = Arc::new(vec![7u8; 32]);
    let guard_drops = drops.clone();
    let held = shared.clone();

    let outcome = catch_fault(move || {
        let _guard = Guard(guard_drops);
        let data = std::hint::black_box(held.clone());
        common::illegal_instruction();
        data.len()
    });

    assert_eq!(outcome.fault().map(|r| r.signal()), Some(FaultSignal::Ill));
    // Faulted frames are abandoned, never unwound
    assert_eq!(drops.load(Ordering::SeqCst), 0);
    assert!(Arc::strong_count(&shared) >= 2);
}

#[test]
#[serial(signals)]
fn test_normal_return_has_no_record() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();

    let record = run(move || {
        seen.fetch_add(1, Ordering::SeqCst);
    });

    assert!(record.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
#[serial(signals)]
fn test_value_is_returned() {
    match catch_fault(|| vec![1, 2, 3].into_iter().sum::<i32>()) {
        Outcome::Returned(sum) => assert_eq!(sum, 6),
        other => panic!("unexpected outcome: faulted={}", other.is_faulted()),
    }
}

#[test]
#[serial(signals)]
fn test_side_effects_before_fault_are_kept() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();

    let outcome = catch_fault(move || {
        seen.fetch_add(1, Ordering::SeqCst);
        common::illegal_instruction();
        seen.fetch_add(1, Ordering::SeqCst);
    });

    assert_eq!(outcome.fault().map(|r| r.signal()), Some(FaultSignal::Ill));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
#[serial(signals)]
fn test_sequential_runs_report_independently() {
    let first = run(common::illegal_instruction).expect("first fault");
    let second = run(common::invalid_read).expect("second fault");
    let third = run(|| 7);

    assert_eq!(first.signal(), FaultSignal::Ill);
    assert!(second.signal().is_memory_fault());
    assert!(third.is_none());
}

#[test]
#[serial(signals)]
fn test_ordinary_panic_propagates() {
    let result = std::panic::catch_unwind(|| run(|| panic!("plain panic")));
    let payload = result.expect_err("panic expected");
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"plain panic"));
}

#[test]
#[serial(signals)]
fn test_nested_run_panics() {
    let result = std::panic::catch_unwind(|| run(|| run(|| ())));
    assert!(result.is_err());
}

#[test]
#[serial(signals)]
fn test_skip_policy_without_debugger_runs_closure() {
    let catcher = FaultCatcher::new(
        fault_bridge::BridgeConfig::default().with_skip_if_being_debugged(true),
    );
    let outcome = catcher.catch(|| 5);
    if fault_bridge::debugger::is_being_debugged() {
        assert!(outcome.is_skipped());
    } else {
        assert_eq!(outcome.value(), Some(5));
    }
}
