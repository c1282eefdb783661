/*!
 * Fault Bridge Library
 * Run a closure and observe the hardware fault it raises, without the process dying
 */

pub mod bridge;
pub mod capture;
pub mod core;
pub mod debugger;
pub mod monitoring;
pub mod orchestrator;
pub mod registry;
pub mod trampoline;
pub mod translate;

// Re-exports
pub use crate::bridge::active_installations;
pub use crate::capture::{Captured, CapturedOutput};
pub use crate::core::{BridgeConfig, BridgeError, BridgeResult, ExceptionCode, FaultRecord, FaultSignal, Outcome};
pub use crate::monitoring::init_tracing;
pub use crate::orchestrator::{catch_fault, run, run_captured, FaultCatcher};
