/*!
 * Monitoring
 * Structured logging for fault interception
 */

pub mod tracer;

pub use tracer::{init_tracing, RunSpan};
