/*!
 * Synchronization Primitives
 *
 * Blocking rendezvous used between the orchestrator and the thread running
 * the target closure.
 */

mod latch;

pub use latch::{Completion, CompletionLatch};
