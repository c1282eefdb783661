/*!
 * Exception Translator
 *
 * Table-driven mapping from a kernel exception triple to the POSIX signal
 * the kernel itself would have delivered. An architecture table is consulted
 * first and the machine-independent table fills in the rest.
 *
 * Everything here is pure, lock-free and allocation-free so it can be called
 * while a fault is being serviced.
 */

mod table;
mod types;

pub use table::{classify, classify_machine, classify_portable};
pub use types::{codes, Arch, ExceptionClass};
