/*!
 * Error Types
 * Setup and protocol failures of the fault bridges, with thiserror and miette
 *
 * None of these are recoverable. A harness whose fault interception cannot be
 * put in place cannot vouch for anything it runs afterwards, so the
 * orchestrator funnels every one of them into [`escalate`].
 */

use miette::Diagnostic;
use thiserror::Error;
use tracing::error;

/// Result type for bridge setup and teardown
pub type BridgeResult<T> = Result<T, BridgeError>;

/// Bridge failures
#[derive(Error, Debug, Diagnostic)]
pub enum BridgeError {
    #[error("Failed to allocate exception port: kern_return {0}")]
    #[diagnostic(
        code(port::allocation_failed),
        help("The task may have exhausted its port name space.")
    )]
    PortAllocation(i32),

    #[error("Failed to configure exception port: kern_return {0}")]
    #[diagnostic(code(port::configuration_failed))]
    PortConfiguration(i32),

    #[error("Failed to swap thread exception ports: kern_return {0}")]
    #[diagnostic(
        code(port::swap_failed),
        help("The calling thread must be a live Mach thread of this task.")
    )]
    PortSwap(i32),

    #[error("Failed to spawn {role} thread: {source}")]
    #[diagnostic(
        code(thread::spawn_failed),
        help("Check the process thread limit and available memory.")
    )]
    ThreadSpawn {
        role: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to install handler for {signal}: {source}")]
    #[diagnostic(code(signal::install_failed))]
    SignalInstall {
        signal: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("Failed to provision fault stack: {0}")]
    #[diagnostic(
        code(bridge::stack_failed),
        help("Fault stacks are mapped with mmap; check address space limits.")
    )]
    Stack(#[source] std::io::Error),

    #[error("Failed to redirect standard output: {0}")]
    #[diagnostic(
        code(capture::redirect_failed),
        help("Capturing needs two pipes and free file descriptors.")
    )]
    Capture(#[source] std::io::Error),

    #[error("Kernel protocol violation: {0}")]
    #[diagnostic(code(port::protocol_violation))]
    Protocol(String),
}

impl BridgeError {
    pub(crate) fn spawn(role: &'static str, source: std::io::Error) -> Self {
        BridgeError::ThreadSpawn { role, source }
    }
}

/// Report an unrecoverable bridge failure and abort the process
#[cold]
pub fn escalate(err: BridgeError) -> ! {
    error!(error = %err, "Fault bridge cannot continue, aborting");
    eprintln!("fault-bridge: {:?}", miette::Report::new(err));
    std::process::abort()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            BridgeError::PortAllocation(3).to_string(),
            "Failed to allocate exception port: kern_return 3"
        );

        let err = BridgeError::spawn(
            "listener",
            std::io::Error::new(std::io::ErrorKind::Other, "no threads"),
        );
        assert_eq!(err.to_string(), "Failed to spawn listener thread: no threads");
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_diagnostic_codes() {
        let err = BridgeError::Protocol("state count 12".into());
        let code = err.code().map(|c| c.to_string());
        assert_eq!(code.as_deref(), Some("port::protocol_violation"));
    }
}
