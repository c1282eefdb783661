/*!
 * Bridge Configuration
 *
 * Runtime knobs for a fault-catching run. Which bridge is used is not one of
 * them: that is fixed per target when the crate is built.
 */

use std::env;

/// Extra alternate-stack space on top of the platform minimum
const ALT_STACK_HEADROOM: usize = 64 * 1024;

/// Default alternate signal stack size
pub fn default_alt_stack_size() -> usize {
    libc::MINSIGSTKSZ as usize + ALT_STACK_HEADROOM
}

/// Fault bridge configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeConfig {
    /// Size of the stack a faulted worker continues on: the alternate signal
    /// stack, or the landing stack of the exception-port bridge
    pub alt_stack_size: usize,
    /// Do not execute the closure when a tracer is attached
    pub skip_if_being_debugged: bool,
    /// Route panic reports of the worker thread to tracing instead of stderr
    pub suppress_fatal_reports: bool,
    /// Name of the thread that executes the target closure
    pub worker_name: String,
    /// Name of the exception-port listener thread
    pub listener_name: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            alt_stack_size: default_alt_stack_size(),
            skip_if_being_debugged: false,
            suppress_fatal_reports: true,
            worker_name: "fault-bridge-worker".to_string(),
            listener_name: "fault-bridge-listener".to_string(),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from the environment, falling back to defaults
    ///
    /// Environment variables:
    /// - FAULT_BRIDGE_ALT_STACK_KB: alternate stack size in KiB
    /// - FAULT_BRIDGE_SKIP_IF_DEBUGGED: skip runs under a debugger (1/true)
    /// - FAULT_BRIDGE_QUIET: mute panic reports from the worker (1/true)
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(kb) = env::var("FAULT_BRIDGE_ALT_STACK_KB")
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
        {
            config = config.with_alt_stack_size(kb * 1024);
        }
        if let Some(skip) = env_flag("FAULT_BRIDGE_SKIP_IF_DEBUGGED") {
            config.skip_if_being_debugged = skip;
        }
        if let Some(quiet) = env_flag("FAULT_BRIDGE_QUIET") {
            config.suppress_fatal_reports = quiet;
        }

        config
    }

    /// Alternate stack size, never below the platform minimum
    pub fn with_alt_stack_size(mut self, bytes: usize) -> Self {
        self.alt_stack_size = bytes.max(libc::MINSIGSTKSZ as usize);
        self
    }

    pub fn with_skip_if_being_debugged(mut self, skip: bool) -> Self {
        self.skip_if_being_debugged = skip;
        self
    }

    pub fn with_suppress_fatal_reports(mut self, suppress: bool) -> Self {
        self.suppress_fatal_reports = suppress;
        self
    }

    pub fn with_worker_name(mut self, name: impl Into<String>) -> Self {
        self.worker_name = name.into();
        self
    }

    pub fn with_listener_name(mut self, name: impl Into<String>) -> Self {
        self.listener_name = name.into();
        self
    }
}

fn env_flag(key: &str) -> Option<bool> {
    let value = env::var(key).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_default_alt_stack_is_generous() {
        let config = BridgeConfig::default();
        assert!(config.alt_stack_size >= libc::MINSIGSTKSZ as usize + 64 * 1024);
        assert!(!config.skip_if_being_debugged);
        assert!(config.suppress_fatal_reports);
    }

    #[test]
    fn test_alt_stack_size_clamped_to_minimum() {
        let config = BridgeConfig::default().with_alt_stack_size(16);
        assert_eq!(config.alt_stack_size, libc::MINSIGSTKSZ as usize);
    }

    #[test]
    fn test_thread_names_are_configurable() {
        let config = BridgeConfig::default()
            .with_worker_name("crash-worker")
            .with_listener_name("crash-listener");
        assert_eq!(config.worker_name, "crash-worker");
        assert_eq!(config.listener_name, "crash-listener");

        let defaults = BridgeConfig::default();
        assert_ne!(defaults.worker_name, defaults.listener_name);
    }

    #[test]
    #[serial(env)]
    fn test_from_env() {
        env::set_var("FAULT_BRIDGE_ALT_STACK_KB", "256");
        env::set_var("FAULT_BRIDGE_SKIP_IF_DEBUGGED", "true");
        env::set_var("FAULT_BRIDGE_QUIET", "0");

        let config = BridgeConfig::from_env();
        assert_eq!(config.alt_stack_size, 256 * 1024);
        assert!(config.skip_if_being_debugged);
        assert!(!config.suppress_fatal_reports);

        env::set_var("FAULT_BRIDGE_QUIET", "maybe");
        assert!(BridgeConfig::from_env().suppress_fatal_reports);

        env::remove_var("FAULT_BRIDGE_ALT_STACK_KB");
        env::remove_var("FAULT_BRIDGE_SKIP_IF_DEBUGGED");
        env::remove_var("FAULT_BRIDGE_QUIET");
    }
}
