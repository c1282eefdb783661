/*!
 * Core Module
 * Fundamental fault types, configuration, error handling and synchronization
 */

pub mod config;
pub mod errors;
pub mod sync;
pub mod types;

// Re-export for convenience
pub use config::BridgeConfig;
pub use errors::*;
pub use types::*;
