//! Shared foundation for the RuleVM workspace.
//!
//! Holds the pieces every other crate leans on: the common error type,
//! environment-driven configuration defaults, and the status sink used by
//! the VM's observability loop.

pub mod config;
pub mod error;
pub mod status;

pub use error::Error;
pub use status::{InMemoryStatusSink, StatusSink, TracingStatusSink};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
