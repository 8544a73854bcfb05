pub mod error;
pub mod logging;
pub mod status;
pub mod timeouts;

pub use tracing;

/// Lifecycle signal broadcast from the host process to long-lived services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
