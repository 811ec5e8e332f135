//! Plumbing shared by every spoolgate crate: the shutdown signal that fans
//! out to the long-running loops, and the logging setup.

pub mod logging;

pub use tracing;

/// Broadcast to every long-running loop when the service is stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Shutdown,
    Finalised,
}
