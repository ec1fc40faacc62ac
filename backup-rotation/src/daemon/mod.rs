//! Process-level guards around a run: the destination lock and signal
//! driven cancellation.

pub mod lock;
pub mod shutdown;

pub use lock::DestinationLock;
pub use shutdown::ShutdownCoordinator;
