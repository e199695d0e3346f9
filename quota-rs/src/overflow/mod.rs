/// Overflow queue for requests denied on budget
///
/// Tenant-scoped FIFO with tickets, positions, wait estimates and a
/// maximum age after which queued requests are denied outright.

pub mod queue;

pub use queue::{OverflowQueue, QueueSettings, QueuedRequest};
