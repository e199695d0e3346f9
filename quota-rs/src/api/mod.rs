/// HTTP surface over the engine
///
/// Identity (tenant, member, role, active member count) travels in each
/// request; the handlers perform no lookups of their own.

pub mod handlers;
pub mod server;

pub use handlers::{ApiError, AppState};
pub use server::{router, ApiServer};
