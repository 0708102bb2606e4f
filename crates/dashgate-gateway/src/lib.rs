//! HTTP surface of dashgate: the auth gate and rate-limit middleware plus the
//! dashboard's token API.

/// Auth gate and rate-limit middleware.
pub mod middleware;
/// Router construction.
pub mod server;

pub use middleware::MiddlewareState;
pub use server::GatewayServer;
