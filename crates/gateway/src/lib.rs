//! The pulse gateway: socket transport, broadcast dispatch, and the
//! HTTP/JSON RPC surface.
//!
//! The gateway owns socket lifetime. The registry and connection manager
//! hold socket ids only; disconnect handling in [`socket`] is the single
//! place where a socket's life ends and the indexes are notified.

pub mod dispatch;
pub mod engine;
pub mod error;
pub mod metrics_middleware;
pub mod routes;
pub mod server;
pub mod socket;
pub mod state;
pub mod throttle;

pub use server::{AppState, build_router, run};
