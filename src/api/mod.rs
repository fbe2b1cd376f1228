//! Dashboard HTTP API and WebSocket event stream.

pub mod models;
pub mod routes;

pub use routes::{build_router, serve};
