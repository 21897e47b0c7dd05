//! HTTP surface: REST routes plus the WebSocket transition stream.

pub mod routes;
pub mod stream;

pub use routes::{router, ApiError, AppState};
