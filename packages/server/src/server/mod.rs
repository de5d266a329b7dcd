// HTTP and WebSocket surface
pub mod app;
pub mod middleware;
pub mod routes;

pub use app::*;
