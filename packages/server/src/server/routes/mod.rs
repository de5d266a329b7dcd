// HTTP routes
pub mod health;
pub mod jobs;
pub mod status_ws;

pub use health::*;
pub use jobs::*;
pub use status_ws::*;
