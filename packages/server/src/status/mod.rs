//! Status propagation: snapshot merging, caching, fan-out and subscriptions.

pub mod broadcaster;
pub mod cache;
pub mod snapshot;
pub mod subscription;

pub use broadcaster::{Broadcaster, SCAN_STATUS_MESSAGE, STATUS_MESSAGE};
pub use cache::{status_key, StatusCache};
pub use snapshot::{scan_topic, ScanPhase, StatusSnapshot, REPORT_TOPIC};
pub use subscription::{Channel, ClientMessage, SessionReply, StatusReader, SubscriptionSession};
