// Phishwatch - URL risk analysis orchestration core
//
// Schedules classification, deep-report and url-scan jobs per url, retries
// transient backend failures and pushes live status to subscribers.
//
// The orchestration engine lives in kernel/jobs, the status layer in status/.

pub mod common;
pub mod config;
pub mod kernel;
pub mod server;
pub mod status;

pub use config::*;
