//! Kernel module - server infrastructure and dependencies.

pub mod analyzer;
pub mod jobs;
pub mod kv;
pub mod nats;
pub mod redis_kv;
pub mod scanner;
pub mod server_kernel;
pub mod stream_hub;
pub mod test_dependencies;
pub mod traits;
pub mod transport;

pub use analyzer::OpenAiAnalyzer;
pub use kv::MemoryKeyValueStore;
pub use nats::NatsTransport;
pub use redis_kv::RedisKeyValueStore;
pub use scanner::UrlscanScanner;
pub use server_kernel::ServerKernel;
pub use stream_hub::StreamHub;
pub use test_dependencies::{MockAnalyzer, MockScanner, TestDependencies, TestKernel};
pub use traits::*;
pub use transport::{FanoutTransport, PublishedMessage, RecordingTransport};
