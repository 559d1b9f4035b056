//! rockgate - stateful gRPC proxy for RocketMQ-style brokers
//!
//! Concentrates broker connection state behind a uniform RPC surface:
//! producers and consumers are created once, shared between callers with
//! identical connection parameters via reference counting, and torn down
//! on client disconnect, idle timeout, or graceful shutdown.

pub mod broker;
pub mod config;
pub mod http;
pub mod metrics;
pub mod registry;
pub mod service;
pub mod sweeper;

// Re-export generated proto types
pub mod proto {
    tonic::include_proto!("rockgate");
}

// Re-export common types for library usage
pub use config::ProxyConfig;
pub use metrics::ProxyMetrics;
pub use registry::{consumer::ConsumerRegistry, producer::ProducerRegistry};
pub use service::ProxyService;
