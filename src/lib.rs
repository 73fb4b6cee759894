//! 基于 etcd / Consul 的 gRPC 服务注册、发现与客户端连接管理

pub mod config;
pub mod services;
pub mod telemetry;

pub use config::Config;
pub use services::{ClientFactory, DiscoveryError, Registry, ServiceManager, ServiceRecord};
