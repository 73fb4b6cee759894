//! Service discovery module
//!
//! - `types`: service records, backend kinds and the watch stream
//! - `etcd`: lease-based key/value backend
//! - `consul`: health-check-based catalog backend
//! - `memory`: in-process backend for tests and single-process setups
//! - `manager`: bookkeeping of the instances this process registered

pub mod consul;
pub mod etcd;
pub mod manager;
pub mod memory;
pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::config::DiscoveryConfig;
use crate::services::error::Result;

pub use consul::ConsulRegistry;
pub use etcd::EtcdRegistry;
pub use manager::ServiceManager;
pub use memory::MemoryRegistry;
pub use types::{DiscoveryKind, ServiceRecord, WatchStream};

/// 服务注册中心接口
#[async_trait]
pub trait Registry: Send + Sync + 'static {
    /// 发布实例，使其对 `discover`/`watch` 可见
    async fn register(&self, record: &ServiceRecord) -> Result<()>;

    /// 注销实例；实例不存在时同样返回成功
    async fn deregister(&self, record: &ServiceRecord) -> Result<()>;

    /// 查询当前实例列表；没有实例时返回空列表
    async fn discover(&self, name: &str) -> Result<Vec<ServiceRecord>>;

    /// 订阅实例列表变化，首个元素是订阅时的列表
    ///
    /// `cancel` 触发后流结束并释放后端 watch 资源，不会注销任何实例。
    async fn watch(&self, name: &str, cancel: CancellationToken) -> Result<WatchStream>;

    /// 释放后端客户端，可重复调用
    async fn close(&self) -> Result<()>;
}

/// 根据配置创建注册中心
pub async fn new_registry(config: &DiscoveryConfig) -> Result<Arc<dyn Registry>> {
    let kind: DiscoveryKind = config.kind.parse()?;

    tracing::info!(
        kind = ?kind,
        endpoints = ?config.endpoints,
        namespace = %config.namespace,
        "Creating service registry"
    );

    match kind {
        DiscoveryKind::LeaseStore => Ok(Arc::new(EtcdRegistry::connect(config).await?)),
        DiscoveryKind::Catalog => Ok(Arc::new(ConsulRegistry::connect(config).await?)),
    }
}
