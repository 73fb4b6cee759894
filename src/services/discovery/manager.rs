use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::types::{ServiceRecord, WatchStream};
use super::Registry;
use crate::services::error::Result;

/// 记录本进程注册过的实例，关闭时可以一次性全部注销
///
/// 注册、注销与 `deregister_all` 持有同一把锁执行，后端调用期间也不释放。
pub struct ServiceManager {
    registry: Arc<dyn Registry>,
    // name:address:port -> 实例
    registered: Mutex<HashMap<String, ServiceRecord>>,
}

impl ServiceManager {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self {
            registry,
            registered: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<dyn Registry> {
        &self.registry
    }

    pub async fn register_service(&self, record: ServiceRecord) -> Result<()> {
        let mut registered = self.registered.lock().await;
        self.registry.register(&record).await?;
        registered.insert(record.instance_key(), record);
        Ok(())
    }

    /// 注销单个实例；无论后端是否成功都会从本地记录中移除
    pub async fn deregister_service(&self, record: &ServiceRecord) -> Result<()> {
        let mut registered = self.registered.lock().await;
        let result = self.registry.deregister(record).await;
        registered.remove(&record.instance_key());
        result
    }

    /// 注销全部已注册实例；单个失败只记录日志，最终总是清空并返回成功
    pub async fn deregister_all(&self) -> Result<()> {
        let mut registered = self.registered.lock().await;
        let total = registered.len();
        let mut failed = 0usize;

        for (_, record) in registered.drain() {
            if let Err(e) = self.registry.deregister(&record).await {
                failed += 1;
                tracing::error!(
                    service_name = %record.name,
                    address = %record.address,
                    port = record.port,
                    error = %e,
                    "Failed to deregister service"
                );
            }
        }

        tracing::info!(total, failed, "Deregistered all services");
        Ok(())
    }

    pub async fn discover_services(&self, name: &str) -> Result<Vec<ServiceRecord>> {
        self.registry.discover(name).await
    }

    pub async fn watch_services(&self, name: &str, cancel: CancellationToken) -> Result<WatchStream> {
        self.registry.watch(name, cancel).await
    }

    /// 当前已注册实例的快照
    pub async fn registered(&self) -> Vec<ServiceRecord> {
        self.registered.lock().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.registered.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.registered.lock().await.is_empty()
    }

    pub async fn close(&self) -> Result<()> {
        self.registry.close().await
    }
}
