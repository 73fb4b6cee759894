use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::types::{ServiceRecord, WatchStream, deliver};
use super::Registry;
use crate::services::error::Result;
use crate::services::task::spawn_guarded;

/// 进程内注册中心
///
/// 每个服务名对应一个 `watch` 通道，通道里保存当前完整的实例列表。
/// 主要用于测试以及不需要外部存储的单进程部署。
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    services: DashMap<String, watch::Sender<Vec<ServiceRecord>>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 当前仍在订阅该服务的 watch 数量
    pub fn watcher_count(&self, name: &str) -> usize {
        self.services
            .get(name)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }

    fn subscribe(&self, name: &str) -> watch::Receiver<Vec<ServiceRecord>> {
        self.services
            .entry(name.to_string())
            .or_insert_with(|| watch::channel(Vec::new()).0)
            .subscribe()
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn register(&self, record: &ServiceRecord) -> Result<()> {
        record.validate()?;

        let sender = self
            .services
            .entry(record.name.clone())
            .or_insert_with(|| watch::channel(Vec::new()).0);

        sender.send_modify(|instances| {
            instances.retain(|r| !(r.address == record.address && r.port == record.port));
            instances.push(record.clone());
        });

        tracing::info!(
            service_name = %record.name,
            address = %record.address,
            port = record.port,
            "Service registered"
        );
        Ok(())
    }

    async fn deregister(&self, record: &ServiceRecord) -> Result<()> {
        if let Some(sender) = self.services.get(&record.name) {
            sender.send_if_modified(|instances| {
                let before = instances.len();
                instances.retain(|r| !(r.address == record.address && r.port == record.port));
                instances.len() != before
            });
        }

        tracing::info!(
            service_name = %record.name,
            address = %record.address,
            port = record.port,
            "Service deregistered"
        );
        Ok(())
    }

    async fn discover(&self, name: &str) -> Result<Vec<ServiceRecord>> {
        Ok(self
            .services
            .get(name)
            .map(|sender| sender.borrow().clone())
            .unwrap_or_default())
    }

    async fn watch(&self, name: &str, cancel: CancellationToken) -> Result<WatchStream> {
        let mut rx = self.subscribe(name);
        let (tx, stream) = WatchStream::channel();

        // 首个快照在返回前写入，订阅与首个状态之间没有空档
        let initial = rx.borrow_and_update().clone();
        if tx.send(initial).await.is_err() {
            return Ok(stream);
        }

        let service_name = name.to_string();
        spawn_guarded("memory_watch", service_name.clone(), async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    // 订阅方已丢弃流
                    _ = tx.closed() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }

                let snapshot = rx.borrow_and_update().clone();
                if !deliver(&tx, snapshot, &cancel).await {
                    break;
                }
            }

            tracing::debug!(service_name = %service_name, "Memory watch stopped");
        });

        Ok(stream)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_register_replaces_same_instance() {
        let registry = MemoryRegistry::new();
        let record = ServiceRecord::new("svc", "127.0.0.1", 9000);

        registry.register(&record).await.unwrap();
        registry
            .register(&record.clone().with_metadata("version", "2"))
            .await
            .unwrap();

        let instances = registry.discover("svc").await.unwrap();
        assert_eq!(instances.len(), 1);
        assert_eq!(instances[0].metadata["version"], "2");
    }

    #[tokio::test]
    async fn test_cancel_releases_watcher() {
        let registry = MemoryRegistry::new();
        let cancel = CancellationToken::new();

        let mut stream = registry.watch("svc", cancel.clone()).await.unwrap();
        assert_eq!(stream.recv().await, Some(vec![]));
        assert_eq!(registry.watcher_count("svc"), 1);

        cancel.cancel();
        let end = timeout(Duration::from_secs(1), stream.recv()).await.unwrap();
        assert!(end.is_none());
        assert_eq!(registry.watcher_count("svc"), 0);
    }

    #[tokio::test]
    async fn test_dropped_stream_releases_watcher() {
        let registry = MemoryRegistry::new();

        let mut stream = registry.watch("svc", CancellationToken::new()).await.unwrap();
        assert_eq!(stream.recv().await, Some(vec![]));
        assert_eq!(registry.watcher_count("svc"), 1);

        // 服务没有任何变化，订阅方直接离开
        drop(stream);
        timeout(Duration::from_secs(1), async {
            while registry.watcher_count("svc") > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("Watch task kept running after the stream was dropped");
    }
}
