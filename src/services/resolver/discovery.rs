use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{ClientConnState, DISCOVERY_SCHEME, Resolver, ResolverBuilder, ResolverState, Target};
use crate::services::discovery::{Registry, ServiceRecord};
use crate::services::error::{DiscoveryError, Result};
use crate::services::task::spawn_guarded;

/// 为 `discovery:///{name}` 目标创建 [`DiscoveryResolver`]
pub struct DiscoveryResolverBuilder {
    registry: Arc<dyn Registry>,
}

impl DiscoveryResolverBuilder {
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl ResolverBuilder for DiscoveryResolverBuilder {
    fn scheme(&self) -> &'static str {
        DISCOVERY_SCHEME
    }

    async fn build(&self, target: &Target, conn: Arc<dyn ClientConnState>) -> Result<Arc<dyn Resolver>> {
        let resolver = DiscoveryResolver::start(self.registry.clone(), &target.endpoint, conn).await?;
        Ok(Arc::new(resolver))
    }
}

// 推送闸门：推送与关闭互斥，关闭后不再推送
#[derive(Clone)]
struct Pusher {
    service_name: String,
    conn: Arc<dyn ClientConnState>,
    cancel: CancellationToken,
    gate: Arc<Mutex<()>>,
}

impl Pusher {
    async fn push(&self, records: Vec<ServiceRecord>) -> bool {
        let _guard = self.gate.lock().await;
        if self.cancel.is_cancelled() {
            return false;
        }

        let state = ResolverState {
            addresses: records.iter().map(ServiceRecord::endpoint).collect(),
        };
        let count = state.addresses.len();

        match self.conn.update_state(state).await {
            Ok(()) => {
                tracing::debug!(service_name = %self.service_name, addresses = count, "Resolver state updated");
            }
            Err(e) => {
                tracing::error!(service_name = %self.service_name, error = %e, "Failed to update resolver state");
            }
        }
        true
    }
}

/// 把注册中心的 watch 流转换成连接层的地址推送
///
/// 每个实例只有一个后台 watch 任务。`close` 取消任务并等待其退出，
/// 正在进行的推送与 `close` 竞争时，推送会被丢弃。
pub struct DiscoveryResolver {
    registry: Arc<dyn Registry>,
    pusher: Pusher,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DiscoveryResolver {
    /// 订阅服务并推送首个快照后返回
    pub async fn start(
        registry: Arc<dyn Registry>,
        service_name: &str,
        conn: Arc<dyn ClientConnState>,
    ) -> Result<Self> {
        let cancel = CancellationToken::new();
        let pusher = Pusher {
            service_name: service_name.to_string(),
            conn,
            cancel: cancel.clone(),
            gate: Arc::new(Mutex::new(())),
        };

        let mut stream = registry.watch(service_name, cancel.child_token()).await?;
        if let Some(initial) = stream.recv().await {
            pusher.push(initial).await;
        }

        let loop_pusher = pusher.clone();
        let task = spawn_guarded("discovery_resolver", service_name.to_string(), async move {
            loop {
                let snapshot = tokio::select! {
                    _ = loop_pusher.cancel.cancelled() => break,
                    snapshot = stream.recv() => snapshot,
                };
                match snapshot {
                    Some(records) => {
                        if !loop_pusher.push(records).await {
                            break;
                        }
                    }
                    None => {
                        tracing::warn!(service_name = %loop_pusher.service_name, "Watch stream ended, resolver stopped");
                        break;
                    }
                }
            }
        });

        tracing::info!(service_name = %service_name, "Discovery resolver started");
        Ok(Self {
            registry,
            pusher,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn service_name(&self) -> &str {
        &self.pusher.service_name
    }

    pub fn is_closed(&self) -> bool {
        self.pusher.cancel.is_cancelled()
    }
}

#[async_trait]
impl Resolver for DiscoveryResolver {
    async fn resolve_now(&self) -> Result<()> {
        if self.is_closed() {
            return Err(DiscoveryError::ResolverClosed);
        }

        let records = self.registry.discover(&self.pusher.service_name).await?;
        if !self.pusher.push(records).await {
            return Err(DiscoveryError::ResolverClosed);
        }
        Ok(())
    }

    async fn close(&self) {
        self.pusher.cancel.cancel();
        // 等待进行中的推送结束
        drop(self.pusher.gate.lock().await);

        let task = self.task.lock().await.take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                tracing::warn!(service_name = %self.pusher.service_name, error = %e, "Resolver task ended abnormally");
            }
            tracing::info!(service_name = %self.pusher.service_name, "Discovery resolver closed");
        }
    }
}
