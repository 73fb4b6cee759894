use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::config::DialOptions;
use super::dialer::{Connection, Dialer, TonicDialer};
use crate::config::ClientConfig;
use crate::services::discovery::Registry;
use crate::services::error::{DiscoveryError, Result};
use crate::services::resolver::{DiscoveryResolverBuilder, ResolverRegistry, Target};

/// 按逻辑服务名缓存连接
///
/// 配置了注册中心时，目标为 `discovery:///{name}`，并在拨号前确认服务至少有一个实例；
/// 没有注册中心时，服务名本身就是 `host:port` 地址。
pub struct ClientFactory<D: Dialer = TonicDialer> {
    registry: Option<Arc<dyn Registry>>,
    dialer: D,
    options: DialOptions,
    resolvers: ResolverRegistry,
    clients: RwLock<HashMap<String, Arc<D::Conn>>>,
}

impl ClientFactory<TonicDialer> {
    pub fn new(config: &ClientConfig, registry: Option<Arc<dyn Registry>>) -> Result<Self> {
        Ok(Self::with_dialer(DialOptions::from_config(config)?, registry, TonicDialer))
    }
}

impl<D: Dialer> ClientFactory<D> {
    pub fn with_dialer(options: DialOptions, registry: Option<Arc<dyn Registry>>, dialer: D) -> Self {
        Self {
            registry,
            dialer,
            options,
            resolvers: ResolverRegistry::new(),
            clients: RwLock::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &DialOptions {
        &self.options
    }

    /// 获取服务的连接，不存在时创建；并发调用只会创建一次
    pub async fn get_client(&self, service_name: &str) -> Result<Arc<D::Conn>> {
        {
            let clients = self.clients.read().await;
            if let Some(conn) = clients.get(service_name) {
                return Ok(conn.clone());
            }
        }

        let mut clients = self.clients.write().await;
        // 双重检查
        if let Some(conn) = clients.get(service_name) {
            return Ok(conn.clone());
        }

        let conn = Arc::new(self.create_connection(service_name).await?);
        clients.insert(service_name.to_string(), conn.clone());
        Ok(conn)
    }

    async fn create_connection(&self, service_name: &str) -> Result<D::Conn> {
        let target = match &self.registry {
            Some(registry) => {
                self.ensure_available(registry.as_ref(), service_name).await?;
                self.resolvers
                    .register(Arc::new(DiscoveryResolverBuilder::new(registry.clone())));
                Target::discovery(service_name)
            }
            None => service_name.parse()?,
        };

        let conn = self.dialer.dial(&target, &self.resolvers, &self.options).await?;
        tracing::info!(
            service_name = %service_name,
            dial_target = %target,
            "Created gRPC client connection"
        );
        Ok(conn)
    }

    // 拨号前确认服务存在，避免连接挂在空地址列表上
    async fn ensure_available(&self, registry: &dyn Registry, service_name: &str) -> Result<()> {
        let instances = tokio::time::timeout(self.options.discover_timeout, registry.discover(service_name))
            .await
            .map_err(|_| {
                DiscoveryError::Backend(format!("timed out discovering service {service_name}"))
            })??;

        if instances.is_empty() {
            return Err(DiscoveryError::ServiceNotFound(service_name.to_string()));
        }
        Ok(())
    }

    /// 立即刷新已缓存连接的地址列表
    pub async fn resolve_now(&self, service_name: &str) -> Result<()> {
        let conn = self.clients.read().await.get(service_name).cloned();
        match conn {
            Some(conn) => conn.resolve_now().await,
            None => Err(DiscoveryError::ServiceNotFound(service_name.to_string())),
        }
    }

    /// 关闭并移除单个连接，下次 `get_client` 会重新创建
    pub async fn evict(&self, service_name: &str) -> bool {
        let removed = self.clients.write().await.remove(service_name);
        match removed {
            Some(conn) => {
                if let Err(e) = conn.close().await {
                    tracing::error!(service_name = %service_name, error = %e, "Failed to close client connection");
                }
                true
            }
            None => false,
        }
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// 关闭全部连接；单个失败只记录日志，最终总是清空缓存
    pub async fn close(&self) -> Result<()> {
        let mut clients = self.clients.write().await;
        for (service_name, conn) in clients.drain() {
            if let Err(e) = conn.close().await {
                tracing::error!(service_name = %service_name, error = %e, "Failed to close client connection");
            }
        }

        tracing::info!("Client factory closed");
        Ok(())
    }
}
