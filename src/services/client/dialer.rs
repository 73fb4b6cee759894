use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tonic::transport::Channel;

use super::config::DialOptions;
use super::interceptor::{InterceptedChannel, InterceptorChain};
use super::retry::call_with_retry;
use super::service_config::ServiceConfig;
use crate::services::error::{DiscoveryError, Result};
use crate::services::resolver::{BalanceSink, Resolver, ResolverRegistry, Target};

// 负载均衡通道的增删事件缓冲
const BALANCE_CAPACITY: usize = 1024;

/// 工厂缓存的连接
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn close(&self) -> Result<()>;

    /// 立即刷新地址列表；直连目标没有解析器时什么也不做
    async fn resolve_now(&self) -> Result<()> {
        Ok(())
    }
}

/// 根据目标建立连接
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Conn: Connection;

    async fn dial(&self, target: &Target, resolvers: &ResolverRegistry, options: &DialOptions) -> Result<Self::Conn>;
}

/// 基于 tonic 的拨号器
///
/// 有解析器的 scheme 使用负载均衡通道，由解析器推送地址；
/// 直连目标使用惰性连接，首次调用时才真正建立。
#[derive(Debug, Clone, Copy, Default)]
pub struct TonicDialer;

#[async_trait]
impl Dialer for TonicDialer {
    type Conn = ClientConnection;

    async fn dial(&self, target: &Target, resolvers: &ResolverRegistry, options: &DialOptions) -> Result<Self::Conn> {
        let chain = InterceptorChain::from_flags(options.enable_logging, options.enable_metrics);

        if let Some(builder) = resolvers.get(&target.scheme) {
            let (channel, tx) = Channel::balance_channel::<String>(BALANCE_CAPACITY);
            let sink = Arc::new(BalanceSink::new(tx, options.clone()));
            let resolver = builder.build(target, sink).await?;
            return Ok(ClientConnection::new(
                target.clone(),
                InterceptedChannel::new(channel, chain),
                Some(resolver),
                options,
            ));
        }

        if !target.is_direct() {
            return Err(DiscoveryError::UnknownScheme(target.scheme.clone()));
        }

        let channel = options.endpoint(&target.endpoint)?.connect_lazy();
        Ok(ClientConnection::new(
            target.clone(),
            InterceptedChannel::new(channel, chain),
            None,
            options,
        ))
    }
}

/// 到一个逻辑服务的连接
///
/// 通道可以被克隆后交给生成的 gRPC 客户端；消息大小上限与服务配置在创建时确定。
pub struct ClientConnection {
    target: Target,
    channel: InterceptedChannel,
    resolver: Option<Arc<dyn Resolver>>,
    service_config: ServiceConfig,
    max_recv_msg_size: usize,
    max_send_msg_size: usize,
    closed: AtomicBool,
}

impl ClientConnection {
    fn new(
        target: Target,
        channel: InterceptedChannel,
        resolver: Option<Arc<dyn Resolver>>,
        options: &DialOptions,
    ) -> Self {
        Self {
            target,
            channel,
            resolver,
            service_config: options.service_config.clone(),
            max_recv_msg_size: options.max_recv_msg_size,
            max_send_msg_size: options.max_send_msg_size,
            closed: AtomicBool::new(false),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// 供生成的客户端使用的通道
    pub fn channel(&self) -> InterceptedChannel {
        self.channel.clone()
    }

    pub fn service_config(&self) -> &ServiceConfig {
        &self.service_config
    }

    /// 生成的客户端应设置 `max_decoding_message_size` 为该值
    pub fn max_recv_msg_size(&self) -> usize {
        self.max_recv_msg_size
    }

    /// 生成的客户端应设置 `max_encoding_message_size` 为该值
    pub fn max_send_msg_size(&self) -> usize {
        self.max_send_msg_size
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 按连接的重试策略执行一元调用
    pub async fn call_with_retry<T, F, Fut>(&self, op_name: &str, call: F) -> std::result::Result<T, tonic::Status>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, tonic::Status>>,
    {
        call_with_retry(&self.service_config.retry_policy, op_name, call).await
    }
}

#[async_trait]
impl Connection for ClientConnection {
    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(resolver) = &self.resolver {
            resolver.close().await;
        }
        tracing::info!(dial_target = %self.target, "Client connection closed");
        Ok(())
    }

    async fn resolve_now(&self) -> Result<()> {
        match &self.resolver {
            Some(resolver) => resolver.resolve_now().await,
            None => Ok(()),
        }
    }
}
