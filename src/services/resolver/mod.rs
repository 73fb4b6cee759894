//! 名称解析
//!
//! 连接目标写作 `scheme://authority/endpoint`。`discovery:///{name}` 交给
//! [`DiscoveryResolver`]，裸 `host:port` 或 `dns:///host:port` 直接拨号。

pub mod balance;
pub mod discovery;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::services::error::{DiscoveryError, Result};

pub use balance::BalanceSink;
pub use discovery::{DiscoveryResolver, DiscoveryResolverBuilder};

/// 服务发现解析器使用的 scheme
pub const DISCOVERY_SCHEME: &str = "discovery";
/// 不带 scheme 的目标按字面地址处理
pub const PASSTHROUGH_SCHEME: &str = "passthrough";
pub const DNS_SCHEME: &str = "dns";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: String,
    pub authority: String,
    pub endpoint: String,
}

impl Target {
    pub fn discovery(service_name: &str) -> Self {
        Self {
            scheme: DISCOVERY_SCHEME.to_string(),
            authority: String::new(),
            endpoint: service_name.to_string(),
        }
    }

    /// 是否可以不经解析器直接拨号
    pub fn is_direct(&self) -> bool {
        self.scheme == PASSTHROUGH_SCHEME || self.scheme == DNS_SCHEME
    }
}

impl FromStr for Target {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        let Some((scheme, rest)) = s.split_once("://") else {
            if s.is_empty() {
                return Err(DiscoveryError::InvalidTarget(s.to_string()));
            }
            return Ok(Self {
                scheme: PASSTHROUGH_SCHEME.to_string(),
                authority: String::new(),
                endpoint: s.to_string(),
            });
        };

        let (authority, endpoint) = rest.split_once('/').unwrap_or(("", rest));
        if scheme.is_empty() || endpoint.is_empty() {
            return Err(DiscoveryError::InvalidTarget(s.to_string()));
        }

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            authority: authority.to_string(),
            endpoint: endpoint.to_string(),
        })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.scheme == PASSTHROUGH_SCHEME {
            write!(f, "{}", self.endpoint)
        } else {
            write!(f, "{}://{}/{}", self.scheme, self.authority, self.endpoint)
        }
    }
}

/// 解析结果：当前可用的 `host:port` 列表
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolverState {
    pub addresses: Vec<String>,
}

/// 连接层接收地址更新的一端
#[async_trait]
pub trait ClientConnState: Send + Sync + 'static {
    /// 用完整列表替换当前地址
    async fn update_state(&self, state: ResolverState) -> Result<()>;
}

#[async_trait]
pub trait Resolver: Send + Sync + 'static {
    /// 立即查询一次并推送结果
    async fn resolve_now(&self) -> Result<()>;

    /// 停止后台 watch；返回后不会再推送任何更新
    async fn close(&self);
}

#[async_trait]
pub trait ResolverBuilder: Send + Sync + 'static {
    fn scheme(&self) -> &'static str;

    async fn build(&self, target: &Target, conn: Arc<dyn ClientConnState>) -> Result<Arc<dyn Resolver>>;
}

/// scheme -> 解析器构造器
#[derive(Default)]
pub struct ResolverRegistry {
    builders: DashMap<String, Arc<dyn ResolverBuilder>>,
}

impl ResolverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册构造器，同一 scheme 后注册的覆盖先注册的
    pub fn register(&self, builder: Arc<dyn ResolverBuilder>) {
        let scheme = builder.scheme();
        if self.builders.insert(scheme.to_string(), builder).is_none() {
            tracing::debug!(scheme, "Resolver builder registered");
        }
    }

    pub fn get(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        self.builders.get(scheme).map(|b| b.value().clone())
    }

    pub fn contains(&self, scheme: &str) -> bool {
        self.builders.contains_key(scheme)
    }
}
