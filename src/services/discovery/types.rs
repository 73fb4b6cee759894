use std::collections::HashMap;
use std::pin::Pin;
use std::str::FromStr;
use std::task::{Context, Poll};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::services::error::{DiscoveryError, Result};

/// 一个正在运行的服务实例
///
/// (name, address, port) 构成实例的自然键，用于生成后端存储键和注销匹配。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub name: String,
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            address: address.into(),
            port,
            metadata: HashMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// 实例地址 `address:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// 进程内唯一键 `name:address:port`
    pub fn instance_key(&self) -> String {
        format!("{}:{}:{}", self.name, self.address, self.port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(DiscoveryError::InvalidRecord("service name is empty".into()));
        }
        if self.address.is_empty() {
            return Err(DiscoveryError::InvalidRecord(format!(
                "service {} has an empty address",
                self.name
            )));
        }
        if self.port == 0 {
            return Err(DiscoveryError::InvalidRecord(format!(
                "service {} has port 0",
                self.name
            )));
        }
        Ok(())
    }
}

/// 注册中心后端类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryKind {
    /// 基于租约的 KV 存储 (etcd)
    LeaseStore,
    /// 基于健康检查的服务目录 (consul)
    Catalog,
}

impl FromStr for DiscoveryKind {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "etcd" | "lease-store" => Ok(DiscoveryKind::LeaseStore),
            "consul" | "catalog" => Ok(DiscoveryKind::Catalog),
            _ => Err(DiscoveryError::UnsupportedType(s.to_string())),
        }
    }
}

/// 服务实例列表的推送流，每个元素都是完整快照
///
/// 第一个元素总是订阅时刻的实例列表。流只会在取消或后端关闭时结束，
/// 结束后不能重启，需要重新 `watch`。
#[derive(Debug)]
pub struct WatchStream {
    inner: ReceiverStream<Vec<ServiceRecord>>,
}

impl WatchStream {
    pub(crate) fn channel() -> (mpsc::Sender<Vec<ServiceRecord>>, Self) {
        let (tx, rx) = mpsc::channel(1);
        (
            tx,
            Self {
                inner: ReceiverStream::new(rx),
            },
        )
    }

    /// 等待下一份快照；流结束时返回 `None`
    pub async fn recv(&mut self) -> Option<Vec<ServiceRecord>> {
        self.inner.next().await
    }
}

// 把快照交给订阅方；订阅方离开或取消时返回 false
pub(crate) async fn deliver(
    tx: &mpsc::Sender<Vec<ServiceRecord>>,
    records: Vec<ServiceRecord>,
    cancel: &CancellationToken,
) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(records) => sent.is_ok(),
    }
}

impl Stream for WatchStream {
    type Item = Vec<ServiceRecord>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}
