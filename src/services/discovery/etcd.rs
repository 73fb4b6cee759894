use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use etcd_client::{Client, ConnectOptions, GetOptions, PutOptions, WatchOptions};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::types::{ServiceRecord, WatchStream, deliver};
use super::Registry;
use crate::config::DiscoveryConfig;
use crate::services::error::{DiscoveryError, Result};
use crate::services::task::{merge_tokens, retry_until_ok, spawn_guarded};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const STATUS_TIMEOUT: Duration = Duration::from_secs(3);

// 单个实例的租约及其续约任务
#[derive(Debug)]
struct LeaseHandle {
    lease_id: Arc<AtomicI64>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl LeaseHandle {
    // 停止续约任务并等待其退出，返回最后持有的租约 ID
    async fn stop(self) -> i64 {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Lease renewal task ended abnormally");
        }
        self.lease_id.load(Ordering::Acquire)
    }
}

/// 基于 etcd 租约的注册中心
///
/// 键格式 `{namespace}/services/{name}/{address}:{port}`，值为 JSON 序列化的 `ServiceRecord`。
/// 每个注册的实例拥有独立的租约和续约任务。
pub struct EtcdRegistry {
    client: Client,
    namespace: String,
    lease_ttl: Duration,
    retry_interval: Duration,
    // 后端键 -> 租约
    leases: DashMap<String, LeaseHandle>,
    shutdown: CancellationToken,
}

impl EtcdRegistry {
    /// 连接 etcd 并确认集群可达
    pub async fn connect(config: &DiscoveryConfig) -> Result<Self> {
        let options = ConnectOptions::new()
            .with_connect_timeout(CONNECT_TIMEOUT)
            .with_keep_alive(Duration::from_secs(30), Duration::from_secs(10));

        let mut client = Client::connect(&config.endpoints, Some(options))
            .await
            .map_err(|e| DiscoveryError::Connect(format!("failed to create etcd client: {e}")))?;

        match tokio::time::timeout(STATUS_TIMEOUT, client.status()).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                return Err(DiscoveryError::Connect(format!("failed to connect to etcd: {e}")));
            }
            Err(_) => {
                return Err(DiscoveryError::Connect(
                    "timed out waiting for etcd status".to_string(),
                ));
            }
        }

        tracing::info!(endpoints = ?config.endpoints, "Connected to etcd");
        Ok(Self::with_client(client, config))
    }

    pub fn with_client(client: Client, config: &DiscoveryConfig) -> Self {
        Self {
            client,
            namespace: config.namespace.clone(),
            lease_ttl: config.lease_ttl(),
            retry_interval: config.watch_retry(),
            leases: DashMap::new(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn service_key(&self, name: &str, address: &str, port: u16) -> String {
        build_key(&self.namespace, &[name, &format!("{address}:{port}")])
    }

    pub fn service_prefix(&self, name: &str) -> String {
        format!("{}/", build_key(&self.namespace, &[name]))
    }

    fn ttl_secs(&self) -> i64 {
        self.lease_ttl.as_secs().max(1) as i64
    }
}

#[async_trait]
impl Registry for EtcdRegistry {
    async fn register(&self, record: &ServiceRecord) -> Result<()> {
        record.validate()?;

        let key = self.service_key(&record.name, &record.address, record.port);
        let value = serde_json::to_string(record)?;

        // 同一实例重复注册时先停掉旧租约
        if let Some((_, previous)) = self.leases.remove(&key) {
            let old_lease = previous.stop().await;
            let mut client = self.client.clone();
            if let Err(e) = client.lease_revoke(old_lease).await {
                tracing::warn!(key = %key, lease_id = old_lease, error = %e, "Failed to revoke previous lease");
            }
        }

        let mut client = self.client.clone();
        let lease_id = grant_and_put(&mut client, &key, &value, self.ttl_secs()).await?;

        let lease_id = Arc::new(AtomicI64::new(lease_id));
        let cancel = self.shutdown.child_token();
        let renewal = LeaseRenewal {
            client: self.client.clone(),
            key: key.clone(),
            value,
            ttl_secs: self.ttl_secs(),
            retry_interval: self.retry_interval,
            lease_id: lease_id.clone(),
        };
        let task = spawn_guarded("etcd_lease_renewal", key.clone(), renewal.run(cancel.clone()));

        self.leases.insert(
            key.clone(),
            LeaseHandle {
                lease_id: lease_id.clone(),
                cancel,
                task,
            },
        );

        tracing::info!(
            service_name = %record.name,
            address = %record.address,
            port = record.port,
            key = %key,
            lease_id = lease_id.load(Ordering::Acquire),
            "Service registered"
        );
        Ok(())
    }

    async fn deregister(&self, record: &ServiceRecord) -> Result<()> {
        let key = self.service_key(&record.name, &record.address, record.port);
        let mut client = self.client.clone();

        // 撤销租约
        if let Some((_, handle)) = self.leases.remove(&key) {
            let lease_id = handle.stop().await;
            if let Err(e) = client.lease_revoke(lease_id).await {
                tracing::warn!(key = %key, lease_id, error = %e, "Failed to revoke lease");
            }
        }

        // 删除服务键；键不存在时 etcd 同样返回成功
        client.delete(key.clone(), None).await?;

        tracing::info!(
            service_name = %record.name,
            address = %record.address,
            port = record.port,
            key = %key,
            "Service deregistered"
        );
        Ok(())
    }

    async fn discover(&self, name: &str) -> Result<Vec<ServiceRecord>> {
        let mut client = self.client.clone();
        let (records, _) = fetch_records(&mut client, &self.service_prefix(name)).await?;
        Ok(records)
    }

    async fn watch(&self, name: &str, cancel: CancellationToken) -> Result<WatchStream> {
        let prefix = self.service_prefix(name);
        let mut client = self.client.clone();

        // 先读取当前列表和 revision，再从下一个 revision 开始 watch，保证没有遗漏
        let (initial, revision) = fetch_records(&mut client, &prefix).await?;
        let (tx, stream) = WatchStream::channel();
        if tx.send(initial).await.is_err() {
            return Ok(stream);
        }

        let cancel = merge_tokens(cancel, &self.shutdown);
        let watch = PrefixWatch {
            client,
            prefix,
            service_name: name.to_string(),
            revision,
            retry_interval: self.retry_interval,
        };
        spawn_guarded("etcd_watch", name.to_string(), watch.run(tx, cancel));

        Ok(stream)
    }

    async fn close(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }

        // 只停止续约与 watch，不撤销租约：实例随租约到期自然消失
        self.shutdown.cancel();
        let keys: Vec<String> = self.leases.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((_, handle)) = self.leases.remove(&key) {
                handle.stop().await;
            }
        }

        tracing::info!(namespace = %self.namespace, "etcd registry closed");
        Ok(())
    }
}

// 续约任务
struct LeaseRenewal {
    client: Client,
    key: String,
    value: String,
    ttl_secs: i64,
    retry_interval: Duration,
    lease_id: Arc<AtomicI64>,
}

impl LeaseRenewal {
    async fn run(mut self, cancel: CancellationToken) {
        let interval = Duration::from_secs((self.ttl_secs / 3).max(1) as u64);

        loop {
            self.keep_alive(interval, &cancel).await;
            if cancel.is_cancelled() {
                return;
            }

            // 租约丢失，带退避地重新注册
            let attempt = {
                let client = self.client.clone();
                let key = self.key.clone();
                let value = self.value.clone();
                let ttl_secs = self.ttl_secs;
                move || {
                    let mut client = client.clone();
                    let key = key.clone();
                    let value = value.clone();
                    async move { grant_and_put(&mut client, &key, &value, ttl_secs).await }
                }
            };
            match retry_until_ok(self.retry_interval, &cancel, &self.key, "re-register service", attempt).await {
                Some(lease_id) => {
                    self.lease_id.store(lease_id, Ordering::Release);
                    tracing::info!(key = %self.key, lease_id, "Service re-registered with a new lease");
                }
                None => return,
            }
        }
    }

    // 续约直到取消或租约失效
    async fn keep_alive(&mut self, interval: Duration, cancel: &CancellationToken) {
        let lease_id = self.lease_id.load(Ordering::Acquire);
        let (mut keeper, mut responses) = match self.client.lease_keep_alive(lease_id).await {
            Ok(pair) => pair,
            Err(e) => {
                tracing::warn!(key = %self.key, lease_id, error = %e, "Failed to start lease keep-alive");
                return;
            }
        };

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }

            if let Err(e) = keeper.keep_alive().await {
                tracing::warn!(key = %self.key, lease_id, error = %e, "Lease keep-alive request failed");
                return;
            }

            let response = tokio::select! {
                _ = cancel.cancelled() => return,
                response = responses.message() => response,
            };

            match response {
                Ok(Some(resp)) if resp.ttl() > 0 => {
                    tracing::debug!(key = %self.key, lease_id, ttl = resp.ttl(), "Lease renewed");
                }
                Ok(Some(_)) => {
                    tracing::warn!(key = %self.key, lease_id, "Lease expired");
                    return;
                }
                Ok(None) => {
                    tracing::warn!(key = %self.key, lease_id, "Lease keep-alive stream closed");
                    return;
                }
                Err(e) => {
                    tracing::warn!(key = %self.key, lease_id, error = %e, "Lease keep-alive failed");
                    return;
                }
            }
        }
    }
}

// 前缀 watch 任务
struct PrefixWatch {
    client: Client,
    prefix: String,
    service_name: String,
    revision: i64,
    retry_interval: Duration,
}

impl PrefixWatch {
    async fn run(mut self, tx: mpsc::Sender<Vec<ServiceRecord>>, cancel: CancellationToken) {
        loop {
            if !self.watch_until_error(&tx, &cancel).await {
                break;
            }

            // 出错后退避，然后重新同步一次完整列表
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tx.closed() => break,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }

            match fetch_records(&mut self.client, &self.prefix).await {
                Ok((records, revision)) => {
                    self.revision = revision;
                    if !deliver(&tx, records, &cancel).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        service_name = %self.service_name,
                        error = %e,
                        "Failed to resync services after watch error"
                    );
                }
            }
        }

        // 结束合并的取消信号，释放其监听任务
        cancel.cancel();
        tracing::debug!(service_name = %self.service_name, "etcd watch stopped");
    }

    // 返回 false 表示应当结束（取消或订阅方已离开），true 表示出错需要重试
    async fn watch_until_error(
        &mut self,
        tx: &mpsc::Sender<Vec<ServiceRecord>>,
        cancel: &CancellationToken,
    ) -> bool {
        let mut options = WatchOptions::new().with_prefix();
        if self.revision > 0 {
            options = options.with_start_revision(self.revision + 1);
        }

        let opened = tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tx.closed() => return false,
            opened = self.client.watch(self.prefix.clone(), Some(options)) => opened,
        };
        let (mut watcher, mut events) = match opened {
            Ok(pair) => pair,
            Err(e) => {
                tracing::error!(service_name = %self.service_name, error = %e, "Failed to open etcd watch");
                return true;
            }
        };

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = watcher.cancel().await;
                    return false;
                }
                // 订阅方已丢弃流
                _ = tx.closed() => {
                    let _ = watcher.cancel().await;
                    return false;
                }
                message = events.message() => message,
            };

            match message {
                Ok(Some(resp)) => {
                    if resp.canceled() {
                        tracing::warn!(
                            service_name = %self.service_name,
                            reason = %resp.cancel_reason(),
                            "etcd watch canceled by server"
                        );
                        return true;
                    }
                    if resp.events().is_empty() {
                        continue;
                    }

                    // 重新获取完整列表
                    match fetch_records(&mut self.client, &self.prefix).await {
                        Ok((records, revision)) => {
                            self.revision = revision;
                            if !deliver(tx, records, cancel).await {
                                let _ = watcher.cancel().await;
                                return false;
                            }
                        }
                        Err(e) => {
                            tracing::error!(
                                service_name = %self.service_name,
                                error = %e,
                                "Failed to discover services on watch"
                            );
                        }
                    }
                }
                Ok(None) => {
                    tracing::warn!(service_name = %self.service_name, "etcd watch stream closed");
                    return true;
                }
                Err(e) => {
                    tracing::error!(service_name = %self.service_name, error = %e, "etcd watch error");
                    return true;
                }
            }
        }
    }
}

async fn grant_and_put(client: &mut Client, key: &str, value: &str, ttl_secs: i64) -> Result<i64> {
    let lease = client.lease_grant(ttl_secs, None).await?;
    let lease_id = lease.id();

    client
        .put(key, value, Some(PutOptions::new().with_lease(lease_id)))
        .await?;

    Ok(lease_id)
}

// 读取前缀下的全部实例及当前 revision
async fn fetch_records(client: &mut Client, prefix: &str) -> Result<(Vec<ServiceRecord>, i64)> {
    let resp = client
        .get(prefix, Some(GetOptions::new().with_prefix()))
        .await?;
    let revision = resp.header().map(|h| h.revision()).unwrap_or(0);

    let mut records = Vec::with_capacity(resp.kvs().len());
    for kv in resp.kvs() {
        match serde_json::from_slice::<ServiceRecord>(kv.value()) {
            Ok(record) => records.push(record),
            Err(e) => {
                tracing::warn!(
                    key = %String::from_utf8_lossy(kv.key()),
                    error = %e,
                    "Failed to unmarshal service record"
                );
            }
        }
    }

    Ok((records, revision))
}

/// 按 `{namespace}/services/{segments...}` 拼接键，忽略多余的斜杠
pub(crate) fn build_key(namespace: &str, segments: &[&str]) -> String {
    let leading = if namespace.starts_with('/') { "/" } else { "" };
    let parts: Vec<&str> = std::iter::once(namespace)
        .chain(std::iter::once("services"))
        .chain(segments.iter().copied())
        .map(|part| part.trim_matches('/'))
        .filter(|part| !part.is_empty())
        .collect();

    format!("{leading}{}", parts.join("/"))
}
