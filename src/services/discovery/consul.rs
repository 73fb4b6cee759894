use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client as HttpClient, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::types::{ServiceRecord, WatchStream, deliver};
use super::Registry;
use crate::config::DiscoveryConfig;
use crate::services::error::{DiscoveryError, Result};
use crate::services::task::{merge_tokens, spawn_guarded};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
const INDEX_HEADER: &str = "X-Consul-Index";

// 健康检查参数
const CHECK_INTERVAL: &str = "10s";
const CHECK_TIMEOUT: &str = "3s";
const DEREGISTER_CRITICAL_AFTER: &str = "30s";

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceRegistration<'a> {
    #[serde(rename = "ID")]
    id: String,
    name: &'a str,
    address: &'a str,
    port: u16,
    tags: Vec<String>,
    meta: &'a HashMap<String, String>,
    check: AgentServiceCheck,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
struct AgentServiceCheck {
    #[serde(rename = "GRPC")]
    grpc: String,
    interval: &'static str,
    timeout: &'static str,
    deregister_critical_service_after: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct HealthEntry {
    service: CatalogService,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CatalogService {
    service: String,
    address: String,
    port: u16,
    #[serde(default)]
    meta: Option<HashMap<String, String>>,
}

impl From<CatalogService> for ServiceRecord {
    fn from(service: CatalogService) -> Self {
        ServiceRecord {
            name: service.service,
            address: service.address,
            port: service.port,
            metadata: service.meta.unwrap_or_default(),
        }
    }
}

/// 基于 Consul 服务目录的注册中心
///
/// 实例通过 agent API 注册并附带 gRPC 健康检查，查询只返回检查通过的实例，
/// watch 使用阻塞查询 (`index` + `wait`)。
#[derive(Debug, Clone)]
pub struct ConsulRegistry {
    http: HttpClient,
    base_url: String,
    namespace: String,
    poll_wait: Duration,
    retry_interval: Duration,
    shutdown: CancellationToken,
}

impl ConsulRegistry {
    /// 创建客户端并确认 agent 可达 (查询 leader)
    pub async fn connect(config: &DiscoveryConfig) -> Result<Self> {
        let registry = Self::new(config)?;

        let url = format!("{}/v1/status/leader", registry.base_url);
        let resp = registry
            .http
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| DiscoveryError::Connect(format!("failed to reach consul at {url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(DiscoveryError::Connect(format!(
                "consul leader query returned {}",
                resp.status()
            )));
        }

        tracing::info!(base_url = %registry.base_url, "Connected to consul");
        Ok(registry)
    }

    /// 只构造客户端，不检查连通性
    pub fn new(config: &DiscoveryConfig) -> Result<Self> {
        let endpoint = config
            .endpoints
            .first()
            .ok_or_else(|| DiscoveryError::Connect("no consul endpoints configured".to_string()))?;

        Ok(Self {
            http: HttpClient::new(),
            base_url: base_url(endpoint),
            namespace: config.namespace.clone(),
            poll_wait: config.poll_wait(),
            retry_interval: config.watch_retry(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn service_id(record: &ServiceRecord) -> String {
        format!("{}-{}-{}", record.name, record.address, record.port)
    }

    fn tags(&self) -> Vec<String> {
        let mut tags = vec!["grpc".to_string()];
        let namespace = self.namespace.trim_matches('/');
        if !namespace.is_empty() {
            tags.push(namespace.to_string());
        }
        tags
    }

    // 拼接 API 路径，每一段单独做百分号编码
    fn api_url(&self, segments: &[&str]) -> Result<Url> {
        let invalid = || DiscoveryError::Connect(format!("invalid consul address {}", self.base_url));
        let mut url = Url::parse(&self.base_url).map_err(|_| invalid())?;
        url.path_segments_mut()
            .map_err(|_| invalid())?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    // 单次健康实例查询；`index` 非空时为阻塞查询
    async fn query_healthy(&self, name: &str, index: Option<u64>) -> Result<(Vec<ServiceRecord>, u64)> {
        let url = self.api_url(&["v1", "health", "service", name])?;
        let mut request = self.http.get(url).query(&[("passing", "true")]);

        request = match index {
            Some(index) => request
                .query(&[
                    ("index", index.to_string()),
                    ("wait", format!("{}s", self.poll_wait.as_secs())),
                ])
                // 阻塞查询的服务端最多多等 wait/16
                .timeout(self.poll_wait + self.poll_wait / 16 + REQUEST_TIMEOUT),
            None => request.timeout(REQUEST_TIMEOUT),
        };

        let resp = check_status(request.send().await?).await?;
        let last_index = resp
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());

        // 阻塞查询没有 index 就无法继续阻塞，只能按错误退避
        let last_index = match (index, last_index) {
            (_, Some(last_index)) => last_index,
            (None, None) => 0,
            (Some(_), None) => {
                return Err(DiscoveryError::Backend(format!(
                    "consul response for {name} is missing {INDEX_HEADER}"
                )));
            }
        };

        let entries: Vec<HealthEntry> = resp.json().await?;
        let records = entries.into_iter().map(|e| ServiceRecord::from(e.service)).collect();
        Ok((records, last_index))
    }
}

#[async_trait]
impl Registry for ConsulRegistry {
    async fn register(&self, record: &ServiceRecord) -> Result<()> {
        record.validate()?;

        let service_id = Self::service_id(record);
        let registration = AgentServiceRegistration {
            id: service_id.clone(),
            name: &record.name,
            address: &record.address,
            port: record.port,
            tags: self.tags(),
            meta: &record.metadata,
            check: AgentServiceCheck {
                grpc: record.endpoint(),
                interval: CHECK_INTERVAL,
                timeout: CHECK_TIMEOUT,
                deregister_critical_service_after: DEREGISTER_CRITICAL_AFTER,
            },
        };

        let url = self.api_url(&["v1", "agent", "service", "register"])?;
        let resp = self
            .http
            .put(url)
            .timeout(REQUEST_TIMEOUT)
            .json(&registration)
            .send()
            .await?;
        check_status(resp).await?;

        tracing::info!(
            service_name = %record.name,
            address = %record.address,
            port = record.port,
            service_id = %service_id,
            "Service registered to consul"
        );
        Ok(())
    }

    async fn deregister(&self, record: &ServiceRecord) -> Result<()> {
        let service_id = Self::service_id(record);
        let url = self.api_url(&["v1", "agent", "service", "deregister", &service_id])?;
        let resp = self.http.put(url).timeout(REQUEST_TIMEOUT).send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            // 实例已不存在视为注销成功
            if status == StatusCode::NOT_FOUND || body.contains("Unknown service") {
                tracing::debug!(service_id = %service_id, "Service already absent from consul");
                return Ok(());
            }
            return Err(DiscoveryError::Backend(format!(
                "consul deregister returned {status}: {body}"
            )));
        }

        tracing::info!(
            service_name = %record.name,
            service_id = %service_id,
            "Service deregistered from consul"
        );
        Ok(())
    }

    async fn discover(&self, name: &str) -> Result<Vec<ServiceRecord>> {
        let (records, _) = self.query_healthy(name, None).await?;
        Ok(records)
    }

    async fn watch(&self, name: &str, cancel: CancellationToken) -> Result<WatchStream> {
        let (initial, index) = self.query_healthy(name, None).await?;
        let (tx, stream) = WatchStream::channel();
        if tx.send(initial).await.is_err() {
            return Ok(stream);
        }

        let cancel = merge_tokens(cancel, &self.shutdown);
        let poll = CatalogPoll {
            registry: self.clone(),
            service_name: name.to_string(),
            index,
        };
        spawn_guarded("consul_watch", name.to_string(), poll.run(tx, cancel));

        Ok(stream)
    }

    async fn close(&self) -> Result<()> {
        if !self.shutdown.is_cancelled() {
            self.shutdown.cancel();
            tracing::info!(base_url = %self.base_url, "consul registry closed");
        }
        Ok(())
    }
}

// 阻塞查询循环
struct CatalogPoll {
    registry: ConsulRegistry,
    service_name: String,
    index: u64,
}

impl CatalogPoll {
    async fn run(mut self, tx: mpsc::Sender<Vec<ServiceRecord>>, cancel: CancellationToken) {
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => break,
                // 订阅方已丢弃流
                _ = tx.closed() => break,
                result = self.registry.query_healthy(&self.service_name, Some(self.index)) => result,
            };

            match result {
                Ok((records, index)) => {
                    // 等待超时返回的 index 不变，没有新状态
                    if index == self.index {
                        continue;
                    }
                    // index 回退时从头开始
                    self.index = if index < self.index { 0 } else { index };

                    if !deliver(&tx, records, &cancel).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!(
                        service_name = %self.service_name,
                        error = %e,
                        "Failed to watch services"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tx.closed() => break,
                        _ = tokio::time::sleep(self.registry.retry_interval) => {}
                    }
                }
            }
        }

        // 结束合并的取消信号，释放其监听任务
        cancel.cancel();
        tracing::debug!(service_name = %self.service_name, "consul watch stopped");
    }
}

async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(DiscoveryError::Backend(format!("consul returned {status}: {body}")))
}

fn base_url(endpoint: &str) -> String {
    let endpoint = endpoint.trim_end_matches('/');
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else {
        format!("http://{endpoint}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_adds_scheme() {
        assert_eq!(base_url("localhost:8500"), "http://localhost:8500");
        assert_eq!(base_url("https://consul.local/"), "https://consul.local");
    }

    #[test]
    fn test_api_url_encodes_segments() {
        let config = DiscoveryConfig {
            kind: "consul".into(),
            endpoints: vec!["127.0.0.1:8500".into()],
            ..Default::default()
        };
        let registry = ConsulRegistry::new(&config).unwrap();

        let url = registry.api_url(&["v1", "health", "service", "a b/c"]).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8500/v1/health/service/a%20b%2Fc");

        let url = registry.api_url(&["v1", "agent", "service", "register"]).unwrap();
        assert_eq!(url.as_str(), "http://127.0.0.1:8500/v1/agent/service/register");
    }

    #[test]
    fn test_registration_payload() {
        let config = DiscoveryConfig {
            kind: "consul".into(),
            endpoints: vec!["127.0.0.1:8500".into()],
            ..Default::default()
        };
        let registry = ConsulRegistry::new(&config).unwrap();
        let record = ServiceRecord::new("greeter", "10.0.0.5", 9090).with_metadata("version", "1.0");

        let payload = serde_json::to_value(AgentServiceRegistration {
            id: ConsulRegistry::service_id(&record),
            name: &record.name,
            address: &record.address,
            port: record.port,
            tags: registry.tags(),
            meta: &record.metadata,
            check: AgentServiceCheck {
                grpc: record.endpoint(),
                interval: CHECK_INTERVAL,
                timeout: CHECK_TIMEOUT,
                deregister_critical_service_after: DEREGISTER_CRITICAL_AFTER,
            },
        })
        .unwrap();

        assert_eq!(payload["ID"], "greeter-10.0.0.5-9090");
        assert_eq!(payload["Tags"], serde_json::json!(["grpc", "grpc-kit"]));
        assert_eq!(payload["Meta"]["version"], "1.0");
        assert_eq!(payload["Check"]["GRPC"], "10.0.0.5:9090");
        assert_eq!(payload["Check"]["DeregisterCriticalServiceAfter"], "30s");
    }

    #[test]
    fn test_health_entry_parsing() {
        let body = r#"[{"Node":{"Node":"n1"},"Service":{"ID":"greeter-h-1","Service":"greeter","Address":"h","Port":1,"Meta":null},"Checks":[]}]"#;
        let entries: Vec<HealthEntry> = serde_json::from_str(body).unwrap();
        let record = ServiceRecord::from(entries.into_iter().next().unwrap().service);

        assert_eq!(record, ServiceRecord::new("greeter", "h", 1));
    }
}
