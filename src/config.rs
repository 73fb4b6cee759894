use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::services::client::retry::{parse_duration, parse_status_code};
use crate::services::discovery::ServiceRecord;

/// 环境变量前缀，例如 `GRPC_KIT_DISCOVERY_TYPE=consul`
pub const ENV_PREFIX: &str = "GRPC_KIT_";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to read environment overrides: {0}")]
    Env(#[from] envy::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub discovery: DiscoveryConfig,
    pub client: ClientConfig,
    pub logging: LoggingConfig,
    /// 本进程启动时要注册的服务实例
    pub services: Vec<ServiceRecord>,
    /// 实际读取的配置文件；文件不存在时为 `None`
    #[serde(skip)]
    pub source: Option<PathBuf>,
}

// 服务发现配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub endpoints: Vec<String>,
    pub namespace: String,
    /// 租约 TTL (秒)，仅 etcd 使用
    pub lease_ttl_secs: u64,
    /// watch 出错后的重试间隔 (秒)
    pub watch_retry_secs: u64,
    /// consul 阻塞查询的最长等待时间 (秒)
    pub poll_wait_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            kind: "etcd".to_string(),
            endpoints: vec!["localhost:2379".to_string()],
            namespace: "/grpc-kit".to_string(),
            lease_ttl_secs: 30,
            watch_retry_secs: 5,
            poll_wait_secs: 30,
        }
    }
}

impl DiscoveryConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }

    pub fn watch_retry(&self) -> Duration {
        Duration::from_secs(self.watch_retry_secs)
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_secs(self.poll_wait_secs)
    }
}

// gRPC 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub timeout_secs: u64,
    pub load_balancing: String,
    pub max_recv_msg_size: usize,
    pub max_send_msg_size: usize,
    pub keepalive_time_secs: u64,
    pub keepalive_timeout_secs: u64,
    pub permit_without_stream: bool,
    pub retry_policy: RetryPolicyConfig,
    pub enable_logging: bool,
    pub enable_metrics: bool,
    /// 建立连接前检查服务是否存在的超时 (秒)
    pub discover_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            load_balancing: "round_robin".to_string(),
            max_recv_msg_size: 4 * 1024 * 1024,
            max_send_msg_size: 4 * 1024 * 1024,
            keepalive_time_secs: 30,
            keepalive_timeout_secs: 5,
            permit_without_stream: false,
            retry_policy: RetryPolicyConfig::default(),
            enable_logging: true,
            enable_metrics: true,
            discover_timeout_secs: 5,
        }
    }
}

// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicyConfig {
    pub max_attempts: u32,
    pub initial_backoff: String,
    pub max_backoff: String,
    pub backoff_multiplier: f64,
    pub retryable_status_codes: Vec<String>,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: "1s".to_string(),
            max_backoff: "30s".to_string(),
            backoff_multiplier: 2.0,
            retryable_status_codes: vec!["UNAVAILABLE".to_string(), "DEADLINE_EXCEEDED".to_string()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `json` 或 `pretty`
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "json".to_string(),
        }
    }
}

// 环境变量覆盖项
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    discovery_type: Option<String>,
    discovery_endpoints: Option<Vec<String>>,
    discovery_namespace: Option<String>,
    log_level: Option<String>,
    log_format: Option<String>,
}

impl Config {
    /// 加载配置：`.env` -> TOML 文件 -> `GRPC_KIT_*` 环境变量
    ///
    /// 配置文件不存在时使用默认值，此时 `source` 为 `None`。
    /// 加载发生在日志初始化之前，因此这里不输出日志。
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let path = path.as_ref();
        let mut config = match fs::read_to_string(path) {
            Ok(config_str) => Self {
                source: Some(path.to_path_buf()),
                ..Self::from_toml_str(&config_str)?
            },
            Err(e) if e.kind() == ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(ConfigError::Io {
                    path: path.display().to_string(),
                    source: e,
                });
            }
        };

        let overrides = envy::prefixed(ENV_PREFIX).from_env::<EnvOverrides>()?;
        config.apply_overrides(overrides);
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(config_str: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(config_str)?;
        Ok(config)
    }

    fn apply_overrides(&mut self, overrides: EnvOverrides) {
        if let Some(kind) = overrides.discovery_type {
            self.discovery.kind = kind;
        }
        if let Some(endpoints) = overrides.discovery_endpoints {
            self.discovery.endpoints = endpoints;
        }
        if let Some(namespace) = overrides.discovery_namespace {
            self.discovery.namespace = namespace;
        }
        if let Some(level) = overrides.log_level {
            self.logging.level = level;
        }
        if let Some(format) = overrides.log_format {
            self.logging.format = format;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.discovery.endpoints.is_empty() {
            return Err(ConfigError::Invalid("discovery.endpoints must not be empty".into()));
        }
        if self.discovery.lease_ttl_secs == 0 {
            return Err(ConfigError::Invalid("discovery.lease_ttl_secs must be positive".into()));
        }

        let retry = &self.client.retry_policy;
        // gRPC 重试策略要求 maxAttempts 至少为 2
        if retry.max_attempts < 2 {
            return Err(ConfigError::Invalid(format!(
                "retry_policy.max_attempts must be at least 2, got {}",
                retry.max_attempts
            )));
        }
        if retry.backoff_multiplier <= 0.0 {
            return Err(ConfigError::Invalid(
                "retry_policy.backoff_multiplier must be positive".into(),
            ));
        }
        for value in [&retry.initial_backoff, &retry.max_backoff] {
            parse_duration(value).map_err(ConfigError::Invalid)?;
        }
        for code in &retry.retryable_status_codes {
            if parse_status_code(code).is_none() {
                return Err(ConfigError::Invalid(format!("unknown status code {code}")));
            }
        }

        for record in &self.services {
            record
                .validate()
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.discovery.kind, "etcd");
        assert_eq!(config.discovery.endpoints, vec!["localhost:2379"]);
        assert_eq!(config.discovery.namespace, "/grpc-kit");
        assert_eq!(config.client.load_balancing, "round_robin");
        assert_eq!(config.client.max_recv_msg_size, 4 * 1024 * 1024);
        assert_eq!(config.client.retry_policy.max_attempts, 3);
        assert_eq!(
            config.client.retry_policy.retryable_status_codes,
            vec!["UNAVAILABLE", "DEADLINE_EXCEEDED"]
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [discovery]
            type = "consul"
            endpoints = ["127.0.0.1:8500"]

            [client.retry_policy]
            max_attempts = 5

            [[services]]
            name = "greeter"
            address = "10.0.0.5"
            port = 9090
            metadata = { version = "1.0" }
            "#,
        )
        .unwrap();

        assert_eq!(config.discovery.kind, "consul");
        assert_eq!(config.discovery.namespace, "/grpc-kit");
        assert_eq!(config.client.retry_policy.max_attempts, 5);
        assert_eq!(config.client.retry_policy.initial_backoff, "1s");
        assert_eq!(config.services.len(), 1);
        assert_eq!(config.services[0].metadata["version"], "1.0");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = Config::default();
        config.discovery.endpoints.clear();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.client.retry_policy.max_attempts = 1;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.client.retry_policy.initial_backoff = "soon".into();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.client.retry_policy.retryable_status_codes = vec!["NOPE".into()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides_applied() {
        let mut config = Config::default();
        config.apply_overrides(EnvOverrides {
            discovery_type: Some("consul".into()),
            discovery_endpoints: Some(vec!["a:8500".into(), "b:8500".into()]),
            log_level: Some("debug".into()),
            ..Default::default()
        });

        assert_eq!(config.discovery.kind, "consul");
        assert_eq!(config.discovery.endpoints, vec!["a:8500", "b:8500"]);
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "json");
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = Config::load("/nonexistent/grpc-discovery.toml").unwrap();
        assert!(!config.discovery.endpoints.is_empty());
        assert!(config.source.is_none());
    }

    #[test]
    fn test_loaded_file_is_recorded_as_source() {
        let path = std::env::temp_dir().join(format!("grpc-discovery-{}.toml", std::process::id()));
        fs::write(&path, "[logging]\nformat = \"pretty\"\n").unwrap();

        let config = Config::load(&path).unwrap();
        fs::remove_file(&path).unwrap();

        assert_eq!(config.source.as_deref(), Some(path.as_path()));
        assert_eq!(config.logging.format, "pretty");
    }
}
