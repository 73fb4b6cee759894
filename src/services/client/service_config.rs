use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tonic::Code;

use super::retry::{format_duration, parse_duration, parse_status_code, status_code_name};
use crate::config::ClientConfig;
use crate::services::error::{DiscoveryError, Result};

/// 连接创建时附带的负载均衡与重试策略
///
/// JSON 形式与 gRPC 服务配置一致：
/// `{"loadBalancingPolicy":"round_robin","retryPolicy":{"maxAttempts":3,...}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub load_balancing_policy: String,
    pub retry_policy: RetryPolicy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_string")]
    pub initial_backoff: Duration,
    #[serde(with = "duration_string")]
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    #[serde(with = "status_code_names")]
    pub retryable_status_codes: Vec<Code>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            load_balancing_policy: "round_robin".to_string(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            retryable_status_codes: vec![Code::Unavailable, Code::DeadlineExceeded],
        }
    }
}

impl ServiceConfig {
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let retry = &config.retry_policy;
        let retryable_status_codes = retry
            .retryable_status_codes
            .iter()
            .map(|name| {
                parse_status_code(name)
                    .ok_or_else(|| DiscoveryError::InvalidConfig(format!("unknown status code {name}")))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            load_balancing_policy: config.load_balancing.clone(),
            retry_policy: RetryPolicy {
                max_attempts: retry.max_attempts,
                initial_backoff: parse_duration(&retry.initial_backoff).map_err(DiscoveryError::InvalidConfig)?,
                max_backoff: parse_duration(&retry.max_backoff).map_err(DiscoveryError::InvalidConfig)?,
                backoff_multiplier: retry.backoff_multiplier,
                retryable_status_codes,
            },
        })
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

mod duration_string {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Duration, D::Error> {
        let value = String::deserialize(deserializer)?;
        parse_duration(&value).map_err(serde::de::Error::custom)
    }
}

mod status_code_names {
    use super::*;

    pub fn serialize<S: Serializer>(codes: &[Code], serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(codes.iter().map(|code| status_code_name(*code)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Vec<Code>, D::Error> {
        Vec::<String>::deserialize(deserializer)?
            .iter()
            .map(|name| {
                parse_status_code(name)
                    .ok_or_else(|| serde::de::Error::custom(format!("unknown status code {name}")))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blob_from_default_config() {
        let service_config = ServiceConfig::from_config(&ClientConfig::default()).unwrap();
        assert_eq!(service_config, ServiceConfig::default());

        let json: serde_json::Value = serde_json::from_str(&service_config.to_json().unwrap()).unwrap();
        assert_eq!(json["loadBalancingPolicy"], "round_robin");
        assert_eq!(json["retryPolicy"]["maxAttempts"], 3);
        assert_eq!(json["retryPolicy"]["initialBackoff"], "1s");
        assert_eq!(json["retryPolicy"]["maxBackoff"], "30s");
        assert_eq!(json["retryPolicy"]["backoffMultiplier"], 2.0);
        assert_eq!(
            json["retryPolicy"]["retryableStatusCodes"],
            serde_json::json!(["UNAVAILABLE", "DEADLINE_EXCEEDED"])
        );

        let parsed: ServiceConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, service_config);
    }

    #[test]
    fn test_unknown_status_code_rejected() {
        let mut config = ClientConfig::default();
        config.retry_policy.retryable_status_codes = vec!["SOMETIMES".into()];
        assert!(ServiceConfig::from_config(&config).is_err());
    }
}
