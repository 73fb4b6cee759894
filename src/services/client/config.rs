use std::time::Duration;

use tonic::transport::Endpoint;

use super::service_config::ServiceConfig;
use crate::config::ClientConfig;
use crate::services::error::{DiscoveryError, Result};

/// 建立连接时使用的参数，在工厂创建时确定，之后不再变化
#[derive(Debug, Clone)]
pub struct DialOptions {
    /// 拨号超时
    pub connect_timeout: Duration,
    pub max_recv_msg_size: usize,
    pub max_send_msg_size: usize,
    pub keepalive_time: Duration,
    pub keepalive_timeout: Duration,
    pub permit_without_stream: bool,
    pub service_config: ServiceConfig,
    pub enable_logging: bool,
    pub enable_metrics: bool,
    /// 拨号前检查服务存在的超时
    pub discover_timeout: Duration,
}

impl Default for DialOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            max_recv_msg_size: 4 * 1024 * 1024,
            max_send_msg_size: 4 * 1024 * 1024,
            keepalive_time: Duration::from_secs(30),
            keepalive_timeout: Duration::from_secs(5),
            permit_without_stream: false,
            service_config: ServiceConfig::default(),
            enable_logging: false,
            enable_metrics: false,
            discover_timeout: Duration::from_secs(5),
        }
    }
}

impl DialOptions {
    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        Ok(Self {
            connect_timeout: Duration::from_secs(config.timeout_secs),
            max_recv_msg_size: config.max_recv_msg_size,
            max_send_msg_size: config.max_send_msg_size,
            keepalive_time: Duration::from_secs(config.keepalive_time_secs),
            keepalive_timeout: Duration::from_secs(config.keepalive_timeout_secs),
            permit_without_stream: config.permit_without_stream,
            service_config: ServiceConfig::from_config(config)?,
            enable_logging: config.enable_logging,
            enable_metrics: config.enable_metrics,
            discover_timeout: Duration::from_secs(config.discover_timeout_secs),
        })
    }

    /// 为单个 `host:port` 构建 tonic Endpoint
    pub fn endpoint(&self, address: &str) -> Result<Endpoint> {
        let mut endpoint = Endpoint::from_shared(format!("http://{address}"))
            .map_err(|source| DiscoveryError::Dial {
                target: address.to_string(),
                source,
            })?
            .connect_timeout(self.connect_timeout);

        // keepalive 时间为 0 表示不发送 ping
        if !self.keepalive_time.is_zero() {
            endpoint = endpoint
                .http2_keep_alive_interval(self.keepalive_time)
                .keep_alive_timeout(self.keepalive_timeout)
                .keep_alive_while_idle(self.permit_without_stream);
        }

        Ok(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_config() {
        let config = ClientConfig {
            timeout_secs: 10,
            keepalive_time_secs: 0,
            ..Default::default()
        };
        let options = DialOptions::from_config(&config).unwrap();

        assert_eq!(options.connect_timeout, Duration::from_secs(10));
        assert!(options.keepalive_time.is_zero());
        assert_eq!(options.service_config.load_balancing_policy, "round_robin");
        assert!(options.endpoint("127.0.0.1:9090").is_ok());
    }

    #[test]
    fn test_invalid_address_is_dial_error() {
        let options = DialOptions::default();
        assert!(matches!(
            options.endpoint("bad host:1"),
            Err(DiscoveryError::Dial { .. })
        ));
    }
}
