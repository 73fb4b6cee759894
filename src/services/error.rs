/// 服务发现与客户端工厂的统一错误类型
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to connect to registry backend: {0}")]
    Connect(String),
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("registry backend error: {0}")]
    Backend(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unsupported discovery type: {0}")]
    UnsupportedType(String),
    #[error("service {0} not found")]
    ServiceNotFound(String),
    #[error("invalid service record: {0}")]
    InvalidRecord(String),
    #[error("invalid client configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid target {0}")]
    InvalidTarget(String),
    #[error("no resolver registered for scheme {0}")]
    UnknownScheme(String),
    #[error("failed to dial {target}: {source}")]
    Dial {
        target: String,
        #[source]
        source: tonic::transport::Error,
    },
    #[error("resolver is closed")]
    ResolverClosed,
}

pub type Result<T, E = DiscoveryError> = std::result::Result<T, E>;
