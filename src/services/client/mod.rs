//! gRPC 客户端
//!
//! [`ClientFactory`] 按服务名缓存连接，[`TonicDialer`] 负责真正建立 tonic 通道。

pub mod config;
pub mod dialer;
pub mod factory;
pub mod interceptor;
pub mod metrics;
pub mod retry;
pub mod service_config;

pub use config::DialOptions;
pub use dialer::{ClientConnection, Connection, Dialer, TonicDialer};
pub use factory::ClientFactory;
pub use interceptor::{CallInterceptor, CallOutcome, InterceptedChannel, InterceptorChain};
pub use metrics::CLIENT_METRICS;
pub use retry::call_with_retry;
pub use service_config::{RetryPolicy, ServiceConfig};
