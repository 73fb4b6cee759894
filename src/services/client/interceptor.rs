use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use tonic::body::Body;
use tonic::transport::Channel;
use tonic::{Code, Status};
use tower::Service;

use super::metrics::CLIENT_METRICS;

/// 一次调用的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Ok,
    /// 服务端在响应头里返回的非 OK 状态
    Status(Code),
    /// 请求没有到达服务端
    Transport(String),
    /// 调用方在响应到达前放弃了调用
    Cancelled,
}

impl CallOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, CallOutcome::Ok)
    }

    fn from_response(response: &http::Response<Body>) -> Self {
        match Status::from_header_map(response.headers()) {
            Some(status) if status.code() != Code::Ok => CallOutcome::Status(status.code()),
            _ => CallOutcome::Ok,
        }
    }
}

/// 包裹每次调用的拦截器
pub trait CallInterceptor: Send + Sync + 'static {
    fn on_start(&self, _method: &str) {}

    fn on_finish(&self, method: &str, elapsed: Duration, outcome: &CallOutcome);
}

/// 调用日志：成功 debug，失败 error
#[derive(Debug, Default)]
pub struct LoggingInterceptor;

impl CallInterceptor for LoggingInterceptor {
    fn on_finish(&self, method: &str, elapsed: Duration, outcome: &CallOutcome) {
        let duration_ms = elapsed.as_millis() as u64;
        match outcome {
            CallOutcome::Ok => {
                tracing::debug!(method = %method, duration_ms, "gRPC client call completed");
            }
            CallOutcome::Status(code) => {
                tracing::error!(method = %method, duration_ms, code = ?code, "gRPC client call failed");
            }
            CallOutcome::Transport(error) => {
                tracing::error!(method = %method, duration_ms, error = %error, "gRPC client call failed");
            }
            CallOutcome::Cancelled => {
                tracing::warn!(method = %method, duration_ms, "gRPC client call cancelled");
            }
        }
    }
}

/// 把调用写入进程级 [`CLIENT_METRICS`]
#[derive(Debug, Default)]
pub struct MetricsInterceptor;

impl CallInterceptor for MetricsInterceptor {
    fn on_start(&self, method: &str) {
        CLIENT_METRICS.call_started(method);
    }

    fn on_finish(&self, method: &str, elapsed: Duration, outcome: &CallOutcome) {
        CLIENT_METRICS.call_finished(method, elapsed, !outcome.is_ok());
    }
}

/// 按顺序执行的拦截器列表；结束回调按相反顺序执行
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Arc<Vec<Arc<dyn CallInterceptor>>>,
}

impl InterceptorChain {
    pub fn new(interceptors: Vec<Arc<dyn CallInterceptor>>) -> Self {
        Self {
            interceptors: Arc::new(interceptors),
        }
    }

    /// 根据开关组装日志与指标拦截器
    pub fn from_flags(enable_logging: bool, enable_metrics: bool) -> Self {
        let mut interceptors: Vec<Arc<dyn CallInterceptor>> = Vec::new();
        if enable_logging {
            interceptors.push(Arc::new(LoggingInterceptor));
        }
        if enable_metrics {
            interceptors.push(Arc::new(MetricsInterceptor));
        }
        Self::new(interceptors)
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    pub fn start(&self, method: &str) {
        for interceptor in self.interceptors.iter() {
            interceptor.on_start(method);
        }
    }

    pub fn finish(&self, method: &str, elapsed: Duration, outcome: &CallOutcome) {
        for interceptor in self.interceptors.iter().rev() {
            interceptor.on_finish(method, elapsed, outcome);
        }
    }
}

// 保证每次 start 都有对应的 finish；future 被提前丢弃时记为取消
struct CallGuard {
    chain: InterceptorChain,
    method: String,
    started: Instant,
    finished: bool,
}

impl CallGuard {
    fn start(chain: InterceptorChain, method: String) -> Self {
        chain.start(&method);
        Self {
            chain,
            method,
            started: Instant::now(),
            finished: false,
        }
    }

    fn finish(mut self, outcome: &CallOutcome) {
        self.finished = true;
        self.chain.finish(&self.method, self.started.elapsed(), outcome);
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        if !self.finished {
            self.chain
                .finish(&self.method, self.started.elapsed(), &CallOutcome::Cancelled);
        }
    }
}

/// 带拦截器链的 tonic 通道，可直接交给生成的客户端使用
#[derive(Clone)]
pub struct InterceptedChannel {
    inner: Channel,
    chain: InterceptorChain,
}

impl InterceptedChannel {
    pub fn new(inner: Channel, chain: InterceptorChain) -> Self {
        Self { inner, chain }
    }

    pub fn chain(&self) -> &InterceptorChain {
        &self.chain
    }
}

impl Service<http::Request<Body>> for InterceptedChannel {
    type Response = http::Response<Body>;
    type Error = tonic::transport::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: http::Request<Body>) -> Self::Future {
        let guard = CallGuard::start(self.chain.clone(), request.uri().path().to_string());
        let response = self.inner.call(request);

        Box::pin(async move {
            let result = response.await;
            let outcome = match &result {
                Ok(response) => CallOutcome::from_response(response),
                Err(e) => CallOutcome::Transport(e.to_string()),
            };
            guard.finish(&outcome);
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    struct Named(&'static str, Arc<Recorder>);

    impl CallInterceptor for Named {
        fn on_start(&self, method: &str) {
            self.1.events.lock().unwrap().push(format!("{} start {method}", self.0));
        }

        fn on_finish(&self, method: &str, _elapsed: Duration, outcome: &CallOutcome) {
            self.1
                .events
                .lock()
                .unwrap()
                .push(format!("{} finish {method} {}", self.0, outcome.is_ok()));
        }
    }

    #[test]
    fn test_chain_order() {
        let recorder = Arc::new(Recorder::default());
        let chain = InterceptorChain::new(vec![
            Arc::new(Named("a", recorder.clone())),
            Arc::new(Named("b", recorder.clone())),
        ]);

        chain.start("/svc/M");
        chain.finish("/svc/M", Duration::ZERO, &CallOutcome::Status(Code::Unavailable));

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec!["a start /svc/M", "b start /svc/M", "b finish /svc/M false", "a finish /svc/M false"]
        );
    }

    #[test]
    fn test_flags_select_interceptors() {
        assert!(InterceptorChain::from_flags(false, false).is_empty());
        assert_eq!(InterceptorChain::from_flags(true, false).len(), 1);
        assert_eq!(InterceptorChain::from_flags(true, true).len(), 2);
    }

    #[test]
    fn test_metrics_interceptor_records_failures() {
        let interceptor = MetricsInterceptor;
        interceptor.on_start("/metrics.Test/Fail");
        interceptor.on_finish(
            "/metrics.Test/Fail",
            Duration::from_millis(1),
            &CallOutcome::Transport("refused".into()),
        );

        let stats = CLIENT_METRICS.snapshot("/metrics.Test/Fail").unwrap();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn test_dropped_call_is_finished_as_cancelled() {
        use tower::ServiceExt;

        // 接受连接但从不应答的服务端
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let channel = tonic::transport::Endpoint::from_shared(format!("http://{addr}"))
            .unwrap()
            .connect_lazy();
        let mut intercepted = InterceptedChannel::new(channel, InterceptorChain::from_flags(false, true));
        let request = http::Request::builder()
            .uri(format!("http://{addr}/metrics.Test/Hang"))
            .body(Body::empty())
            .unwrap();

        let ready = intercepted.ready().await.unwrap();
        let call = ready.call(request);
        let _ = tokio::time::timeout(Duration::from_millis(200), call).await;

        let stats = CLIENT_METRICS.snapshot("/metrics.Test/Hang").unwrap();
        assert_eq!(stats.active, 0);
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.failures, 1);
        server.abort();
    }

    #[test]
    fn test_unfinished_guard_reports_cancelled() {
        let recorder = Arc::new(Recorder::default());
        let chain = InterceptorChain::new(vec![Arc::new(Named("a", recorder.clone()))]);

        drop(CallGuard::start(chain.clone(), "/svc/Drop".to_string()));
        CallGuard::start(chain, "/svc/Done".to_string()).finish(&CallOutcome::Ok);

        assert_eq!(
            *recorder.events.lock().unwrap(),
            vec![
                "a start /svc/Drop",
                "a finish /svc/Drop false",
                "a start /svc/Done",
                "a finish /svc/Done true"
            ]
        );
    }
}
