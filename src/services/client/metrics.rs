use std::sync::LazyLock;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;

/// 进程级客户端调用指标，首次使用时初始化
pub static CLIENT_METRICS: LazyLock<ClientMetrics> = LazyLock::new(ClientMetrics::default);

#[derive(Debug, Default)]
struct MethodCounters {
    requests: AtomicU64,
    failures: AtomicU64,
    active: AtomicI64,
    latency_micros: AtomicU64,
}

/// 单个方法的指标快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MethodStats {
    pub requests: u64,
    pub failures: u64,
    pub active: i64,
    pub total_latency: Duration,
}

/// 按方法路径聚合的调用计数
#[derive(Debug, Default)]
pub struct ClientMetrics {
    methods: DashMap<String, MethodCounters>,
}

impl ClientMetrics {
    pub fn call_started(&self, method: &str) {
        self.methods
            .entry(method.to_string())
            .or_default()
            .active
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn call_finished(&self, method: &str, elapsed: Duration, failed: bool) {
        let counters = self.methods.entry(method.to_string()).or_default();
        counters.active.fetch_sub(1, Ordering::Relaxed);
        counters.requests.fetch_add(1, Ordering::Relaxed);
        if failed {
            counters.failures.fetch_add(1, Ordering::Relaxed);
        }
        counters
            .latency_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, method: &str) -> Option<MethodStats> {
        self.methods.get(method).map(|counters| MethodStats {
            requests: counters.requests.load(Ordering::Relaxed),
            failures: counters.failures.load(Ordering::Relaxed),
            active: counters.active.load(Ordering::Relaxed),
            total_latency: Duration::from_micros(counters.latency_micros.load(Ordering::Relaxed)),
        })
    }

    pub fn methods(&self) -> Vec<String> {
        self.methods.iter().map(|e| e.key().clone()).collect()
    }
}
