use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use grpc_discovery::services::discovery::{MemoryRegistry, Registry, ServiceManager, ServiceRecord, WatchStream};
use grpc_discovery::services::error::{DiscoveryError, Result};

fn endpoints(records: &[ServiceRecord]) -> HashSet<String> {
    records.iter().map(ServiceRecord::endpoint).collect()
}

#[tokio::test]
async fn test_register_then_discover() {
    let registry = MemoryRegistry::new();
    let record = ServiceRecord::new("greeter", "10.0.0.5", 9090);

    registry.register(&record).await.expect("Failed to register service");

    let instances = registry.discover("greeter").await.expect("Failed to discover");
    assert_eq!(instances, vec![record.clone()]);

    // 重复查询不会产生重复实例
    let again = registry.discover("greeter").await.expect("Failed to discover");
    assert_eq!(again.len(), 1);
}

#[tokio::test]
async fn test_deregister_is_idempotent() {
    let registry = MemoryRegistry::new();
    let record = ServiceRecord::new("greeter", "10.0.0.5", 9090);
    registry.register(&record).await.unwrap();

    registry.deregister(&record).await.expect("First deregister failed");
    assert!(registry.discover("greeter").await.unwrap().is_empty());

    registry.deregister(&record).await.expect("Second deregister failed");
    registry
        .deregister(&ServiceRecord::new("never-registered", "h", 1))
        .await
        .expect("Deregistering unknown record failed");
    assert!(registry.discover("greeter").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_watch_delivers_initial_state_and_updates() {
    let registry = MemoryRegistry::new();
    let first = ServiceRecord::new("greeter", "10.0.0.5", 9090);
    let second = ServiceRecord::new("greeter", "10.0.0.5", 9091);
    registry.register(&first).await.unwrap();

    let cancel = CancellationToken::new();
    let mut stream = registry
        .watch("greeter", cancel.clone())
        .await
        .expect("Failed to watch service");

    let initial = timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("Timeout waiting for initial snapshot")
        .expect("Stream ended unexpectedly");
    assert_eq!(initial, vec![first.clone()]);

    registry.register(&second).await.unwrap();

    let updated = timeout(Duration::from_secs(5), stream.next())
        .await
        .expect("Timeout waiting for update")
        .expect("Stream ended unexpectedly");
    assert_eq!(endpoints(&updated), endpoints(&[first, second]));

    cancel.cancel();
    let end = timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("Timeout waiting for stream end");
    assert!(end.is_none());
}

// 注销总是失败的注册中心
struct FailingRegistry {
    inner: MemoryRegistry,
    deregister_calls: AtomicUsize,
}

#[async_trait]
impl Registry for FailingRegistry {
    async fn register(&self, record: &ServiceRecord) -> Result<()> {
        self.inner.register(record).await
    }

    async fn deregister(&self, _record: &ServiceRecord) -> Result<()> {
        self.deregister_calls.fetch_add(1, Ordering::SeqCst);
        Err(DiscoveryError::Backend("backend unreachable".into()))
    }

    async fn discover(&self, name: &str) -> Result<Vec<ServiceRecord>> {
        self.inner.discover(name).await
    }

    async fn watch(&self, name: &str, cancel: CancellationToken) -> Result<WatchStream> {
        self.inner.watch(name, cancel).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_deregister_all_is_total() {
    let registry = Arc::new(FailingRegistry {
        inner: MemoryRegistry::new(),
        deregister_calls: AtomicUsize::new(0),
    });
    let manager = ServiceManager::new(registry.clone());

    for port in 9000..9003 {
        manager
            .register_service(ServiceRecord::new("svc", "127.0.0.1", port))
            .await
            .expect("Failed to register service");
    }
    assert_eq!(manager.len().await, 3);

    manager.deregister_all().await.expect("Shutdown must report success");
    assert!(manager.is_empty().await);
    assert_eq!(registry.deregister_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_deregister_service_forgets_record_on_failure() {
    let registry = Arc::new(FailingRegistry {
        inner: MemoryRegistry::new(),
        deregister_calls: AtomicUsize::new(0),
    });
    let manager = ServiceManager::new(registry);
    let record = ServiceRecord::new("svc", "127.0.0.1", 9000);

    manager.register_service(record.clone()).await.unwrap();
    assert!(manager.deregister_service(&record).await.is_err());
    assert!(manager.is_empty().await);
}

// 注销很慢的注册中心，用来制造注销与注册的交错
struct SlowDeregisterRegistry {
    inner: MemoryRegistry,
    delay: Duration,
}

#[async_trait]
impl Registry for SlowDeregisterRegistry {
    async fn register(&self, record: &ServiceRecord) -> Result<()> {
        self.inner.register(record).await
    }

    async fn deregister(&self, record: &ServiceRecord) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        self.inner.deregister(record).await
    }

    async fn discover(&self, name: &str) -> Result<Vec<ServiceRecord>> {
        self.inner.discover(name).await
    }

    async fn watch(&self, name: &str, cancel: CancellationToken) -> Result<WatchStream> {
        self.inner.watch(name, cancel).await
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_register_during_deregister_all_stays_tracked() {
    let registry = Arc::new(SlowDeregisterRegistry {
        inner: MemoryRegistry::new(),
        delay: Duration::from_millis(200),
    });
    let manager = Arc::new(ServiceManager::new(registry.clone()));
    manager
        .register_service(ServiceRecord::new("svc", "h", 1))
        .await
        .unwrap();

    let shutdown = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.deregister_all().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let late = ServiceRecord::new("svc", "h", 2);
    timeout(Duration::from_secs(5), manager.register_service(late.clone()))
        .await
        .expect("Timeout waiting for register")
        .expect("Failed to register service");
    shutdown.await.unwrap().expect("Shutdown must report success");

    // 后端里存活的实例必须仍被记录，之后的 deregister_all 才能清理它
    let live = registry.discover("svc").await.unwrap();
    assert_eq!(live, vec![late.clone()]);
    assert_eq!(manager.registered().await, vec![late]);

    manager.deregister_all().await.unwrap();
    assert!(registry.discover("svc").await.unwrap().is_empty());
    assert!(manager.is_empty().await);
}

#[tokio::test]
async fn test_greeter_scenario() {
    let registry = Arc::new(MemoryRegistry::new());
    let manager = ServiceManager::new(registry.clone());
    let first = ServiceRecord::new("greeter", "10.0.0.5", 9090);

    manager.register_service(first.clone()).await.unwrap();
    let instances = manager.discover_services("greeter").await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].address, "10.0.0.5");
    assert_eq!(instances[0].port, 9090);

    let cancel = CancellationToken::new();
    let mut stream = manager.watch_services("greeter", cancel.clone()).await.unwrap();
    let initial = timeout(Duration::from_secs(1), stream.recv()).await.unwrap().unwrap();
    assert_eq!(initial, vec![first.clone()]);

    let second = ServiceRecord::new("greeter", "10.0.0.5", 9091);
    manager.register_service(second.clone()).await.unwrap();

    let snapshot = timeout(Duration::from_secs(5), stream.recv()).await.unwrap().unwrap();
    assert_eq!(endpoints(&snapshot), endpoints(&[first, second]));

    cancel.cancel();
    manager.deregister_all().await.unwrap();
    assert!(registry.discover("greeter").await.unwrap().is_empty());
}
