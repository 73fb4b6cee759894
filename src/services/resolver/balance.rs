use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tonic::transport::Endpoint;
use tonic::transport::channel::Change;

use super::{ClientConnState, ResolverState};
use crate::services::client::config::DialOptions;
use crate::services::error::{DiscoveryError, Result};

/// 把完整地址快照转换成 tonic 负载均衡通道的增删事件
pub struct BalanceSink {
    tx: mpsc::Sender<Change<String, Endpoint>>,
    options: DialOptions,
    current: Mutex<HashSet<String>>,
}

impl BalanceSink {
    pub fn new(tx: mpsc::Sender<Change<String, Endpoint>>, options: DialOptions) -> Self {
        Self {
            tx,
            options,
            current: Mutex::new(HashSet::new()),
        }
    }

    pub async fn addresses(&self) -> HashSet<String> {
        self.current.lock().await.clone()
    }
}

#[async_trait]
impl ClientConnState for BalanceSink {
    async fn update_state(&self, state: ResolverState) -> Result<()> {
        let mut current = self.current.lock().await;
        let next: HashSet<String> = state.addresses.into_iter().collect();

        // 先构建全部新增地址的 Endpoint，任何一个失败都不发送变更
        let inserts = next
            .difference(&current)
            .map(|added| Ok((added.clone(), self.options.endpoint(added)?)))
            .collect::<Result<Vec<_>>>()?;

        for removed in current.difference(&next) {
            self.tx
                .send(Change::Remove(removed.clone()))
                .await
                .map_err(|_| DiscoveryError::ResolverClosed)?;
        }

        for (added, endpoint) in inserts {
            self.tx
                .send(Change::Insert(added, endpoint))
                .await
                .map_err(|_| DiscoveryError::ResolverClosed)?;
        }

        if next.is_empty() {
            tracing::warn!("Resolver produced an empty address list");
        }
        *current = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshots_become_inserts_and_removes() {
        let (tx, mut rx) = mpsc::channel(16);
        let sink = BalanceSink::new(tx, DialOptions::default());

        sink.update_state(ResolverState {
            addresses: vec!["10.0.0.1:80".into(), "10.0.0.2:80".into()],
        })
        .await
        .unwrap();
        sink.update_state(ResolverState {
            addresses: vec!["10.0.0.2:80".into(), "10.0.0.3:80".into()],
        })
        .await
        .unwrap();

        let mut inserted = Vec::new();
        let mut removed = Vec::new();
        while let Ok(change) = rx.try_recv() {
            match change {
                Change::Insert(key, _) => inserted.push(key),
                Change::Remove(key) => removed.push(key),
            }
        }
        inserted.sort();

        assert_eq!(inserted, vec!["10.0.0.1:80", "10.0.0.2:80", "10.0.0.3:80"]);
        assert_eq!(removed, vec!["10.0.0.1:80"]);
        assert_eq!(sink.addresses().await.len(), 2);
    }

    #[tokio::test]
    async fn test_invalid_address_sends_nothing() {
        let (tx, mut rx) = mpsc::channel(16);
        let sink = BalanceSink::new(tx, DialOptions::default());

        sink.update_state(ResolverState {
            addresses: vec!["10.0.0.1:80".into()],
        })
        .await
        .unwrap();
        assert!(matches!(rx.try_recv(), Ok(Change::Insert(key, _)) if key == "10.0.0.1:80"));

        // 含空格的地址无法构成 URI，整次更新被拒绝
        let result = sink
            .update_state(ResolverState {
                addresses: vec!["10.0.0.2:80".into(), "bad host:80".into()],
            })
            .await;
        assert!(result.is_err());
        assert!(rx.try_recv().is_err());
        assert_eq!(sink.addresses().await, HashSet::from(["10.0.0.1:80".to_string()]));

        // 之后的正常更新按原先的状态计算差异
        sink.update_state(ResolverState {
            addresses: vec!["10.0.0.2:80".into()],
        })
        .await
        .unwrap();
        let mut changes = Vec::new();
        while let Ok(change) = rx.try_recv() {
            changes.push(match change {
                Change::Insert(key, _) => format!("+{key}"),
                Change::Remove(key) => format!("-{key}"),
            });
        }
        assert_eq!(changes, vec!["-10.0.0.1:80", "+10.0.0.2:80"]);
    }
}
