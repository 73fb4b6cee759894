use std::fmt::Display;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 启动后台任务；任务内部 panic 只终止该任务本身并记录日志
pub(crate) fn spawn_guarded<F>(task_name: &'static str, scope: String, fut: F) -> JoinHandle<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());

            tracing::error!(
                task = task_name,
                scope = %scope,
                reason = %reason,
                "Background task panicked, task terminated"
            );
        }
    })
}

/// 合并调用方与组件自身的取消信号，任一触发即取消
pub(crate) fn merge_tokens(caller: CancellationToken, owner: &CancellationToken) -> CancellationToken {
    let merged = owner.child_token();
    let guard = merged.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = caller.cancelled() => guard.cancel(),
            _ = guard.cancelled() => {}
        }
    });
    merged
}

/// 每次等待 `interval` 后重试，直到成功；取消时返回 `None`
pub(crate) async fn retry_until_ok<T, E, F, Fut>(
    interval: Duration,
    cancel: &CancellationToken,
    scope: &str,
    action: &'static str,
    mut attempt: F,
) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(interval) => {}
        }

        match attempt().await {
            Ok(value) => return Some(value),
            Err(e) => {
                tracing::warn!(scope = %scope, action, error = %e, "Retry attempt failed");
            }
        }
    }
}
