//! 一元调用的重试
//!
//! 重试只针对策略中列出的状态码，退避按 `initial * multiplier^(n-1)` 增长并以
//! `max_backoff` 封顶。被重试的调用必须是幂等的。

use std::future::Future;
use std::time::Duration;

use tonic::{Code, Status};

use super::service_config::RetryPolicy;

/// 解析 `"1s"`、`"250ms"`、`"1.5s"`、`"2m"` 形式的时长
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .ok_or_else(|| format!("duration {value:?} is missing a unit"))?;
    let (number, unit) = value.split_at(split);

    let number: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration {value:?}"))?;
    let seconds = match unit {
        "ms" => number / 1000.0,
        "s" => number,
        "m" => number * 60.0,
        "h" => number * 3600.0,
        _ => return Err(format!("unknown duration unit in {value:?}")),
    };

    Duration::try_from_secs_f64(seconds).map_err(|_| format!("invalid duration {value:?}"))
}

/// 按 gRPC 服务配置的写法输出秒数，例如 `"1s"`、`"0.25s"`
pub fn format_duration(duration: Duration) -> String {
    if duration.subsec_nanos() == 0 {
        format!("{}s", duration.as_secs())
    } else {
        let formatted = format!("{:.9}", duration.as_secs_f64());
        format!("{}s", formatted.trim_end_matches('0'))
    }
}

const STATUS_CODES: [(&str, Code); 17] = [
    ("OK", Code::Ok),
    ("CANCELLED", Code::Cancelled),
    ("UNKNOWN", Code::Unknown),
    ("INVALID_ARGUMENT", Code::InvalidArgument),
    ("DEADLINE_EXCEEDED", Code::DeadlineExceeded),
    ("NOT_FOUND", Code::NotFound),
    ("ALREADY_EXISTS", Code::AlreadyExists),
    ("PERMISSION_DENIED", Code::PermissionDenied),
    ("RESOURCE_EXHAUSTED", Code::ResourceExhausted),
    ("FAILED_PRECONDITION", Code::FailedPrecondition),
    ("ABORTED", Code::Aborted),
    ("OUT_OF_RANGE", Code::OutOfRange),
    ("UNIMPLEMENTED", Code::Unimplemented),
    ("INTERNAL", Code::Internal),
    ("UNAVAILABLE", Code::Unavailable),
    ("DATA_LOSS", Code::DataLoss),
    ("UNAUTHENTICATED", Code::Unauthenticated),
];

/// 状态码名称 (如 `UNAVAILABLE`) 转换为 [`Code`]
pub fn parse_status_code(name: &str) -> Option<Code> {
    let name = name.trim();
    STATUS_CODES
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case(name))
        .map(|(_, code)| *code)
}

/// `Code` 对应的服务配置名称
pub fn status_code_name(code: Code) -> &'static str {
    STATUS_CODES
        .iter()
        .find(|(_, c)| *c == code)
        .map(|(n, _)| *n)
        .unwrap_or("UNKNOWN")
}

impl RetryPolicy {
    /// 第 `attempt` 次失败后的等待时间 (从 1 开始)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.initial_backoff.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = secs.min(self.max_backoff.as_secs_f64());
        Duration::try_from_secs_f64(capped).unwrap_or(self.max_backoff)
    }

    pub fn is_retryable(&self, code: Code) -> bool {
        self.retryable_status_codes.contains(&code)
    }
}

/// 按重试策略执行一元调用
///
/// `call` 每次尝试都会被调用一次，参数是从 1 开始的尝试序号。
pub async fn call_with_retry<T, F, Fut>(policy: &RetryPolicy, op_name: &str, mut call: F) -> Result<T, Status>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, Status>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match call(attempt).await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(op = op_name, attempt, "RPC succeeded after retry");
                }
                return Ok(value);
            }
            Err(status) if attempt < max_attempts && policy.is_retryable(status.code()) => {
                let backoff = policy.backoff(attempt);
                tracing::warn!(
                    op = op_name,
                    attempt,
                    max_attempts,
                    code = ?status.code(),
                    backoff_ms = backoff.as_millis() as u64,
                    "Retrying RPC after transient error"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(status) => {
                if policy.is_retryable(status.code()) {
                    tracing::error!(op = op_name, attempt, code = ?status.code(), "RPC retries exhausted");
                }
                return Err(status);
            }
        }
    }
}
