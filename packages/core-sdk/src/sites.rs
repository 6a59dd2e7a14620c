use std::time::{Duration, Instant};

use crate::gateway::ProbeResult;
use crate::llm;

/** \brief 首次尝试之后的重试次数 */
pub const PROBE_RETRIES: u32 = 2;
const PROBE_BACKOFF_STEP: Duration = Duration::from_millis(300);

/**
 * \brief 文献网站连通性检查的重试策略：第 i 次重试前等待 `step × (i+1)`。
 *
 * 与锚定流程的固定 1 秒单次重试相互独立。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    pub timeout: Duration,
    pub retries: u32,
    pub backoff_step: Duration,
}

impl Default for ProbePolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: PROBE_RETRIES,
            backoff_step: PROBE_BACKOFF_STEP,
        }
    }
}

impl ProbePolicy {
    pub fn backoff(&self, retry_index: u32) -> Duration {
        self.backoff_step * (retry_index + 1)
    }
}

/**
 * \brief 探测一个文献网站：带可选 Authorization 头发送 GET。
 * 只要拿到 HTTP 响应即视为可达；网络错误或超时才会重试。
 */
pub async fn probe_site(
    client: &reqwest::Client,
    url: &str,
    authorization: Option<&str>,
    policy: ProbePolicy,
) -> ProbeResult {
    let start = Instant::now();
    let mut last_error = String::new();

    for attempt in 0..=policy.retries {
        match llm::probe_get(client, url, authorization, policy.timeout).await {
            Ok(status) => {
                tracing::debug!(url, status, attempt, "site reachable");
                return ProbeResult::ok(start.elapsed().as_millis() as u64);
            }
            Err(err) => {
                last_error = llm::describe_transport_error(&err);
                tracing::debug!(url, attempt, error = %last_error, "site probe failed");
                if attempt < policy.retries {
                    tokio::time::sleep(policy.backoff(attempt)).await;
                }
            }
        }
    }

    tracing::warn!(url, "site unreachable after {} attempts", policy.retries + 1);
    ProbeResult::error(start.elapsed().as_millis() as u64, last_error)
}
