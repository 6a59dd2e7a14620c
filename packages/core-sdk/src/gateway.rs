use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::attachments::{self, Attachment};
use crate::config::{GatewayTimeouts, MAX_CONTINUATION_ROUNDS};
use crate::error::GatewayError;
use crate::llm::{self, Endpoint, ModelParams, RoundResponse, WireShape};
use crate::models::{ConfigKind, Message, StoredCredential};
use crate::vault::Vault;

const BODY_SAMPLE_BYTES: usize = 512;
const PAYLOAD_PREVIEW_BYTES: usize = 200;
const CONTINUE_INSTRUCTION: &str = "请从上次中断的位置继续输出，不要重复已经输出的内容。";

/**
 * \brief 凭据来源（外部协作者）：按调用者与逻辑接口名返回加密凭据。
 */
pub trait CredentialSource: Send + Sync {
    fn credential(&self, caller: &str, api_name: &str) -> anyhow::Result<Option<StoredCredential>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    Ok,
    Error,
}

/**
 * \brief 业务层失败的分类。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Configuration,
    Transport,
    Timeout,
    Upstream,
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub debug: bool,
    pub trace_id: Option<String>,
    pub cancel: Option<CancellationToken>,
}

/**
 * \brief 调试旁路信息，只用于追踪，不能替代主结果。
 */
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugTrace {
    pub request_id: Option<String>,
    pub url: Option<String>,
    pub headers_sent: Value,
    pub status_code: Option<u16>,
    #[serde(rename = "latency_ms")]
    pub latency_ms: u64,
    #[serde(rename = "body_sample")]
    pub body_sample: Option<String>,
    #[serde(rename = "payload_preview")]
    pub payload_preview: Option<String>,
    #[serde(rename = "loop_count", skip_serializing_if = "Option::is_none")]
    pub loop_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/**
 * \brief 一次网关调用的规范化结果。`status` 只有 ok/error 两种，
 * 调用方不需要用异常区分“请求失败”和“模型返回空”。
 */
#[derive(Debug, Clone)]
pub struct CompletionResult {
    pub status: CallStatus,
    pub failure: Option<FailureKind>,
    pub message: Option<String>,
    pub http_status: Option<u16>,
    pub raw_body: Option<String>,
    pub parsed_answer: Option<String>,
    pub latency_ms: u64,
    pub rounds_used: u32,
    pub debug: Option<DebugTrace>,
}

/**
 * \brief 对外返回的统一包络：`{status, latency_ms, answer?, message?, debug?}`。
 */
#[derive(Debug, Clone, Serialize)]
pub struct PromptEnvelope {
    pub status: CallStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<DebugTrace>,
}

impl CompletionResult {
    pub fn is_ok(&self) -> bool {
        self.status == CallStatus::Ok
    }

    pub fn is_cancelled(&self) -> bool {
        self.failure == Some(FailureKind::Cancelled)
    }

    /** \brief 优先返回抽取后的回答正文，否则返回原始响应体。 */
    pub fn answer_text(&self) -> &str {
        self.parsed_answer
            .as_deref()
            .or(self.raw_body.as_deref())
            .unwrap_or("")
    }

    pub fn envelope(&self) -> PromptEnvelope {
        PromptEnvelope {
            status: self.status,
            latency_ms: self.latency_ms,
            answer: self.raw_body.clone(),
            message: self.message.clone(),
            debug: self.debug.clone(),
        }
    }

    fn failed(kind: FailureKind, message: impl Into<String>, latency_ms: u64) -> Self {
        Self {
            status: CallStatus::Error,
            failure: Some(kind),
            message: Some(message.into()),
            http_status: None,
            raw_body: None,
            parsed_answer: None,
            latency_ms,
            rounds_used: 0,
            debug: None,
        }
    }
}

/**
 * \brief 连通性测试结果。
 */
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub status: CallStatus,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ProbeResult {
    pub fn ok(latency_ms: u64) -> Self {
        Self {
            status: CallStatus::Ok,
            latency_ms,
            message: None,
        }
    }

    pub fn error(latency_ms: u64, message: impl Into<String>) -> Self {
        Self {
            status: CallStatus::Error,
            latency_ms,
            message: Some(message.into()),
        }
    }
}

enum RoundError {
    Transport(reqwest::Error),
    Cancelled,
}

enum Outcome {
    Completed {
        status: u16,
        body: String,
        answer: String,
        rounds: u32,
    },
    Failed {
        kind: FailureKind,
        message: String,
        status: Option<u16>,
        body: Option<String>,
        rounds: u32,
    },
}

/**
 * \brief 补全网关：解析凭据、适配上游请求形状、执行调用并在截断时续写。
 */
pub struct Gateway {
    client: reqwest::Client,
    vault: Arc<Vault>,
    credentials: Arc<dyn CredentialSource>,
    timeouts: GatewayTimeouts,
    max_rounds: u32,
}

impl Gateway {
    pub fn new(vault: Arc<Vault>, credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            client: reqwest::Client::new(),
            vault,
            credentials,
            timeouts: GatewayTimeouts::default(),
            max_rounds: MAX_CONTINUATION_ROUNDS,
        }
    }

    pub fn with_timeouts(mut self, timeouts: GatewayTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_max_rounds(mut self, max_rounds: u32) -> Self {
        self.max_rounds = max_rounds.max(1);
        self
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn timeouts(&self) -> GatewayTimeouts {
        self.timeouts
    }

    /**
     * \brief 执行一次补全调用。
     *
     * 只有未知接口名、解密失败和凭据存储故障会返回 `Err`；
     * 配置缺失、网络错误、超时、上游错误与取消都以 `error` 状态的结果返回。
     */
    pub async fn complete(
        &self,
        caller: &str,
        api_name: &str,
        prompt: &str,
        attachments: &[Attachment],
        opts: &CallOptions,
    ) -> Result<CompletionResult, GatewayError> {
        let start = Instant::now();
        let cred = self
            .credentials
            .credential(caller, api_name)
            .map_err(GatewayError::Store)?
            .ok_or_else(|| GatewayError::UnknownApi(api_name.to_string()))?;

        if cred.kind == ConfigKind::Local {
            return Ok(self.complete_local(&cred, start, opts));
        }

        let endpoint_raw = self.vault.decrypt(cred.endpoint_ciphertext.as_deref())?;
        let api_key = self.vault.decrypt(cred.api_key_ciphertext.as_deref())?;

        let Some(endpoint_raw) = endpoint_raw.filter(|u| !u.trim().is_empty()) else {
            return Ok(self.config_failure("Missing URL", start, opts, None));
        };
        let endpoint = match llm::classify_endpoint(&endpoint_raw) {
            Ok(ep) => ep,
            Err(msg) => return Ok(self.config_failure(&msg, start, opts, None)),
        };
        let params = match ModelParams::from_json(cred.params_json.as_deref()) {
            Ok(p) => p,
            Err(msg) => return Ok(self.config_failure(&msg, start, opts, Some(&endpoint.url))),
        };

        let (full_prompt, timeout) = if attachments.is_empty() {
            (prompt.to_string(), self.timeouts.plain)
        } else {
            (
                with_attachments(prompt, attachments).await,
                self.timeouts.attachment,
            )
        };

        tracing::debug!(
            api_name,
            trace_id = opts.trace_id.as_deref().unwrap_or("-"),
            shape = ?endpoint.shape,
            attachments = attachments.len(),
            "gateway call start"
        );

        let first_payload = match endpoint.shape {
            WireShape::FlatPrompt => llm::flat_payload(&full_prompt),
            WireShape::OpenAiChat => llm::chat_payload(&params, &[Message::user(full_prompt.as_str())]),
        };
        let outcome = match endpoint.shape {
            WireShape::FlatPrompt => {
                self.run_flat(&endpoint, api_key.as_deref(), &first_payload, timeout, opts)
                    .await
            }
            WireShape::OpenAiChat => {
                self.run_chat(&endpoint, api_key.as_deref(), &params, &full_prompt, timeout, opts)
                    .await
            }
        };

        let latency_ms = elapsed_ms(start);
        let mut debug = opts.debug.then(|| DebugTrace {
            request_id: opts.trace_id.clone(),
            url: Some(endpoint.url.clone()),
            headers_sent: headers_sent(api_key.as_deref()),
            status_code: None,
            latency_ms,
            body_sample: None,
            payload_preview: Some(sample(&first_payload.to_string(), PAYLOAD_PREVIEW_BYTES)),
            loop_count: None,
            error: None,
        });

        let result = match outcome {
            Outcome::Completed {
                status,
                body,
                answer,
                rounds,
            } => {
                if let Some(d) = debug.as_mut() {
                    d.status_code = Some(status);
                    d.body_sample = Some(sample(&body, BODY_SAMPLE_BYTES));
                    d.loop_count = (rounds > 1).then_some(rounds);
                }
                tracing::debug!(api_name, status, rounds, latency_ms, "gateway call done");
                CompletionResult {
                    status: CallStatus::Ok,
                    failure: None,
                    message: None,
                    http_status: Some(status),
                    raw_body: Some(body),
                    parsed_answer: Some(answer),
                    latency_ms,
                    rounds_used: rounds,
                    debug,
                }
            }
            Outcome::Failed {
                kind,
                message,
                status,
                body,
                rounds,
            } => {
                if let Some(d) = debug.as_mut() {
                    d.status_code = status;
                    d.body_sample = body.as_deref().map(|b| sample(b, BODY_SAMPLE_BYTES));
                    d.loop_count = (rounds > 1).then_some(rounds);
                    d.error = Some(message.clone());
                }
                if kind == FailureKind::Cancelled {
                    tracing::info!(api_name, rounds, "gateway call cancelled");
                } else {
                    tracing::warn!(api_name, ?kind, status, url = %endpoint.url, "gateway call failed: {}", message);
                }
                CompletionResult {
                    status: CallStatus::Error,
                    failure: Some(kind),
                    message: Some(message),
                    http_status: status,
                    raw_body: body,
                    parsed_answer: None,
                    latency_ms,
                    rounds_used: rounds,
                    debug,
                }
            }
        };
        Ok(result)
    }

    /**
     * \brief 测试接口连通性：云端发 GET，本地检查模型路径。
     */
    pub async fn test_connection(&self, caller: &str, api_name: &str) -> Result<ProbeResult, GatewayError> {
        let start = Instant::now();
        let cred = self
            .credentials
            .credential(caller, api_name)
            .map_err(GatewayError::Store)?
            .ok_or_else(|| GatewayError::UnknownApi(api_name.to_string()))?;

        if cred.kind == ConfigKind::Local {
            return Ok(match check_model_path(cred.model_path.as_deref()) {
                Ok(()) => ProbeResult::ok(elapsed_ms(start)),
                Err(msg) => ProbeResult::error(elapsed_ms(start), msg),
            });
        }

        let url = self.vault.decrypt(cred.endpoint_ciphertext.as_deref())?;
        let key = self.vault.decrypt(cred.api_key_ciphertext.as_deref())?;
        let Some(url) = url.filter(|u| !u.trim().is_empty()) else {
            return Ok(ProbeResult::error(elapsed_ms(start), "Missing URL"));
        };
        let auth = format!("Bearer {}", key.unwrap_or_default());
        match llm::probe_get(&self.client, &url, Some(&auth), self.timeouts.probe).await {
            Ok(_) => Ok(ProbeResult::ok(elapsed_ms(start))),
            Err(err) => Ok(ProbeResult::error(
                elapsed_ms(start),
                llm::describe_transport_error(&err),
            )),
        }
    }

    fn complete_local(&self, cred: &StoredCredential, start: Instant, opts: &CallOptions) -> CompletionResult {
        match check_model_path(cred.model_path.as_deref()) {
            Ok(()) => CompletionResult {
                status: CallStatus::Ok,
                failure: None,
                message: None,
                http_status: None,
                raw_body: None,
                parsed_answer: None,
                latency_ms: elapsed_ms(start),
                rounds_used: 0,
                debug: None,
            },
            Err(msg) => self.config_failure(&msg, start, opts, None),
        }
    }

    fn config_failure(&self, message: &str, start: Instant, opts: &CallOptions, url: Option<&str>) -> CompletionResult {
        let latency_ms = elapsed_ms(start);
        let mut result = CompletionResult::failed(FailureKind::Configuration, message, latency_ms);
        if opts.debug {
            result.debug = Some(DebugTrace {
                request_id: opts.trace_id.clone(),
                url: url.map(|u| u.to_string()),
                headers_sent: Value::Null,
                status_code: None,
                latency_ms,
                body_sample: None,
                payload_preview: None,
                loop_count: None,
                error: Some(message.to_string()),
            });
        }
        result
    }

    async fn run_flat(
        &self,
        endpoint: &Endpoint,
        api_key: Option<&str>,
        payload: &Value,
        timeout: Duration,
        opts: &CallOptions,
    ) -> Outcome {
        match self.send(&endpoint.url, api_key, payload, timeout, opts).await {
            Ok(resp) => finish_single(resp),
            Err(err) => round_failure(err, 1),
        }
    }

    /**
     * \brief OpenAI 兼容接口的续写循环：`finish_reason == "length"` 时追加
     * assistant 回显与 user 续写指令后重发，最多 `max_rounds` 轮。
     */
    async fn run_chat(
        &self,
        endpoint: &Endpoint,
        api_key: Option<&str>,
        params: &ModelParams,
        prompt: &str,
        timeout: Duration,
        opts: &CallOptions,
    ) -> Outcome {
        let mut messages = vec![Message::user(prompt)];
        let mut accumulated = String::new();
        let mut rounds = 0u32;

        loop {
            rounds += 1;
            let payload = llm::chat_payload(params, &messages);
            let resp = match self.send(&endpoint.url, api_key, &payload, timeout, opts).await {
                Ok(resp) => resp,
                Err(err) => return round_failure(err, rounds),
            };
            if !is_success(resp.status) {
                return upstream_failure(resp, rounds);
            }

            let choice = serde_json::from_str::<Value>(&resp.body)
                .ok()
                .and_then(|v| llm::parse_choice(&v).map(|c| (v, c)));
            let Some((envelope, choice)) = choice else {
                if rounds == 1 {
                    return finish_single(resp);
                }
                return Outcome::Failed {
                    kind: FailureKind::Upstream,
                    message: "Upstream returned an unreadable continuation".to_string(),
                    status: Some(resp.status),
                    body: Some(resp.body),
                    rounds,
                };
            };

            accumulated.push_str(&choice.content);
            let truncated = choice.finish_reason.as_deref() == Some("length");
            if !truncated || rounds >= self.max_rounds {
                if truncated {
                    tracing::warn!(rounds, "continuation cap reached while upstream still truncating");
                }
                let body = if rounds > 1 {
                    let merged = llm::merge_rounds(&envelope, &accumulated, choice.finish_reason.as_deref());
                    serde_json::to_string(&merged).unwrap_or_else(|_| resp.body.clone())
                } else {
                    resp.body
                };
                return Outcome::Completed {
                    status: resp.status,
                    body,
                    answer: accumulated,
                    rounds,
                };
            }

            tracing::debug!(rounds, partial_len = choice.content.len(), "upstream truncated, continuing");
            messages.push(Message::assistant(choice.content));
            messages.push(Message::user(CONTINUE_INSTRUCTION));
        }
    }

    async fn send(
        &self,
        url: &str,
        api_key: Option<&str>,
        payload: &Value,
        timeout: Duration,
        opts: &CallOptions,
    ) -> Result<RoundResponse, RoundError> {
        let request = llm::post_json(&self.client, url, api_key, payload, timeout);
        match opts.cancel.as_ref() {
            Some(token) => {
                if token.is_cancelled() {
                    return Err(RoundError::Cancelled);
                }
                tokio::select! {
                    _ = token.cancelled() => Err(RoundError::Cancelled),
                    res = request => res.map_err(RoundError::Transport),
                }
            }
            None => request.await.map_err(RoundError::Transport),
        }
    }
}

async fn with_attachments(prompt: &str, attachments: &[Attachment]) -> String {
    let prompt_owned = prompt.to_string();
    let files = attachments.to_vec();
    match tokio::task::spawn_blocking(move || attachments::append_to_prompt(&prompt_owned, &files)).await {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(error = %err, "attachment extraction task failed");
            attachments::append_to_prompt(prompt, &[])
        }
    }
}

fn finish_single(resp: RoundResponse) -> Outcome {
    if !is_success(resp.status) {
        return upstream_failure(resp, 1);
    }
    let answer = serde_json::from_str::<Value>(&resp.body)
        .ok()
        .and_then(|v| llm::parse_choice(&v))
        .map(|c| c.content)
        .unwrap_or_else(|| resp.body.clone());
    Outcome::Completed {
        status: resp.status,
        body: resp.body,
        answer,
        rounds: 1,
    }
}

fn upstream_failure(resp: RoundResponse, rounds: u32) -> Outcome {
    Outcome::Failed {
        kind: FailureKind::Upstream,
        message: format!("Upstream returned HTTP {}", resp.status),
        status: Some(resp.status),
        body: Some(resp.body),
        rounds,
    }
}

fn round_failure(err: RoundError, rounds: u32) -> Outcome {
    match err {
        RoundError::Cancelled => Outcome::Failed {
            kind: FailureKind::Cancelled,
            message: "Cancelled".to_string(),
            status: None,
            body: None,
            rounds,
        },
        RoundError::Transport(e) => Outcome::Failed {
            kind: if e.is_timeout() {
                FailureKind::Timeout
            } else {
                FailureKind::Transport
            },
            message: llm::describe_transport_error(&e),
            status: None,
            body: None,
            rounds,
        },
    }
}

fn check_model_path(model_path: Option<&str>) -> Result<(), String> {
    match model_path.filter(|p| !p.trim().is_empty()) {
        None => Err("Missing modelPath".to_string()),
        Some(p) if Path::new(p).exists() => Ok(()),
        Some(p) => Err(format!("modelPath not accessible: {}", p)),
    }
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

fn headers_sent(api_key: Option<&str>) -> Value {
    match api_key.filter(|k| !k.is_empty()) {
        Some(_) => json!({ "Authorization": "Bearer ****", "Content-Type": "application/json" }),
        None => json!({ "Content-Type": "application/json" }),
    }
}

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

/**
 * \brief 截断到最多 `max_bytes` 字节，回退到字符边界。
 */
pub fn sample(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s[..end].to_string()
}
