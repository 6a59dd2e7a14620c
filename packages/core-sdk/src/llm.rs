use std::time::Duration;

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::Url;
use serde_json::{json, Map, Value};

use crate::models::Message;

pub const DEFAULT_MODEL: &str = "deepseek-chat";

const CHAT_SUFFIX: &str = "/chat/completions";

/** \brief 已知的 OpenAI 兼容主机，以及裸地址需补全的聊天路径 */
const KNOWN_PROVIDERS: &[(&str, &str)] = &[
    ("api.openai.com", "/v1/chat/completions"),
    ("api.deepseek.com", "/chat/completions"),
];

/**
 * \brief 上游请求体形状。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireShape {
    /** \brief {model, messages:[{role, content}]} */
    OpenAiChat,
    /** \brief {prompt} */
    FlatPrompt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
    pub shape: WireShape,
}

/**
 * \brief 根据路径后缀或已知主机名判断接口是否 OpenAI 兼容，必要时补全聊天路径。
 *
 * 这是兼容性启发式规则，不是协议保证。
 */
pub fn classify_endpoint(raw: &str) -> Result<Endpoint, String> {
    let mut url = Url::parse(raw.trim()).map_err(|_| "Invalid URL".to_string())?;
    let path = url.path().trim_end_matches('/').to_string();

    if path.ends_with(CHAT_SUFFIX) {
        return Ok(Endpoint {
            url: raw.trim().to_string(),
            shape: WireShape::OpenAiChat,
        });
    }

    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    let Some((_, chat_path)) = KNOWN_PROVIDERS.iter().find(|(h, _)| *h == host) else {
        return Ok(Endpoint {
            url: raw.trim().to_string(),
            shape: WireShape::FlatPrompt,
        });
    };

    if !path.contains("/v1") && !path.contains("/chat") {
        url.set_path(&format!("{}{}", path, chat_path));
    } else if path.ends_with("/v1") {
        url.set_path(&format!("{}{}", path, CHAT_SUFFIX));
    }
    Ok(Endpoint {
        url: url.to_string(),
        shape: WireShape::OpenAiChat,
    })
}

/**
 * \brief 模型参数：`model` 单独取出，其余字段原样并入聊天请求体。
 */
#[derive(Debug, Clone, PartialEq)]
pub struct ModelParams {
    pub model: String,
    pub extra: Map<String, Value>,
}

impl Default for ModelParams {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            extra: Map::new(),
        }
    }
}

impl ModelParams {
    pub fn from_json(raw: Option<&str>) -> Result<Self, String> {
        let raw = match raw.map(str::trim) {
            Some(r) if !r.is_empty() => r,
            _ => return Ok(Self::default()),
        };
        let value: Value = serde_json::from_str(raw).map_err(|e| format!("Invalid paramsJson: {}", e))?;
        let Value::Object(mut extra) = value else {
            return Err("Invalid paramsJson: expected an object".to_string());
        };
        let model = match extra.remove("model") {
            Some(Value::String(m)) if !m.trim().is_empty() => m,
            _ => DEFAULT_MODEL.to_string(),
        };
        // 这些字段由网关自己控制
        extra.remove("messages");
        extra.remove("stream");
        Ok(Self { model, extra })
    }
}

pub fn chat_payload(params: &ModelParams, messages: &[Message]) -> Value {
    let mut body = params.extra.clone();
    body.insert("model".to_string(), json!(params.model));
    body.insert("messages".to_string(), json!(messages));
    Value::Object(body)
}

pub fn flat_payload(prompt: &str) -> Value {
    json!({ "prompt": prompt })
}

/**
 * \brief `choices[0]` 的内容与结束原因。
 */
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub content: String,
    pub finish_reason: Option<String>,
}

pub fn parse_choice(v: &Value) -> Option<Choice> {
    let first = v.get("choices")?.get(0)?;
    let content = first
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("")
        .to_string();
    let finish_reason = first
        .get("finish_reason")
        .and_then(|r| r.as_str())
        .map(|r| r.to_string());
    Some(Choice {
        content,
        finish_reason,
    })
}

/**
 * \brief 将多轮续写合成为单个 chat-completion 包络：以最后一轮为底，
 * 替换 `message.content` 为各轮内容的拼接，`finish_reason` 取最后一轮。
 */
pub fn merge_rounds(last_envelope: &Value, merged_content: &str, finish_reason: Option<&str>) -> Value {
    let mut envelope = match last_envelope {
        Value::Object(_) => last_envelope.clone(),
        _ => json!({}),
    };
    let choice = json!({
        "index": 0,
        "message": { "role": "assistant", "content": merged_content },
        "finish_reason": finish_reason,
    });
    envelope["choices"] = json!([choice]);
    envelope
}

/**
 * \brief 单轮上游响应。
 */
#[derive(Debug, Clone)]
pub struct RoundResponse {
    pub status: u16,
    pub body: String,
}

/**
 * \brief 发送一次 JSON POST；超时由传输层强制执行。
 */
pub async fn post_json(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
    payload: &Value,
    timeout: Duration,
) -> Result<RoundResponse, reqwest::Error> {
    let mut request = client
        .post(url)
        .timeout(timeout)
        .header(CONTENT_TYPE, "application/json")
        .json(payload);
    if let Some(key) = api_key.filter(|k| !k.is_empty()) {
        request = request.header(AUTHORIZATION, format!("Bearer {}", key));
    }
    let resp = request.send().await?;
    let status = resp.status().as_u16();
    let body = resp.text().await?;
    Ok(RoundResponse { status, body })
}

/**
 * \brief 连通性探测用的 GET。
 */
pub async fn probe_get(
    client: &reqwest::Client,
    url: &str,
    authorization: Option<&str>,
    timeout: Duration,
) -> Result<u16, reqwest::Error> {
    let mut request = client.get(url).timeout(timeout);
    if let Some(auth) = authorization.filter(|a| !a.is_empty()) {
        request = request.header(AUTHORIZATION, auth);
    }
    let resp = request.send().await?;
    let status = resp.status().as_u16();
    // 读完响应体，与连接关闭语义一致
    let _ = resp.bytes().await?;
    Ok(status)
}

pub fn describe_transport_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "Timeout".to_string()
    } else if err.is_builder() {
        format!("request build failed: {}", err)
    } else if err.is_connect() {
        format!("connection failed: {}", err)
    } else {
        err.to_string()
    }
}
