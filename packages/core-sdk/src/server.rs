use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, FromRequestParts, Multipart, Path, Query, State},
    http::{request::Parts, StatusCode},
    routing::{get, post},
    Json, Router,
};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::anchoring::{AnchorRequest, AnchoringSession, CallerGateway, Orchestrator, RetryPolicy, SessionStore};
use crate::attachments::Attachment;
use crate::config::{AppConfig, GatewayTimeouts};
use crate::db::{self, SqliteStore};
use crate::error::{AnchorError, GatewayError};
use crate::gateway::{CallOptions, Gateway, PromptEnvelope};
use crate::llm::ModelParams;
use crate::models::{ConfigKind, StoredCredential};
use crate::prompts::PromptKind;
use crate::sites::{self, ProbePolicy};
use crate::telemetry;
use crate::vault::Vault;

pub const CALLER_HEADER: &str = "x-user-id";
pub const DEFAULT_CALLER: &str = "local";
pub const MAX_PROMPT_BYTES: usize = 1_000_000;
const MAX_UPLOAD_BYTES: usize = 50 * 1024 * 1024;

static API_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{3,32}$").expect("apiName pattern compiles"));

type ApiError = (StatusCode, Json<Value>);

/**
 * \brief 服务共享状态。除会话存储外均为只读。
 */
#[derive(Clone)]
pub struct AppState {
    pub store: SqliteStore,
    pub vault: Arc<Vault>,
    pub gateway: Arc<Gateway>,
    pub sessions: Arc<SessionStore>,
    pub retry: RetryPolicy,
    pub probe: ProbePolicy,
}

impl AppState {
    pub fn new(store: SqliteStore, vault: Vault, timeouts: GatewayTimeouts) -> Self {
        let vault = Arc::new(vault);
        let gateway = Gateway::new(vault.clone(), Arc::new(store.clone())).with_timeouts(timeouts);
        let probe = ProbePolicy {
            timeout: gateway.timeouts().probe,
            ..ProbePolicy::default()
        };
        Self {
            store,
            vault,
            gateway: Arc::new(gateway),
            sessions: Arc::new(SessionStore::new()),
            retry: RetryPolicy::default(),
            probe,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/**
 * \brief 启动 HTTP 服务，直到 `shutdown` 被触发。
 */
pub async fn run(config: AppConfig, shutdown: CancellationToken) -> Result<()> {
    let store = SqliteStore::open(&config.db_path)?;
    {
        let conn = store.conn()?;
        telemetry::set_enabled(db::get_telemetry_enabled(&conn)?);
    }
    let state = AppState::new(store, config.vault, config.timeouts);

    let listener = tokio::net::TcpListener::bind(&config.addr).await?;
    tracing::info!(addr = %config.addr, db = %state.store.path().display(), "server listening");
    let app = build_router(state);
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    tracing::info!("server stopped");
    Ok(())
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(health_check))
        .route("/config/telemetry", get(get_telemetry).put(set_telemetry))
        .route("/config/ai", get(list_ai_configs).post(save_ai_config))
        .route("/config/ai/test", post(test_ai_config))
        .route("/config/ai/prompt", post(prompt))
        .route(
            "/config/ai/{api_name}/prompt-files",
            post(prompt_files).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/config/sites", get(list_sites).post(save_site))
        .route("/config/sites/test", post(test_site))
        .route("/config/prompts/{kind}", get(get_prompt_template).put(put_prompt_template))
        .route(
            "/directions/{id}/anchor",
            post(start_anchor).get(get_anchor).delete(cancel_anchor),
        )
        .route("/directions/{id}/review", get(get_review))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/**
 * \brief 调用者身份，由外部会话层通过 `X-User-Id` 头传入。
 */
#[derive(Debug, Clone)]
pub struct Caller(pub String);

impl<S> FromRequestParts<S> for Caller
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let id = parts
            .headers
            .get(CALLER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(DEFAULT_CALLER);
        Ok(Caller(id.to_string()))
    }
}

fn error_body(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn bad_request(message: impl Into<String>) -> ApiError {
    error_body(StatusCode::BAD_REQUEST, message)
}

fn internal_err<E: std::fmt::Display>(e: E) -> ApiError {
    tracing::error!(error = %e, "request failed");
    error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn gateway_err(e: GatewayError) -> ApiError {
    match e {
        GatewayError::UnknownApi(_) => error_body(StatusCode::NOT_FOUND, e.to_string()),
        GatewayError::Vault(_) | GatewayError::Store(_) => internal_err(e),
    }
}

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    payload.map(|Json(v)| v).map_err(|r| bad_request(r.body_text()))
}

fn validate_api_name(api_name: &str) -> Result<(), ApiError> {
    if API_NAME_RE.is_match(api_name) {
        Ok(())
    } else {
        Err(bad_request("Invalid apiName"))
    }
}

fn validate_prompt(prompt: &str) -> Result<(), ApiError> {
    if prompt.is_empty() || prompt.len() > MAX_PROMPT_BYTES {
        return Err(bad_request("Invalid prompt"));
    }
    Ok(())
}

fn truthy(flag: Option<&str>) -> bool {
    matches!(flag.map(str::trim), Some("1" | "true" | "yes"))
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok", "telemetry": telemetry::is_enabled() }))
}

#[derive(Deserialize, Debug)]
struct TelemetryInput {
    enabled: bool,
}

async fn get_telemetry(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let conn = state.store.conn().map_err(internal_err)?;
    let enabled = db::get_telemetry_enabled(&conn).map_err(internal_err)?;
    Ok(Json(json!({ "enabled": enabled })))
}

/**
 * \brief 更新遥测开关并同步到进程内状态。
 */
async fn set_telemetry(
    State(state): State<AppState>,
    payload: Result<Json<TelemetryInput>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let input = json_body(payload)?;
    let conn = state.store.conn().map_err(internal_err)?;
    db::set_telemetry_enabled(&conn, input.enabled).map_err(internal_err)?;
    telemetry::set_enabled(input.enabled);
    Ok(Json(json!({ "enabled": input.enabled })))
}

/**
 * \brief 接口配置输入。明文地址与密钥只在本请求内存在，入库前加密。
 */
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AiConfigInput {
    api_name: String,
    #[serde(default, rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    api_key: Option<String>,
    #[serde(default)]
    model_path: Option<String>,
    #[serde(default)]
    params_json: Option<Value>,
}

async fn list_ai_configs(State(state): State<AppState>, Caller(caller): Caller) -> Result<Json<Value>, ApiError> {
    let conn = state.store.conn().map_err(internal_err)?;
    let configs = db::list_ai_configs(&conn, &caller).map_err(internal_err)?;
    Ok(Json(json!({ "configs": configs })))
}

async fn save_ai_config(
    State(state): State<AppState>,
    Caller(caller): Caller,
    payload: Result<Json<AiConfigInput>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let input = json_body(payload)?;
    validate_api_name(&input.api_name)?;
    let kind = match input.kind.as_deref() {
        None => ConfigKind::Cloud,
        Some(raw) => ConfigKind::parse(raw).ok_or_else(|| bad_request("type must be cloud or local"))?,
    };
    let params_json = match input.params_json {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.trim().is_empty() => None,
        Some(Value::String(s)) => Some(s),
        Some(other) => Some(other.to_string()),
    };
    ModelParams::from_json(params_json.as_deref()).map_err(bad_request)?;

    let url = input.url.filter(|u| !u.trim().is_empty());
    let api_key = input.api_key.filter(|k| !k.is_empty());
    let cred = StoredCredential {
        api_name: input.api_name,
        kind,
        endpoint_ciphertext: state.vault.encrypt(url.as_deref()).map_err(internal_err)?,
        api_key_ciphertext: state.vault.encrypt(api_key.as_deref()).map_err(internal_err)?,
        model_path: input.model_path.filter(|p| !p.trim().is_empty()),
        params_json,
    };
    let conn = state.store.conn().map_err(internal_err)?;
    db::upsert_ai_config(&conn, &caller, &cred).map_err(internal_err)?;
    tracing::info!(caller = %caller, api_name = %cred.api_name, kind = cred.kind.as_str(), "ai config saved");
    Ok(Json(json!({ "status": "ok", "apiName": cred.api_name })))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct ApiNameInput {
    api_name: String,
}

async fn test_ai_config(
    State(state): State<AppState>,
    Caller(caller): Caller,
    payload: Result<Json<ApiNameInput>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let input = json_body(payload)?;
    validate_api_name(&input.api_name)?;
    let result = state
        .gateway
        .test_connection(&caller, &input.api_name)
        .await
        .map_err(gateway_err)?;
    Ok(Json(json!(result)))
}

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct PromptInput {
    api_name: String,
    prompt: String,
    #[serde(default)]
    debug: Option<bool>,
    #[serde(default)]
    request_id: Option<String>,
}

/**
 * \brief 单次提示词调用。业务失败也返回 200，由 `status` 字段区分。
 */
async fn prompt(
    State(state): State<AppState>,
    Caller(caller): Caller,
    payload: Result<Json<PromptInput>, JsonRejection>,
) -> Result<Json<PromptEnvelope>, ApiError> {
    let input = json_body(payload)?;
    validate_api_name(&input.api_name)?;
    validate_prompt(&input.prompt)?;
    let opts = CallOptions {
        debug: input.debug.unwrap_or(false),
        trace_id: input.request_id,
        cancel: None,
    };
    let result = state
        .gateway
        .complete(&caller, &input.api_name, &input.prompt, &[], &opts)
        .await
        .map_err(gateway_err)?;
    Ok(Json(result.envelope()))
}

#[derive(Deserialize, Debug, Default)]
#[serde(rename_all = "camelCase")]
struct PromptFilesQuery {
    #[serde(default)]
    debug: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
}

/**
 * \brief 带附件的提示词调用：multipart 字段 `prompt` 与若干 `files`。
 */
async fn prompt_files(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(api_name): Path<String>,
    Query(q): Query<PromptFilesQuery>,
    mut multipart: Multipart,
) -> Result<Json<PromptEnvelope>, ApiError> {
    validate_api_name(&api_name)?;

    let mut prompt = String::new();
    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(e.body_text()))?
    {
        let name = field.name().unwrap_or("").to_string();
        match name.as_str() {
            "prompt" => {
                prompt = field.text().await.map_err(|e| bad_request(e.body_text()))?;
            }
            "files" | "files[]" | "file" => {
                let file_name = field.file_name().unwrap_or("attachment").to_string();
                let content_type = field.content_type().map(|c| c.to_string());
                let bytes = field.bytes().await.map_err(|e| bad_request(e.body_text()))?;
                files.push(Attachment {
                    name: file_name,
                    content_type,
                    bytes: bytes.to_vec(),
                });
            }
            other => tracing::debug!(field = other, "ignoring multipart field"),
        }
    }
    validate_prompt(&prompt)?;

    let opts = CallOptions {
        debug: truthy(q.debug.as_deref()),
        trace_id: q.request_id,
        cancel: None,
    };
    let result = state
        .gateway
        .complete(&caller, &api_name, &prompt, &files, &opts)
        .await
        .map_err(gateway_err)?;
    Ok(Json(result.envelope()))
}

#[derive(Serialize, Debug)]
#[serde(rename_all = "camelCase")]
struct SiteItem {
    id: i64,
    site_name: String,
    url: String,
    has_auth: bool,
    updated_at: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SiteInput {
    site_name: String,
    url: String,
    #[serde(default)]
    auth: Option<String>,
}

async fn list_sites(State(state): State<AppState>, Caller(caller): Caller) -> Result<Json<Value>, ApiError> {
    let conn = state.store.conn().map_err(internal_err)?;
    let sites: Vec<SiteItem> = db::list_sites(&conn, &caller)
        .map_err(internal_err)?
        .into_iter()
        .map(|s| SiteItem {
            id: s.id,
            site_name: s.site_name,
            url: s.url,
            has_auth: s.auth_ciphertext.is_some(),
            updated_at: s.updated_at,
        })
        .collect();
    Ok(Json(json!({ "sites": sites })))
}

async fn save_site(
    State(state): State<AppState>,
    Caller(caller): Caller,
    payload: Result<Json<SiteInput>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let input = json_body(payload)?;
    let name = input.site_name.trim();
    if name.is_empty() {
        return Err(bad_request("siteName is required"));
    }
    Url::parse(input.url.trim()).map_err(|_| bad_request("Invalid URL"))?;
    let auth = input.auth.filter(|a| !a.trim().is_empty());
    let auth_enc = state.vault.encrypt(auth.as_deref()).map_err(internal_err)?;
    let conn = state.store.conn().map_err(internal_err)?;
    let id = db::upsert_site(&conn, &caller, name, input.url.trim(), auth_enc.as_deref()).map_err(internal_err)?;
    Ok(Json(json!({ "id": id })))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SiteTestInput {
    #[serde(default)]
    id: Option<i64>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    auth: Option<String>,
}

/**
 * \brief 测试文献网站连通性：可以按已保存的 id，也可以直接给出 url/auth。
 */
async fn test_site(
    State(state): State<AppState>,
    Caller(caller): Caller,
    payload: Result<Json<SiteTestInput>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let input = json_body(payload)?;
    let (url, auth) = match input.id {
        Some(id) => {
            let conn = state.store.conn().map_err(internal_err)?;
            let site = db::get_site(&conn, &caller, id)
                .map_err(internal_err)?
                .ok_or_else(|| error_body(StatusCode::NOT_FOUND, format!("site {} not found", id)))?;
            let auth = state
                .vault
                .decrypt(site.auth_ciphertext.as_deref())
                .map_err(internal_err)?;
            (site.url, auth)
        }
        None => {
            let url = input
                .url
                .filter(|u| !u.trim().is_empty())
                .ok_or_else(|| bad_request("url or id is required"))?;
            (url, input.auth)
        }
    };
    let result = sites::probe_site(state.gateway.client(), &url, auth.as_deref(), state.probe).await;
    Ok(Json(json!(result)))
}

fn parse_kind(raw: &str) -> Result<PromptKind, ApiError> {
    PromptKind::parse(raw).ok_or_else(|| bad_request(format!("unknown prompt kind '{}'", raw)))
}

async fn get_prompt_template(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(kind): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let kind = parse_kind(&kind)?;
    let conn = state.store.conn().map_err(internal_err)?;
    let stored = db::get_prompt_template(&conn, &caller, kind)
        .map_err(internal_err)?
        .filter(|t| !t.trim().is_empty());
    let is_default = stored.is_none();
    let content = stored.unwrap_or_else(|| kind.default_template().to_string());
    Ok(Json(json!({ "kind": kind.as_str(), "content": content, "isDefault": is_default })))
}

#[derive(Deserialize, Debug)]
struct TemplateInput {
    content: String,
}

async fn put_prompt_template(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(kind): Path<String>,
    payload: Result<Json<TemplateInput>, JsonRejection>,
) -> Result<Json<Value>, ApiError> {
    let kind = parse_kind(&kind)?;
    let input = json_body(payload)?;
    let conn = state.store.conn().map_err(internal_err)?;
    db::set_prompt_template(&conn, &caller, kind, &input.content).map_err(internal_err)?;
    Ok(Json(json!({ "kind": kind.as_str(), "status": "ok" })))
}

/**
 * \brief 发起锚定：同步校验后在后台执行，立即返回 202 与会话快照。
 */
async fn start_anchor(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Path(direction_id): Path<String>,
    payload: Result<Json<AnchorRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<AnchoringSession>), ApiError> {
    let mut req = json_body(payload)?;
    req.direction_id = direction_id.clone();
    Orchestrator::validate(&req).map_err(|e| bad_request(e.to_string()))?;

    {
        let conn = state.store.conn().map_err(internal_err)?;
        if req.search_template.is_none() {
            req.search_template = db::get_prompt_template(&conn, &caller, PromptKind::Search).map_err(internal_err)?;
        }
        if req.review_template.is_none() {
            req.review_template = db::get_prompt_template(&conn, &caller, PromptKind::Review).map_err(internal_err)?;
        }
    }

    let (session, token) = state.sessions.begin(&direction_id).map_err(|e| match e {
        AnchorError::AlreadyRunning(_) => error_body(StatusCode::CONFLICT, e.to_string()),
        AnchorError::Validation(v) => bad_request(v.to_string()),
    })?;
    let snapshot = session.clone();

    let backend = Arc::new(CallerGateway::new(state.gateway.clone(), caller));
    let orchestrator = Orchestrator::new(backend, Arc::new(state.store.clone())).with_retry(state.retry);
    let sessions = state.sessions.clone();
    tokio::spawn(async move {
        let mut session = session;
        if let Err(err) = orchestrator.run(&mut session, &req, &token, Some(sessions.as_ref())).await {
            tracing::warn!(direction = %session.direction_id, "anchoring rejected: {}", err);
        }
        tracing::info!(direction = %session.direction_id, stage = ?session.stage, "anchoring finished");
        sessions.finish(session);
    });

    Ok((StatusCode::ACCEPTED, Json(snapshot)))
}

async fn get_anchor(
    State(state): State<AppState>,
    Path(direction_id): Path<String>,
) -> Result<Json<AnchoringSession>, ApiError> {
    state
        .sessions
        .snapshot(&direction_id)
        .map(Json)
        .ok_or_else(|| error_body(StatusCode::NOT_FOUND, "no anchoring session"))
}

async fn cancel_anchor(State(state): State<AppState>, Path(direction_id): Path<String>) -> Json<Value> {
    let cancelled = state.sessions.cancel(&direction_id);
    Json(json!({ "cancelled": cancelled }))
}

async fn get_review(
    State(state): State<AppState>,
    Path(direction_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let conn = state.store.conn().map_err(internal_err)?;
    let (status, review) = db::get_review(&conn, &direction_id)
        .map_err(internal_err)?
        .ok_or_else(|| error_body(StatusCode::NOT_FOUND, "no review for direction"))?;
    Ok(Json(json!({ "status": status.as_str(), "review": review })))
}
