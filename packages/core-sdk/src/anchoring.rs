use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use crate::error::{AnchorError, GatewayError, ValidationError};
use crate::gateway::{CallOptions, CompletionResult, Gateway};
use crate::literature::{self, LiteratureRecord};
use crate::prompts::{self, PromptKind, PromptVars};
use crate::telemetry::{self, TraceRecord};

pub const MIN_SELECTED_LITERATURE: usize = 10;

/**
 * \brief 锚定会话阶段。`done` 与 `error` 为终态，新的锚定动作总是开启新会话。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Idle,
    Searching,
    Reviewing,
    Done,
    Error,
}

/**
 * \brief 单个研究方向的锚定会话。
 */
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchoringSession {
    pub direction_id: String,
    pub trace_id: String,
    pub stage: Stage,
    pub base_records: Vec<LiteratureRecord>,
    pub expanded_records: Vec<LiteratureRecord>,
    pub review_document: Option<String>,
    /** \brief 面向用户的状态或错误信息 */
    pub message: Option<String>,
    pub trace: Vec<TraceRecord>,
}

impl AnchoringSession {
    pub fn new(direction_id: &str) -> Self {
        Self {
            direction_id: direction_id.to_string(),
            trace_id: uuid::Uuid::new_v4().to_string(),
            stage: Stage::Idle,
            base_records: Vec::new(),
            expanded_records: Vec::new(),
            review_document: None,
            message: None,
            trace: Vec::new(),
        }
    }

    fn record(&mut self, step: &str, detail: Value) {
        let record = TraceRecord::new(&self.trace_id, step, detail);
        telemetry::emit(&record);
        self.trace.push(record);
    }
}

/**
 * \brief 一次锚定动作的输入。
 */
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnchorRequest {
    #[serde(default)]
    pub direction_id: String,
    pub direction_name: String,
    #[serde(default)]
    pub keywords: String,
    #[serde(default)]
    pub search_api: String,
    /** \brief 为空时沿用检索接口 */
    #[serde(default)]
    pub review_api: Option<String>,
    #[serde(default)]
    pub sites: Vec<String>,
    #[serde(default)]
    pub base_records: Vec<LiteratureRecord>,
    #[serde(default)]
    pub search_template: Option<String>,
    #[serde(default)]
    pub review_template: Option<String>,
}

impl AnchorRequest {
    pub fn review_api(&self) -> &str {
        self.review_api
            .as_deref()
            .filter(|a| !a.trim().is_empty())
            .unwrap_or(&self.search_api)
    }
}

/**
 * \brief 编排器依赖的补全能力。
 */
#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        api_name: &str,
        prompt: &str,
        opts: &CallOptions,
    ) -> Result<CompletionResult, GatewayError>;
}

/**
 * \brief 综述落库，并把研究方向标记为“已生成综述”。
 */
pub trait ReviewSink: Send + Sync {
    fn save_review(&self, direction_id: &str, document: &str) -> anyhow::Result<()>;
}

/**
 * \brief 绑定调用者身份的网关。
 */
pub struct CallerGateway {
    gateway: Arc<Gateway>,
    caller: String,
}

impl CallerGateway {
    pub fn new(gateway: Arc<Gateway>, caller: impl Into<String>) -> Self {
        Self {
            gateway,
            caller: caller.into(),
        }
    }
}

#[async_trait]
impl CompletionBackend for CallerGateway {
    async fn complete(
        &self,
        api_name: &str,
        prompt: &str,
        opts: &CallOptions,
    ) -> Result<CompletionResult, GatewayError> {
        self.gateway
            .complete(&self.caller, api_name, prompt, &[], opts)
            .await
    }
}

/**
 * \brief 编排器的重试策略：`attempts` 为总尝试次数，两次之间固定等待 `delay`。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 2,
            delay: Duration::from_secs(1),
        }
    }
}

enum CallOutcome {
    Answer(CompletionResult),
    Failed(String),
    Cancelled,
}

/**
 * \brief 锚定编排器：检索 → 去重 → 综述 → 落库，严格顺序执行。
 */
pub struct Orchestrator {
    backend: Arc<dyn CompletionBackend>,
    sink: Arc<dyn ReviewSink>,
    retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(backend: Arc<dyn CompletionBackend>, sink: Arc<dyn ReviewSink>) -> Self {
        Self {
            backend,
            sink,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /**
     * \brief 前置校验，在任何网络调用之前同步完成。
     */
    pub fn validate(req: &AnchorRequest) -> Result<(), ValidationError> {
        let selected = req.base_records.iter().filter(|r| r.selected).count();
        if selected < MIN_SELECTED_LITERATURE {
            return Err(ValidationError::NotEnoughLiterature {
                selected,
                required: MIN_SELECTED_LITERATURE,
            });
        }
        if req.sites.iter().all(|s| s.trim().is_empty()) {
            return Err(ValidationError::NoSiteSelected);
        }
        if req.search_api.trim().is_empty() {
            return Err(ValidationError::NoApiSelected);
        }
        Ok(())
    }

    /**
     * \brief 驱动一次完整的锚定流程。
     *
     * 校验失败时会话保持 `idle` 并返回 `Err`；其余结果都体现在会话阶段上。
     * `store` 存在时每次状态变化都会发布快照。
     */
    pub async fn run(
        &self,
        session: &mut AnchoringSession,
        req: &AnchorRequest,
        cancel: &CancellationToken,
        store: Option<&SessionStore>,
    ) -> Result<(), ValidationError> {
        if let Err(err) = Self::validate(req) {
            session.message = Some(err.to_string());
            session.record("validation_failed", json!({ "reason": err.to_string() }));
            publish(store, session);
            return Err(err);
        }

        let mut keys = HashSet::new();
        session.base_records = literature::dedupe_records(&mut keys, &req.base_records);
        let duplicates = req.base_records.len() - session.base_records.len();
        let selected: Vec<LiteratureRecord> = session.base_records.iter().filter(|r| r.selected).cloned().collect();
        session.expanded_records.clear();
        session.review_document = None;
        session.message = None;
        session.stage = Stage::Searching;
        session.record(
            "search_start",
            json!({
                "api": req.search_api,
                "selected": selected.len(),
                "duplicates": duplicates,
                "sites": req.sites.len()
            }),
        );
        publish(store, session);

        let search_prompt = prompts::render(
            PromptKind::Search,
            req.search_template.as_deref(),
            &PromptVars {
                direction: &req.direction_name,
                keywords: &req.keywords,
                sites: &req.sites,
                literature: &selected,
                expanded: &[],
            },
        );
        let search = match self
            .call_with_retry(session, "search", &req.search_api, &search_prompt, cancel)
            .await
        {
            CallOutcome::Answer(res) => res,
            CallOutcome::Cancelled => return Ok(self.cancelled(session, store)),
            CallOutcome::Failed(msg) => return Ok(self.failed(session, "search", msg, store)),
        };

        let raw = search.raw_body.as_deref().unwrap_or_else(|| search.answer_text());
        let found = literature::parse_answer(raw);
        let found_count = found.len();
        let accepted = literature::dedupe(&mut keys, found);
        session.record(
            "search_done",
            json!({ "found": found_count, "accepted": accepted.len(), "latency_ms": search.latency_ms }),
        );
        session.expanded_records.extend(accepted);

        session.stage = Stage::Reviewing;
        let review_api = req.review_api().to_string();
        session.record(
            "review_start",
            json!({ "api": review_api, "expanded": session.expanded_records.len() }),
        );
        publish(store, session);

        let review_prompt = prompts::render(
            PromptKind::Review,
            req.review_template.as_deref(),
            &PromptVars {
                direction: &req.direction_name,
                keywords: &req.keywords,
                sites: &req.sites,
                literature: &selected,
                expanded: &session.expanded_records,
            },
        );
        let review = match self
            .call_with_retry(session, "review", &review_api, &review_prompt, cancel)
            .await
        {
            CallOutcome::Answer(res) => res,
            CallOutcome::Cancelled => return Ok(self.cancelled(session, store)),
            CallOutcome::Failed(msg) => return Ok(self.failed(session, "review", msg, store)),
        };

        let document = literature::unwrap_outer_fence(review.answer_text());
        if document.is_empty() {
            return Ok(self.failed(session, "review", "综述内容为空".to_string(), store));
        }
        if let Err(err) = self.sink.save_review(&session.direction_id, &document) {
            return Ok(self.failed(session, "persist", format!("保存综述失败: {:#}", err), store));
        }

        session.record("review_done", json!({ "length": document.chars().count() }));
        session.review_document = Some(document);
        session.stage = Stage::Done;
        session.message = Some("已生成综述".to_string());
        publish(store, session);
        Ok(())
    }

    async fn call_with_retry(
        &self,
        session: &mut AnchoringSession,
        step: &str,
        api_name: &str,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> CallOutcome {
        let opts = CallOptions {
            debug: false,
            trace_id: Some(session.trace_id.clone()),
            cancel: Some(cancel.clone()),
        };
        let attempts = self.retry.attempts.max(1);
        let mut last_error = String::from("unknown error");

        for attempt in 0..attempts {
            if attempt > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => return CallOutcome::Cancelled,
                    _ = tokio::time::sleep(self.retry.delay) => {}
                }
            }
            if cancel.is_cancelled() {
                return CallOutcome::Cancelled;
            }
            match self.backend.complete(api_name, prompt, &opts).await {
                Ok(res) if res.is_cancelled() => return CallOutcome::Cancelled,
                Ok(res) if res.is_ok() => return CallOutcome::Answer(res),
                Ok(res) => {
                    last_error = res.message.unwrap_or_else(|| "unknown error".to_string());
                    session.record(
                        &format!("{}_attempt_failed", step),
                        json!({ "attempt": attempt + 1, "error": last_error }),
                    );
                }
                // hard failures are configuration problems, a retry would not help
                Err(err) => return CallOutcome::Failed(err.to_string()),
            }
        }
        CallOutcome::Failed(last_error)
    }

    fn cancelled(&self, session: &mut AnchoringSession, store: Option<&SessionStore>) {
        session.stage = Stage::Idle;
        session.expanded_records.clear();
        session.review_document = None;
        session.message = None;
        session.record("cancelled", Value::Null);
        publish(store, session);
    }

    fn failed(&self, session: &mut AnchoringSession, step: &str, message: String, store: Option<&SessionStore>) {
        tracing::warn!(direction = %session.direction_id, step, "anchoring failed: {}", message);
        session.stage = Stage::Error;
        session.record(&format!("{}_failed", step), json!({ "error": message }));
        session.message = Some(message);
        publish(store, session);
    }
}

fn publish(store: Option<&SessionStore>, session: &AnchoringSession) {
    if let Some(store) = store {
        store.publish(session);
    }
}

struct Slot {
    session: AnchoringSession,
    cancel: Option<CancellationToken>,
}

/**
 * \brief 按研究方向保存会话的显式存储。同一方向同一时刻只允许一个进行中的会话。
 */
#[derive(Default)]
pub struct SessionStore {
    slots: Mutex<HashMap<String, Slot>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /**
     * \brief 开启新会话；已有进行中的会话时返回 `AlreadyRunning`。
     */
    pub fn begin(&self, direction_id: &str) -> Result<(AnchoringSession, CancellationToken), AnchorError> {
        let mut slots = self.slots();
        if slots.get(direction_id).is_some_and(|s| s.cancel.is_some()) {
            return Err(AnchorError::AlreadyRunning(direction_id.to_string()));
        }
        let session = AnchoringSession::new(direction_id);
        let token = CancellationToken::new();
        slots.insert(
            direction_id.to_string(),
            Slot {
                session: session.clone(),
                cancel: Some(token.clone()),
            },
        );
        Ok((session, token))
    }

    pub fn publish(&self, session: &AnchoringSession) {
        if let Some(slot) = self.slots().get_mut(&session.direction_id) {
            slot.session = session.clone();
        }
    }

    /** \brief 会话结束（任意结果），释放单飞占位。 */
    pub fn finish(&self, session: AnchoringSession) {
        let mut slots = self.slots();
        let id = session.direction_id.clone();
        slots.insert(id, Slot { session, cancel: None });
    }

    /** \brief 触发进行中会话的取消信号；没有进行中的会话时返回 false。 */
    pub fn cancel(&self, direction_id: &str) -> bool {
        match self.slots().get(direction_id).and_then(|s| s.cancel.as_ref()) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self, direction_id: &str) -> bool {
        self.slots()
            .get(direction_id)
            .is_some_and(|s| s.cancel.is_some())
    }

    pub fn snapshot(&self, direction_id: &str) -> Option<AnchoringSession> {
        self.slots().get(direction_id).map(|s| s.session.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{CallStatus, FailureKind};
    use std::collections::VecDeque;

    enum Reply {
        Answer(&'static str),
        Fail(&'static str),
        Hang,
    }

    struct Scripted {
        replies: Mutex<VecDeque<Reply>>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl Scripted {
        fn new(replies: Vec<Reply>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn result(status: CallStatus, failure: Option<FailureKind>, body: Option<&str>, message: Option<&str>) -> CompletionResult {
        CompletionResult {
            status,
            failure,
            message: message.map(|m| m.to_string()),
            http_status: body.map(|_| 200),
            raw_body: body.map(|b| b.to_string()),
            parsed_answer: body.map(|b| b.to_string()),
            latency_ms: 1,
            rounds_used: 1,
            debug: None,
        }
    }

    #[async_trait]
    impl CompletionBackend for Scripted {
        async fn complete(
            &self,
            api_name: &str,
            prompt: &str,
            opts: &CallOptions,
        ) -> Result<CompletionResult, GatewayError> {
            self.calls
                .lock()
                .unwrap()
                .push((api_name.to_string(), prompt.to_string()));
            let reply = self.replies.lock().unwrap().pop_front();
            match reply {
                Some(Reply::Answer(body)) => Ok(result(CallStatus::Ok, None, Some(body), None)),
                Some(Reply::Fail(msg)) => Ok(result(CallStatus::Error, Some(FailureKind::Transport), None, Some(msg))),
                Some(Reply::Hang) => {
                    if let Some(token) = opts.cancel.as_ref() {
                        token.cancelled().await;
                    }
                    Ok(result(CallStatus::Error, Some(FailureKind::Cancelled), None, Some("Cancelled")))
                }
                None => Err(GatewayError::UnknownApi(api_name.to_string())),
            }
        }
    }

    #[derive(Default)]
    struct MemorySink {
        saved: Mutex<Vec<(String, String)>>,
    }

    impl ReviewSink for MemorySink {
        fn save_review(&self, direction_id: &str, document: &str) -> anyhow::Result<()> {
            self.saved
                .lock()
                .unwrap()
                .push((direction_id.to_string(), document.to_string()));
            Ok(())
        }
    }

    fn request(selected: usize) -> AnchorRequest {
        let base_records = (0..selected)
            .map(|i| LiteratureRecord::uploaded(&format!("Base Paper {}", i)))
            .collect();
        AnchorRequest {
            direction_id: "dir-1".to_string(),
            direction_name: "图神经网络".to_string(),
            keywords: "GNN".to_string(),
            search_api: "deepseek".to_string(),
            review_api: None,
            sites: vec!["arXiv".to_string()],
            base_records,
            search_template: None,
            review_template: None,
        }
    }

    fn orchestrator(backend: Arc<Scripted>, sink: Arc<MemorySink>) -> Orchestrator {
        Orchestrator::new(backend, sink).with_retry(RetryPolicy {
            attempts: 2,
            delay: Duration::ZERO,
        })
    }

    fn steps(session: &AnchoringSession) -> Vec<String> {
        session.trace.iter().map(|t| t.step.clone()).collect()
    }

    const SEARCH_ANSWER: &str = r#"[
        {"title": "Graph Attention Networks", "doi": "10.48550/arXiv.1710.10903"},
        {"title": "Base Paper 3"},
        {"title": "Inductive Representation Learning on Large Graphs"}
    ]"#;

    #[tokio::test]
    async fn nine_selected_records_are_refused() {
        let backend = Scripted::new(vec![]);
        let sink = Arc::new(MemorySink::default());
        let orch = orchestrator(backend.clone(), sink);
        let mut session = AnchoringSession::new("dir-1");

        let err = orch
            .run(&mut session, &request(9), &CancellationToken::new(), None)
            .await
            .unwrap_err();
        assert_eq!(err, ValidationError::NotEnoughLiterature { selected: 9, required: 10 });
        assert_eq!(session.stage, Stage::Idle);
        assert!(backend.calls().is_empty());
    }

    #[test]
    fn unselected_records_do_not_count() {
        let mut req = request(10);
        req.base_records[0].selected = false;
        assert!(matches!(
            Orchestrator::validate(&req),
            Err(ValidationError::NotEnoughLiterature { selected: 9, .. })
        ));
    }

    #[test]
    fn sites_and_api_are_required() {
        let mut req = request(10);
        req.sites.clear();
        assert_eq!(Orchestrator::validate(&req), Err(ValidationError::NoSiteSelected));
        let mut req = request(10);
        req.search_api = "  ".to_string();
        assert_eq!(Orchestrator::validate(&req), Err(ValidationError::NoApiSelected));
    }

    #[tokio::test]
    async fn two_search_failures_end_in_error_before_review() {
        let backend = Scripted::new(vec![Reply::Fail("boom"), Reply::Fail("boom again")]);
        let sink = Arc::new(MemorySink::default());
        let orch = orchestrator(backend.clone(), sink.clone());
        let mut session = AnchoringSession::new("dir-1");

        orch.run(&mut session, &request(10), &CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(session.stage, Stage::Error);
        assert_eq!(session.message.as_deref(), Some("boom again"));
        assert_eq!(backend.calls().len(), 2);
        assert!(!steps(&session).contains(&"review_start".to_string()));
        assert!(sink.saved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn full_run_dedupes_and_persists_review() {
        let backend = Scripted::new(vec![
            Reply::Answer(SEARCH_ANSWER),
            Reply::Answer("```markdown\n# 综述\n\n正文\n```"),
        ]);
        let sink = Arc::new(MemorySink::default());
        let orch = orchestrator(backend.clone(), sink.clone());
        let mut session = AnchoringSession::new("dir-1");

        orch.run(&mut session, &request(10), &CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(session.stage, Stage::Done);
        assert_eq!(session.expanded_records.len(), 2);
        assert_eq!(session.review_document.as_deref(), Some("# 综述\n\n正文"));
        assert_eq!(session.message.as_deref(), Some("已生成综述"));

        let calls = backend.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[1].0, "deepseek");
        assert!(calls[1].1.contains("Graph Attention Networks"));

        let saved = sink.saved.lock().unwrap();
        assert_eq!(saved.as_slice(), &[("dir-1".to_string(), "# 综述\n\n正文".to_string())]);

        let keys: std::collections::HashSet<_> = session
            .base_records
            .iter()
            .chain(session.expanded_records.iter())
            .map(|r| r.dedupe_key())
            .collect();
        assert_eq!(keys.len(), session.base_records.len() + session.expanded_records.len());
        assert_eq!(
            steps(&session),
            vec!["search_start", "search_done", "review_start", "review_done"]
        );
    }

    #[tokio::test]
    async fn duplicate_base_records_keep_keys_unique() {
        let backend = Scripted::new(vec![
            Reply::Answer(r#"[{"title": "DEEP learning-X"}, {"title": "Fresh Paper"}]"#),
            Reply::Answer("综述正文"),
        ]);
        let sink = Arc::new(MemorySink::default());
        let orch = orchestrator(backend.clone(), sink);
        let mut req = request(10);
        req.base_records.push(LiteratureRecord::uploaded("Deep-Learning X!"));
        req.base_records.push(LiteratureRecord::uploaded("deep learning x"));
        let mut session = AnchoringSession::new("dir-1");

        orch.run(&mut session, &req, &CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(session.stage, Stage::Done);
        assert_eq!(session.base_records.len(), 11);
        assert_eq!(session.base_records[10].title, "Deep-Learning X!");
        assert_eq!(session.expanded_records.len(), 1);
        assert_eq!(session.expanded_records[0].title, "Fresh Paper");

        let all: Vec<_> = session.base_records.iter().chain(session.expanded_records.iter()).collect();
        let keys: HashSet<_> = all.iter().map(|r| r.dedupe_key()).collect();
        assert_eq!(keys.len(), all.len());

        let calls = backend.calls();
        let search_prompt = &calls[0].1;
        assert_eq!(search_prompt.matches("deep learning x").count(), 0);
        assert_eq!(search_prompt.matches("Deep-Learning X!").count(), 1);
    }

    #[tokio::test]
    async fn one_retry_recovers_search() {
        let backend = Scripted::new(vec![
            Reply::Fail("flaky"),
            Reply::Answer("[]"),
            Reply::Answer("综述正文"),
        ]);
        let sink = Arc::new(MemorySink::default());
        let orch = orchestrator(backend.clone(), sink);
        let mut req = request(10);
        req.review_api = Some("openai".to_string());
        let mut session = AnchoringSession::new("dir-1");

        orch.run(&mut session, &req, &CancellationToken::new(), None)
            .await
            .unwrap();

        assert_eq!(session.stage, Stage::Done);
        let calls = backend.calls();
        assert_eq!(calls.len(), 3);
        assert_eq!(calls[2].0, "openai");
        assert!(steps(&session).contains(&"search_attempt_failed".to_string()));
    }

    #[tokio::test]
    async fn empty_review_is_an_error() {
        let backend = Scripted::new(vec![Reply::Answer("[]"), Reply::Answer("```\n```")]);
        let sink = Arc::new(MemorySink::default());
        let orch = orchestrator(backend, sink.clone());
        let mut session = AnchoringSession::new("dir-1");

        orch.run(&mut session, &request(10), &CancellationToken::new(), None)
            .await
            .unwrap();
        assert_eq!(session.stage, Stage::Error);
        assert!(sink.saved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_returns_to_idle_silently() {
        let backend = Scripted::new(vec![Reply::Hang]);
        let sink = Arc::new(MemorySink::default());
        let orch = orchestrator(backend, sink);
        let store = SessionStore::new();
        let (mut session, token) = store.begin("dir-1").unwrap();

        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });
        orch.run(&mut session, &request(10), &token, Some(&store))
            .await
            .unwrap();

        assert_eq!(session.stage, Stage::Idle);
        assert!(session.message.is_none());
        assert_eq!(store.snapshot("dir-1").unwrap().stage, Stage::Idle);
    }

    #[test]
    fn store_is_single_flight_per_direction() {
        let store = SessionStore::new();
        let (session, _token) = store.begin("dir-1").unwrap();
        assert!(matches!(store.begin("dir-1"), Err(AnchorError::AlreadyRunning(_))));
        assert!(store.begin("dir-2").is_ok());
        assert!(store.is_running("dir-1"));

        store.finish(session);
        assert!(!store.is_running("dir-1"));
        assert!(!store.cancel("dir-1"));
        let (fresh, _) = store.begin("dir-1").unwrap();
        assert_eq!(fresh.stage, Stage::Idle);
    }

    #[test]
    fn cancel_fires_the_session_token() {
        let store = SessionStore::new();
        let (_session, token) = store.begin("dir-1").unwrap();
        assert!(store.cancel("dir-1"));
        assert!(token.is_cancelled());
    }
}
