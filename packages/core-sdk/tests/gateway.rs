use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

use scholaranchor_core_sdk::attachments::Attachment;
use scholaranchor_core_sdk::config::GatewayTimeouts;
use scholaranchor_core_sdk::error::GatewayError;
use scholaranchor_core_sdk::gateway::{CallOptions, CallStatus, CredentialSource, FailureKind, Gateway};
use scholaranchor_core_sdk::models::{ConfigKind, StoredCredential};
use scholaranchor_core_sdk::vault::Vault;

const CHAT_PATH: &str = "/v1/chat/completions";

struct MapCredentials(HashMap<String, StoredCredential>);

impl CredentialSource for MapCredentials {
    fn credential(&self, _caller: &str, api_name: &str) -> anyhow::Result<Option<StoredCredential>> {
        Ok(self.0.get(api_name).cloned())
    }
}

/** \brief 按顺序返回给定的聊天包络，超出后重复最后一个。 */
struct Rounds {
    replies: Vec<(&'static str, &'static str)>,
    hits: AtomicUsize,
}

impl Rounds {
    fn new(replies: Vec<(&'static str, &'static str)>) -> Self {
        Self {
            replies,
            hits: AtomicUsize::new(0),
        }
    }
}

impl Respond for Rounds {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let i = self.hits.fetch_add(1, Ordering::SeqCst);
        let (content, reason) = self.replies[i.min(self.replies.len() - 1)];
        ResponseTemplate::new(200).set_body_json(envelope(content, reason))
    }
}

fn envelope(content: &str, reason: &str) -> Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": content },
            "finish_reason": reason
        }]
    })
}

fn gateway_for(url: &str, api_key: Option<&str>, timeouts: GatewayTimeouts) -> Gateway {
    let vault = Arc::new(Vault::new([9u8; 32]));
    let cred = StoredCredential {
        api_name: "deepseek".to_string(),
        kind: ConfigKind::Cloud,
        endpoint_ciphertext: vault.encrypt(Some(url)).unwrap(),
        api_key_ciphertext: vault.encrypt(api_key).unwrap(),
        model_path: None,
        params_json: Some(r#"{"model":"deepseek-chat","temperature":0.2}"#.to_string()),
    };
    let creds = MapCredentials(HashMap::from([("deepseek".to_string(), cred)]));
    Gateway::new(vault, Arc::new(creds)).with_timeouts(timeouts)
}

fn short_timeouts() -> GatewayTimeouts {
    GatewayTimeouts {
        plain: Duration::from_secs(5),
        attachment: Duration::from_secs(5),
        probe: Duration::from_secs(1),
    }
}

async fn request_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|r| serde_json::from_slice(&r.body).unwrap())
        .collect()
}

#[tokio::test]
async fn truncated_rounds_are_continued_and_merged() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(Rounds::new(vec![("Part A. ", "length"), ("Part B. ", "length"), ("Part C.", "stop")]))
        .mount(&server)
        .await;

    let gw = gateway_for(&format!("{}{}", server.uri(), CHAT_PATH), None, short_timeouts());
    let opts = CallOptions {
        debug: true,
        ..Default::default()
    };
    let res = gw.complete("u", "deepseek", "写一篇综述", &[], &opts).await.unwrap();

    assert_eq!(res.status, CallStatus::Ok);
    assert_eq!(res.rounds_used, 3);
    assert_eq!(res.parsed_answer.as_deref(), Some("Part A. Part B. Part C."));

    let merged: Value = serde_json::from_str(res.raw_body.as_deref().unwrap()).unwrap();
    assert_eq!(merged["choices"].as_array().unwrap().len(), 1);
    assert_eq!(merged["choices"][0]["message"]["content"], "Part A. Part B. Part C.");
    assert_eq!(merged["choices"][0]["finish_reason"], "stop");
    assert_eq!(res.debug.as_ref().unwrap().loop_count, Some(3));

    let bodies = request_bodies(&server).await;
    assert_eq!(bodies.len(), 3);
    assert_eq!(bodies[0]["model"], "deepseek-chat");
    assert_eq!(bodies[0]["temperature"], 0.2);
    assert_eq!(bodies[0]["messages"].as_array().unwrap().len(), 1);

    let last = bodies[2]["messages"].as_array().unwrap();
    let roles: Vec<&str> = last.iter().map(|m| m["role"].as_str().unwrap()).collect();
    assert_eq!(roles, vec!["user", "assistant", "user", "assistant", "user"]);
    assert_eq!(last[1]["content"], "Part A. ");
    assert_eq!(last[3]["content"], "Part B. ");
}

#[tokio::test]
async fn continuation_stops_at_round_cap() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(Rounds::new(vec![("x", "length")]))
        .expect(5)
        .mount(&server)
        .await;

    let gw = gateway_for(&format!("{}{}", server.uri(), CHAT_PATH), None, short_timeouts());
    let res = gw
        .complete("u", "deepseek", "go", &[], &CallOptions::default())
        .await
        .unwrap();

    assert_eq!(res.status, CallStatus::Ok);
    assert_eq!(res.rounds_used, 5);
    assert_eq!(res.parsed_answer.as_deref(), Some("xxxxx"));
    assert!(res.debug.is_none());
}

#[tokio::test]
async fn single_round_keeps_upstream_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .and(header("authorization", "Bearer sk-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope("done", "stop")))
        .expect(1)
        .mount(&server)
        .await;

    let gw = gateway_for(&format!("{}{}", server.uri(), CHAT_PATH), Some("sk-secret"), short_timeouts());
    let opts = CallOptions {
        debug: true,
        trace_id: Some("req-7".to_string()),
        cancel: None,
    };
    let res = gw.complete("u", "deepseek", "hi", &[], &opts).await.unwrap();

    assert_eq!(res.rounds_used, 1);
    let body: Value = serde_json::from_str(res.raw_body.as_deref().unwrap()).unwrap();
    assert_eq!(body["id"], "chatcmpl-1");

    let debug = res.debug.as_ref().unwrap();
    assert_eq!(debug.headers_sent["Authorization"], "Bearer ****");
    assert_eq!(debug.status_code, Some(200));
    assert_eq!(debug.request_id.as_deref(), Some("req-7"));
    assert!(debug.loop_count.is_none());
    let envelope = serde_json::to_string(&res.envelope()).unwrap();
    assert!(!envelope.contains("sk-secret"));
}

#[tokio::test]
async fn unknown_endpoints_get_a_flat_prompt_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/generate"))
        .respond_with(ResponseTemplate::new(200).set_body_string("plain answer"))
        .mount(&server)
        .await;

    let gw = gateway_for(&format!("{}/generate", server.uri()), None, short_timeouts());
    let res = gw
        .complete("u", "deepseek", "hello", &[], &CallOptions::default())
        .await
        .unwrap();

    assert_eq!(res.status, CallStatus::Ok);
    assert_eq!(res.raw_body.as_deref(), Some("plain answer"));
    let bodies = request_bodies(&server).await;
    assert_eq!(bodies, vec![json!({ "prompt": "hello" })]);
}

#[tokio::test]
async fn upstream_error_status_is_a_business_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_string("overloaded"))
        .mount(&server)
        .await;

    let gw = gateway_for(&format!("{}{}", server.uri(), CHAT_PATH), None, short_timeouts());
    let res = gw
        .complete("u", "deepseek", "hi", &[], &CallOptions::default())
        .await
        .unwrap();

    assert_eq!(res.status, CallStatus::Error);
    assert_eq!(res.failure, Some(FailureKind::Upstream));
    assert_eq!(res.http_status, Some(500));
    assert_eq!(res.message.as_deref(), Some("Upstream returned HTTP 500"));
    assert_eq!(res.raw_body.as_deref(), Some("overloaded"));
}

#[tokio::test]
async fn slow_upstream_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope("late", "stop")).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let timeouts = GatewayTimeouts {
        plain: Duration::from_millis(200),
        ..short_timeouts()
    };
    let gw = gateway_for(&format!("{}{}", server.uri(), CHAT_PATH), None, timeouts);
    let res = gw
        .complete("u", "deepseek", "hi", &[], &CallOptions::default())
        .await
        .unwrap();

    assert_eq!(res.failure, Some(FailureKind::Timeout));
    assert_eq!(res.message.as_deref(), Some("Timeout"));
}

#[tokio::test]
async fn attachment_calls_use_the_longer_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope("ok", "stop")).set_delay(Duration::from_millis(400)))
        .mount(&server)
        .await;

    let timeouts = GatewayTimeouts {
        plain: Duration::from_millis(100),
        attachment: Duration::from_secs(5),
        probe: Duration::from_secs(1),
    };
    let gw = gateway_for(&format!("{}{}", server.uri(), CHAT_PATH), None, timeouts);
    let notes = Attachment {
        name: "notes.txt".to_string(),
        content_type: Some("text/plain".to_string()),
        bytes: b"graph neural networks".to_vec(),
    };
    let res = gw
        .complete("u", "deepseek", "总结附件", &[notes], &CallOptions::default())
        .await
        .unwrap();

    assert_eq!(res.status, CallStatus::Ok);
    let bodies = request_bodies(&server).await;
    let content = bodies[0]["messages"][0]["content"].as_str().unwrap();
    assert!(content.starts_with("总结附件\n\n[File: notes.txt]\ngraph neural networks\n---\n"));
}

#[tokio::test]
async fn cancellation_aborts_in_flight_call() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(envelope("late", "stop")).set_delay(Duration::from_secs(10)))
        .mount(&server)
        .await;

    let gw = gateway_for(&format!("{}{}", server.uri(), CHAT_PATH), None, short_timeouts());
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let opts = CallOptions {
        cancel: Some(token),
        ..Default::default()
    };
    let res = gw.complete("u", "deepseek", "hi", &[], &opts).await.unwrap();

    assert!(res.is_cancelled());
    assert_eq!(res.status, CallStatus::Error);
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn connection_failure_is_a_business_error() {
    let gw = gateway_for("http://127.0.0.1:9/v1/chat/completions", None, short_timeouts());
    let res = gw
        .complete("u", "deepseek", "hi", &[], &CallOptions::default())
        .await
        .unwrap();
    assert_eq!(res.status, CallStatus::Error);
    assert!(matches!(res.failure, Some(FailureKind::Transport) | Some(FailureKind::Timeout)));
}

#[tokio::test]
async fn unknown_api_name_is_a_hard_error() {
    let gw = gateway_for("http://127.0.0.1:9/", None, short_timeouts());
    let err = gw
        .complete("u", "missing", "hi", &[], &CallOptions::default())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::UnknownApi(_)));
    assert_eq!(err.to_string(), "No config for apiName 'missing'");
}

#[tokio::test]
async fn connection_test_counts_any_response_as_reachable() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(header("authorization", "Bearer sk-secret"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let gw = gateway_for(&format!("{}{}", server.uri(), CHAT_PATH), Some("sk-secret"), short_timeouts());
    let probe = gw.test_connection("u", "deepseek").await.unwrap();
    assert_eq!(probe.status, CallStatus::Ok);
}
