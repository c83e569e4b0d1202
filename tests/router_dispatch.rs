use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router as AxumRouter};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

use modelgate::util::{build_http_client_from_env, init_tracing, millis_until_next_minute};
use modelgate::{
    spawn_health_checks, Capabilities, MemoryStore, ProviderConfig, RequestContext, RouteError,
    Router, RouterConfig, ScoreWeights, StaticBalance, TierLimits, DEFAULT_PRIMARY_ID,
};

#[derive(Clone)]
struct UpstreamState {
    hits: Arc<AtomicUsize>,
    response: Arc<Value>,
    status: StatusCode,
    last_user_agent: Arc<Mutex<Option<String>>>,
}

async fn handle_chat(
    State(state): State<UpstreamState>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    state.hits.fetch_add(1, Ordering::SeqCst);
    if let Some(agent) = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
    {
        if let Ok(mut slot) = state.last_user_agent.lock() {
            *slot = Some(agent.to_string());
        }
    }
    (state.status, Json(state.response.as_ref().clone()))
}

async fn handle_models() -> Json<Value> {
    Json(json!({"data": []}))
}

struct MockUpstream {
    base_url: String,
    hits: Arc<AtomicUsize>,
    last_user_agent: Arc<Mutex<Option<String>>>,
    join: JoinHandle<()>,
}

impl MockUpstream {
    async fn start(status: StatusCode, response: Value) -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let last_user_agent = Arc::new(Mutex::new(None));
        let state = UpstreamState {
            hits: hits.clone(),
            response: Arc::new(response),
            status,
            last_user_agent: last_user_agent.clone(),
        };

        let app = AxumRouter::new()
            .route("/chat/completions", post(handle_chat))
            .route("/models", get(handle_models))
            .with_state(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind upstream");
        let addr = listener.local_addr().expect("local addr");
        let base_url = format!("http://{}", addr);

        let join = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("upstream server");
        });

        Self {
            base_url,
            hits,
            last_user_agent,
            join,
        }
    }

    fn hit_count(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn last_user_agent(&self) -> Option<String> {
        self.last_user_agent.lock().ok().and_then(|slot| slot.clone())
    }
}

impl Drop for MockUpstream {
    fn drop(&mut self) {
        self.join.abort();
    }
}

/// Upstream that advertises a longer body than it sends, then closes the
/// connection, so the client fails while reading the response body.
struct TruncatingUpstream {
    base_url: String,
    join: JoinHandle<()>,
}

impl TruncatingUpstream {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind upstream");
        let addr = listener.local_addr().expect("local addr");
        let base_url = format!("http://{}", addr);

        let join = tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let mut request = Vec::new();
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                request.extend_from_slice(&buf[..n]);
                                if request.windows(4).any(|w| w == b"\r\n\r\n") {
                                    break;
                                }
                            }
                        }
                    }
                    let _ = socket
                        .write_all(
                            b"HTTP/1.1 200 OK\r\n\
                              content-type: application/json\r\n\
                              content-length: 100\r\n\r\n\
                              {\"partial\":",
                        )
                        .await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { base_url, join }
    }
}

impl Drop for TruncatingUpstream {
    fn drop(&mut self) {
        self.join.abort();
    }
}

fn provider(id: &str, base_url: &str, priority: u32) -> ProviderConfig {
    ProviderConfig {
        id: id.to_string(),
        base_url: base_url.to_string(),
        priority,
        capabilities: Capabilities {
            gpt: true,
            ..Capabilities::default()
        },
        requests_per_minute: 60,
        tokens_per_minute: 100_000,
        api_key_env: None,
        headers: HashMap::new(),
    }
}

fn config(
    providers: Vec<ProviderConfig>,
    model_providers: HashMap<String, Vec<String>>,
    tiers: TierLimits,
) -> RouterConfig {
    RouterConfig {
        providers,
        model_providers,
        primary_id: DEFAULT_PRIMARY_ID.to_string(),
        endpoint_suffix: "/chat/completions".to_string(),
        weights: ScoreWeights::default(),
        tiers,
        request_timeout_secs: 5,
        health_check_secs: 60,
    }
}

fn build_router(config: RouterConfig, balance: StaticBalance) -> Router {
    init_tracing();
    Router::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(balance),
        build_http_client_from_env(),
    )
    .expect("router")
}

/// Keep window-sensitive tests away from a minute boundary.
async fn settle_window() {
    if millis_until_next_minute() < 3_000 {
        tokio::time::sleep(Duration::from_millis(millis_until_next_minute() + 50)).await;
    }
}

fn completion_payload() -> Value {
    json!({
        "model": "gpt-4o",
        "messages": [{"role": "user", "content": "hello"}]
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn best_provider_serves_and_is_recorded() {
    let fast = MockUpstream::start(StatusCode::OK, json!({"id": "resp-1", "ok": true})).await;
    let primary = MockUpstream::start(StatusCode::OK, json!({"id": "resp-primary"})).await;

    let mut map = HashMap::new();
    map.insert(
        "gpt-4o".to_string(),
        vec!["fast".to_string(), DEFAULT_PRIMARY_ID.to_string()],
    );
    let router = build_router(
        config(
            vec![
                provider(DEFAULT_PRIMARY_ID, &primary.base_url, 2),
                provider("fast", &fast.base_url, 1),
            ],
            map,
            TierLimits::default(),
        ),
        StaticBalance::with_balance("100", 1_000),
    );

    let routed = router
        .route("100", "gpt-4o", &completion_payload(), &RequestContext::default())
        .await
        .expect("routed");

    assert_eq!(routed.served_by, "fast");
    assert!(!routed.fallback);
    assert_eq!(routed.body.get("id").and_then(Value::as_str), Some("resp-1"));
    assert!(routed.estimated_tokens > 0);
    assert_eq!(fast.hit_count(), 1);
    assert_eq!(primary.hit_count(), 0);

    let snap = router.registry().snapshot("fast").expect("snapshot");
    assert_eq!(snap.usage.requests, 1);
    assert_eq!(snap.usage.tokens, routed.estimated_tokens);
    assert_eq!(snap.response_times.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_provider_falls_back_to_primary_once() {
    let flaky = MockUpstream::start(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({"error": "overloaded"}),
    )
    .await;
    let primary = MockUpstream::start(StatusCode::OK, json!({"id": "resp-primary"})).await;

    let mut map = HashMap::new();
    map.insert(
        "gpt-4o".to_string(),
        vec!["flaky".to_string(), DEFAULT_PRIMARY_ID.to_string()],
    );
    let router = build_router(
        config(
            vec![
                provider(DEFAULT_PRIMARY_ID, &primary.base_url, 5),
                provider("flaky", &flaky.base_url, 1),
            ],
            map,
            TierLimits::default(),
        ),
        StaticBalance::with_balance("100", 1_000),
    );

    let routed = router
        .route("100", "gpt-4o", &completion_payload(), &RequestContext::default())
        .await
        .expect("fallback should serve");

    assert_eq!(routed.served_by, DEFAULT_PRIMARY_ID);
    assert!(routed.fallback);
    assert_eq!(flaky.hit_count(), 1);
    assert_eq!(primary.hit_count(), 1);

    let snap = router.registry().snapshot("flaky").expect("snapshot");
    assert_eq!(snap.health_score, 90.0);
    assert_eq!(snap.failures.len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn truncated_body_triggers_primary_fallback() {
    let chopper = TruncatingUpstream::start().await;
    let primary = MockUpstream::start(StatusCode::OK, json!({"id": "resp-primary"})).await;

    let mut map = HashMap::new();
    map.insert(
        "gpt-4o".to_string(),
        vec!["chopper".to_string(), DEFAULT_PRIMARY_ID.to_string()],
    );
    let router = build_router(
        config(
            vec![
                provider(DEFAULT_PRIMARY_ID, &primary.base_url, 5),
                provider("chopper", &chopper.base_url, 1),
            ],
            map,
            TierLimits::default(),
        ),
        StaticBalance::with_balance("100", 1_000),
    );

    let routed = router
        .route("100", "gpt-4o", &completion_payload(), &RequestContext::default())
        .await
        .expect("fallback should serve");

    // The 200 status line does not rescue a connection dropped mid-body:
    // the attempt counts as a failure and the primary serves instead.
    assert_eq!(routed.served_by, DEFAULT_PRIMARY_ID);
    assert!(routed.fallback);
    assert_eq!(primary.hit_count(), 1);

    let snap = router.registry().snapshot("chopper").expect("snapshot");
    assert_eq!(snap.health_score, 90.0);
    assert_eq!(snap.failures.len(), 1);
    assert_eq!(snap.response_times.len(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn dispatch_sends_versioned_user_agent() {
    let upstream = MockUpstream::start(StatusCode::OK, json!({"id": "resp"})).await;

    let router = build_router(
        config(
            vec![provider(DEFAULT_PRIMARY_ID, &upstream.base_url, 1)],
            HashMap::new(),
            TierLimits::default(),
        ),
        StaticBalance::with_balance("100", 1_000),
    );

    router
        .route("100", "gpt-4o", &completion_payload(), &RequestContext::default())
        .await
        .expect("routed");

    let agent = upstream.last_user_agent().expect("user agent recorded");
    assert!(
        agent.starts_with("modelgate/"),
        "unexpected user agent: {agent}"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn fallback_failure_is_terminal() {
    let flaky = MockUpstream::start(StatusCode::BAD_GATEWAY, json!({"error": "down"})).await;
    let primary =
        MockUpstream::start(StatusCode::SERVICE_UNAVAILABLE, json!({"error": "down too"})).await;

    let mut map = HashMap::new();
    map.insert("gpt-4o".to_string(), vec!["flaky".to_string()]);
    let router = build_router(
        config(
            vec![
                provider(DEFAULT_PRIMARY_ID, &primary.base_url, 5),
                provider("flaky", &flaky.base_url, 1),
            ],
            map,
            TierLimits::default(),
        ),
        StaticBalance::with_balance("100", 1_000),
    );

    let err = router
        .route("100", "gpt-4o", &completion_payload(), &RequestContext::default())
        .await
        .expect_err("should be terminal");

    assert!(matches!(err, RouteError::Terminal { .. }));
    assert_eq!(flaky.hit_count(), 1);
    assert_eq!(primary.hit_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn exhausted_budget_rejects_before_dispatch() {
    settle_window().await;
    let upstream = MockUpstream::start(StatusCode::OK, json!({"id": "resp"})).await;

    let tiers = TierLimits {
        default_per_minute: 2,
        premium_per_minute: 30,
        premium_threshold: 50_000,
    };
    let router = build_router(
        config(
            vec![provider(DEFAULT_PRIMARY_ID, &upstream.base_url, 1)],
            HashMap::new(),
            tiers,
        ),
        StaticBalance::with_balance("200", 1_000),
    );

    for _ in 0..2 {
        router
            .route("200", "gpt-4o", &completion_payload(), &RequestContext::default())
            .await
            .expect("within budget");
    }

    let err = router
        .route("200", "gpt-4o", &completion_payload(), &RequestContext::default())
        .await
        .expect_err("third call should be limited");

    match err {
        RouteError::RateLimited {
            limit,
            current,
            reset_in_ms,
        } => {
            assert_eq!(limit, 2);
            assert_eq!(current, 2);
            assert!(reset_in_ms <= 60_000);
        }
        other => panic!("unexpected error: {other}"),
    }
    // The rejected request never reached the upstream.
    assert_eq!(upstream.hit_count(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn newly_added_provider_serves_its_model() {
    let primary = MockUpstream::start(StatusCode::OK, json!({"id": "resp-primary"})).await;
    let newcomer = MockUpstream::start(StatusCode::OK, json!({"id": "resp-new"})).await;

    let mut map = HashMap::new();
    map.insert("llama-3-70b".to_string(), vec!["newcomer".to_string()]);
    let router = build_router(
        config(
            vec![provider(DEFAULT_PRIMARY_ID, &primary.base_url, 1)],
            map,
            TierLimits::default(),
        ),
        StaticBalance::with_balance("300", 1_000),
    );

    router
        .registry()
        .add(provider("newcomer", &newcomer.base_url, 1));

    let routed = router
        .route(
            "300",
            "llama-3-70b",
            &completion_payload(),
            &RequestContext::default(),
        )
        .await
        .expect("routed");

    assert_eq!(routed.served_by, "newcomer");
    assert_eq!(newcomer.hit_count(), 1);
    assert_eq!(primary.hit_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn health_checks_probe_off_the_request_path() {
    let upstream = MockUpstream::start(StatusCode::OK, json!({})).await;

    let router = build_router(
        config(
            vec![provider(DEFAULT_PRIMARY_ID, &upstream.base_url, 1)],
            HashMap::new(),
            TierLimits::default(),
        ),
        StaticBalance::with_balance("400", 1_000),
    );

    let handle = spawn_health_checks(
        router.registry(),
        reqwest::Client::new(),
        Duration::from_millis(50),
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    handle.abort();

    let snap = router.registry().primary();
    assert!(!snap.response_times.is_empty());
    // Probes record zero tokens; the token window stays untouched.
    assert_eq!(snap.usage.tokens, 0);
    assert_eq!(snap.health_score, 100.0);
}
