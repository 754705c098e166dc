use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query};
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use lantern_control_plane::{
    status_path, ControlRequest, ControlResponse, ControlStatus, InferenceRequest,
    InferenceResponse, Phase, StatusEvent,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::broadcaster::Subscription;
use crate::config::{SecurityConfig, ServerConfig};
use crate::error::ControlError;
use crate::instance::InstanceSnapshot;
use crate::orchestrator::LifecycleOrchestrator;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub orchestrator: LifecycleOrchestrator,
}

impl AppState {
    pub fn new(config: ServerConfig, orchestrator: LifecycleOrchestrator) -> Self {
        Self {
            config: Arc::new(config),
            orchestrator,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health-check", get(health_check))
        .route("/control", post(control))
        .route("/control/:device_id/teardown", post(retry_teardown))
        .route("/status/:device_id", get(status_stream))
        .route("/respond", post(respond))
        .fallback(fallback)
        .layer(Extension(state))
}

/// Browsers cannot set headers on a WebSocket upgrade, so the key may also
/// ride in the query string.
#[derive(Debug, Default, Deserialize)]
pub struct AuthQuery {
    #[serde(default)]
    api_key: Option<String>,
}

pub async fn control(
    Extension(state): Extension<AppState>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<ControlResponse>), ControlError> {
    authorize(&state.config.security, &headers, query.api_key.as_deref(), false)?;
    let request: ControlRequest = parse_body(&body)?;
    let device_id = request.device_id.trim();
    if device_id.is_empty() {
        return Err(ControlError::MalformedRequest(
            "device_id must be non-empty".to_string(),
        ));
    }
    debug!(device_id, run = request.run, timestamp = %request.timestamp, "control request");

    match state.orchestrator.request(device_id, request.run) {
        Ok(transition) => {
            let status = if request.run {
                ControlStatus::Init
            } else {
                ControlStatus::Stopping
            };
            let body = control_response(
                &state.config,
                &headers,
                device_id,
                status,
                transition.to,
                transition.compute_instance(),
            );
            Ok((StatusCode::ACCEPTED, Json(body)))
        }
        Err(ControlError::Conflict {
            device_id: holder,
            phase,
        }) => {
            let status = ControlStatus::rejected(phase);
            warn!(
                device_id,
                holder = %holder,
                run = request.run,
                %phase,
                ?status,
                "control request rejected"
            );
            let compute_instance = state
                .orchestrator
                .registry()
                .snapshot(&holder)
                .map(|snapshot| snapshot.compute_instance())
                .unwrap_or_default();
            let body = control_response(
                &state.config,
                &headers,
                device_id,
                status,
                phase,
                compute_instance,
            );
            Ok((StatusCode::CONFLICT, Json(body)))
        }
        Err(err) => Err(err),
    }
}

pub async fn retry_teardown(
    Extension(state): Extension<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Result<(StatusCode, Json<ControlResponse>), ControlError> {
    authorize(&state.config.security, &headers, query.api_key.as_deref(), false)?;
    let transition = state.orchestrator.retry_teardown(&device_id)?;
    let body = control_response(
        &state.config,
        &headers,
        &device_id,
        ControlStatus::Stopping,
        transition.to,
        transition.compute_instance(),
    );
    Ok((StatusCode::ACCEPTED, Json(body)))
}

pub async fn status_stream(
    Extension(state): Extension<AppState>,
    Path(device_id): Path<String>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, ControlError> {
    authorize(&state.config.security, &headers, query.api_key.as_deref(), true)?;
    // Subscribe before upgrading so nothing published during the handshake
    // is missed.
    let (subscription, snapshot) = state.orchestrator.registry().subscribe(&device_id);
    Ok(ws.on_upgrade(move |socket| stream_status(state, socket, subscription, snapshot)))
}

async fn stream_status(
    state: AppState,
    mut socket: WebSocket,
    mut subscription: Subscription,
    snapshot: Option<InstanceSnapshot>,
) {
    let device_id = subscription.device_id().to_string();
    info!(device_id = %device_id, "status stream opened");

    if let Some(snapshot) = snapshot {
        if send_event(&mut socket, &snapshot.status_event()).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else { break };
                if send_event(&mut socket, &event).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(_))) => {
                    state.orchestrator.record_activity(&device_id);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            }
        }
    }

    info!(
        device_id = %device_id,
        dropped = subscription.dropped(),
        "status stream closed"
    );
}

async fn send_event(socket: &mut WebSocket, event: &StatusEvent) -> Result<(), axum::Error> {
    let payload = serde_json::to_string(event).map_err(axum::Error::new)?;
    socket.send(Message::Text(payload)).await
}

pub async fn respond(
    Extension(state): Extension<AppState>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<InferenceResponse>, ControlError> {
    let started = Instant::now();
    authorize(&state.config.security, &headers, query.api_key.as_deref(), false)?;
    let request: InferenceRequest = parse_body(&body)?;

    // A device that never issued a control request has nothing running.
    match state
        .orchestrator
        .record_activity(&request.device_id)
        .unwrap_or(Phase::Idle)
    {
        Phase::Running => {
            info!(
                device_id = %request.device_id,
                prompt_chars = request.prompt.chars().count(),
                "inference prompt received"
            );
            Ok(Json(InferenceResponse {
                status: "received".to_string(),
                response: "prompt received".to_string(),
                latency: format!("{}ms", started.elapsed().as_millis()),
            }))
        }
        phase => Err(ControlError::Conflict {
            device_id: request.device_id,
            phase,
        }),
    }
}

pub async fn health_check() -> Result<Json<()>, (StatusCode, String)> {
    Ok(Json(()))
}

pub async fn fallback(uri: Uri) -> impl IntoResponse {
    (StatusCode::NOT_FOUND, format!("No route for {uri}"))
}

fn parse_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, ControlError> {
    serde_json::from_slice(body).map_err(|err| ControlError::MalformedRequest(err.to_string()))
}

fn control_response(
    config: &ServerConfig,
    headers: &HeaderMap,
    device_id: &str,
    status: ControlStatus,
    phase: Phase,
    compute_instance: String,
) -> ControlResponse {
    ControlResponse {
        status,
        phase,
        websocket_url: websocket_url(config, headers, device_id),
        compute_instance,
        ready: phase == Phase::Running,
        cost_per_hour: config.cost_per_hour,
        idle_after_min: config.idle_after_min(),
    }
}

fn websocket_url(config: &ServerConfig, headers: &HeaderMap, device_id: &str) -> String {
    match &config.public_ws_base_url {
        Some(base) => format!("{base}{}", status_path(device_id)),
        None => {
            let host = headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
                .unwrap_or_else(|| format!("localhost:{}", config.port));
            format!("ws://{host}{}", status_path(device_id))
        }
    }
}

fn authorize(
    security: &SecurityConfig,
    headers: &HeaderMap,
    query_key: Option<&str>,
    require_origin: bool,
) -> Result<(), ControlError> {
    let presented = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
        })
        .or(query_key);
    match presented {
        Some(key) if keys_match(key.trim(), &security.api_key) => {}
        _ => return Err(ControlError::Unauthorized),
    }

    match headers.get(header::ORIGIN) {
        Some(origin) => {
            let origin = origin.to_str().unwrap_or_default();
            if origin != security.accepted_origin {
                return Err(ControlError::ForbiddenOrigin(origin.to_string()));
            }
        }
        None if require_origin => {
            return Err(ControlError::ForbiddenOrigin("<missing>".to_string()));
        }
        None => {}
    }
    Ok(())
}

fn keys_match(presented: &str, expected: &str) -> bool {
    let (a, b) = (presented.as_bytes(), expected.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::StatusBroadcaster;
    use crate::config::LifecycleConfig;
    use crate::instance::{InstanceHandle, InstanceRegistry};
    use crate::provider::ProviderAdapter;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio_tungstenite::connect_async;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
    use tower::ServiceExt;

    const API_KEY: &str = "test-secret";
    const ORIGIN: &str = "https://app.example";

    #[derive(Default)]
    struct InstantAdapter {
        starts: AtomicUsize,
    }

    #[async_trait]
    impl ProviderAdapter for InstantAdapter {
        fn name(&self) -> &'static str {
            "instant"
        }

        async fn start(&self, _device_id: &str) -> anyhow::Result<InstanceHandle> {
            let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(InstanceHandle::new(format!("inst-{n}")))
        }

        async fn stop(&self, _handle: &InstanceHandle) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn test_config() -> ServerConfig {
        ServerConfig {
            port: 8000,
            public_ws_base_url: None,
            cost_per_hour: 0.42,
            subscriber_queue_capacity: 16,
            shutdown_grace: Duration::from_secs(1),
            security: SecurityConfig {
                api_key: API_KEY.to_string(),
                accepted_origin: ORIGIN.to_string(),
            },
            lifecycle: LifecycleConfig {
                idle_after: None,
                ..LifecycleConfig::default()
            },
        }
    }

    fn test_state_with(config: ServerConfig, adapter: Arc<InstantAdapter>) -> AppState {
        let broadcaster = Arc::new(StatusBroadcaster::new(config.subscriber_queue_capacity));
        let registry = Arc::new(InstanceRegistry::new(broadcaster));
        let orchestrator = LifecycleOrchestrator::new(registry, adapter, config.lifecycle.clone());
        AppState::new(config, orchestrator)
    }

    fn test_state() -> AppState {
        test_state_with(test_config(), Arc::new(InstantAdapter::default()))
    }

    fn control_request(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/control")
            .header("host", "api.example:8000")
            .header("content-type", "application/json")
            .header("x-api-key", API_KEY)
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn send(state: &AppState, request: Request<Body>) -> (StatusCode, Value) {
        let response = router(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = hyper::body::to_bytes(response.into_body()).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn wait_for_phase(state: &AppState, device_id: &str, phase: Phase) {
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let current = state
                    .orchestrator
                    .registry()
                    .snapshot(device_id)
                    .map(|s| s.phase);
                if current == Some(phase) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("phase reached");
    }

    #[tokio::test]
    async fn control_accepts_start_then_reports_conflicts() {
        let state = test_state();

        let (status, body) = send(
            &state,
            control_request(json!({"device_id": "dev1", "timestamp": "t0", "run": true})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "init");
        assert_eq!(body["phase"], "starting");
        assert_eq!(body["websocket_url"], "ws://api.example:8000/status/dev1");
        assert_eq!(body["compute_instance"], "");
        assert_eq!(body["ready"], false);
        assert_eq!(body["cost_per_hour"], 0.42);

        wait_for_phase(&state, "dev1", Phase::Running).await;
        let (status, body) = send(
            &state,
            control_request(json!({"device_id": "dev1", "timestamp": "t1", "run": true})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], "already-running");
        assert_eq!(body["ready"], true);
        assert_eq!(body["compute_instance"], "inst-1");

        let (status, body) = send(
            &state,
            control_request(json!({"device_id": "dev1", "timestamp": "t2", "run": false})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["status"], "stopping");

        wait_for_phase(&state, "dev1", Phase::Idle).await;
        let (status, body) = send(
            &state,
            control_request(json!({"device_id": "dev1", "timestamp": "t3", "run": false})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], "already-idle");
    }

    #[tokio::test]
    async fn control_rejects_second_device_while_instance_is_held() {
        let state = test_state();
        let (status, _) = send(
            &state,
            control_request(json!({"device_id": "dev1", "timestamp": "t0", "run": true})),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        wait_for_phase(&state, "dev1", Phase::Running).await;

        let (status, body) = send(
            &state,
            control_request(json!({"device_id": "dev2", "timestamp": "t1", "run": true})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["status"], "already-running");
        assert_eq!(body["phase"], "running");
        assert_eq!(body["compute_instance"], "inst-1");
        assert_eq!(body["websocket_url"], "ws://api.example:8000/status/dev2");

        let snapshot = state.orchestrator.registry().snapshot("dev2").expect("record");
        assert_eq!(snapshot.phase, Phase::Idle);
    }

    #[tokio::test]
    async fn control_rejects_malformed_bodies() {
        let state = test_state();
        let (status, body) = send(&state, control_request(json!({"device_id": "dev1"}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "malformed_request");

        let (status, body) = send(
            &state,
            control_request(json!({"device_id": "  ", "timestamp": "t", "run": true})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "malformed_request");
        assert!(state.orchestrator.registry().device_ids().is_empty());
    }

    #[tokio::test]
    async fn control_enforces_key_and_origin() {
        let state = test_state();
        let body = json!({"device_id": "dev1", "timestamp": "t", "run": true}).to_string();

        let missing_key = Request::builder()
            .method("POST")
            .uri("/control")
            .body(Body::from(body.clone()))
            .unwrap();
        let (status, json) = send(&state, missing_key).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(json["code"], "unauthorized");

        let wrong_origin = Request::builder()
            .method("POST")
            .uri("/control")
            .header("authorization", format!("Bearer {API_KEY}"))
            .header("origin", "https://evil.example")
            .body(Body::from(body.clone()))
            .unwrap();
        let (status, json) = send(&state, wrong_origin).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(json["code"], "forbidden_origin");
        assert!(state.orchestrator.registry().device_ids().is_empty());

        let query_key = Request::builder()
            .method("POST")
            .uri(format!("/control?api_key={API_KEY}"))
            .header("origin", ORIGIN)
            .body(Body::from(body))
            .unwrap();
        let (status, _) = send(&state, query_key).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn public_base_url_overrides_host_header() {
        let mut config = test_config();
        config.public_ws_base_url = Some("wss://lantern.example".to_string());
        let state = test_state_with(config, Arc::new(InstantAdapter::default()));
        let (_, body) = send(
            &state,
            control_request(json!({"device_id": "dev9", "timestamp": "t", "run": true})),
        )
        .await;
        assert_eq!(body["websocket_url"], "wss://lantern.example/status/dev9");
        assert_eq!(body["idle_after_min"], 0.0);
    }

    #[tokio::test]
    async fn respond_requires_running_instance() {
        let state = test_state();
        let respond_request = |device_id: &str| {
            Request::builder()
                .method("POST")
                .uri("/respond")
                .header("x-api-key", API_KEY)
                .body(Body::from(
                    json!({"device_id": device_id, "timestamp": "t", "prompt": "hello"})
                        .to_string(),
                ))
                .unwrap()
        };

        let (status, body) = send(&state, respond_request("ghost")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "conflict");

        state.orchestrator.request("dev1", true).expect("start");
        wait_for_phase(&state, "dev1", Phase::Running).await;
        let (status, body) = send(&state, respond_request("dev1")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "received");
        assert!(body["latency"].as_str().unwrap().ends_with("ms"));

        state.orchestrator.request("dev1", false).expect("stop");
        wait_for_phase(&state, "dev1", Phase::Idle).await;
        let (status, body) = send(&state, respond_request("dev1")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "conflict");
    }

    #[tokio::test]
    async fn teardown_retry_rejects_healthy_records() {
        let state = test_state();
        let retry = |device_id: &str| {
            Request::builder()
                .method("POST")
                .uri(format!("/control/{device_id}/teardown"))
                .header("x-api-key", API_KEY)
                .body(Body::empty())
                .unwrap()
        };
        let (status, _) = send(&state, retry("ghost")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        state.orchestrator.request("dev1", true).expect("start");
        wait_for_phase(&state, "dev1", Phase::Running).await;
        let (status, body) = send(&state, retry("dev1")).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "conflict");
    }

    #[tokio::test]
    async fn health_check_needs_no_key() {
        let state = test_state();
        let request = Request::builder()
            .uri("/health-check")
            .body(Body::empty())
            .unwrap();
        let (status, _) = send(&state, request).await;
        assert_eq!(status, StatusCode::OK);
    }

    async fn spawn_server(state: AppState) -> std::net::SocketAddr {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = axum::Server::from_tcp(listener)
            .unwrap()
            .serve(router(state).into_make_service());
        tokio::spawn(server);
        addr
    }

    async fn next_frame<S>(stream: &mut S) -> Value
    where
        S: futures::Stream<Item = Result<WsMessage, WsError>> + Unpin,
    {
        let frame = tokio::time::timeout(Duration::from_secs(3), stream.next())
            .await
            .expect("frame within deadline")
            .expect("stream open")
            .expect("frame ok");
        match frame {
            WsMessage::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn status_stream_delivers_own_device_events() {
        let state = test_state();
        let addr = spawn_server(state.clone()).await;

        let mut request = format!("ws://{addr}/status/dev1?api_key={API_KEY}")
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert("origin", HeaderValue::from_static(ORIGIN));
        let (mut stream, _) = connect_async(request).await.expect("upgrade");

        state.orchestrator.request("dev2", true).expect("start dev2");
        wait_for_phase(&state, "dev2", Phase::Running).await;
        state.orchestrator.request("dev2", false).expect("stop dev2");
        wait_for_phase(&state, "dev2", Phase::Idle).await;
        state.orchestrator.request("dev1", true).expect("start dev1");

        let starting = next_frame(&mut stream).await;
        assert_eq!(starting["device_id"], "dev1");
        assert_eq!(starting["status"], "starting");
        let running = next_frame(&mut stream).await;
        assert_eq!(running["device_id"], "dev1");
        assert_eq!(running["status"], "running");

        let before = state
            .orchestrator
            .registry()
            .snapshot("dev1")
            .unwrap()
            .last_active;
        stream
            .send(WsMessage::Text("heartbeat".into()))
            .await
            .expect("send heartbeat");
        tokio::time::timeout(Duration::from_secs(3), async {
            loop {
                let now = state.orchestrator.registry().snapshot("dev1").unwrap().last_active;
                if now > before {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("heartbeat counted as activity");
    }

    #[tokio::test]
    async fn status_stream_starts_with_snapshot_for_known_device() {
        let state = test_state();
        state.orchestrator.request("dev1", true).expect("start");
        wait_for_phase(&state, "dev1", Phase::Running).await;
        let addr = spawn_server(state.clone()).await;

        let mut request = format!("ws://{addr}/status/dev1")
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert("x-api-key", HeaderValue::from_static(API_KEY));
        request
            .headers_mut()
            .insert("origin", HeaderValue::from_static(ORIGIN));
        let (mut stream, _) = connect_async(request).await.expect("upgrade");

        let snapshot = next_frame(&mut stream).await;
        assert_eq!(snapshot["status"], "running");
        assert_eq!(snapshot["device_id"], "dev1");
    }

    #[tokio::test]
    async fn status_stream_requires_origin_and_key() {
        let state = test_state();
        let addr = spawn_server(state).await;

        let no_origin = format!("ws://{addr}/status/dev1?api_key={API_KEY}")
            .into_client_request()
            .unwrap();
        match connect_async(no_origin).await.expect_err("origin required") {
            WsError::Http(response) => assert_eq!(response.status(), 403),
            other => panic!("unexpected ws error: {other:?}"),
        }

        let mut no_key = format!("ws://{addr}/status/dev1")
            .into_client_request()
            .unwrap();
        no_key
            .headers_mut()
            .insert("origin", HeaderValue::from_static(ORIGIN));
        match connect_async(no_key).await.expect_err("key required") {
            WsError::Http(response) => assert_eq!(response.status(), 401),
            other => panic!("unexpected ws error: {other:?}"),
        }
    }
}
