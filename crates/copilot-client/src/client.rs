//! Upstream dispatch with retry, rotation and quota reporting

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use copilot_auth::{
    API_VERSION, COPILOT_INTEGRATION_ID, DEFAULT_API_URL, EDITOR_PLUGIN_VERSION, EDITOR_VERSION,
    OPENAI_INTENT, OPENAI_INTENT_MODELS, OPENAI_ORGANIZATION, USER_AGENT,
};
use copilot_pool::{AccessToken, ErrorClassification, TokenManager, classify_status};
use reqwest::header::{AUTHORIZATION, HOST, HeaderMap, HeaderValue};

use crate::error::{Error, Result};
use crate::event::{AttemptEvent, AttemptObserver, AttemptOutcome, NoopObserver};
use crate::{RequestHandler, UpstreamRequest, UpstreamResponse};

#[derive(Debug, Clone)]
pub struct ClientSettings {
    /// Used unless the exchange announced an API base for the token.
    pub base_url: String,
    /// Per attempt.
    pub timeout: Duration,
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Refuse non-`/models` requests on tokens that report usage telemetry.
    pub block_telemetry: bool,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            timeout: Duration::from_secs(120),
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            block_telemetry: true,
        }
    }
}

impl ClientSettings {
    /// Delay before the `retry`-th transient retry (0-based): base doubled
    /// per retry, capped at `max_delay`.
    pub fn backoff(&self, retry: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry.min(16));
        self.base_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

pub struct ApiClient {
    http: reqwest::Client,
    manager: Arc<TokenManager>,
    settings: ClientSettings,
    observer: Arc<dyn AttemptObserver>,
}

impl ApiClient {
    pub fn new(http: reqwest::Client, manager: Arc<TokenManager>, settings: ClientSettings) -> Self {
        Self {
            http,
            manager,
            settings,
            observer: Arc::new(NoopObserver),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn AttemptObserver>) -> Self {
        self.observer = observer;
        self
    }

    /// Send `request` upstream, retrying within `max_attempts`.
    ///
    /// - transport errors, 408 and 5xx back off and retry on the same token
    /// - 401/403/429 report the quota carried in the body (if any) and move
    ///   to another token
    /// - 2xx and any other status are returned as-is
    ///
    /// Fails with `NoTokenAvailable` as soon as the pool has nothing to
    /// offer, with `TelemetryEnabled` when the selected token reports usage
    /// telemetry and the request is not a model listing, and with
    /// `UpstreamUnavailable` once the ceiling is reached.
    pub async fn dispatch(&self, request: UpstreamRequest) -> Result<UpstreamResponse> {
        let max_attempts = self.settings.max_attempts.max(1);
        let mut transient_retries = 0u32;
        let mut last = String::from("no attempt made");

        for attempt in 1..=max_attempts {
            let token = self.manager.get_token(false).await?;
            if self.settings.block_telemetry
                && token.telemetry_enabled
                && !request.path.starts_with("/models")
            {
                return Err(Error::TelemetryEnabled(token.id));
            }
            let started = Instant::now();

            let Some(headers) = upstream_headers(&request, &token) else {
                // Bearer value with bytes a header can't carry
                last = format!("token {} is not a valid header value", token.id);
                self.emit(attempt, token.id, AttemptOutcome::Unauthorized(0), started);
                self.rotate_away(token.id).await?;
                continue;
            };

            let url = format!(
                "{}{}",
                token
                    .api_base
                    .as_deref()
                    .unwrap_or(&self.settings.base_url)
                    .trim_end_matches('/'),
                request.path
            );

            let sent = self
                .http
                .request(request.method.clone(), &url)
                .headers(headers)
                .timeout(self.settings.timeout)
                .body(request.body.clone())
                .send()
                .await;
            let (status, resp_headers, body) = match sent {
                Ok(response) => {
                    let status = response.status();
                    let resp_headers = response.headers().clone();
                    match response.bytes().await {
                        Ok(body) => (status, resp_headers, body),
                        Err(e) => {
                            last = format!("upstream body read failed: {e}");
                            self.emit(attempt, token.id, AttemptOutcome::Transport(last.clone()), started);
                            self.back_off(attempt, max_attempts, &mut transient_retries).await;
                            continue;
                        }
                    }
                }
                Err(e) => {
                    last = format!("upstream request failed: {e}");
                    self.emit(attempt, token.id, AttemptOutcome::Transport(last.clone()), started);
                    self.back_off(attempt, max_attempts, &mut transient_retries).await;
                    continue;
                }
            };

            let code = status.as_u16();
            if status.is_success() {
                self.report_body_quota(token.id, &body).await;
                self.emit(attempt, token.id, AttemptOutcome::Success(code), started);
                return Ok(UpstreamResponse {
                    status,
                    headers: resp_headers,
                    body,
                    token_id: token.id,
                    attempts: attempt,
                });
            }

            match classify_status(code) {
                ErrorClassification::Rejected => {
                    self.emit(attempt, token.id, AttemptOutcome::Rejected(code), started);
                    return Ok(UpstreamResponse {
                        status,
                        headers: resp_headers,
                        body,
                        token_id: token.id,
                        attempts: attempt,
                    });
                }
                ErrorClassification::Transient => {
                    last = format!("upstream returned {status}");
                    self.emit(attempt, token.id, AttemptOutcome::Transient(code), started);
                    self.back_off(attempt, max_attempts, &mut transient_retries).await;
                }
                classification @ (ErrorClassification::QuotaExceeded
                | ErrorClassification::Unauthorized) => {
                    last = format!("upstream returned {status}");
                    let outcome = if classification == ErrorClassification::Unauthorized {
                        AttemptOutcome::Unauthorized(code)
                    } else {
                        AttemptOutcome::QuotaExceeded(code)
                    };
                    self.emit(attempt, token.id, outcome, started);

                    let retired = self.report_body_quota(token.id, &body).await;
                    if !retired {
                        self.rotate_away(token.id).await?;
                    }
                }
            }
        }

        Err(Error::UpstreamUnavailable {
            attempts: max_attempts,
            last,
        })
    }

    /// Feed `limited_user_quotas` from a response body back to the manager.
    /// Returns whether the token was retired. A bookkeeping failure goes to
    /// the observer and never fails the request.
    async fn report_body_quota(&self, token_id: u64, body: &[u8]) -> bool {
        let Ok(payload) = serde_json::from_slice::<serde_json::Value>(body) else {
            return false;
        };
        let tracker = self.manager.tracker();
        let Some(snapshot) = tracker.snapshot_of(&payload) else {
            return false;
        };
        let reset_at = tracker.reset_time_of(&payload);
        match self
            .manager
            .report_quota(token_id, snapshot, Some(reset_at))
            .await
        {
            Ok(retired) => retired,
            Err(e) => {
                self.observer.on_quota_report_failed(token_id, &e.to_string());
                false
            }
        }
    }

    /// Move off `failed_id`. A no-op if a concurrent request already did.
    async fn rotate_away(&self, failed_id: u64) -> Result<()> {
        let max = self.manager.settings().max_rotation_attempts;
        self.manager.rotate_from(failed_id, max).await?;
        Ok(())
    }

    async fn back_off(&self, attempt: u32, max_attempts: u32, retries: &mut u32) {
        if attempt >= max_attempts {
            return;
        }
        tokio::time::sleep(self.settings.backoff(*retries)).await;
        *retries += 1;
    }

    fn emit(&self, attempt: u32, token_id: u64, outcome: AttemptOutcome, started: Instant) {
        self.observer.on_attempt(&AttemptEvent {
            attempt,
            token_id,
            outcome,
            elapsed: started.elapsed(),
        });
    }
}

impl RequestHandler for ApiClient {
    fn handle(
        &self,
        request: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse>> + Send + '_>> {
        Box::pin(self.dispatch(request))
    }
}

/// Inbound headers minus `authorization`/`host`, plus the Copilot client
/// identity and the bearer token. `None` if the token can't be a header value.
fn upstream_headers(request: &UpstreamRequest, token: &AccessToken) -> Option<HeaderMap> {
    let mut headers = request.headers.clone();
    headers.remove(AUTHORIZATION);
    headers.remove(HOST);

    let bearer = HeaderValue::from_str(&format!("Bearer {}", token.value.expose())).ok()?;
    headers.insert(AUTHORIZATION, bearer);

    let intent = if request.path.starts_with("/models") {
        OPENAI_INTENT_MODELS
    } else {
        OPENAI_INTENT
    };
    for (name, value) in [
        ("copilot-integration-id", COPILOT_INTEGRATION_ID),
        ("editor-plugin-version", EDITOR_PLUGIN_VERSION),
        ("editor-version", EDITOR_VERSION),
        ("user-agent", USER_AGENT),
        ("x-github-api-version", API_VERSION),
        ("openai-intent", intent),
        ("openai-organization", OPENAI_ORGANIZATION),
    ] {
        headers.insert(name, HeaderValue::from_static(value));
    }
    Some(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::Router;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use bytes::Bytes;
    use copilot_auth::{
        AccessGrant, PassthroughExchange, TokenExchange, TokenState, TokenStore, unix_now,
    };
    use copilot_pool::{ManagerSettings, QuotaTracker};
    use reqwest::Method;

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<AttemptEvent>>,
        quota_failures: Mutex<Vec<(u64, String)>>,
    }

    impl AttemptObserver for RecordingObserver {
        fn on_attempt(&self, event: &AttemptEvent) {
            self.events.lock().unwrap().push(event.clone());
        }

        fn on_quota_report_failed(&self, token_id: u64, error: &str) {
            self.quota_failures
                .lock()
                .unwrap()
                .push((token_id, error.to_string()));
        }
    }

    impl RecordingObserver {
        fn outcomes(&self) -> Vec<(u64, AttemptOutcome)> {
            self.events
                .lock()
                .unwrap()
                .iter()
                .map(|e| (e.token_id, e.outcome.clone()))
                .collect()
        }
    }

    /// Start a mock upstream on an ephemeral port. The handler receives the
    /// hit counter (1-based) and the bearer token of each request.
    async fn start_upstream<F>(respond: F) -> (String, Arc<AtomicUsize>)
    where
        F: Fn(usize, String) -> (StatusCode, String) + Clone + Send + Sync + 'static,
    {
        let hits = Arc::new(AtomicUsize::new(0));
        let router = Router::new()
            .fallback(
                move |State(hits): State<Arc<AtomicUsize>>, headers: axum::http::HeaderMap| {
                    let respond = respond.clone();
                    async move {
                        let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
                        let bearer = headers
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .trim_start_matches("Bearer ")
                            .to_string();
                        let (status, body) = respond(n, bearer);
                        (
                            status,
                            [(axum::http::header::CONTENT_TYPE, "application/json")],
                            body,
                        )
                            .into_response()
                    }
                },
            )
            .with_state(hits.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{addr}"), hits)
    }

    async fn test_manager(dir: &tempfile::TempDir, secrets: &[&str]) -> Arc<TokenManager> {
        test_manager_with(dir, secrets, Arc::new(PassthroughExchange)).await
    }

    async fn test_manager_with(
        dir: &tempfile::TempDir,
        secrets: &[&str],
        exchange: Arc<dyn TokenExchange>,
    ) -> Arc<TokenManager> {
        let store = TokenStore::open(dir.path()).await.unwrap();
        for secret in secrets {
            store.insert(secret).await.unwrap();
        }
        Arc::new(TokenManager::new(
            Arc::new(store),
            QuotaTracker::default(),
            exchange,
            ManagerSettings::default(),
        ))
    }

    fn settings(base_url: &str, max_attempts: u32) -> ClientSettings {
        ClientSettings {
            base_url: base_url.to_string(),
            timeout: Duration::from_secs(5),
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            block_telemetry: true,
        }
    }

    fn chat_request() -> UpstreamRequest {
        UpstreamRequest {
            method: Method::POST,
            path: "/chat/completions".into(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(br#"{"model":"gpt-4o","messages":[]}"#),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let settings = ClientSettings {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            ..Default::default()
        };
        let delays: Vec<u128> = (0..6).map(|n| settings.backoff(n).as_millis()).collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
        assert_eq!(settings.backoff(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn headers_replace_inbound_authorization() {
        let mut request = chat_request();
        request
            .headers
            .insert(AUTHORIZATION, HeaderValue::from_static("Bearer client-key"));
        request
            .headers
            .insert(HOST, HeaderValue::from_static("localhost:8080"));
        request
            .headers
            .insert("x-request-id", HeaderValue::from_static("req_1"));
        let token = AccessToken {
            id: 1,
            value: common_secret("gho_pool"),
            expires_at: tokio::time::Instant::now(),
            api_base: None,
            telemetry_enabled: false,
        };

        let headers = upstream_headers(&request, &token).unwrap();
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer gho_pool");
        assert!(headers.get(HOST).is_none());
        assert_eq!(headers.get("x-request-id").unwrap(), "req_1");
        assert_eq!(headers.get("copilot-integration-id").unwrap(), "vscode-chat");
        assert_eq!(headers.get("openai-intent").unwrap(), "conversation-panel");
        assert_eq!(headers.get("x-github-api-version").unwrap(), "2024-12-15");
    }

    #[test]
    fn models_path_uses_model_access_intent() {
        let mut request = chat_request();
        request.method = Method::GET;
        request.path = "/models".into();
        let token = AccessToken {
            id: 1,
            value: common_secret("gho_pool"),
            expires_at: tokio::time::Instant::now(),
            api_base: None,
            telemetry_enabled: false,
        };
        let headers = upstream_headers(&request, &token).unwrap();
        assert_eq!(headers.get("openai-intent").unwrap(), "model-access");
    }

    fn common_secret(value: &str) -> common::Secret<String> {
        common::Secret::new(value.to_string())
    }

    #[tokio::test]
    async fn always_429_fails_after_exactly_max_attempts() {
        let (url, hits) = start_upstream(|_, _| {
            (StatusCode::TOO_MANY_REQUESTS, r#"{"error":"rate limited"}"#.into())
        })
        .await;
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, &["gho_a", "gho_b"]).await;
        let observer = Arc::new(RecordingObserver::default());
        let client = ApiClient::new(reqwest::Client::new(), manager.clone(), settings(&url, 4))
            .with_observer(observer.clone());

        let err = client.dispatch(chat_request()).await.unwrap_err();
        match err {
            Error::UpstreamUnavailable { attempts, last } => {
                assert_eq!(attempts, 4);
                assert!(last.contains("429"), "got {last}");
            }
            other => panic!("expected UpstreamUnavailable, got {other:?}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 4);

        let tokens: Vec<u64> = observer.outcomes().iter().map(|(id, _)| *id).collect();
        assert_eq!(tokens, vec![1, 2, 1, 2]);
        // No quota in the body, so nothing was retired
        assert_eq!(manager.available_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn success_sends_pool_token_and_reports_quota() {
        let (url, _hits) = start_upstream(|_, bearer| {
            (
                StatusCode::OK,
                serde_json::json!({
                    "seen": bearer,
                    "limited_user_quotas": {"chat": 3},
                })
                .to_string(),
            )
        })
        .await;
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, &["gho_a"]).await;
        let client = ApiClient::new(reqwest::Client::new(), manager.clone(), settings(&url, 3));

        let mut request = chat_request();
        request
            .headers
            .insert(AUTHORIZATION, HeaderValue::from_static("Bearer client-key"));
        let response = client.dispatch(request).await.unwrap();

        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.attempts, 1);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["seen"], "gho_a");

        let statuses = manager.list_status().await.unwrap();
        assert_eq!(statuses[0].quota.as_ref().and_then(|q| q.get("chat")), Some(3));
    }

    #[tokio::test]
    async fn spent_quota_in_429_body_retires_token_and_fails_over() {
        let reset = unix_now() + 7200;
        let (url, _hits) = start_upstream(move |_, bearer| {
            if bearer == "gho_a" {
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    serde_json::json!({
                        "limited_user_quotas": {"chat": 0},
                        "limited_user_reset_date": reset,
                    })
                    .to_string(),
                )
            } else {
                (StatusCode::OK, "{}".into())
            }
        })
        .await;
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, &["gho_a", "gho_b"]).await;
        let client = ApiClient::new(reqwest::Client::new(), manager.clone(), settings(&url, 3));

        let response = client.dispatch(chat_request()).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.token_id, 2);
        assert_eq!(response.attempts, 2);

        let statuses = manager.list_status().await.unwrap();
        assert_eq!(statuses[0].state, TokenState::Exhausted);
        assert_eq!(statuses[0].reset_at, Some(reset));
        assert_eq!(statuses[1].state, TokenState::Active);
    }

    #[tokio::test]
    async fn unauthorized_rotates_without_retiring() {
        let (url, _hits) = start_upstream(|_, bearer| {
            if bearer == "gho_a" {
                (StatusCode::UNAUTHORIZED, "bad token".into())
            } else {
                (StatusCode::OK, "{}".into())
            }
        })
        .await;
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, &["gho_a", "gho_b"]).await;
        let observer = Arc::new(RecordingObserver::default());
        let client = ApiClient::new(reqwest::Client::new(), manager.clone(), settings(&url, 3))
            .with_observer(observer.clone());

        let response = client.dispatch(chat_request()).await.unwrap();
        assert_eq!(response.token_id, 2);
        assert_eq!(
            observer.outcomes(),
            vec![
                (1, AttemptOutcome::Unauthorized(401)),
                (2, AttemptOutcome::Success(200)),
            ]
        );
        assert_eq!(manager.available_count().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn transient_error_retries_on_same_token() {
        let (url, hits) = start_upstream(|n, _| {
            if n == 1 {
                (StatusCode::SERVICE_UNAVAILABLE, "try later".into())
            } else {
                (StatusCode::OK, "{}".into())
            }
        })
        .await;
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, &["gho_a", "gho_b"]).await;
        let observer = Arc::new(RecordingObserver::default());
        let client = ApiClient::new(reqwest::Client::new(), manager, settings(&url, 3))
            .with_observer(observer.clone());

        let response = client.dispatch(chat_request()).await.unwrap();
        assert_eq!(response.attempts, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert_eq!(
            observer.outcomes(),
            vec![
                (1, AttemptOutcome::Transient(503)),
                (1, AttemptOutcome::Success(200)),
            ]
        );
    }

    #[tokio::test]
    async fn client_errors_are_returned_not_retried() {
        let (url, hits) = start_upstream(|_, _| {
            (StatusCode::BAD_REQUEST, r#"{"error":"bad model"}"#.into())
        })
        .await;
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, &["gho_a"]).await;
        let client = ApiClient::new(reqwest::Client::new(), manager, settings(&url, 5));

        let response = client.dispatch(chat_request()).await.unwrap();
        assert_eq!(response.status, StatusCode::BAD_REQUEST);
        assert_eq!(response.attempts, 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn empty_pool_fails_without_calling_upstream() {
        let (url, hits) = start_upstream(|_, _| (StatusCode::OK, "{}".into())).await;
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, &[]).await;
        let client = ApiClient::new(reqwest::Client::new(), manager, settings(&url, 5));

        let err = client.dispatch(chat_request()).await.unwrap_err();
        assert!(matches!(err, Error::NoTokenAvailable(_)), "got {err:?}");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unreachable_upstream_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, &["gho_a"]).await;
        let observer = Arc::new(RecordingObserver::default());
        let client = ApiClient::new(
            reqwest::Client::new(),
            manager,
            settings("http://127.0.0.1:1", 2),
        )
        .with_observer(observer.clone());

        let err = client.dispatch(chat_request()).await.unwrap_err();
        assert!(
            matches!(err, Error::UpstreamUnavailable { attempts: 2, .. }),
            "got {err:?}"
        );
        let outcomes = observer.outcomes();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, o)| o.label() == "transport"));
    }

    struct AnnouncingExchange {
        api_base: String,
    }

    impl TokenExchange for AnnouncingExchange {
        fn id(&self) -> &str {
            "announcing"
        }

        fn exchange<'a>(
            &'a self,
            secret: &'a common::Secret<String>,
        ) -> Pin<Box<dyn Future<Output = copilot_auth::Result<AccessGrant>> + Send + 'a>> {
            Box::pin(async move {
                Ok(AccessGrant {
                    api_base: Some(self.api_base.clone()),
                    ..AccessGrant::passthrough(secret)
                })
            })
        }
    }

    #[tokio::test]
    async fn announced_api_base_overrides_configured_base() {
        let (url, hits) = start_upstream(|_, _| (StatusCode::OK, "{}".into())).await;
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager_with(
            &dir,
            &["gho_a"],
            Arc::new(AnnouncingExchange { api_base: url }),
        )
        .await;
        let client = ApiClient::new(
            reqwest::Client::new(),
            manager,
            settings("http://127.0.0.1:1", 1),
        );

        let response = client.dispatch(chat_request()).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn request_handler_delegates_to_dispatch() {
        let (url, _hits) = start_upstream(|_, _| (StatusCode::OK, r#"{"ok":true}"#.into())).await;
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, &["gho_a"]).await;
        let handler: Arc<dyn RequestHandler> = Arc::new(ApiClient::new(
            reqwest::Client::new(),
            manager,
            settings(&url, 1),
        ));

        let response = handler.handle(chat_request()).await.unwrap();
        assert_eq!(response.body, Bytes::from_static(br#"{"ok":true}"#));
    }

    #[tokio::test]
    async fn concurrent_failures_on_one_token_both_land_on_the_healthy_one() {
        let router = Router::new().fallback(|headers: axum::http::HeaderMap| async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            let bearer = headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            if bearer == "Bearer gho_bad" {
                (StatusCode::UNAUTHORIZED, "revoked").into_response()
            } else {
                (StatusCode::OK, "{}").into_response()
            }
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, &["gho_bad", "gho_good"]).await;
        let client = ApiClient::new(
            reqwest::Client::new(),
            manager,
            settings(&format!("http://{addr}"), 2),
        );

        let (a, b) = tokio::join!(
            client.dispatch(chat_request()),
            client.dispatch(chat_request())
        );
        let a = a.unwrap();
        let b = b.unwrap();
        assert_eq!((a.status, a.token_id), (StatusCode::OK, 2));
        assert_eq!((b.status, b.token_id), (StatusCode::OK, 2));
    }

    #[tokio::test]
    async fn quota_bookkeeping_failure_keeps_the_upstream_response() {
        let (url, _hits) = start_upstream(|_, _| {
            (
                StatusCode::OK,
                r#"{"limited_user_quotas":{"chat":0}}"#.into(),
            )
        })
        .await;
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, &["gho_a", "gho_b"]).await;
        // Select and cache token 1 first so dispatch needs no directory scan
        assert_eq!(manager.get_token(false).await.unwrap().id, 1);
        std::fs::remove_dir_all(dir.path().join("QuotaExhausted")).unwrap();
        let observer = Arc::new(RecordingObserver::default());
        let client = ApiClient::new(reqwest::Client::new(), manager, settings(&url, 3))
            .with_observer(observer.clone());

        let response = client.dispatch(chat_request()).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(response.token_id, 1);

        let failures = observer.quota_failures.lock().unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, 1);
        assert_eq!(
            observer.outcomes(),
            vec![(1, AttemptOutcome::Success(200))]
        );
    }

    struct TelemetryExchange;

    impl TokenExchange for TelemetryExchange {
        fn id(&self) -> &str {
            "telemetry"
        }

        fn exchange<'a>(
            &'a self,
            secret: &'a common::Secret<String>,
        ) -> Pin<Box<dyn Future<Output = copilot_auth::Result<AccessGrant>> + Send + 'a>> {
            Box::pin(async move {
                Ok(AccessGrant {
                    telemetry_enabled: true,
                    ..AccessGrant::passthrough(secret)
                })
            })
        }
    }

    #[tokio::test]
    async fn telemetry_enabled_token_is_refused_for_completions() {
        let (url, hits) = start_upstream(|_, _| (StatusCode::OK, "{}".into())).await;
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager_with(&dir, &["gho_a"], Arc::new(TelemetryExchange)).await;
        let client = ApiClient::new(reqwest::Client::new(), manager, settings(&url, 3));

        let err = client.dispatch(chat_request()).await.unwrap_err();
        assert!(matches!(err, Error::TelemetryEnabled(1)), "got {err:?}");
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        let mut models = chat_request();
        models.method = Method::GET;
        models.path = "/models".into();
        let response = client.dispatch(models).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn telemetry_gate_can_be_switched_off() {
        let (url, hits) = start_upstream(|_, _| (StatusCode::OK, "{}".into())).await;
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager_with(&dir, &["gho_a"], Arc::new(TelemetryExchange)).await;
        let client = ApiClient::new(
            reqwest::Client::new(),
            manager,
            ClientSettings {
                block_telemetry: false,
                ..settings(&url, 3)
            },
        );

        let response = client.dispatch(chat_request()).await.unwrap();
        assert_eq!(response.status, StatusCode::OK);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
