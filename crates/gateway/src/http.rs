use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use edgeguard_contracts::{Action, VerdictSource};
use edgeguard_policy::{DecisionRule, PolicyEngine};
use serde::Serialize;
use tracing::Instrument;
use ulid::Ulid;

use crate::circuit_breaker::CircuitBreaker;
use crate::classifier::{Classifier, ClassifierGateway, HttpClassifier};
use crate::config::{ConfigurationError, GatewayConfig};
use crate::extract::{Extractor, InvalidRequest, RawRequest, unix_epoch_ms_now};
use crate::pipeline::Pipeline;
use crate::rate_limit::RateLimiter;

pub const REQUEST_ID_HEADER: &str = "x-edgeguard-request-id";

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    pipeline: Pipeline,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

impl AppState {
    /// Wires the pipeline around the HTTP scorer named in `config`.
    pub fn from_config(config: GatewayConfig) -> Result<Self, ConfigurationError> {
        let classifier = HttpClassifier::new(
            config.classifier_url.clone(),
            Duration::from_millis(config.classifier_timeout_ms),
        )
        .map_err(|err| ConfigurationError {
            code: "ERR_CLASSIFIER_CLIENT",
            message: format!("failed to initialize classifier client: {}", err),
        })?;

        Self::with_classifier(config, Arc::new(classifier))
    }

    pub fn with_classifier(
        config: GatewayConfig,
        classifier: Arc<dyn Classifier>,
    ) -> Result<Self, ConfigurationError> {
        let extractor = Extractor::new(config.trust_forwarded_for, &config.redact_headers);

        let gateway = ClassifierGateway::new(
            classifier,
            Duration::from_millis(config.classifier_timeout_ms),
            config.classifier_failure_mode,
            CircuitBreaker::new(
                config.classifier_circuit_breaker_failure_threshold,
                Duration::from_millis(config.classifier_circuit_breaker_open_ms),
            ),
        );

        let counters = Arc::new(RateLimiter::new(config.counter_max_keys));
        let engine =
            PolicyEngine::new(counters, config.thresholds.clone()).map_err(|err| {
                ConfigurationError {
                    code: "ERR_INVALID_CONFIG",
                    message: err.to_string(),
                }
            })?;

        Ok(Self {
            config,
            pipeline: Pipeline::new(extractor, gateway, engine),
        })
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// Periodically drops expired counters. Returns `None` when the sweep
    /// interval is configured as 0.
    pub fn spawn_counter_sweeper(&self) -> Option<tokio::task::JoinHandle<()>> {
        if self.config.counter_sweep_interval_secs == 0 {
            return None;
        }

        let counters = self.pipeline.counters().clone();
        let period = Duration::from_secs(self.config.counter_sweep_interval_secs);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = counters.sweep_expired();
                if removed > 0 {
                    tracing::debug!(removed, remaining = counters.len(), "swept expired counters");
                }
            }
        }))
    }
}

/// Service routes plus `downstream` guarded by the pipeline.
///
/// `downstream` must not define `/healthz`, `/readyz`, `/metrics` or
/// `/v1/decisions`.
pub fn router(state: AppState, downstream: Router) -> Router {
    let guarded = downstream.layer(middleware::from_fn_with_state(state.clone(), guard));

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/decisions", post(decide))
        .with_state(state)
        .merge(guarded)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let classifier_ready = state.pipeline.classifier().ready().await.is_ok();
    checks.insert("classifier", classifier_ready);

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[derive(Debug, Serialize)]
struct DecisionResponse {
    action: Action,
    status: u16,
    descriptor_id: String,
    request_count: u64,
    rule: DecisionRule,
    verdict_source: VerdictSource,
    escalated: bool,
}

async fn decide(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<RawRequest>, JsonRejection>,
) -> Response {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let result = async {
        let Json(raw) = req.map_err(|_| {
            json_error(
                StatusCode::BAD_REQUEST,
                InvalidRequest::CODE,
                "invalid JSON body",
                false,
            )
        })?;

        let descriptor = state
            .pipeline
            .extractor()
            .from_raw(&raw, unix_epoch_ms_now())
            .map_err(|err| invalid_request_error(&err))?;

        let decision = state.pipeline.evaluate(descriptor).await;

        Ok::<_, ApiError>(DecisionResponse {
            action: decision.action,
            status: status_for(decision.action).as_u16(),
            descriptor_id: decision.descriptor_id,
            request_count: decision.request_count,
            rule: decision.rule,
            verdict_source: decision.verdict_source,
            escalated: decision.escalated,
        })
    }
    .instrument(tracing::info_span!("decision.evaluate", request_id = %request_id))
    .await;

    let response = match result {
        Ok(body) => Json(body).into_response(),
        Err(err) => err.into_response(),
    };
    crate::metrics::observe_http_request(
        "/v1/decisions",
        "POST",
        response.status().as_u16(),
        started.elapsed(),
    );
    with_request_id(response, &request_id)
}

async fn guard(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let started = Instant::now();
    let request_id = extract_request_id(request.headers());
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    let (parts, body) = request.into_parts();
    let method = parts.method.clone();

    let descriptor = match state
        .pipeline
        .extractor()
        .from_parts(&parts, peer, unix_epoch_ms_now())
    {
        Ok(descriptor) => descriptor,
        Err(err) => {
            let response = invalid_request_error(&err).into_response();
            crate::metrics::observe_http_request(
                "guarded",
                method.as_str(),
                response.status().as_u16(),
                started.elapsed(),
            );
            return with_request_id(response, &request_id);
        }
    };

    let span = tracing::info_span!(
        "edge.request",
        request_id = %request_id,
        descriptor_id = %descriptor.descriptor_id(),
        method = %descriptor.method(),
        path = %descriptor.path(),
        client_id = %descriptor.client_id(),
        action = tracing::field::Empty,
        rule = tracing::field::Empty,
        request_count = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
    );

    let decision = state
        .pipeline
        .evaluate(descriptor)
        .instrument(span.clone())
        .await;
    let decided_in = started.elapsed();
    span.record("action", decision.action.as_str());
    span.record("rule", decision.rule.as_str());
    span.record("request_count", decision.request_count);
    span.record("latency_ms", decided_in.as_millis() as u64);

    let response = match short_circuit(&state.config, decision.action) {
        Some(response) => response,
        None => next.run(Request::from_parts(parts, body)).await,
    };

    crate::metrics::observe_http_request(
        "guarded",
        method.as_str(),
        response.status().as_u16(),
        decided_in,
    );
    with_request_id(response, &request_id)
}

/// HTTP status an action maps to at the edge.
pub fn status_for(action: Action) -> StatusCode {
    match action {
        Action::Allow | Action::LogOnly => StatusCode::OK,
        Action::Challenge => StatusCode::UNAUTHORIZED,
        Action::Block => StatusCode::FORBIDDEN,
        Action::RateLimit => StatusCode::TOO_MANY_REQUESTS,
    }
}

/// Response for actions that stop the request at the edge. Bodies are
/// generic and never describe the verdict.
fn short_circuit(config: &GatewayConfig, action: Action) -> Option<Response> {
    let status = status_for(action);
    match action {
        Action::Allow | Action::LogOnly => None,
        Action::Block => {
            Some(json_error(status, "ERR_FORBIDDEN", "request blocked", false).into_response())
        }
        Action::Challenge => {
            let mut response = json_error(
                status,
                "ERR_CHALLENGE_REQUIRED",
                "additional verification required",
                true,
            )
            .into_response();
            response.headers_mut().insert(
                header::WWW_AUTHENTICATE,
                HeaderValue::from_static("Challenge realm=\"edgeguard\""),
            );
            Some(response)
        }
        Action::RateLimit => {
            let mut response =
                json_error(status, "ERR_RATE_LIMITED", "rate limit exceeded", true)
                    .into_response();
            // Every rate-limited key sits at the penalty count until it expires.
            let retry_after = config.thresholds.penalty_window.as_secs().max(1);
            if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
            Some(response)
        }
    }
}

fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let out = raw
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.'))
        .take(MAX_LEN)
        .collect::<String>();

    (!out.is_empty()).then_some(out)
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
    retryable: bool,
}

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
    retryable: bool,
) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: message.into(),
            retryable,
        }),
    )
}

fn invalid_request_error(err: &InvalidRequest) -> ApiError {
    json_error(
        StatusCode::BAD_REQUEST,
        InvalidRequest::CODE,
        err.message.clone(),
        false,
    )
}
