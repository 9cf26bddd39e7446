use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use edgeguard_contracts::{Action, FailureMode, RequestDescriptor, Verdict};
use serde::{Deserialize, Serialize};
use tracing::Instrument;

use crate::circuit_breaker::CircuitBreaker;

/// Why no scored verdict could be produced for a descriptor.
#[derive(Debug)]
pub enum ClassificationUnavailable {
    Timeout,
    CircuitOpen,
    Http(reqwest::Error),
    BadStatus(reqwest::StatusCode),
    InvalidResponse(String),
}

impl ClassificationUnavailable {
    pub fn outcome(&self) -> &'static str {
        match self {
            ClassificationUnavailable::Timeout => "timeout",
            ClassificationUnavailable::CircuitOpen => "circuit_open",
            ClassificationUnavailable::Http(_) => "http_error",
            ClassificationUnavailable::BadStatus(_) => "bad_status",
            ClassificationUnavailable::InvalidResponse(_) => "invalid_response",
        }
    }
}

impl std::fmt::Display for ClassificationUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClassificationUnavailable::Timeout => write!(f, "classifier request timed out"),
            ClassificationUnavailable::CircuitOpen => {
                write!(f, "classifier circuit breaker is open")
            }
            ClassificationUnavailable::Http(err) => write!(f, "classifier HTTP error: {}", err),
            ClassificationUnavailable::BadStatus(status) => {
                write!(f, "classifier returned status {}", status)
            }
            ClassificationUnavailable::InvalidResponse(reason) => {
                write!(f, "classifier returned an invalid response: {}", reason)
            }
        }
    }
}

impl std::error::Error for ClassificationUnavailable {}

impl From<reqwest::Error> for ClassificationUnavailable {
    fn from(value: reqwest::Error) -> Self {
        if value.is_timeout() {
            ClassificationUnavailable::Timeout
        } else {
            ClassificationUnavailable::Http(value)
        }
    }
}

/// External scoring capability.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(
        &self,
        descriptor: &RequestDescriptor,
    ) -> Result<Verdict, ClassificationUnavailable>;

    async fn ready(&self) -> Result<(), ClassificationUnavailable> {
        Ok(())
    }
}

#[derive(Serialize)]
struct ClassifyRequest<'a> {
    descriptor: &'a RequestDescriptor,
}

#[derive(Deserialize)]
struct ClassifyResponse {
    threat_level: f64,
    confidence: f64,
    recommended_action: Action,
}

/// Scorer reached over HTTP: `POST {base_url}/v1/classify`.
#[derive(Clone)]
pub struct HttpClassifier {
    base_url: String,
    http: reqwest::Client,
}

impl HttpClassifier {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, ClassificationUnavailable> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ClassificationUnavailable::Http)?;

        Ok(Self { base_url, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(
        &self,
        descriptor: &RequestDescriptor,
    ) -> Result<Verdict, ClassificationUnavailable> {
        let resp = self
            .http
            .post(self.url("/v1/classify"))
            .json(&ClassifyRequest { descriptor })
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(ClassificationUnavailable::BadStatus(resp.status()));
        }

        let body = resp.json::<ClassifyResponse>().await.map_err(|err| {
            if err.is_timeout() {
                ClassificationUnavailable::Timeout
            } else {
                ClassificationUnavailable::InvalidResponse("undecodable body".to_string())
            }
        })?;

        Verdict::scored(
            descriptor,
            body.threat_level,
            body.confidence,
            body.recommended_action,
        )
        .map_err(|err| ClassificationUnavailable::InvalidResponse(err.to_string()))
    }

    async fn ready(&self) -> Result<(), ClassificationUnavailable> {
        let resp = self.http.get(self.url("/healthz")).send().await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ClassificationUnavailable::BadStatus(resp.status()))
        }
    }
}

/// Bounded, breaker-protected access to a [`Classifier`].
#[derive(Clone)]
pub struct ClassifierGateway {
    classifier: Arc<dyn Classifier>,
    timeout: Duration,
    failure_mode: FailureMode,
    breaker: Arc<CircuitBreaker>,
}

impl ClassifierGateway {
    pub fn new(
        classifier: Arc<dyn Classifier>,
        timeout: Duration,
        failure_mode: FailureMode,
        breaker: CircuitBreaker,
    ) -> Self {
        Self {
            classifier,
            timeout,
            failure_mode,
            breaker: Arc::new(breaker),
        }
    }

    pub fn failure_mode(&self) -> FailureMode {
        self.failure_mode
    }

    /// Verdict to use for `descriptor` when [`ClassifierGateway::classify`] fails.
    pub fn fallback(&self, descriptor: &RequestDescriptor) -> Verdict {
        self.failure_mode.fallback_verdict(descriptor)
    }

    /// Scores `descriptor`, giving up after the configured timeout. The
    /// in-flight call is dropped at the deadline.
    pub async fn classify(
        &self,
        descriptor: &RequestDescriptor,
    ) -> Result<Verdict, ClassificationUnavailable> {
        let span = tracing::info_span!(
            "classifier.classify",
            descriptor_id = %descriptor.descriptor_id(),
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        async {
            let started = Instant::now();

            let result = if self.breaker.allow_request() {
                let result =
                    match tokio::time::timeout(self.timeout, self.classifier.classify(descriptor))
                        .await
                    {
                        Ok(result) => result,
                        Err(_) => Err(ClassificationUnavailable::Timeout),
                    };
                match &result {
                    Ok(_) => self.breaker.record_success(),
                    Err(_) => self.breaker.record_failure(),
                }
                result
            } else {
                Err(ClassificationUnavailable::CircuitOpen)
            };

            let elapsed = started.elapsed();
            let outcome = match &result {
                Ok(_) => "ok",
                Err(err) => err.outcome(),
            };
            tracing::Span::current().record("latency_ms", elapsed.as_millis() as u64);
            tracing::Span::current().record("outcome", outcome);
            crate::metrics::observe_classifier_call(outcome, elapsed);

            result
        }
        .instrument(span)
        .await
    }

    pub async fn ready(&self) -> Result<(), ClassificationUnavailable> {
        match tokio::time::timeout(self.timeout, self.classifier.ready()).await {
            Ok(result) => result,
            Err(_) => Err(ClassificationUnavailable::Timeout),
        }
    }
}
