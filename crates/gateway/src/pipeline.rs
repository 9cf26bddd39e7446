use std::sync::Arc;

use edgeguard_contracts::RequestDescriptor;
use edgeguard_policy::{CounterStore, Decision, PolicyEngine};

use crate::classifier::ClassifierGateway;
use crate::extract::Extractor;
use crate::rate_limit::RateLimiter;

/// Extractor, classifier gateway, policy engine and the shared counter store.
#[derive(Clone)]
pub struct Pipeline {
    extractor: Extractor,
    classifier: ClassifierGateway,
    engine: PolicyEngine<Arc<RateLimiter>>,
}

impl Pipeline {
    pub fn new(
        extractor: Extractor,
        classifier: ClassifierGateway,
        engine: PolicyEngine<Arc<RateLimiter>>,
    ) -> Self {
        Self {
            extractor,
            classifier,
            engine,
        }
    }

    pub fn extractor(&self) -> &Extractor {
        &self.extractor
    }

    pub fn classifier(&self) -> &ClassifierGateway {
        &self.classifier
    }

    pub fn counters(&self) -> &Arc<RateLimiter> {
        self.engine.store()
    }

    pub fn engine(&self) -> &PolicyEngine<Arc<RateLimiter>> {
        &self.engine
    }

    /// Runs one descriptor through counting, classification and policy.
    ///
    /// The request is counted before the classifier call, so no counter lock
    /// is held across it, and every concurrent request for a key observes a
    /// distinct count.
    pub async fn evaluate(&self, descriptor: RequestDescriptor) -> Decision {
        let key = descriptor.rate_limit_key();
        let count = self.engine.record_request(&key);

        let verdict = match self.classifier.classify(&descriptor).await {
            Ok(verdict) => verdict,
            Err(err) => {
                tracing::warn!(
                    descriptor_id = %descriptor.descriptor_id(),
                    failure_mode = self.classifier.failure_mode().as_str(),
                    error = %err,
                    "classification unavailable; using fallback verdict"
                );
                self.classifier.fallback(&descriptor)
            }
        };

        let decision = self.engine.decide(&key, verdict, count);

        crate::metrics::observe_action(decision.action.as_str(), decision.rule.as_str());
        if decision.escalated {
            crate::metrics::inc_escalation();
            tracing::info!(
                rate_limit_key = %key,
                penalty_count = self.engine.thresholds().penalty_count,
                "rate limit key escalated"
            );
        }

        decision
    }

    /// Current count for `key`, for diagnostics.
    pub fn request_count(&self, key: &str) -> u64 {
        self.counters().get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use edgeguard_contracts::{Action, FailureMode, VerdictSource};
    use edgeguard_policy::{DecisionRule, PolicyThresholds};

    use crate::circuit_breaker::CircuitBreaker;
    use crate::classifier::Classifier;
    use crate::classifier::tests::{StubClassifier, descriptor};

    fn pipeline(classifier: Arc<dyn Classifier>, failure_mode: FailureMode) -> Pipeline {
        let gateway = ClassifierGateway::new(
            classifier,
            Duration::from_millis(100),
            failure_mode,
            CircuitBreaker::new(8, Duration::from_secs(1)),
        );
        let engine = PolicyEngine::new(
            Arc::new(RateLimiter::new(1024)),
            PolicyThresholds::default(),
        )
        .expect("default thresholds are valid");
        Pipeline::new(Extractor::default(), gateway, engine)
    }

    #[tokio::test]
    async fn high_threat_blocks_and_escalates() {
        let p = pipeline(
            Arc::new(StubClassifier::scoring(0.9, Action::Allow)),
            FailureMode::FailOpen,
        );
        let d = descriptor();
        let key = d.rate_limit_key();

        let decision = p.evaluate(d).await;
        assert_eq!(decision.action, Action::Block);
        assert_eq!(decision.rule, DecisionRule::SecurityThreshold);
        assert!(decision.escalated);
        assert_eq!(p.request_count(&key), 1000);
    }

    #[tokio::test]
    async fn low_threat_over_ceiling_is_rate_limited() {
        let p = pipeline(
            Arc::new(StubClassifier::scoring(0.1, Action::Allow)),
            FailureMode::FailOpen,
        );
        let key = descriptor().rate_limit_key();
        for _ in 0..100 {
            p.counters().increment(&key, Duration::from_secs(60));
        }

        let decision = p.evaluate(descriptor()).await;
        assert_eq!(decision.request_count, 101);
        assert_eq!(decision.action, Action::RateLimit);
        assert_eq!(decision.rule, DecisionRule::RateLimitCeiling);
    }

    #[tokio::test]
    async fn low_threat_under_ceiling_is_allowed() {
        let p = pipeline(
            Arc::new(StubClassifier::scoring(0.1, Action::Allow)),
            FailureMode::FailOpen,
        );
        let key = descriptor().rate_limit_key();
        for _ in 0..4 {
            p.counters().increment(&key, Duration::from_secs(60));
        }

        let decision = p.evaluate(descriptor()).await;
        assert_eq!(decision.request_count, 5);
        assert_eq!(decision.action, Action::Allow);
        assert!(!decision.escalated);
    }

    #[tokio::test]
    async fn timeout_uses_fail_open_fallback_within_bound() {
        let p = pipeline(
            Arc::new(StubClassifier::slow(Duration::from_secs(10))),
            FailureMode::FailOpen,
        );

        let started = std::time::Instant::now();
        let decision = p.evaluate(descriptor()).await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(decision.action, Action::LogOnly);
        assert_eq!(decision.verdict_source, VerdictSource::Fallback);
    }

    #[tokio::test]
    async fn timeout_with_fail_closed_blocks() {
        let p = pipeline(
            Arc::new(StubClassifier::slow(Duration::from_secs(10))),
            FailureMode::FailClosed,
        );
        let decision = p.evaluate(descriptor()).await;
        assert_eq!(decision.action, Action::Block);
        assert_eq!(decision.verdict_source, VerdictSource::Fallback);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_requests_trip_the_ceiling_exactly_once() {
        let p = pipeline(
            Arc::new(StubClassifier::scoring(0.0, Action::Allow)),
            FailureMode::FailOpen,
        );

        let tasks = (0..101)
            .map(|_| {
                let p = p.clone();
                tokio::spawn(async move { p.evaluate(descriptor()).await })
            })
            .collect::<Vec<_>>();

        let mut limited = 0;
        for task in tasks {
            let decision = task.await.expect("task should not panic");
            if decision.action == Action::RateLimit {
                limited += 1;
            }
        }
        assert_eq!(limited, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_blocks_escalate_the_key_once() {
        let p = pipeline(
            Arc::new(StubClassifier::scoring(0.95, Action::Allow)),
            FailureMode::FailOpen,
        );

        let tasks = (0..32)
            .map(|_| {
                let p = p.clone();
                tokio::spawn(async move { p.evaluate(descriptor()).await })
            })
            .collect::<Vec<_>>();

        let mut escalated = 0;
        for task in tasks {
            let decision = task.await.expect("task should not panic");
            assert_eq!(decision.action, Action::Block);
            if decision.escalated {
                escalated += 1;
            }
        }
        assert_eq!(escalated, 1);
        assert!(p.request_count(&descriptor().rate_limit_key()) >= 1000);
    }
}
