use std::sync::Arc;
use std::time::Duration;

use edgeguard_contracts::{Action, Verdict, VerdictSource};
use serde::Serialize;

/// Per-key request counters with expiry.
///
/// Implementations must make every operation on a single key linearizable;
/// operations on distinct keys need no coordination.
pub trait CounterStore: Send + Sync {
    /// Counts one request against `key` and returns the resulting count.
    /// An absent or expired entry restarts at 1 with a fresh `window`.
    fn increment(&self, key: &str, window: Duration) -> u64;

    /// Force-sets `key` to `count`, expiring after `window`.
    fn penalize(&self, key: &str, count: u64, window: Duration);

    /// Current count, or 0 when absent or expired.
    fn get(&self, key: &str) -> u64;

    /// Penalizes `key` only when its current count is below `count`, and
    /// reports whether it did. Stores shared between threads must override
    /// this so the check and the write happen under one lock.
    fn penalize_if_below(&self, key: &str, count: u64, window: Duration) -> bool {
        if self.get(key) >= count {
            return false;
        }
        self.penalize(key, count, window);
        true
    }
}

impl<T: CounterStore + ?Sized> CounterStore for Arc<T> {
    fn increment(&self, key: &str, window: Duration) -> u64 {
        (**self).increment(key, window)
    }

    fn penalize(&self, key: &str, count: u64, window: Duration) {
        (**self).penalize(key, count, window)
    }

    fn get(&self, key: &str) -> u64 {
        (**self).get(key)
    }

    fn penalize_if_below(&self, key: &str, count: u64, window: Duration) -> bool {
        (**self).penalize_if_below(key, count, window)
    }
}

/// Longest accepted rate-limit or penalty window.
pub const MAX_WINDOW: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyThresholds {
    pub security_threshold: f64,
    pub rate_limit_ceiling: u64,
    pub rate_limit_window: Duration,
    pub penalty_count: u64,
    pub penalty_window: Duration,
}

impl Default for PolicyThresholds {
    fn default() -> Self {
        Self {
            security_threshold: 0.8,
            rate_limit_ceiling: 100,
            rate_limit_window: Duration::from_secs(60),
            penalty_count: 1000,
            penalty_window: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidThresholds {
    message: String,
}

impl InvalidThresholds {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for InvalidThresholds {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for InvalidThresholds {}

impl PolicyThresholds {
    pub fn validate(&self) -> Result<(), InvalidThresholds> {
        if !self.security_threshold.is_finite()
            || !(0.0..=1.0).contains(&self.security_threshold)
        {
            return Err(InvalidThresholds::new(
                "security threshold must be within [0, 1]",
            ));
        }
        if self.rate_limit_ceiling == 0 {
            return Err(InvalidThresholds::new("rate limit ceiling must be >= 1"));
        }
        if self.rate_limit_window.is_zero() {
            return Err(InvalidThresholds::new("rate limit window must be non-zero"));
        }
        if self.rate_limit_window > MAX_WINDOW {
            return Err(InvalidThresholds::new(
                "rate limit window must not exceed ten years",
            ));
        }
        if self.penalty_count <= self.rate_limit_ceiling {
            return Err(InvalidThresholds::new(
                "penalty count must exceed the rate limit ceiling",
            ));
        }
        if self.penalty_window.is_zero() {
            return Err(InvalidThresholds::new("penalty window must be non-zero"));
        }
        if self.penalty_window > MAX_WINDOW {
            return Err(InvalidThresholds::new(
                "penalty window must not exceed ten years",
            ));
        }
        Ok(())
    }
}

/// Which ordered rule produced the final action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionRule {
    SecurityThreshold,
    RateLimitCeiling,
    Recommended,
}

impl DecisionRule {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionRule::SecurityThreshold => "security_threshold",
            DecisionRule::RateLimitCeiling => "rate_limit_ceiling",
            DecisionRule::Recommended => "recommended",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub action: Action,
    pub rule: DecisionRule,
    pub escalated: bool,
    pub request_count: u64,
    pub descriptor_id: String,
    pub verdict_source: VerdictSource,
}

/// Applies the ordered rules without touching any counter.
///
/// Security dominates rate limiting, which dominates the recommendation.
pub fn evaluate(
    verdict: &Verdict,
    count: u64,
    thresholds: &PolicyThresholds,
) -> (Action, DecisionRule) {
    if verdict.threat_level > thresholds.security_threshold {
        return (Action::Block, DecisionRule::SecurityThreshold);
    }
    if count > thresholds.rate_limit_ceiling {
        return (Action::RateLimit, DecisionRule::RateLimitCeiling);
    }
    (verdict.recommended_action, DecisionRule::Recommended)
}

#[derive(Debug, Clone)]
pub struct PolicyEngine<S> {
    store: S,
    thresholds: PolicyThresholds,
}

impl<S: CounterStore> PolicyEngine<S> {
    pub fn new(store: S, thresholds: PolicyThresholds) -> Result<Self, InvalidThresholds> {
        thresholds.validate()?;
        Ok(Self { store, thresholds })
    }

    pub fn thresholds(&self) -> &PolicyThresholds {
        &self.thresholds
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Counts one request for `key` inside the configured rate-limit window.
    pub fn record_request(&self, key: &str) -> u64 {
        self.store.increment(key, self.thresholds.rate_limit_window)
    }

    /// Decides the final action for `verdict`, given the count observed for
    /// `key` when this request was recorded.
    ///
    /// A `block` or `rate_limit` escalates the key to the penalty count. Keys
    /// already at or above the penalty count are left untouched, so repeated
    /// blocks inside one penalty window neither reset accumulated counts nor
    /// extend the expiry.
    pub fn decide(&self, key: &str, verdict: Verdict, count: u64) -> Decision {
        let (action, rule) = evaluate(&verdict, count, &self.thresholds);

        let escalated = matches!(action, Action::Block | Action::RateLimit)
            && self.store.penalize_if_below(
                key,
                self.thresholds.penalty_count,
                self.thresholds.penalty_window,
            );

        Decision {
            action,
            rule,
            escalated,
            request_count: count,
            descriptor_id: verdict.descriptor_id,
            verdict_source: verdict.source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    use edgeguard_contracts::RequestDescriptor;

    #[derive(Default)]
    struct FixedStore {
        counts: Mutex<HashMap<String, (u64, Duration)>>,
        penalize_calls: Mutex<u32>,
    }

    impl CounterStore for FixedStore {
        fn increment(&self, key: &str, window: Duration) -> u64 {
            let mut counts = self.counts.lock().expect("store lock");
            let entry = counts.entry(key.to_string()).or_insert((0, window));
            entry.0 += 1;
            entry.0
        }

        fn penalize(&self, key: &str, count: u64, window: Duration) {
            *self.penalize_calls.lock().expect("calls lock") += 1;
            self.counts
                .lock()
                .expect("store lock")
                .insert(key.to_string(), (count, window));
        }

        fn get(&self, key: &str) -> u64 {
            self.counts
                .lock()
                .expect("store lock")
                .get(key)
                .map(|(count, _)| *count)
                .unwrap_or(0)
        }
    }

    fn descriptor() -> RequestDescriptor {
        RequestDescriptor::new(
            "GET".to_string(),
            "/compose".to_string(),
            String::new(),
            BTreeMap::new(),
            "10.1.2.3".to_string(),
            0,
        )
    }

    fn verdict(threat_level: f64, action: Action) -> Verdict {
        Verdict::scored(&descriptor(), threat_level, 0.9, action).expect("valid verdict")
    }

    fn engine() -> PolicyEngine<Arc<FixedStore>> {
        PolicyEngine::new(Arc::new(FixedStore::default()), PolicyThresholds::default())
            .expect("default thresholds are valid")
    }

    #[test]
    fn high_threat_always_blocks_regardless_of_count() {
        let thresholds = PolicyThresholds::default();
        for threat in [0.81, 0.9, 0.99, 1.0] {
            for count in [0, 1, 100, 101, 5000] {
                for recommended in [Action::Allow, Action::RateLimit, Action::LogOnly] {
                    let (action, rule) =
                        evaluate(&verdict(threat, recommended), count, &thresholds);
                    assert_eq!(action, Action::Block);
                    assert_eq!(rule, DecisionRule::SecurityThreshold);
                }
            }
        }
    }

    #[test]
    fn threshold_is_strictly_greater_than() {
        let (action, rule) = evaluate(
            &verdict(0.8, Action::Allow),
            1,
            &PolicyThresholds::default(),
        );
        assert_eq!(action, Action::Allow);
        assert_eq!(rule, DecisionRule::Recommended);
    }

    #[test]
    fn count_over_ceiling_rate_limits() {
        let thresholds = PolicyThresholds::default();
        let (at_ceiling, _) = evaluate(&verdict(0.1, Action::Allow), 100, &thresholds);
        assert_eq!(at_ceiling, Action::Allow);

        let (over, rule) = evaluate(&verdict(0.1, Action::Allow), 101, &thresholds);
        assert_eq!(over, Action::RateLimit);
        assert_eq!(rule, DecisionRule::RateLimitCeiling);
    }

    #[test]
    fn low_threat_passes_recommendation_through() {
        let (action, _) = evaluate(
            &verdict(0.3, Action::Challenge),
            5,
            &PolicyThresholds::default(),
        );
        assert_eq!(action, Action::Challenge);
    }

    #[test]
    fn block_escalates_key_once_per_window() {
        let engine = engine();
        let key = "client:10.1.2.3";
        let count = engine.record_request(key);

        let first = engine.decide(key, verdict(0.95, Action::Block), count);
        assert_eq!(first.action, Action::Block);
        assert!(first.escalated);
        assert_eq!(engine.store().get(key), 1000);

        let count = engine.record_request(key);
        assert_eq!(count, 1001);
        let second = engine.decide(key, verdict(0.95, Action::Block), count);
        assert!(!second.escalated);
        assert_eq!(engine.store().get(key), 1001);
        assert_eq!(*engine.store().penalize_calls.lock().expect("calls lock"), 1);
    }

    #[test]
    fn rate_limit_escalates_and_allow_does_not() {
        let engine = engine();
        let key = "client:10.1.2.3";

        let allowed = engine.decide(key, verdict(0.1, Action::Allow), 5);
        assert_eq!(allowed.action, Action::Allow);
        assert!(!allowed.escalated);
        assert_eq!(engine.store().get(key), 0);

        let limited = engine.decide(key, verdict(0.1, Action::Allow), 101);
        assert_eq!(limited.action, Action::RateLimit);
        assert!(limited.escalated);
        assert_eq!(engine.store().get(key), 1000);
    }

    #[test]
    fn decision_carries_verdict_binding() {
        let engine = engine();
        let d = descriptor();
        let v = edgeguard_contracts::FailureMode::FailOpen.fallback_verdict(&d);
        let decision = engine.decide("client:x", v, 1);
        assert_eq!(decision.descriptor_id, d.descriptor_id());
        assert_eq!(decision.verdict_source, VerdictSource::Fallback);
        assert_eq!(decision.action, Action::LogOnly);
    }

    #[test]
    fn thresholds_validation_rejects_inconsistent_values() {
        let invalid = [
            PolicyThresholds {
                security_threshold: 1.2,
                ..PolicyThresholds::default()
            },
            PolicyThresholds {
                rate_limit_ceiling: 0,
                ..PolicyThresholds::default()
            },
            PolicyThresholds {
                rate_limit_window: Duration::ZERO,
                ..PolicyThresholds::default()
            },
            PolicyThresholds {
                rate_limit_window: Duration::from_secs(u64::MAX),
                ..PolicyThresholds::default()
            },
            PolicyThresholds {
                penalty_window: MAX_WINDOW + Duration::from_secs(1),
                ..PolicyThresholds::default()
            },
        ];
        for t in invalid {
            assert!(t.validate().is_err(), "{:?} should be rejected", t);
        }

        let err = PolicyThresholds {
            penalty_count: 100,
            ..PolicyThresholds::default()
        }
        .validate()
        .unwrap_err();
        assert!(err.to_string().contains("penalty count"));

        assert!(PolicyThresholds::default().validate().is_ok());
        assert!(
            PolicyThresholds {
                penalty_window: MAX_WINDOW,
                ..PolicyThresholds::default()
            }
            .validate()
            .is_ok()
        );
    }

    #[test]
    fn decision_rule_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(DecisionRule::RateLimitCeiling).expect("serialize"),
            serde_json::json!("rate_limit_ceiling")
        );
    }
}
