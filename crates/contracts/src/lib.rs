use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub mod canonical;

/// Actions a verdict may recommend and the pipeline may finally take.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Allow,
    Challenge,
    Block,
    RateLimit,
    LogOnly,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Allow => "allow",
            Action::Challenge => "challenge",
            Action::Block => "block",
            Action::RateLimit => "rate_limit",
            Action::LogOnly => "log_only",
        }
    }

    /// Whether the request continues to the downstream handler.
    pub fn passes_through(self) -> bool {
        matches!(self, Action::Allow | Action::LogOnly)
    }
}

/// Normalized, immutable summary of one inbound request.
///
/// Absent inputs are represented by empty strings and an empty header map so
/// that downstream comparisons never see a missing value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestDescriptor {
    method: String,
    path: String,
    query: String,
    headers: BTreeMap<String, String>,
    client_id: String,
    timestamp_ms: i64,
    descriptor_id: String,
}

impl RequestDescriptor {
    pub fn new(
        method: String,
        path: String,
        query: String,
        headers: BTreeMap<String, String>,
        client_id: String,
        timestamp_ms: i64,
    ) -> Self {
        let descriptor_id = canonical::hash_canonical_json(&serde_json::json!({
            "method": method.as_str(),
            "path": path.as_str(),
            "query": query.as_str(),
            "headers": &headers,
            "client_id": client_id.as_str(),
            "timestamp_ms": timestamp_ms,
        }));

        Self {
            method,
            path,
            query,
            headers,
            client_id,
            timestamp_ms,
            descriptor_id,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    pub fn header(&self, name: &str) -> &str {
        self.headers.get(name).map(String::as_str).unwrap_or("")
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    pub fn descriptor_id(&self) -> &str {
        &self.descriptor_id
    }

    pub fn rate_limit_key(&self) -> String {
        if self.client_id.is_empty() {
            "client:anonymous".to_string()
        } else {
            format!("client:{}", self.client_id)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    Scored,
    Fallback,
}

impl VerdictSource {
    pub fn as_str(self) -> &'static str {
        match self {
            VerdictSource::Scored => "scored",
            VerdictSource::Fallback => "fallback",
        }
    }
}

/// Classification result for exactly one descriptor.
///
/// Deliberately not `Clone`: the policy engine takes it by value.
#[derive(Debug, PartialEq, Serialize)]
pub struct Verdict {
    pub threat_level: f64,
    pub confidence: f64,
    pub recommended_action: Action,
    pub descriptor_id: String,
    pub source: VerdictSource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvalidScore {
    pub field: &'static str,
    pub value: f64,
}

impl std::fmt::Display for InvalidScore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} must be within [0, 1], got {}", self.field, self.value)
    }
}

impl std::error::Error for InvalidScore {}

impl Verdict {
    pub fn scored(
        descriptor: &RequestDescriptor,
        threat_level: f64,
        confidence: f64,
        recommended_action: Action,
    ) -> Result<Self, InvalidScore> {
        check_unit_interval("threat_level", threat_level)?;
        check_unit_interval("confidence", confidence)?;

        Ok(Self {
            threat_level,
            confidence,
            recommended_action,
            descriptor_id: descriptor.descriptor_id().to_string(),
            source: VerdictSource::Scored,
        })
    }
}

fn check_unit_interval(field: &'static str, value: f64) -> Result<(), InvalidScore> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(InvalidScore { field, value })
    }
}

/// What to assume when the classifier cannot be reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailureMode {
    #[default]
    FailOpen,
    FailClosed,
}

impl FailureMode {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureMode::FailOpen => "fail-open",
            FailureMode::FailClosed => "fail-closed",
        }
    }

    pub fn fallback_verdict(self, descriptor: &RequestDescriptor) -> Verdict {
        let (threat_level, recommended_action) = match self {
            FailureMode::FailOpen => (0.0, Action::LogOnly),
            FailureMode::FailClosed => (1.0, Action::Block),
        };

        Verdict {
            threat_level,
            confidence: 0.0,
            recommended_action,
            descriptor_id: descriptor.descriptor_id().to_string(),
            source: VerdictSource::Fallback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(client_id: &str) -> RequestDescriptor {
        RequestDescriptor::new(
            "GET".to_string(),
            "/inbox".to_string(),
            String::new(),
            BTreeMap::from([("accept".to_string(), "text/html".to_string())]),
            client_id.to_string(),
            1_700_000_000_000,
        )
    }

    #[test]
    fn descriptor_id_changes_with_any_field() {
        let a = descriptor("10.0.0.1");
        let b = descriptor("10.0.0.2");
        assert!(canonical::is_sha256_hex(a.descriptor_id()));
        assert_ne!(a.descriptor_id(), b.descriptor_id());
        assert_eq!(a.descriptor_id(), descriptor("10.0.0.1").descriptor_id());
    }

    #[test]
    fn missing_header_reads_as_empty() {
        let d = descriptor("10.0.0.1");
        assert_eq!(d.header("user-agent"), "");
        assert_eq!(d.header("accept"), "text/html");
    }

    #[test]
    fn anonymous_clients_share_one_rate_limit_key() {
        assert_eq!(descriptor("").rate_limit_key(), "client:anonymous");
        assert_eq!(descriptor("10.0.0.1").rate_limit_key(), "client:10.0.0.1");
    }

    #[test]
    fn scored_verdict_rejects_out_of_range_scores() {
        let d = descriptor("10.0.0.1");
        let err = Verdict::scored(&d, 1.5, 0.5, Action::Allow).unwrap_err();
        assert_eq!(err.field, "threat_level");

        let err = Verdict::scored(&d, 0.5, f64::NAN, Action::Allow).unwrap_err();
        assert_eq!(err.field, "confidence");

        let ok = Verdict::scored(&d, 0.0, 1.0, Action::Challenge).expect("bounds are inclusive");
        assert_eq!(ok.descriptor_id, d.descriptor_id());
        assert_eq!(ok.source, VerdictSource::Scored);
    }

    #[test]
    fn fallback_verdicts_follow_failure_mode() {
        let d = descriptor("10.0.0.1");

        let open = FailureMode::FailOpen.fallback_verdict(&d);
        assert_eq!(open.threat_level, 0.0);
        assert_eq!(open.recommended_action, Action::LogOnly);
        assert_eq!(open.source, VerdictSource::Fallback);

        let closed = FailureMode::FailClosed.fallback_verdict(&d);
        assert_eq!(closed.threat_level, 1.0);
        assert_eq!(closed.recommended_action, Action::Block);
    }

    #[test]
    fn action_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&Action::RateLimit).expect("serialize"),
            "\"rate_limit\""
        );
        let parsed: Action = serde_json::from_str("\"log_only\"").expect("deserialize");
        assert_eq!(parsed, Action::LogOnly);
        assert!(parsed.passes_through());
        assert!(!Action::Challenge.passes_through());
    }
}
