use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use axum::http::HeaderMap;
use axum::http::request::Parts;
use edgeguard_contracts::RequestDescriptor;
use serde::Deserialize;

/// Request description posted by edge workers to the decision API.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRequest {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidRequest {
    pub message: String,
}

impl InvalidRequest {
    pub const CODE: &'static str = "ERR_INVALID_REQUEST";

    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for InvalidRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", Self::CODE, self.message)
    }
}

impl std::error::Error for InvalidRequest {}

pub fn unix_epoch_ms_now() -> i64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO);
    duration.as_millis().min(i64::MAX as u128) as i64
}

/// Turns inbound requests into [`RequestDescriptor`]s.
#[derive(Debug, Clone, Default)]
pub struct Extractor {
    trust_forwarded_for: bool,
    redact_headers: Vec<String>,
}

impl Extractor {
    pub fn new(trust_forwarded_for: bool, redact_headers: &[String]) -> Self {
        let mut redact_headers = redact_headers
            .iter()
            .map(|h| h.trim().to_ascii_lowercase())
            .filter(|h| !h.is_empty())
            .collect::<Vec<_>>();
        redact_headers.sort();
        redact_headers.dedup();

        Self {
            trust_forwarded_for,
            redact_headers,
        }
    }

    fn keeps_header(&self, name: &str) -> bool {
        self.redact_headers
            .binary_search_by(|h| h.as_str().cmp(name))
            .is_err()
    }

    pub fn from_raw(
        &self,
        raw: &RawRequest,
        timestamp_ms: i64,
    ) -> Result<RequestDescriptor, InvalidRequest> {
        let method = normalize_method(raw.method.as_deref().unwrap_or(""))?;

        let raw_path = raw.path.as_deref().map(str::trim).unwrap_or("");
        let (path, inline_query) = match raw_path.split_once('?') {
            Some((path, query)) => (path, query),
            None => (raw_path, ""),
        };
        let path = normalize_path(path)?;

        let query = raw
            .query
            .as_deref()
            .map(|q| q.trim().trim_start_matches('?'))
            .filter(|q| !q.is_empty())
            .unwrap_or(inline_query)
            .to_string();

        let mut headers = BTreeMap::new();
        for (name, value) in &raw.headers {
            let name = name.trim().to_ascii_lowercase();
            if name.is_empty() || !self.keeps_header(&name) {
                continue;
            }
            headers.insert(name, value.trim().to_string());
        }

        let client_id = raw
            .client_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
            .or_else(|| self.forwarded_client(|name| headers.get(name).map(String::as_str)))
            .unwrap_or_default();

        Ok(RequestDescriptor::new(
            method,
            path,
            query,
            headers,
            client_id,
            timestamp_ms,
        ))
    }

    pub fn from_parts(
        &self,
        parts: &Parts,
        peer: Option<SocketAddr>,
        timestamp_ms: i64,
    ) -> Result<RequestDescriptor, InvalidRequest> {
        let method = normalize_method(parts.method.as_str())?;
        let path = normalize_path(parts.uri.path())?;
        let query = parts.uri.query().unwrap_or("").to_string();
        let headers = self.collect_headers(&parts.headers);

        let client_id = self
            .forwarded_client(|name| headers.get(name).map(String::as_str))
            .or_else(|| peer.map(|addr| addr.ip().to_string()))
            .unwrap_or_default();

        Ok(RequestDescriptor::new(
            method,
            path,
            query,
            headers,
            client_id,
            timestamp_ms,
        ))
    }

    fn collect_headers(&self, map: &HeaderMap) -> BTreeMap<String, String> {
        let mut headers = BTreeMap::<String, String>::new();
        for (name, value) in map {
            let name = name.as_str();
            if !self.keeps_header(name) {
                continue;
            }
            let Ok(value) = value.to_str() else {
                continue;
            };
            headers
                .entry(name.to_string())
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.to_string());
        }
        headers
    }

    fn forwarded_client<'a>(&self, header: impl Fn(&str) -> Option<&'a str>) -> Option<String> {
        if !self.trust_forwarded_for {
            return None;
        }

        header("x-forwarded-for")
            .and_then(|v| v.split(',').next())
            .or_else(|| header("x-real-ip"))
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }
}

fn normalize_method(raw: &str) -> Result<String, InvalidRequest> {
    let method = raw.trim();
    if method.is_empty() {
        return Err(InvalidRequest::new("method is required"));
    }
    if !method.bytes().all(is_token_byte) {
        return Err(InvalidRequest::new("method must be an HTTP token"));
    }
    Ok(method.to_ascii_uppercase())
}

fn normalize_path(raw: &str) -> Result<String, InvalidRequest> {
    if raw.is_empty() {
        return Err(InvalidRequest::new("path is required"));
    }
    if !raw.starts_with('/') {
        return Err(InvalidRequest::new("path must start with '/'"));
    }
    Ok(raw.to_string())
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric()
        || matches!(
            b,
            b'!' | b'#'
                | b'$'
                | b'%'
                | b'&'
                | b'\''
                | b'*'
                | b'+'
                | b'-'
                | b'.'
                | b'^'
                | b'_'
                | b'`'
                | b'|'
                | b'~'
        )
}
