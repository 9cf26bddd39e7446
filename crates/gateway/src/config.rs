use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use edgeguard_contracts::FailureMode;
use edgeguard_policy::PolicyThresholds;

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_addr: SocketAddr,
    pub classifier_url: String,
    pub classifier_timeout_ms: u64,
    pub classifier_failure_mode: FailureMode,
    pub classifier_circuit_breaker_failure_threshold: u32,
    pub classifier_circuit_breaker_open_ms: u64,
    pub thresholds: PolicyThresholds,
    pub counter_max_keys: usize,
    pub counter_sweep_interval_secs: u64,
    pub trust_forwarded_for: bool,
    pub redact_headers: Vec<String>,
}

/// Fatal startup problem; the process reports it and exits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationError {
    pub code: &'static str,
    pub message: String,
}

impl std::fmt::Display for ConfigurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for ConfigurationError {}

fn invalid(message: impl Into<String>) -> ConfigurationError {
    ConfigurationError {
        code: "ERR_INVALID_CONFIG",
        message: message.into(),
    }
}

const DEFAULT_REDACT_HEADERS: &str = "authorization,cookie,proxy-authorization";

impl GatewayConfig {
    pub fn load() -> Result<Self, ConfigurationError> {
        let mut merged = HashMap::new();

        if let Ok(config_path) = std::env::var("EDGEGUARD_CONFIG_PATH") {
            let config_path = config_path.trim();
            if !config_path.is_empty() {
                merged.extend(parse_env_file(config_path)?);
            }
        }

        merged.extend(std::env::vars());

        Self::from_kv(&merged)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, ConfigurationError> {
        let bind_addr = parse_socket_addr(
            kv.get("EDGEGUARD_BIND_ADDR"),
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080),
            "EDGEGUARD_BIND_ADDR",
        )?;

        let classifier_url = require_nonempty(kv, "EDGEGUARD_CLASSIFIER_URL")?;
        if !(classifier_url.starts_with("http://") || classifier_url.starts_with("https://")) {
            return Err(invalid(
                "EDGEGUARD_CLASSIFIER_URL must be an http:// or https:// URL",
            ));
        }

        let classifier_timeout_ms = parse_u64(
            kv.get("EDGEGUARD_CLASSIFIER_TIMEOUT_MS"),
            2000,
            "EDGEGUARD_CLASSIFIER_TIMEOUT_MS",
        )?;
        if classifier_timeout_ms == 0 {
            return Err(invalid("EDGEGUARD_CLASSIFIER_TIMEOUT_MS must be >= 1"));
        }

        let classifier_failure_mode =
            parse_failure_mode(kv.get("EDGEGUARD_CLASSIFIER_FAILURE_MODE"))?;

        let classifier_circuit_breaker_failure_threshold = parse_u32(
            kv.get("EDGEGUARD_CLASSIFIER_CIRCUIT_BREAKER_FAILURE_THRESHOLD"),
            8,
            "EDGEGUARD_CLASSIFIER_CIRCUIT_BREAKER_FAILURE_THRESHOLD",
        )?;
        if classifier_circuit_breaker_failure_threshold == 0 {
            return Err(invalid(
                "EDGEGUARD_CLASSIFIER_CIRCUIT_BREAKER_FAILURE_THRESHOLD must be >= 1",
            ));
        }
        let classifier_circuit_breaker_open_ms = parse_u64(
            kv.get("EDGEGUARD_CLASSIFIER_CIRCUIT_BREAKER_OPEN_MS"),
            1000,
            "EDGEGUARD_CLASSIFIER_CIRCUIT_BREAKER_OPEN_MS",
        )?;

        let defaults = PolicyThresholds::default();
        let thresholds = PolicyThresholds {
            security_threshold: parse_f64(
                kv.get("EDGEGUARD_THRESHOLD_SECURITY"),
                defaults.security_threshold,
                "EDGEGUARD_THRESHOLD_SECURITY",
            )?,
            rate_limit_ceiling: parse_u64(
                kv.get("EDGEGUARD_RATE_LIMIT_CEILING"),
                defaults.rate_limit_ceiling,
                "EDGEGUARD_RATE_LIMIT_CEILING",
            )?,
            rate_limit_window: Duration::from_secs(parse_u64(
                kv.get("EDGEGUARD_RATE_LIMIT_WINDOW_SECS"),
                defaults.rate_limit_window.as_secs(),
                "EDGEGUARD_RATE_LIMIT_WINDOW_SECS",
            )?),
            penalty_count: parse_u64(
                kv.get("EDGEGUARD_PENALTY_COUNT"),
                defaults.penalty_count,
                "EDGEGUARD_PENALTY_COUNT",
            )?,
            penalty_window: Duration::from_secs(parse_u64(
                kv.get("EDGEGUARD_PENALTY_WINDOW_SECS"),
                defaults.penalty_window.as_secs(),
                "EDGEGUARD_PENALTY_WINDOW_SECS",
            )?),
        };
        thresholds.validate().map_err(|err| invalid(err.to_string()))?;

        let counter_max_keys = parse_usize(
            kv.get("EDGEGUARD_COUNTER_MAX_KEYS"),
            65_536,
            "EDGEGUARD_COUNTER_MAX_KEYS",
        )?;
        if counter_max_keys == 0 {
            return Err(invalid("EDGEGUARD_COUNTER_MAX_KEYS must be >= 1"));
        }
        let counter_sweep_interval_secs = parse_u64(
            kv.get("EDGEGUARD_COUNTER_SWEEP_INTERVAL_SECS"),
            30,
            "EDGEGUARD_COUNTER_SWEEP_INTERVAL_SECS",
        )?;

        let trust_forwarded_for = match kv.get("EDGEGUARD_TRUST_FORWARDED_FOR") {
            None => false,
            Some(raw) if raw.trim().is_empty() => false,
            Some(raw) => parse_bool(raw).ok_or_else(|| {
                invalid("EDGEGUARD_TRUST_FORWARDED_FOR must be a boolean")
            })?,
        };

        let redact_headers = kv
            .get("EDGEGUARD_REDACT_HEADERS")
            .map(|s| s.as_str())
            .unwrap_or(DEFAULT_REDACT_HEADERS)
            .split(',')
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        Ok(Self {
            bind_addr,
            classifier_url,
            classifier_timeout_ms,
            classifier_failure_mode,
            classifier_circuit_breaker_failure_threshold,
            classifier_circuit_breaker_open_ms,
            thresholds,
            counter_max_keys,
            counter_sweep_interval_secs,
            trust_forwarded_for,
            redact_headers,
        })
    }
}

fn parse_env_file(path: &str) -> Result<HashMap<String, String>, ConfigurationError> {
    let contents = std::fs::read_to_string(path).map_err(|_| ConfigurationError {
        code: "ERR_CONFIG_FILE_READ",
        message: format!("failed to read config file at {}", path),
    })?;

    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| ConfigurationError {
            code: "ERR_CONFIG_FILE_PARSE",
            message: format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
        })?;

        let key = key.trim().trim_start_matches("export ").trim();
        if key.is_empty() {
            return Err(ConfigurationError {
                code: "ERR_CONFIG_FILE_PARSE",
                message: format!("invalid config line {} (empty key)", idx + 1),
            });
        }

        kv.insert(key.to_string(), strip_quotes(value.trim()));
    }

    Ok(kv)
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 {
        let first = bytes[0];
        let last = bytes[bytes.len() - 1];
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return s[1..bytes.len() - 1].to_string();
        }
    }
    s.to_string()
}

fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, ConfigurationError> {
    kv.get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .map(|v| v.to_string())
        .ok_or_else(|| ConfigurationError {
            code: "ERR_MISSING_CONFIG",
            message: format!("missing required config key {}", key),
        })
}

fn parse_socket_addr(
    value: Option<&String>,
    default: SocketAddr,
    key: &'static str,
) -> Result<SocketAddr, ConfigurationError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v
            .trim()
            .parse::<SocketAddr>()
            .map_err(|_| invalid(format!("{} must be a valid host:port socket address", key))),
    }
}

fn parse_usize(
    value: Option<&String>,
    default: usize,
    key: &'static str,
) -> Result<usize, ConfigurationError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v
            .trim()
            .parse::<usize>()
            .map_err(|_| invalid(format!("{} must be an integer", key))),
    }
}

fn parse_u64(
    value: Option<&String>,
    default: u64,
    key: &'static str,
) -> Result<u64, ConfigurationError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v
            .trim()
            .parse::<u64>()
            .map_err(|_| invalid(format!("{} must be an integer", key))),
    }
}

fn parse_u32(
    value: Option<&String>,
    default: u32,
    key: &'static str,
) -> Result<u32, ConfigurationError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v
            .trim()
            .parse::<u32>()
            .map_err(|_| invalid(format!("{} must be an integer", key))),
    }
}

fn parse_f64(
    value: Option<&String>,
    default: f64,
    key: &'static str,
) -> Result<f64, ConfigurationError> {
    match value {
        None => Ok(default),
        Some(v) if v.trim().is_empty() => Ok(default),
        Some(v) => v
            .trim()
            .parse::<f64>()
            .map_err(|_| invalid(format!("{} must be a number", key))),
    }
}

fn parse_failure_mode(value: Option<&String>) -> Result<FailureMode, ConfigurationError> {
    let mode = value
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or("fail-open");

    match mode {
        "fail-open" => Ok(FailureMode::FailOpen),
        "fail-closed" => Ok(FailureMode::FailClosed),
        _ => Err(invalid(
            "EDGEGUARD_CLASSIFIER_FAILURE_MODE must be fail-open or fail-closed",
        )),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
        "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
        _ => None,
    }
}
