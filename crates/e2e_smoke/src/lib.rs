//! End-to-end checks for the gateway; see `tests/smoke.rs`.
