use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Consecutive-failure breaker guarding the classifier.
///
/// While open, callers skip the classifier entirely and use their fallback.
/// After `open_for` one probe call is let through; its outcome closes or
/// re-opens the circuit.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerState>,
    failure_threshold: u32,
    open_for: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_for: Duration) -> Self {
        Self {
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
            failure_threshold: failure_threshold.max(1),
            open_for,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn allow_request(&self) -> bool {
        self.allow_request_at(Instant::now())
    }

    fn allow_request_at(&self, now: Instant) -> bool {
        let mut inner = self.lock();
        let elapsed = inner
            .opened_at
            .map(|opened| now.saturating_duration_since(opened))
            .unwrap_or(Duration::MAX);

        let state = inner.state;
        let probe_in_flight = inner.probe_in_flight;

        match state {
            CircuitState::Closed => true,
            CircuitState::Open if elapsed < self.open_for => false,
            // A probe whose caller went away never reports back; after another
            // open period a new probe replaces it.
            CircuitState::HalfOpen if probe_in_flight && elapsed < self.open_for => false,
            CircuitState::Open | CircuitState::HalfOpen => {
                inner.state = CircuitState::HalfOpen;
                inner.opened_at = Some(now);
                inner.probe_in_flight = true;
                true
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now());
    }

    fn record_failure_at(&self, now: Instant) {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.probe_in_flight = false;

        let state = inner.state;
        let trips = match state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.consecutive_failures >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if trips {
            inner.state = CircuitState::Open;
            inner.opened_at = Some(now);
        }
    }
}
