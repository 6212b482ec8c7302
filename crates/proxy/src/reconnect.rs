//! Reconnection control: capped exponential backoff with jitter.
//!
//! One controller exists per upstream connection. It owns the decision of
//! whether and when to retry, tracks the six-state connection lifecycle, and
//! reports state transitions to observers in the order they occur. The
//! actual connect work is supplied by the transport as a thunk; the
//! controller only schedules it.

use rand::Rng;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Backoff policy for one connection.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectSettings {
    /// Retry budget; 0 means any failure is immediately terminal.
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Fraction in [0, 1]; the scheduled delay is spread uniformly across
    /// `base * (1 ± jitter)`.
    pub jitter: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter: 0.25,
        }
    }
}

impl ReconnectSettings {
    /// Deterministic part of the delay for retry number `attempt` (0-based).
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = self.backoff_multiplier.powi(attempt.min(64) as i32);
        let ms = (self.initial_delay_ms as f64 * exp).min(self.max_delay_ms as f64);
        Duration::from_millis(ms as u64)
    }

    /// Jittered delay for retry number `attempt` (0-based), clamped to ≥ 0.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let jitter = self.jitter.clamp(0.0, 1.0);
        let factor = if jitter == 0.0 {
            1.0
        } else {
            1.0 + rand::thread_rng().gen_range(-jitter..=jitter)
        };
        Duration::from_millis((base * factor).max(0.0) as u64)
    }
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        write!(f, "{text}")
    }
}

/// Future-producing thunk invoked when a scheduled retry fires.
pub type ConnectFn =
    Arc<dyn Fn() -> futures_util::future::BoxFuture<'static, ()> + Send + Sync>;

/// Callback invoked once the retry budget is exhausted or a non-retryable
/// error short-circuits the controller.
pub type GiveUpFn = Arc<dyn Fn(String) + Send + Sync>;

struct ControllerInner {
    name: String,
    settings: ReconnectSettings,
    state: Mutex<ConnectionState>,
    attempts: AtomicU32,
    timer: Mutex<Option<JoinHandle<()>>>,
    observers: broadcast::Sender<ConnectionState>,
    connect: Mutex<Option<ConnectFn>>,
    give_up: Mutex<Option<GiveUpFn>>,
}

/// Drives the retry decision for a single connection.
#[derive(Clone)]
pub struct ReconnectController {
    inner: Arc<ControllerInner>,
}

impl ReconnectController {
    pub fn new(name: impl Into<String>, settings: ReconnectSettings) -> Self {
        let (observers, _) = broadcast::channel(32);
        Self {
            inner: Arc::new(ControllerInner {
                name: name.into(),
                settings,
                state: Mutex::new(ConnectionState::Idle),
                attempts: AtomicU32::new(0),
                timer: Mutex::new(None),
                observers,
                connect: Mutex::new(None),
                give_up: Mutex::new(None),
            }),
        }
    }

    /// Install the connect thunk and give-up callback. Must be called before
    /// the first disconnect is reported; typically right after construction,
    /// once the owning connection exists.
    pub fn set_hooks(&self, connect: ConnectFn, give_up: GiveUpFn) {
        *self.inner.connect.lock().expect("reconnect lock") = Some(connect);
        *self.inner.give_up.lock().expect("reconnect lock") = Some(give_up);
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.lock().expect("reconnect lock")
    }

    /// Retry attempts consumed since the last successful connect.
    pub fn attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    /// Subscribe to state transitions. Transitions are delivered in the
    /// order they occur.
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionState> {
        self.inner.observers.subscribe()
    }

    /// A connect attempt is starting. Resets the attempt counter only when
    /// coming from `Idle` (a fresh start, not a retry). A retry that is
    /// already in `Reconnecting` stays there.
    pub fn note_connecting(&self) {
        let mut state = self.inner.state.lock().expect("reconnect lock");
        match *state {
            ConnectionState::Idle => {
                self.inner.attempts.store(0, Ordering::SeqCst);
                Self::transition(&self.inner, &mut state, ConnectionState::Connecting);
            }
            ConnectionState::Disconnected => {
                Self::transition(&self.inner, &mut state, ConnectionState::Connecting);
            }
            _ => {}
        }
    }

    /// The connection is up. Resets the attempt counter and cancels any
    /// pending retry timer.
    pub fn note_connected(&self) {
        self.cancel_timer();
        self.inner.attempts.store(0, Ordering::SeqCst);
        let mut state = self.inner.state.lock().expect("reconnect lock");
        Self::transition(&self.inner, &mut state, ConnectionState::Connected);
    }

    /// The connection was lost or a connect attempt failed. Schedules a
    /// retry while the budget lasts, otherwise gives up.
    pub fn note_disconnected(&self, error: impl Into<String>) {
        let error = error.into();
        let attempt = self.inner.attempts.fetch_add(1, Ordering::SeqCst) + 1;

        {
            let mut state = self.inner.state.lock().expect("reconnect lock");
            Self::transition(&self.inner, &mut state, ConnectionState::Disconnected);
        }

        if attempt > self.inner.settings.max_attempts {
            warn!(
                connection = %self.inner.name,
                attempts = attempt - 1,
                error = %error,
                "retry budget exhausted"
            );
            self.enter_failed(error);
            return;
        }

        let delay = self.inner.settings.delay(attempt - 1);
        debug!(
            connection = %self.inner.name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "scheduling reconnect"
        );

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let connect = {
                let mut state = inner.state.lock().expect("reconnect lock");
                if *state != ConnectionState::Disconnected {
                    return;
                }
                Self::transition(&inner, &mut state, ConnectionState::Reconnecting);
                inner.connect.lock().expect("reconnect lock").clone()
            };

            if let Some(connect) = connect {
                connect().await;
            }
        });
        *self.inner.timer.lock().expect("reconnect lock") = Some(handle);
    }

    /// A non-retryable error: go straight to `Failed` without consuming the
    /// retry budget.
    pub fn fail(&self, error: impl Into<String>) {
        self.enter_failed(error.into());
    }

    /// Cancel any pending retry and return to `Idle` (explicit close).
    pub fn cancel(&self) {
        self.cancel_timer();
        let mut state = self.inner.state.lock().expect("reconnect lock");
        Self::transition(&self.inner, &mut state, ConnectionState::Idle);
    }

    fn enter_failed(&self, error: String) {
        self.cancel_timer();
        {
            let mut state = self.inner.state.lock().expect("reconnect lock");
            Self::transition(&self.inner, &mut state, ConnectionState::Failed);
        }
        let give_up = self.inner.give_up.lock().expect("reconnect lock").clone();
        if let Some(give_up) = give_up {
            give_up(error);
        }
    }

    fn cancel_timer(&self) {
        if let Some(handle) = self.inner.timer.lock().expect("reconnect lock").take() {
            handle.abort();
        }
    }

    fn transition(
        inner: &ControllerInner,
        state: &mut ConnectionState,
        next: ConnectionState,
    ) {
        if *state == next {
            return;
        }
        debug!(connection = %inner.name, from = %state, to = %next, "connection state");
        *state = next;
        let _ = inner.observers.send(next);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    fn fast_settings(max_attempts: u32) -> ReconnectSettings {
        ReconnectSettings {
            max_attempts,
            initial_delay_ms: 5,
            max_delay_ms: 50,
            backoff_multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn base_delay_is_capped() {
        let settings = ReconnectSettings::default();
        assert_eq!(settings.base_delay(0), Duration::from_millis(1_000));
        assert_eq!(settings.base_delay(1), Duration::from_millis(2_000));
        assert_eq!(settings.base_delay(30), Duration::from_millis(60_000));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let settings = ReconnectSettings {
            jitter: 0.25,
            ..ReconnectSettings::default()
        };
        for attempt in 0..12 {
            let base = settings.base_delay(attempt).as_millis() as f64;
            for _ in 0..50 {
                let delay = settings.delay(attempt).as_millis() as f64;
                assert!(delay >= (base * 0.75).floor(), "attempt {attempt}: {delay} < lower bound");
                assert!(delay <= (base * 1.25).ceil(), "attempt {attempt}: {delay} > upper bound");
            }
        }
    }

    #[tokio::test]
    async fn retries_then_gives_up() {
        let controller = ReconnectController::new("test", fast_settings(2));
        let fired = Arc::new(AtomicUsize::new(0));
        let (gave_up_tx, mut gave_up_rx) = mpsc::unbounded_channel();

        let fired_clone = Arc::clone(&fired);
        let controller_clone = controller.clone();
        controller.set_hooks(
            Arc::new(move || {
                let fired = Arc::clone(&fired_clone);
                let controller = controller_clone.clone();
                Box::pin(async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                    // Every reconnect attempt fails again.
                    controller.note_disconnected("still down");
                })
            }),
            Arc::new(move |err| {
                let _ = gave_up_tx.send(err);
            }),
        );

        controller.note_connecting();
        controller.note_disconnected("initial failure");

        let err = tokio::time::timeout(Duration::from_secs(2), gave_up_rx.recv())
            .await
            .expect("give-up fires")
            .expect("give-up carries error");
        assert_eq!(err, "still down");
        assert_eq!(controller.state(), ConnectionState::Failed);
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_attempts_fails_immediately() {
        let controller = ReconnectController::new("test", fast_settings(0));
        let (gave_up_tx, mut gave_up_rx) = mpsc::unbounded_channel();
        controller.set_hooks(
            Arc::new(|| Box::pin(async {})),
            Arc::new(move |err| {
                let _ = gave_up_tx.send(err);
            }),
        );

        controller.note_connecting();
        controller.note_disconnected("boom");

        let err = tokio::time::timeout(Duration::from_millis(200), gave_up_rx.recv())
            .await
            .expect("give-up fires")
            .unwrap();
        assert_eq!(err, "boom");
        assert_eq!(controller.state(), ConnectionState::Failed);
    }

    #[tokio::test]
    async fn connected_resets_attempts() {
        let controller = ReconnectController::new("test", fast_settings(5));
        controller.set_hooks(Arc::new(|| Box::pin(async {})), Arc::new(|_| {}));

        controller.note_connecting();
        controller.note_disconnected("one");
        assert_eq!(controller.attempts(), 1);

        controller.note_connected();
        assert_eq!(controller.attempts(), 0);
        assert_eq!(controller.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn cancel_returns_to_idle_and_stops_timer() {
        let controller = ReconnectController::new("test", fast_settings(5));
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        controller.set_hooks(
            Arc::new(move || {
                let fired = Arc::clone(&fired_clone);
                Box::pin(async move {
                    fired.fetch_add(1, Ordering::SeqCst);
                })
            }),
            Arc::new(|_| {}),
        );

        controller.note_connecting();
        controller.note_disconnected("down");
        controller.cancel();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(controller.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn non_retryable_short_circuits_without_consuming_attempts() {
        let controller = ReconnectController::new("test", fast_settings(5));
        controller.set_hooks(Arc::new(|| Box::pin(async {})), Arc::new(|_| {}));

        controller.note_connecting();
        controller.fail("invalid url");

        assert_eq!(controller.state(), ConnectionState::Failed);
        assert_eq!(controller.attempts(), 0);
    }

    #[tokio::test]
    async fn observers_see_transitions_in_order() {
        let controller = ReconnectController::new("test", fast_settings(5));
        controller.set_hooks(Arc::new(|| Box::pin(async {})), Arc::new(|_| {}));
        let mut rx = controller.subscribe();

        controller.note_connecting();
        controller.note_connected();
        controller.note_disconnected("down");
        controller.cancel();

        assert_eq!(rx.recv().await.unwrap(), ConnectionState::Connecting);
        assert_eq!(rx.recv().await.unwrap(), ConnectionState::Connected);
        assert_eq!(rx.recv().await.unwrap(), ConnectionState::Disconnected);
        assert_eq!(rx.recv().await.unwrap(), ConnectionState::Idle);
    }
}
