//! # Activity Monitor
//!
//! Tracks the wall-clock time of the last user interaction and signals when
//! the user has been idle long enough to be warned or signed out.
//!
//! ## Timing model
//!
//! A single background task sleeps until the next deadline. Every wakeup,
//! whether from the timer, from `record_activity()` or from `resume()`,
//! recomputes idle time as `clock.now() - last_activity_at`. Timers that
//! stalled while the host was suspended therefore catch up on the first
//! wakeup instead of drifting.
//!
//! ```text
//!  last activity        warning                    timeout
//!       |------------------|--------------------------|
//!       0     idle_timeout - warning_lead        idle_timeout
//! ```
//!
//! The monitor only signals. Ending the session is up to the subscriber.

use bridge_traits::time::Clock;
use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

const SIGNAL_BUFFER: usize = 16;

/// Notification produced by the monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivitySignal {
    /// Idle long enough to show a warning.
    Warning { time_left: Duration },
    /// Activity dismissed a shown warning.
    Resumed,
    /// The idle timeout elapsed. Sent once per idle period.
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Active,
    Warned,
    TimedOut,
}

struct MonitorState {
    last_activity_at: DateTime<Utc>,
    phase: Phase,
    running: Option<CancellationToken>,
}

struct Inner {
    clock: Arc<dyn Clock>,
    idle_timeout: Duration,
    warning_lead: Duration,
    state: Mutex<MonitorState>,
    wake: Notify,
    signals: broadcast::Sender<ActivitySignal>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn idle_since(&self, last_activity_at: DateTime<Utc>) -> Duration {
        (self.clock.now() - last_activity_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Advances the phase from the wall clock and returns how long to sleep
    /// before the next deadline, or `None` once timed out.
    fn evaluate(&self) -> Option<Duration> {
        let mut state = self.lock();
        if state.phase == Phase::TimedOut {
            return None;
        }

        let idle = self.idle_since(state.last_activity_at);
        if idle >= self.idle_timeout {
            state.phase = Phase::TimedOut;
            state.running = None;
            info!(idle_ms = idle.as_millis() as u64, "Idle timeout reached");
            let _ = self.signals.send(ActivitySignal::Timeout);
            return None;
        }

        let time_left = self.idle_timeout - idle;
        let warn_after = self.idle_timeout.saturating_sub(self.warning_lead);
        if idle >= warn_after {
            if state.phase == Phase::Active {
                state.phase = Phase::Warned;
                debug!(time_left_ms = time_left.as_millis() as u64, "Idle warning");
                let _ = self.signals.send(ActivitySignal::Warning { time_left });
            }
            return Some(time_left);
        }

        Some(warn_after - idle)
    }
}

/// Idle detector with a single wall-clock driven timer task.
#[derive(Clone)]
pub struct ActivityMonitor {
    inner: Arc<Inner>,
}

impl ActivityMonitor {
    pub fn new(clock: Arc<dyn Clock>, idle_timeout: Duration, warning_lead: Duration) -> Self {
        let (signals, _) = broadcast::channel(SIGNAL_BUFFER);
        let now = clock.now();

        Self {
            inner: Arc::new(Inner {
                clock,
                idle_timeout,
                warning_lead,
                state: Mutex::new(MonitorState {
                    last_activity_at: now,
                    phase: Phase::Active,
                    running: None,
                }),
                wake: Notify::new(),
                signals,
            }),
        }
    }

    /// Starts a fresh idle period and the timer task.
    ///
    /// Restarting replaces the previous task. Must be called within a Tokio
    /// runtime.
    pub fn start(&self) {
        let token = CancellationToken::new();
        {
            let mut state = self.inner.lock();
            if let Some(previous) = state.running.take() {
                previous.cancel();
            }
            state.last_activity_at = self.inner.clock.now();
            state.phase = Phase::Active;
            state.running = Some(token.clone());
        }

        debug!(
            idle_timeout_ms = self.inner.idle_timeout.as_millis() as u64,
            warning_lead_ms = self.inner.warning_lead.as_millis() as u64,
            "Activity monitor started"
        );
        tokio::spawn(run(Arc::clone(&self.inner), token));
    }

    /// Cancels the timer task. No signal is sent afterwards.
    pub fn stop(&self) {
        let running = self.inner.lock().running.take();
        if let Some(token) = running {
            token.cancel();
            debug!("Activity monitor stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .lock()
            .running
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Marks the user as active now.
    ///
    /// Cheap and idempotent: bursts of calls coalesce into one recompute by
    /// the timer task. Ignored once the idle period timed out.
    pub fn record_activity(&self) {
        {
            let mut state = self.inner.lock();
            if state.phase == Phase::TimedOut {
                return;
            }
            state.last_activity_at = self.inner.clock.now();
            if state.phase == Phase::Warned {
                state.phase = Phase::Active;
                debug!("Idle warning dismissed by activity");
                let _ = self.inner.signals.send(ActivitySignal::Resumed);
            }
        }
        self.inner.wake.notify_one();
    }

    /// Explicit "stay signed in" from the warning prompt.
    pub fn stay_active(&self) {
        self.record_activity();
    }

    /// Re-evaluates deadlines after the host was hidden or suspended.
    ///
    /// Does not count as activity.
    pub fn resume(&self) {
        self.inner.wake.notify_one();
    }

    pub fn idle_for(&self) -> Duration {
        let last = self.inner.lock().last_activity_at;
        self.inner.idle_since(last)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ActivitySignal> {
        self.inner.signals.subscribe()
    }
}

async fn run(inner: Arc<Inner>, token: CancellationToken) {
    loop {
        if token.is_cancelled() {
            break;
        }
        let Some(wait) = inner.evaluate() else {
            break;
        };

        tokio::select! {
            _ = token.cancelled() => break,
            _ = inner.wake.notified() => {}
            _ = tokio::time::sleep(wait) => {}
        }
    }
    debug!("Activity timer task exited");
}
