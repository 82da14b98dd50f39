use log::{debug, info, warn};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

use super::scheduler::SchedulerHandle;
use crate::modbus::connection::Transport;
use crate::modbus::executor::LivenessClock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessState {
    Fresh,
    Stale,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LivenessSettings {
    pub stale_after: Duration,
    pub reconnect_cooldown: Duration,
    pub tick: Duration,
}

impl Default for LivenessSettings {
    fn default() -> Self {
        Self {
            stale_after: Duration::from_millis(3000),
            reconnect_cooldown: Duration::from_millis(3000),
            tick: Duration::from_millis(500),
        }
    }
}

/// Decides when a silent link deserves a reconnect, and rate-limits attempts.
#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    settings: LivenessSettings,
    state: LivenessState,
    last_reconnect_attempt: Option<Instant>,
}

impl LivenessMonitor {
    pub fn new(settings: LivenessSettings) -> Self {
        Self {
            settings,
            state: LivenessState::Fresh,
            last_reconnect_attempt: None,
        }
    }

    pub fn state(&self) -> LivenessState {
        self.state
    }

    pub fn last_reconnect_attempt(&self) -> Option<Instant> {
        self.last_reconnect_attempt
    }

    /// Returns true exactly when a reconnect should be submitted now.
    /// `session_active` is false while the user wants to stay disconnected.
    /// A degraded clock counts as stale however recent its last success.
    pub fn evaluate(&mut self, now: Instant, clock: &LivenessClock, session_active: bool) -> bool {
        if self.state == LivenessState::Reconnecting {
            return false;
        }
        if !session_active {
            self.state = LivenessState::Fresh;
            return false;
        }
        // staleness needs at least one prior success
        let last_success = match clock.last_success {
            Some(at) => at,
            None => return false,
        };

        let silent = now.saturating_duration_since(last_success);
        if silent <= self.settings.stale_after && !clock.degraded {
            self.state = LivenessState::Fresh;
            return false;
        }

        if self.state == LivenessState::Fresh {
            if clock.degraded {
                debug!("Link degraded: a chunked read failed");
            } else {
                debug!("Link went stale: no successful exchange for {:?}", silent);
            }
        }
        self.state = LivenessState::Stale;

        let cooled_down = self
            .last_reconnect_attempt
            .map_or(true, |at| now.saturating_duration_since(at) >= self.settings.reconnect_cooldown);
        if !cooled_down {
            return false;
        }

        self.state = LivenessState::Reconnecting;
        self.last_reconnect_attempt = Some(now);
        true
    }

    pub fn reconnect_finished(&mut self, success: bool) {
        self.state = if success {
            LivenessState::Fresh
        } else {
            LivenessState::Stale
        };
    }
}

/// Runs the monitor against the scheduler until `session` is dropped.
///
/// While a reconnect is in flight `pollers` is held at `false`; pollers resume
/// once the reconnect reports either way.
pub fn spawn_supervisor<T: Transport + 'static>(
    mut monitor: LivenessMonitor,
    scheduler: SchedulerHandle<T>,
    mut session: watch::Receiver<bool>,
    pollers: watch::Sender<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(monitor.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let liveness = scheduler.liveness();

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = session.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let clock = *liveness.borrow();
            let active = *session.borrow();
            if !monitor.evaluate(Instant::now(), &clock, active) {
                continue;
            }

            if clock.degraded {
                warn!("⚠️  Chunked read failed, reconnecting");
            } else {
                warn!(
                    "⚠️  No successful exchange for over {:?}, reconnecting",
                    monitor.settings.stale_after
                );
            }
            let _ = pollers.send(false);
            let result = scheduler.connect().await;
            match &result {
                Ok(()) => info!("✅ Reconnected after stale link"),
                Err(e) => warn!("⚠️  Reconnect attempt failed: {}", e),
            }
            monitor.reconnect_finished(result.is_ok());
            let _ = pollers.send(true);
        }

        debug!("Liveness supervisor stopped");
    })
}
