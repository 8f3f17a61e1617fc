use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockTick {
    Idle,
    Running { remaining: u64 },
    Expired,
}

/// Countdown for one session. `Expired` is reported exactly once.
#[derive(Debug, Clone)]
pub struct SessionClock {
    duration: u64,
    remaining: u64,
    running: bool,
    expired: bool,
}

impl SessionClock {
    pub fn new(duration_seconds: u64) -> Self {
        Self {
            duration: duration_seconds,
            remaining: duration_seconds,
            running: false,
            expired: false,
        }
    }

    pub fn start(&mut self) {
        if !self.expired {
            self.running = true;
        }
    }

    pub fn stop(&mut self) {
        self.running = false;
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn duration(&self) -> u64 {
        self.duration
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn tick(&mut self) -> ClockTick {
        if !self.running {
            return ClockTick::Idle;
        }
        self.remaining = self.remaining.saturating_sub(1);
        if self.remaining == 0 {
            self.running = false;
            self.expired = true;
            ClockTick::Expired
        } else {
            ClockTick::Running {
                remaining: self.remaining,
            }
        }
    }
}

/// Background ticker feeding a session intake. Stops when cancelled, when
/// dropped, or when the intake is gone.
pub struct ClockDriver {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ClockDriver {
    pub fn spawn<T>(
        intake: mpsc::WeakSender<T>,
        make_tick: fn() -> T,
        period: Duration,
        cancel: CancellationToken,
    ) -> Self
    where
        T: Send + 'static,
    {
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(tx) = intake.upgrade() else { break };
                        if tx.send(make_tick()).await.is_err() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("session clock driver stopped");
        });
        Self { cancel, task }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ClockDriver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
