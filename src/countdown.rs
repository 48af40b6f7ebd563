use crate::clock::{remaining_seconds, Clock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
pub struct CountdownTick {
    pub remaining_seconds: i64,
    pub display: String,
    pub complete: bool,
}

/// Per-auction countdown against a server-authoritative end time. Remaining
/// time is recomputed from the clock on every tick rather than decremented,
/// so a drifting or resynchronized clock cannot accumulate error.
#[derive(Clone)]
pub struct Countdown {
    clock: Arc<dyn Clock>,
    target_ms: i64,
    created_at_ms: i64,
    initial_remaining_seconds: i64,
}

impl Countdown {
    pub fn new(clock: Arc<dyn Clock>, target_ms: i64) -> Self {
        let created_at_ms = clock.now_unix_ms();
        let initial_remaining_seconds = remaining_seconds(created_at_ms, target_ms);
        Self {
            clock,
            target_ms,
            created_at_ms,
            initial_remaining_seconds,
        }
    }

    pub fn target_ms(&self) -> i64 {
        self.target_ms
    }

    pub fn remaining_seconds(&self) -> i64 {
        remaining_seconds(self.clock.now_unix_ms(), self.target_ms)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining_seconds() == 0
    }

    pub fn tick(&self) -> CountdownTick {
        let remaining = self.remaining_seconds();
        CountdownTick {
            remaining_seconds: remaining,
            display: format_remaining(remaining),
            complete: remaining == 0,
        }
    }

    /// Fraction of the original duration still remaining, as a percentage
    /// clamped to [0, 100]. The original duration is reconstructed from the
    /// current remaining time plus the wall time elapsed since this
    /// countdown was created, so a countdown created after time has already
    /// elapsed reports against the shorter window it actually observed.
    pub fn percent_remaining(&self) -> f64 {
        let remaining = self.remaining_seconds();
        let elapsed = self
            .clock
            .now_unix_ms()
            .saturating_sub(self.created_at_ms)
            .max(0)
            / 1_000;
        let total = remaining + elapsed;
        if total <= 0 {
            return 0.0;
        }
        ((remaining as f64 / total as f64) * 100.0).clamp(0.0, 100.0)
    }

    /// Starts the 1 s tick loop. The returned receiver always holds the
    /// latest tick; a target already in the past publishes a single terminal
    /// tick and never starts the loop. The terminal tick is published at
    /// most once per countdown, after which the sender is dropped.
    pub fn spawn(self, cancel: CancellationToken) -> watch::Receiver<CountdownTick> {
        let (tick_tx, tick_rx) = watch::channel(self.tick());

        tokio::spawn(async move {
            if self.initial_remaining_seconds == 0 {
                return;
            }

            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let tick = self.tick();
                        let complete = tick.complete;
                        tick_tx.send_replace(tick);
                        if complete {
                            break;
                        }
                    }
                }
            }
        });

        tick_rx
    }
}

/// Zero-padded `HH:MM:SS`; hours grow without bound.
pub fn format_remaining(remaining_seconds: i64) -> String {
    let clamped = remaining_seconds.max(0);
    let hours = clamped / 3_600;
    let minutes = (clamped % 3_600) / 60;
    let seconds = clamped % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}
