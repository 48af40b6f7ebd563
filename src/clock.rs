use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn unix_now_ms() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(duration) => duration.as_millis().min(i64::MAX as u128) as i64,
        Err(_) => 0,
    }
}

/// Whole seconds left until `target_ms`, never negative.
pub fn remaining_seconds(now_ms: i64, target_ms: i64) -> i64 {
    target_ms.saturating_sub(now_ms).max(0) / 1_000
}

pub trait Clock: Send + Sync {
    fn now_unix_ms(&self) -> i64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_unix_ms(&self) -> i64 {
        unix_now_ms()
    }
}

/// Wall clock shifted by a smoothed server-time offset so countdowns track
/// the marketplace's authoritative end times.
#[derive(Debug, Default)]
pub struct SyncedClock {
    offset_ms: AtomicI64,
}

impl SyncedClock {
    pub fn offset_ms(&self) -> i64 {
        self.offset_ms.load(Ordering::Relaxed)
    }

    pub fn set_offset_ms(&self, offset_ms: i64) {
        self.offset_ms.store(offset_ms, Ordering::Relaxed);
    }
}

impl Clock for SyncedClock {
    fn now_unix_ms(&self) -> i64 {
        unix_now_ms().saturating_add(self.offset_ms())
    }
}

/// Test clock driven by hand.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set_ms(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn advance_ms(&self, delta_ms: i64) {
        self.now_ms.fetch_add(delta_ms, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_unix_ms(&self) -> i64 {
        self.now_ms.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ClockOffsetSample {
    pub offset_ms: i64,
    pub rtt_ms: i64,
}

/// Offset of the server clock against the local midpoint of the probe
/// round trip.
pub fn offset_sample(
    request_started_ms: i64,
    request_finished_ms: i64,
    server_time_ms: i64,
) -> ClockOffsetSample {
    let rtt_ms = request_finished_ms.saturating_sub(request_started_ms).max(0);
    let local_midpoint_ms = request_started_ms.saturating_add(rtt_ms / 2);
    ClockOffsetSample {
        offset_ms: server_time_ms.saturating_sub(local_midpoint_ms),
        rtt_ms,
    }
}

#[derive(Debug, Default)]
pub struct ClockSyncEwma {
    initialized: bool,
    value_ms: i64,
}

impl ClockSyncEwma {
    pub fn update(&mut self, sample_ms: i64, rtt_ms: i64) -> i64 {
        if !self.initialized {
            self.initialized = true;
            self.value_ms = sample_ms;
            return self.value_ms;
        }

        // Noisy round trips get a smaller gain; wild samples are clamped.
        let gain_permille = gain_for_rtt(rtt_ms);
        let delta = sample_ms.saturating_sub(self.value_ms).clamp(-300, 300);
        self.value_ms = self
            .value_ms
            .saturating_add(delta.saturating_mul(gain_permille) / 1_000);
        self.value_ms
    }
}

fn gain_for_rtt(rtt_ms: i64) -> i64 {
    if rtt_ms <= 80 {
        280
    } else if rtt_ms <= 180 {
        200
    } else if rtt_ms <= 350 {
        130
    } else {
        90
    }
}
