//! Sliding-window and EMA hashrate estimation from accepted shares.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

const MIN_SPAN_SECS: f64 = 10.0;

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

#[derive(Debug, Clone, Copy)]
struct ShareRecord {
    timestamp: f64,
    difficulty: f64,
    accepted: bool,
}

#[derive(Default)]
struct WorkerState {
    shares: Vec<ShareRecord>,
    ema: Option<(f64, f64)>, // (ema_hashrate_hs, last_update_ts)
}

/// A formatted hashrate value ready for display.
#[derive(Debug, Clone, PartialEq)]
pub struct HashrateDisplay {
    pub value: f64,
    pub unit: &'static str,
    pub instant_hs: f64,
    pub ema_hs: f64,
    pub shares: usize,
}

impl HashrateDisplay {
    pub fn formatted(&self) -> String {
        format!("{:.2} {}", self.value, self.unit)
    }
}

pub struct HashrateTracker {
    window_secs: f64,
    ema_half_life: f64,
    workers: Mutex<HashMap<String, WorkerState>>,
}

impl HashrateTracker {
    pub fn new(window_secs: f64, ema_half_life: f64) -> Self {
        Self {
            window_secs,
            ema_half_life,
            workers: Mutex::new(HashMap::new()),
        }
    }

    pub fn add_share(&self, worker: &str, difficulty: f64, accepted: bool) {
        let now = now_secs();
        let mut workers = self.workers.lock();
        let state = workers.entry(worker.to_string()).or_default();
        state.shares.push(ShareRecord {
            timestamp: now,
            difficulty,
            accepted,
        });
        let cutoff = now - self.window_secs;
        state.shares.retain(|s| s.timestamp >= cutoff);

        let inst = instantaneous(&state.shares, now, cutoff);
        let (mut ema_val, last_ts) = state.ema.unwrap_or((inst, now));
        let dt = (now - last_ts).max(0.0);
        let alpha = if self.ema_half_life > 0.0 {
            1.0 - (-dt / self.ema_half_life).exp()
        } else {
            1.0
        };
        ema_val = alpha * inst + (1.0 - alpha) * ema_val;
        if inst > 0.0 && ema_val > inst * 64.0 {
            ema_val = inst;
        }
        state.ema = Some((ema_val, now));
    }

    pub fn display(&self, worker: &str) -> HashrateDisplay {
        let now = now_secs();
        let workers = self.workers.lock();
        let Some(state) = workers.get(worker) else {
            return HashrateDisplay {
                value: 0.0,
                unit: "H/s",
                instant_hs: 0.0,
                ema_hs: 0.0,
                shares: 0,
            };
        };
        let cutoff = now - self.window_secs;
        let inst = instantaneous(&state.shares, now, cutoff);
        let ema_hs = state.ema.map(|(v, _)| v).unwrap_or(inst);
        let display_hs = if ema_hs > 0.0 { ema_hs } else { inst };
        let accepted_count = state.shares.iter().filter(|s| s.accepted).count();
        let (value, unit) = format_hashrate(display_hs);
        HashrateDisplay {
            value,
            unit,
            instant_hs: inst,
            ema_hs,
            shares: accepted_count,
        }
    }

    pub fn remove_worker(&self, worker: &str) {
        self.workers.lock().remove(worker);
    }
}

fn instantaneous(shares: &[ShareRecord], now: f64, cutoff: f64) -> f64 {
    let accepted: Vec<&ShareRecord> = shares.iter().filter(|s| s.accepted && s.timestamp >= cutoff).collect();
    if accepted.is_empty() {
        return 0.0;
    }
    let oldest = accepted.iter().map(|s| s.timestamp).fold(f64::INFINITY, f64::min);
    let mut span = now - cutoff.max(oldest);
    if span < MIN_SPAN_SECS {
        span = MIN_SPAN_SECS;
    }
    let total_diff: f64 = accepted.iter().map(|s| s.difficulty).sum();
    if total_diff <= 0.0 {
        return 0.0;
    }
    (total_diff * 2f64.powi(32)) / span
}

fn format_hashrate(hs: f64) -> (f64, &'static str) {
    if hs >= 1_000_000_000.0 {
        (hs / 1_000_000_000.0, "GH/s")
    } else if hs >= 1_000_000.0 {
        (hs / 1_000_000.0, "MH/s")
    } else if hs >= 1_000.0 {
        (hs / 1_000.0, "KH/s")
    } else {
        (hs, "H/s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_worker_displays_zero() {
        let tracker = HashrateTracker::new(300.0, 120.0);
        let display = tracker.display("nobody");
        assert_eq!(display.value, 0.0);
        assert_eq!(display.unit, "H/s");
    }

    #[test]
    fn instantaneous_rate_uses_min_span_floor() {
        let tracker = HashrateTracker::new(300.0, 120.0);
        tracker.add_share("alice", 1000.0, true);
        let display = tracker.display("alice");
        // diff * 2^32 / MIN_SPAN(10) is the expected floor-limited rate.
        let expected = (1000.0 * 2f64.powi(32)) / MIN_SPAN_SECS;
        assert!((display.instant_hs - expected).abs() / expected < 0.05);
    }

    #[test]
    fn rejected_shares_do_not_count_toward_rate() {
        let tracker = HashrateTracker::new(300.0, 120.0);
        tracker.add_share("alice", 1000.0, false);
        let display = tracker.display("alice");
        assert_eq!(display.instant_hs, 0.0);
    }

    #[test]
    fn remove_worker_clears_state() {
        let tracker = HashrateTracker::new(300.0, 120.0);
        tracker.add_share("alice", 1000.0, true);
        tracker.remove_worker("alice");
        let display = tracker.display("alice");
        assert_eq!(display.shares, 0);
    }

    #[test]
    fn format_hashrate_picks_correct_unit() {
        assert_eq!(format_hashrate(500.0).1, "H/s");
        assert_eq!(format_hashrate(5_000.0).1, "KH/s");
        assert_eq!(format_hashrate(5_000_000.0).1, "MH/s");
        assert_eq!(format_hashrate(5_000_000_000.0).1, "GH/s");
    }
}
