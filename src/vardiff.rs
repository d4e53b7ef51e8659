//! Adaptive per-miner difficulty targeting a desired share interval.
//!
//! Invoked synchronously from the share submission hot path; the lock is
//! held only for in-memory bookkeeping, never across I/O. Persistence runs
//! on a blocking task so a slow disk never stalls the scheduler.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::VarDiffConfig;

fn now_secs() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

#[derive(Debug, Clone)]
struct MinerState {
    difficulty: f64,
    shares: VecDeque<(f64, f64)>,
    last_retarget: f64,
    ema_interval: Option<f64>,
}

impl MinerState {
    fn new(start_difficulty: f64, window: usize) -> Self {
        Self {
            difficulty: start_difficulty,
            shares: VecDeque::with_capacity(window.min(64)),
            last_retarget: now_secs(),
            ema_interval: None,
        }
    }
}

/// Adaptive per-miner difficulty controller.
///
/// The current network difficulty is supplied by the caller (the template
/// updater) rather than read from a global singleton, so the controller
/// stays free of hidden shared state.
pub struct VarDiffController {
    config: VarDiffConfig,
    miners: Mutex<HashMap<String, MinerState>>,
}

impl VarDiffController {
    pub fn new(config: VarDiffConfig) -> Self {
        Self {
            config,
            miners: Mutex::new(HashMap::new()),
        }
    }

    /// Current difficulty for a miner, applying the inactivity auto-drop if
    /// the miner has gone quiet.
    pub fn get_difficulty(&self, worker: &str) -> f64 {
        let mut miners = self.miners.lock();
        let state = miners
            .entry(worker.to_string())
            .or_insert_with(|| MinerState::new(self.config.start_difficulty, self.config.retarget_shares as usize * 6));

        if let Some(&(last_ts, _)) = state.shares.back() {
            let idle = now_secs() - last_ts;
            let floor = self.config.inactivity_lower.max(self.config.inactivity_multiples * self.config.target_interval);
            if idle > floor && state.difficulty > self.config.min_difficulty {
                state.difficulty = (state.difficulty * self.config.inactivity_drop_factor).max(self.config.min_difficulty);
                state.last_retarget = now_secs();
                state.shares.clear();
            }
        }
        state.difficulty
    }

    /// Record an accepted share and maybe retarget. `network_difficulty`
    /// bounds the result via `chain_headroom`. Returns the (possibly
    /// updated) current difficulty.
    pub fn record_share(&self, worker: &str, diff_used: f64, network_difficulty: f64) -> f64 {
        let now = now_secs();
        let mut miners = self.miners.lock();
        let window_cap = (self.config.retarget_shares as usize * 6).max(2);
        let state = miners
            .entry(worker.to_string())
            .or_insert_with(|| MinerState::new(self.config.start_difficulty, window_cap));

        if let Some(&(last_ts, _)) = state.shares.back() {
            let delta = now - last_ts;
            state.ema_interval = Some(match state.ema_interval {
                Some(ema) => self.config.ema_alpha * delta + (1.0 - self.config.ema_alpha) * ema,
                None => delta,
            });
        }
        state.shares.push_back((now, diff_used));
        if state.shares.len() > window_cap {
            state.shares.pop_front();
        }

        self.maybe_retarget(state, network_difficulty);
        state.difficulty
    }

    fn maybe_retarget(&self, state: &mut MinerState, network_difficulty: f64) {
        let now = now_secs();
        let share_count = state.shares.len();
        let elapsed = now - state.last_retarget;
        if share_count < 2 {
            return;
        }
        if share_count < self.config.retarget_shares as usize && elapsed < self.config.retarget_time {
            return;
        }
        let first_ts = state.shares.front().unwrap().0;
        let last_ts = state.shares.back().unwrap().0;
        let window_time = last_ts - first_ts;
        if window_time <= 0.0 {
            return;
        }
        let avg_interval = window_time / (share_count - 1) as f64;
        let blended = match state.ema_interval {
            Some(ema) => 0.5 * avg_interval + 0.5 * ema,
            None => avg_interval,
        };
        if blended <= 0.0 {
            return;
        }
        let ratio = self.config.target_interval / blended;

        let mut new_diff = if ratio > self.config.up_step {
            state.difficulty * self.config.up_step
        } else if ratio < self.config.down_step {
            state.difficulty * self.config.down_step
        } else {
            state.difficulty * ratio
        };

        new_diff = new_diff.clamp(self.config.min_difficulty, self.config.max_difficulty);

        if network_difficulty > 0.0 {
            let cap = network_difficulty * self.config.chain_headroom;
            if new_diff > cap {
                new_diff = cap;
            }
        }

        if (new_diff - state.difficulty).abs() / state.difficulty.max(1e-12) >= 0.05 {
            state.difficulty = new_diff;
            state.last_retarget = now;
            state.shares.clear();
            state.ema_interval = None;
        }
    }

    /// Periodic tick: drop difficulty for miners that have gone idle since
    /// their last retarget, then persist.
    pub async fn tick(&self) {
        {
            let mut miners = self.miners.lock();
            let now = now_secs();
            for state in miners.values_mut() {
                if state.shares.is_empty()
                    && now - state.last_retarget > self.config.inactivity_lower
                    && state.difficulty > self.config.min_difficulty
                {
                    state.difficulty = (state.difficulty * self.config.inactivity_drop_factor).max(self.config.min_difficulty);
                    state.last_retarget = now;
                }
            }
        }
        self.persist().await;
    }

    fn snapshot(&self) -> PersistedState {
        let miners = self.miners.lock();
        PersistedState {
            target: self.config.target_interval,
            miners: miners
                .iter()
                .map(|(k, v)| {
                    (
                        k.clone(),
                        PersistedMiner {
                            difficulty: v.difficulty,
                            last_retarget: v.last_retarget,
                            ema_interval: v.ema_interval,
                        },
                    )
                })
                .collect(),
            ts: now_secs(),
        }
    }

    async fn persist(&self) {
        let path = self.config.state_path.clone();
        let snapshot = self.snapshot();
        let result = tokio::task::spawn_blocking(move || write_state_atomic(&path, &snapshot)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::debug!(error = %e, "failed to save vardiff state"),
            Err(e) => tracing::debug!(error = %e, "vardiff persistence task panicked"),
        }
    }

    /// Load persisted per-miner state at startup, if a state file exists.
    pub fn load_from_disk(&self) {
        let path = &self.config.state_path;
        let Ok(text) = std::fs::read_to_string(path) else {
            return;
        };
        match serde_json::from_str::<PersistedState>(&text) {
            Ok(state) => {
                let mut miners = self.miners.lock();
                for (worker, persisted) in state.miners {
                    miners.insert(
                        worker,
                        MinerState {
                            difficulty: persisted.difficulty,
                            shares: VecDeque::new(),
                            last_retarget: persisted.last_retarget,
                            ema_interval: persisted.ema_interval,
                        },
                    );
                }
            }
            Err(e) => tracing::debug!(error = %e, "failed to parse vardiff state file"),
        }
    }

    pub fn remove_worker(&self, worker: &str) {
        self.miners.lock().remove(worker);
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedMiner {
    difficulty: f64,
    last_retarget: f64,
    ema_interval: Option<f64>,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedState {
    target: f64,
    miners: HashMap<String, PersistedMiner>,
    ts: f64,
}

fn write_state_atomic(path: &PathBuf, state: &PersistedState) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp_path = path.with_extension("json.tmp");
    let serialized = serde_json::to_vec(state)?;
    std::fs::write(&tmp_path, serialized)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}
