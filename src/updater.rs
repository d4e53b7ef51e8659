//! Polls the node for a fresh block template and republishes jobs whenever
//! the tip changes or the ntime roll window elapses.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ruint::aliases::U256;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::coinbase::build_coinbase;
use crate::config::Config;
use crate::encoding::{merkle_branch_index0, target_to_difficulty};
use crate::error::{Error, Result};
use crate::rpc::NodeRpcClient;
use crate::stratum::messages::Notification;
use crate::template::{Template, TemplateStore};
use crate::vardiff::VarDiffController;

/// Serializes every `update_once` call across the poller and the ZMQ
/// listener, so a forced refresh never races an in-flight one (spec §5).
pub type RefreshLock = Arc<Mutex<()>>;

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn word_swap(le_bytes: &[u8; 32]) -> [u8; 32] {
    let mut out = [0u8; 32];
    for chunk in 0..8 {
        let word = &le_bytes[chunk * 4..chunk * 4 + 4];
        out[chunk * 4] = word[3];
        out[chunk * 4 + 1] = word[2];
        out[chunk * 4 + 2] = word[1];
        out[chunk * 4 + 3] = word[0];
    }
    out
}

fn field<'a>(value: &'a Value, key: &str) -> Result<&'a Value> {
    value.get(key).ok_or_else(|| Error::Protocol(format!("getblocktemplate missing field {key}")))
}

fn hex_field(value: &Value, key: &str) -> Result<String> {
    Ok(field(value, key)?.as_str().ok_or_else(|| Error::Protocol(format!("field {key} is not a string")))?.to_string())
}

/// One poll-and-maybe-republish cycle. Returns `false` when no payout
/// address has been claimed yet, so the caller can keep polling without
/// treating it as an error.
pub async fn update_once(
    store: &TemplateStore,
    config: &Config,
    rpc: &NodeRpcClient,
    vardiff: Option<&VarDiffController>,
    force_update: bool,
) -> Result<bool> {
    let response = rpc.getblocktemplate().await?;

    let version = field(&response, "version")?.as_i64().unwrap_or(1) as i32;
    let height = field(&response, "height")?.as_i64().ok_or_else(|| Error::Protocol("height not an integer".to_string()))?;
    let bits_hex = hex_field(&response, "bits")?;
    let prev_hash_hex = hex_field(&response, "previousblockhash")?;
    let coinbase_value = field(&response, "coinbasevalue")?.as_u64().ok_or_else(|| Error::Protocol("coinbasevalue not an integer".to_string()))?;
    let target_hex = hex_field(&response, "target")?;
    let transactions = field(&response, "transactions")?.as_array().cloned().unwrap_or_default();

    let bits = u32::from_str_radix(&bits_hex, 16).map_err(|e| Error::Protocol(format!("bad bits: {e}")))?;
    let target_bytes = hex::decode(&target_hex).map_err(|e| Error::Protocol(format!("bad target: {e}")))?;
    if target_bytes.len() != 32 {
        return Err(Error::Protocol("target must be 32 bytes".to_string()));
    }
    let mut target_be = [0u8; 32];
    target_be.copy_from_slice(&target_bytes);
    let target = U256::from_be_bytes(target_be);

    let prev_hash_be_bytes = hex::decode(&prev_hash_hex).map_err(|e| Error::Protocol(format!("bad previousblockhash: {e}")))?;
    if prev_hash_be_bytes.len() != 32 {
        return Err(Error::Protocol("previousblockhash must be 32 bytes".to_string()));
    }
    let mut prev_hash_be = [0u8; 32];
    prev_hash_be.copy_from_slice(&prev_hash_be_bytes);
    let mut prev_hash_header_le = prev_hash_be;
    prev_hash_header_le.reverse();
    let prev_hash_notify = word_swap(&prev_hash_header_le);

    let ts = now_unix() as u32;
    let prior_height = store.height();
    let new_block = prior_height == -1 || prior_height != height;

    let prior_timestamp = store.current().map(|t| t.timestamp);
    let ntime_roll_due = match prior_timestamp {
        Some(prior_ts) => ts.saturating_sub(prior_ts) as u64 >= config.difficulty.ntime_roll_seconds,
        None => true,
    };

    if !(force_update || new_block || ntime_roll_due) {
        return Ok(true);
    }

    let Some(payout_h160) = store.payout_h160() else {
        return Ok(false);
    };

    let mut extra_outputs = Vec::new();
    if let Some(miner_fund) = response.get("minerfund").and_then(|v| v.get("outputs")).and_then(|v| v.as_array()) {
        for output in miner_fund {
            let value = output.get("value").and_then(|v| v.as_u64()).unwrap_or(0);
            if value == 0 {
                continue;
            }
            if let Some(script_hex) = output.get("script").and_then(|v| v.as_str()) {
                if let Ok(script) = hex::decode(script_hex) {
                    extra_outputs.push((value, script));
                }
            }
        }
    }

    let proxy_sig = config.proxy_signature.as_bytes();
    let coinbase = build_coinbase(&payout_h160, height as u32, proxy_sig, coinbase_value, &extra_outputs);

    let mut external_txs = Vec::with_capacity(transactions.len());
    let mut txids = vec![coinbase.txid];
    for tx in &transactions {
        let data_hex = tx.get("data").and_then(|v| v.as_str()).ok_or_else(|| Error::Protocol("transaction missing data".to_string()))?;
        let txid_hex = tx.get("txid").and_then(|v| v.as_str()).ok_or_else(|| Error::Protocol("transaction missing txid".to_string()))?;
        external_txs.push(hex::decode(data_hex).map_err(|e| Error::Protocol(format!("bad tx data: {e}")))?);
        let mut txid_be = hex::decode(txid_hex).map_err(|e| Error::Protocol(format!("bad txid: {e}")))?;
        txid_be.reverse();
        let mut txid_le = [0u8; 32];
        txid_le.copy_from_slice(&txid_be);
        txids.push(txid_le);
    }

    let merkle_branch = merkle_branch_index0(&txids);

    let advertised_diff = target_to_difficulty(target);

    let template = Template {
        height,
        version,
        bits_hex,
        bits,
        target,
        prev_hash_be,
        prev_hash_header_le,
        prev_hash_notify,
        timestamp: ts,
        job_id: now_unix(),
        merkle_branch,
        external_txs,
        coinbase,
        advertised_diff,
    };

    let clean = new_block;
    let job_params = template.job_params(clean);
    store.replace_template(template);

    // VarDiff disabled: fixed-ratio mode advertises network_diff / share_divisor
    // to every session rather than the raw config value (spec §4.D).
    let divisor_difficulty = advertised_diff / config.difficulty.static_share_difficulty;

    let (new_sessions, all_sessions) = store.snapshot_sessions();
    let mut promoted = Vec::new();
    let mut dead_all = Vec::new();
    let mut dead_new = Vec::new();

    for handle in &all_sessions {
        if vardiff.is_none() {
            if push(&handle.sender, Notification::SetDifficulty(divisor_difficulty)).is_err() {
                dead_all.push(handle.id);
                continue;
            }
        }
        if push(&handle.sender, Notification::Notify(job_params.clone())).is_err() {
            dead_all.push(handle.id);
        }
    }

    for handle in &new_sessions {
        let initial_difficulty = match vardiff {
            Some(controller) => controller.get_difficulty(&handle.worker_name),
            None => divisor_difficulty,
        };
        if push(&handle.sender, Notification::SetDifficulty(initial_difficulty)).is_err() {
            dead_new.push(handle.id);
            continue;
        }
        if push(&handle.sender, Notification::Notify(job_params.clone())).is_err() {
            dead_new.push(handle.id);
            continue;
        }
        promoted.push(handle.id);
    }

    store.commit_fanout(&promoted, &dead_all, &dead_new);

    Ok(true)
}

fn push(sender: &tokio::sync::mpsc::Sender<Notification>, notification: Notification) -> std::result::Result<(), ()> {
    sender.try_send(notification).map_err(|_| ())
}

/// Drives [`update_once`] forever: a 5s backoff on error, otherwise a poll
/// interval that slows down when ZMQ is doing the real-time push work.
pub async fn state_updater_loop(
    store: TemplateStore,
    config: Config,
    rpc: NodeRpcClient,
    vardiff: Option<std::sync::Arc<VarDiffController>>,
    refresh_lock: RefreshLock,
    cancel: CancellationToken,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let result = {
            let _guard = refresh_lock.lock().await;
            update_once(&store, &config, &rpc, vardiff.as_deref(), false).await
        };
        match result {
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "state updater error");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    _ = cancel.cancelled() => break,
                }
                continue;
            }
        }

        let sleep_for = if config.zmq.enabled { Duration::from_secs(10) } else { Duration::from_millis(100) };
        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = cancel.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_swap_reverses_each_32_bit_word() {
        let mut input = [0u8; 32];
        for (i, b) in input.iter_mut().enumerate() {
            *b = i as u8;
        }
        let swapped = word_swap(&input);
        assert_eq!(&swapped[0..4], &[3, 2, 1, 0]);
        assert_eq!(&swapped[4..8], &[7, 6, 5, 4]);
    }
}
