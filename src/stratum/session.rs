//! Per-connection Stratum v1 state machine: subscribe, authorize, submit,
//! keepalive, and disconnect cleanup.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::events::{BlockEvent, ConnectionEvent, Event, EventBus, ShareEvent};
use crate::hashrate::HashrateTracker;
use crate::rpc::NodeRpcClient;
use crate::stratum::messages::{Notification, Request, Response, RpcError};
use crate::template::{SessionHandle, TemplateStore};
use crate::validator::{self, SubmitParams};
use crate::vardiff::VarDiffController;

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const KEEPALIVE_IDLE_THRESHOLD: Duration = Duration::from_secs(45);
const KEEPALIVE_DIFF_CHANGE_THRESHOLD: f64 = 0.05;

/// Shared, long-lived dependencies every session needs. Constructed once at
/// startup and cloned (cheaply, via `Arc`) per connection.
pub struct SharedContext {
    pub template_store: TemplateStore,
    pub vardiff: Option<Arc<VarDiffController>>,
    pub hashrate: Arc<HashrateTracker>,
    pub events: Arc<EventBus>,
    pub rpc: NodeRpcClient,
    pub testnet: bool,
    pub static_share_difficulty: f64,
}

struct SessionState {
    id: u64,
    extranonce1: [u8; 4],
    worker_name: Option<String>,
    miner_software: String,
    share_difficulty: f64,
    subscribed: bool,
    authorized: bool,
    last_activity: Instant,
}

fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Drive one miner connection until it disconnects or the process shuts
/// down.
pub async fn run_session(
    stream: TcpStream,
    id: u64,
    extranonce1: [u8; 4],
    ctx: Arc<SharedContext>,
    cancel: CancellationToken,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(64);
    let writer_task = tokio::spawn(async move {
        while let Some(line) = outbound_rx.recv().await {
            if write_half.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if write_half.write_all(b"\n").await.is_err() {
                break;
            }
        }
    });

    let (notif_tx, mut notif_rx) = mpsc::channel::<Notification>(32);
    let mut state = SessionState {
        id,
        extranonce1,
        worker_name: None,
        miner_software: "Unknown".to_string(),
        share_difficulty: ctx.static_share_difficulty,
        subscribed: false,
        authorized: false,
        last_activity: Instant::now(),
    };

    let mut keepalive_deadline = Instant::now() + KEEPALIVE_INTERVAL;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        state.last_activity = Instant::now();
                        if let Some(response_line) = handle_line(&line, &mut state, &ctx, &notif_tx).await {
                            if outbound_tx.send(response_line).await.is_err() {
                                break;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(session = id, error = %e, "read error, closing session");
                        break;
                    }
                }
            }
            Some(notification) = notif_rx.recv() => {
                if let Notification::SetDifficulty(d) = &notification {
                    state.share_difficulty = *d;
                }
                if outbound_tx.send(notification.to_line()).await.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep_until(keepalive_deadline) => {
                keepalive_deadline = Instant::now() + KEEPALIVE_INTERVAL;
                if state.authorized && state.last_activity.elapsed() > KEEPALIVE_IDLE_THRESHOLD {
                    let mut diff = state.share_difficulty;
                    if let (Some(vardiff), Some(worker)) = (&ctx.vardiff, &state.worker_name) {
                        let vd = vardiff.get_difficulty(worker);
                        if (vd - diff).abs() / diff.max(1e-9) >= KEEPALIVE_DIFF_CHANGE_THRESHOLD {
                            diff = vd;
                            state.share_difficulty = vd;
                        }
                    }
                    let line = Notification::SetDifficulty(diff).to_line();
                    if outbound_tx.send(line).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    ctx.template_store.remove_session(id);
    if let Some(worker) = &state.worker_name {
        ctx.hashrate.remove_worker(worker);
        if let Some(vardiff) = &ctx.vardiff {
            vardiff.remove_worker(worker);
        }
    }
    ctx.template_store.clear_payout_if_empty();
    ctx.events.publish(Event::Connection(ConnectionEvent {
        worker: state.worker_name.clone(),
        session_id: id,
        connected: false,
        timestamp: now_unix(),
    }));
    writer_task.abort();
}

async fn handle_line(
    line: &str,
    state: &mut SessionState,
    ctx: &Arc<SharedContext>,
    notif_tx: &mpsc::Sender<Notification>,
) -> Option<String> {
    let request: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(session = state.id, error = %e, "malformed request");
            return None;
        }
    };
    let id = request.id.clone().unwrap_or(Value::Null);

    let result = match request.method.as_str() {
        "mining.subscribe" => Ok(handle_subscribe(state, &request.params)),
        "mining.authorize" => handle_authorize(state, &request.params, ctx, notif_tx).await,
        "mining.configure" => Ok(serde_json::json!({})),
        "mining.submit" => handle_submit(state, &request.params, ctx, notif_tx).await,
        "eth_submitHashrate" => Ok(handle_eth_submit_hashrate(&request.params)),
        other => {
            tracing::debug!(session = state.id, method = other, "unknown method");
            Err(RpcError {
                code: RpcError::METHOD_NOT_FOUND,
                message: format!("unknown method: {other}"),
            })
        }
    };

    if request.id.is_none() {
        return None;
    }
    let response = match result {
        Ok(value) => Response::ok(id, value),
        Err(err) => Response::err(id, err),
    };
    Some(response.to_line())
}

fn handle_subscribe(state: &mut SessionState, params: &Value) -> Value {
    state.subscribed = true;
    if let Some(software) = params.as_array().and_then(|a| a.first()).and_then(|v| v.as_str()) {
        if !software.is_empty() {
            state.miner_software = software.to_string();
        }
    }
    let subscription_id = format!("subscription_{}", state.id);
    let extranonce1_hex = hex::encode(state.extranonce1);
    serde_json::json!([
        [["mining.set_difficulty", subscription_id], ["mining.notify", subscription_id]],
        extranonce1_hex,
        4,
    ])
}

fn decode_payout_address(address: &str, testnet: bool) -> std::result::Result<[u8; 20], RpcError> {
    let decoded = bitcoin::base58::decode_check(address)
        .map_err(|e| RpcError::bad_address(format!("address validation failed: {address}: {e}")))?;
    if decoded.is_empty() {
        return Err(RpcError::bad_address(format!("empty address: {address}")));
    }
    let version = decoded[0];
    let allowed: &[u8] = if testnet { &[111, 196] } else { &[0, 5] };
    if !allowed.contains(&version) {
        let kind = if testnet { "testnet" } else { "mainnet" };
        return Err(RpcError::bad_address(format!("invalid {kind} address version for {address}")));
    }
    let hash = &decoded[1..];
    if hash.len() != 20 {
        return Err(RpcError::bad_address(format!("invalid address hash length: {address}")));
    }
    let mut out = [0u8; 20];
    out.copy_from_slice(hash);
    Ok(out)
}

async fn handle_authorize(
    state: &mut SessionState,
    params: &Value,
    ctx: &Arc<SharedContext>,
    notif_tx: &mpsc::Sender<Notification>,
) -> std::result::Result<Value, RpcError> {
    if !state.subscribed {
        return Err(RpcError::invalid_params("authorize called before subscribe"));
    }
    let array = params.as_array().ok_or_else(|| RpcError::invalid_params("authorize requires [worker, password]"))?;
    let worker = array
        .first()
        .and_then(|v| v.as_str())
        .ok_or_else(|| RpcError::invalid_params("missing worker name"))?
        .to_string();

    let address = worker.split('.').next().unwrap_or(&worker);
    let h160 = decode_payout_address(address, ctx.testnet)?;

    ctx.template_store.claim_payout(h160);

    state.worker_name = Some(worker.clone());
    state.authorized = true;
    state.last_activity = Instant::now();

    let handle = SessionHandle {
        id: state.id,
        worker_name: worker.clone(),
        sender: notif_tx.clone(),
    };
    ctx.template_store.add_new_session(handle);

    tracing::info!(session = state.id, worker = %worker, software = %state.miner_software, "miner authorized");
    ctx.events.publish(Event::Connection(ConnectionEvent {
        worker: Some(worker.clone()),
        session_id: state.id,
        connected: true,
        timestamp: now_unix(),
    }));

    // A template already exists: notify this worker directly instead of
    // waiting for the next update_once fan-out, which would otherwise leave
    // it without a job until the template changes or the ntime roll fires.
    if let Some(template) = ctx.template_store.current() {
        let difficulty = match &ctx.vardiff {
            Some(vardiff) => vardiff.get_difficulty(&worker),
            None => state.share_difficulty,
        };
        state.share_difficulty = difficulty;
        let _ = notif_tx.send(Notification::SetDifficulty(difficulty)).await;
        let _ = notif_tx.send(Notification::Notify(template.job_params(true))).await;
        ctx.template_store.promote_session(state.id);
    }

    Ok(Value::Bool(true))
}

fn handle_eth_submit_hashrate(params: &Value) -> Value {
    if let Some(array) = params.as_array() {
        if let Some(hex_rate) = array.first().and_then(|v| v.as_str()) {
            let rate = i64::from_str_radix(hex_rate.trim_start_matches("0x"), 16).unwrap_or(0);
            tracing::debug!(rate, "eth_submitHashrate reported");
        }
    }
    Value::Bool(true)
}

fn parse_submit_params(params: &Value) -> std::result::Result<SubmitParams, RpcError> {
    let missing = || RpcError::invalid_params("missing required mining.submit parameters");

    if let Some(obj) = params.as_object() {
        let get = |key: &str, alt: &str| -> Option<String> {
            obj.get(key)
                .or_else(|| obj.get(alt))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
        };
        return Ok(SubmitParams {
            worker: get("worker", "login").ok_or_else(missing)?,
            job_id_hex: obj.get("job_id").and_then(|v| v.as_str()).ok_or_else(missing)?.to_string(),
            extranonce2_hex: get("extranonce2", "extranonce2_hex").ok_or_else(missing)?,
            ntime_hex: get("ntime", "ntime_hex").ok_or_else(missing)?,
            nonce_hex: get("nonce", "nonce_hex").ok_or_else(missing)?,
        });
    }

    let array = params.as_array().ok_or_else(missing)?;
    let at = |i: usize| array.get(i).and_then(|v| v.as_str()).map(str::to_string);
    Ok(SubmitParams {
        worker: at(0).ok_or_else(missing)?,
        job_id_hex: at(1).ok_or_else(missing)?,
        extranonce2_hex: at(2).ok_or_else(missing)?,
        ntime_hex: at(3).ok_or_else(missing)?,
        nonce_hex: at(4).ok_or_else(missing)?,
    })
}

async fn handle_submit(
    state: &mut SessionState,
    params: &Value,
    ctx: &Arc<SharedContext>,
    notif_tx: &mpsc::Sender<Notification>,
) -> std::result::Result<Value, RpcError> {
    let submit_params = parse_submit_params(params)?;

    let Some(template) = ctx.template_store.current() else {
        ctx.events.publish(Event::Share(ShareEvent {
            worker: submit_params.worker.clone(),
            share_difficulty: 0.0,
            sent_difficulty: state.share_difficulty,
            network_difficulty: 0.0,
            accepted: false,
            is_block: false,
            timestamp: now_unix(),
        }));
        return Ok(Value::Bool(false));
    };

    let sent_difficulty = state.share_difficulty;
    let outcome = validator::validate_submit(&template, state.extranonce1, &submit_params, sent_difficulty)
        .map_err(|e| RpcError::invalid_params(e.to_string()))?;

    let worker = submit_params.worker.clone();
    let accepted = outcome.is_accepted();
    let share_diff = outcome.share_diff().unwrap_or(0.0);

    ctx.hashrate.add_share(&worker, sent_difficulty, accepted);

    if accepted {
        if let Some(vardiff) = &ctx.vardiff {
            let network_diff = template.advertised_diff;
            let new_diff = vardiff.record_share(&worker, sent_difficulty, network_diff);
            if (new_diff - sent_difficulty).abs() / sent_difficulty.max(1e-9) >= 0.05 {
                state.share_difficulty = new_diff;
                let _ = notif_tx.send(Notification::SetDifficulty(new_diff)).await;
            }
        }
    }

    ctx.events.publish(Event::Share(ShareEvent {
        worker: worker.clone(),
        share_difficulty: share_diff,
        sent_difficulty,
        network_difficulty: template.advertised_diff,
        accepted,
        is_block: outcome.is_block(),
        timestamp: now_unix(),
    }));

    if outcome.is_block() {
        match validator::submit_block(&template, state.extranonce1, &submit_params, &ctx.rpc).await {
            Ok((response, pow_digest_le)) => {
                let node_accepted = response.is_null();
                if node_accepted {
                    tracing::info!(height = template.height, worker = %worker, "submitted RXD block, accepted by node");
                } else {
                    tracing::warn!(height = template.height, worker = %worker, response = %response, "submitblock returned a non-null result, node rejected the block");
                }
                let block_hash_be = match &outcome {
                    validator::Outcome::Block { block_hash_be, .. } => hex::encode(block_hash_be),
                    _ => String::new(),
                };
                ctx.events.publish(Event::Block(BlockEvent {
                    worker: worker.clone(),
                    height: template.height,
                    block_hash: block_hash_be,
                    accepted: node_accepted,
                    timestamp: now_unix(),
                }));
                validator::write_submit_history(template.height, template.job_id, &worker, submit_params.clone(), pow_digest_le, response).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "submitblock RPC call failed");
            }
        }
    }

    Ok(Value::Bool(accepted))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mainnet_rejects_testnet_version_byte() {
        // version byte 111 (testnet P2PKH) encoded address should fail on mainnet.
        let mut payload = vec![111u8];
        payload.extend_from_slice(&[0x01; 20]);
        let address = bitcoin::base58::encode_check(&payload);
        let result = decode_payout_address(&address, false);
        assert!(result.is_err());
    }

    #[test]
    fn mainnet_accepts_p2pkh_version_byte() {
        let mut payload = vec![0u8];
        payload.extend_from_slice(&[0x02; 20]);
        let address = bitcoin::base58::encode_check(&payload);
        let h160 = decode_payout_address(&address, false).unwrap();
        assert_eq!(h160, [0x02; 20]);
    }

    #[test]
    fn parses_named_submit_params_with_extra_fields() {
        let params = serde_json::json!({
            "worker": "alice.rig1",
            "job_id": "5f5e100",
            "extranonce2": "00000001",
            "ntime": "5f5e101",
            "nonce": "00112233",
            "rigid": "extra-field-ignored",
        });
        let parsed = parse_submit_params(&params).unwrap();
        assert_eq!(parsed.worker, "alice.rig1");
    }
}
