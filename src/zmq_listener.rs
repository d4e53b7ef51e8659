//! Subscribes to the node's `hashblock` ZMQ notifications and forces an
//! immediate template refresh on every new block, instead of waiting for
//! the next poll tick.

use std::sync::Arc;
use std::time::Duration;

use bitcoincore_zmq::{subscribe_async, Message};
use futures::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::rpc::NodeRpcClient;
use crate::template::TemplateStore;
use crate::updater::{update_once, RefreshLock};
use crate::vardiff::VarDiffController;

const RECEIVE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONSECUTIVE_ERRORS: u32 = 5;
const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Runs until cancelled or until too many consecutive ZMQ errors occur, in
/// which case it returns and the caller falls back to poller-only operation.
pub async fn run(
    endpoint: String,
    store: TemplateStore,
    config: Config,
    rpc: NodeRpcClient,
    vardiff: Option<Arc<VarDiffController>>,
    refresh_lock: RefreshLock,
    cancel: CancellationToken,
) {
    let mut backoff = MIN_BACKOFF;

    'reconnect: loop {
        if cancel.is_cancelled() {
            return;
        }

        let mut stream = match subscribe_async(&[endpoint.as_str()]) {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, endpoint, "failed to connect ZMQ listener, retrying");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = cancel.cancelled() => return,
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue 'reconnect;
            }
        };

        tracing::info!(endpoint, "ZMQ listener connected");
        backoff = MIN_BACKOFF;
        let mut consecutive_errors: u32 = 0;

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                item = tokio::time::timeout(RECEIVE_TIMEOUT, stream.next()) => item,
            };

            let Ok(item) = next else {
                // Receive timeout: normal, just keep polling the stream.
                continue;
            };

            match item {
                Some(Ok(Message::HashBlock(hash, sequence))) => {
                    consecutive_errors = 0;
                    tracing::info!(block_hash = %hash, sequence, "ZMQ hashblock received");
                    let result = {
                        let _guard = refresh_lock.lock().await;
                        update_once(&store, &config, &rpc, vardiff.as_deref(), true).await
                    };
                    if let Err(e) = result {
                        tracing::error!(error = %e, "forced template refresh after ZMQ hashblock failed");
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    consecutive_errors += 1;
                    tracing::warn!(error = %e, consecutive_errors, "ZMQ stream error");
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        tracing::error!("too many consecutive ZMQ errors, falling back to poller-only");
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis((consecutive_errors as u64 * 500).min(5000))).await;
                }
                None => {
                    tracing::warn!("ZMQ stream ended, reconnecting");
                    continue 'reconnect;
                }
            }
        }
    }
}
