//! TCP accept loop: one `run_session` task per inbound miner connection.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::error::{Error, Result};
use crate::stratum::session::{self, SharedContext};

pub async fn start_server(
    bind_addr: &str,
    ctx: Arc<SharedContext>,
    cancel: CancellationToken,
    tracker: TaskTracker,
) -> Result<()> {
    let listener = TcpListener::bind(bind_addr).await.map_err(Error::Io)?;
    tracing::info!(addr = bind_addr, "stratum server listening");

    let extranonce1_counter = Arc::new(AtomicU32::new(1));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("stratum server shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to accept connection");
                        continue;
                    }
                };
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::debug!(error = %e, "failed to set TCP_NODELAY");
                }

                let id = extranonce1_counter.fetch_add(1, Ordering::Relaxed) as u64;
                let extranonce1 = (id as u32).to_be_bytes();
                let ctx = ctx.clone();
                let cancel = cancel.clone();

                tracing::debug!(%peer_addr, session = id, "accepted connection");
                tracker.spawn(async move {
                    session::run_session(stream, id, extranonce1, ctx, cancel).await;
                    tracing::debug!(%peer_addr, session = id, "session closed");
                });
            }
        }
    }
}
