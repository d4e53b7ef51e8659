//! End-to-end test: a real TCP Stratum listener, a real `mining.subscribe`
//! -> `mining.authorize` -> template fan-out -> `mining.submit` round trip,
//! against an in-process fake node RPC server instead of a live Radiant node.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use rxd_stratum_proxy::config::{DifficultyConfig, VarDiffConfig};
use rxd_stratum_proxy::events::EventBus;
use rxd_stratum_proxy::hashrate::HashrateTracker;
use rxd_stratum_proxy::rpc::NodeRpcClient;
use rxd_stratum_proxy::stratum::server::start_server;
use rxd_stratum_proxy::stratum::session::SharedContext;
use rxd_stratum_proxy::template::TemplateStore;
use rxd_stratum_proxy::updater::update_once;

/// `bits = 0x20ffffff` expands to a target covering virtually the entire
/// 256-bit space, so any nonce the test submits is guaranteed to satisfy
/// the PoW check (mirrors the equivalent unit test in `validator.rs`).
const TRIVIAL_BITS_HEX: &str = "20ffffff";
const TRIVIAL_TARGET_HEX: &str = "ffffff0000000000000000000000000000000000000000000000000000000000";

/// Spawn a minimal HTTP server that answers `getblocktemplate` and
/// `submitblock` JSON-RPC calls with canned responses, standing in for a
/// live Radiant node.
async fn spawn_fake_node() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let mut total = Vec::new();
                loop {
                    let n = stream.read(&mut buf).await.unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    total.extend_from_slice(&buf[..n]);
                    if total.windows(4).any(|w| w == b"\r\n\r\n") {
                        // Good enough for these small, single-shot request bodies.
                        break;
                    }
                }
                let body_text = String::from_utf8_lossy(&total);
                let result = if body_text.contains("getblocktemplate") {
                    json!({
                        "version": 1,
                        "height": 100,
                        "bits": TRIVIAL_BITS_HEX,
                        "previousblockhash": "00".repeat(32),
                        "coinbasevalue": 5_000_000_000u64,
                        "target": TRIVIAL_TARGET_HEX,
                        "transactions": [],
                    })
                } else if body_text.contains("submitblock") {
                    Value::Null
                } else {
                    Value::Null
                };
                let payload = json!({ "result": result, "error": Value::Null }).to_string();
                let response = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    payload.len(),
                    payload
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    format!("http://127.0.0.1:{}", addr.port())
}

async fn read_line(reader: &mut (impl AsyncBufReadExt + Unpin)) -> Value {
    let mut line = String::new();
    tokio::time::timeout(Duration::from_secs(5), reader.read_line(&mut line))
        .await
        .expect("timed out waiting for a line")
        .expect("read_line failed");
    serde_json::from_str(line.trim()).expect("line was not valid JSON")
}

#[tokio::test]
async fn subscribe_authorize_notify_submit_round_trip() {
    let rpc_url = spawn_fake_node().await;
    let rpc = NodeRpcClient::new(rpc_url, Duration::from_secs(5)).unwrap();
    let store = TemplateStore::new();

    let ctx = Arc::new(SharedContext {
        template_store: store.clone(),
        vardiff: None,
        hashrate: Arc::new(HashrateTracker::new(300.0, 120.0)),
        events: Arc::new(EventBus::new()),
        rpc: rpc.clone(),
        testnet: false,
        static_share_difficulty: 1.0,
    });

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let stratum_addr = listener.local_addr().unwrap();
    drop(listener);

    let server_cancel = cancel.clone();
    let server_tracker = tracker.clone();
    let bind_addr = stratum_addr.to_string();
    tracker.spawn(async move {
        start_server(&bind_addr, ctx, server_cancel, server_tracker).await.unwrap();
    });
    // Give the accept loop a moment to bind before connecting.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stream = TcpStream::connect(stratum_addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    write_half
        .write_all(b"{\"id\":1,\"method\":\"mining.subscribe\",\"params\":[\"test-miner/1.0\"]}\n")
        .await
        .unwrap();
    let subscribe_response = read_line(&mut reader).await;
    let result = &subscribe_response["result"];
    let extranonce1_hex = result[1].as_str().unwrap().to_string();
    assert_eq!(hex::decode(&extranonce1_hex).unwrap().len(), 4);

    // A fresh mainnet P2PKH address to claim the payout with.
    let payload: Vec<u8> = std::iter::once(0u8).chain(std::iter::repeat(0x07).take(20)).collect();
    let address = bitcoin::base58::encode_check(&payload);
    let authorize_request = format!(
        "{{\"id\":2,\"method\":\"mining.authorize\",\"params\":[\"{address}.worker1\",\"x\"]}}\n"
    );
    write_half.write_all(authorize_request.as_bytes()).await.unwrap();
    let authorize_response = read_line(&mut reader).await;
    assert_eq!(authorize_response["result"], Value::Bool(true));
    assert_eq!(store.payout_h160(), Some([0x07; 20]));

    // Build the first template now that a payout address has been claimed;
    // this fans out set_difficulty + notify to the just-authorized session.
    let mut config = rxd_stratum_proxy::config::Config::default();
    config.node.rpc_user = "user".into();
    config.node.rpc_pass = "pass".into();
    config.difficulty = DifficultyConfig {
        static_share_difficulty: 1.0,
        ntime_roll_seconds: 30,
    };
    config.vardiff = VarDiffConfig::default();
    let updated = update_once(&store, &config, &rpc, None, true).await.unwrap();
    assert!(updated);

    let set_difficulty = read_line(&mut reader).await;
    assert_eq!(set_difficulty["method"], "mining.set_difficulty");

    let notify = read_line(&mut reader).await;
    assert_eq!(notify["method"], "mining.notify");
    let params = notify["params"].as_array().unwrap();
    let job_id_hex = params[0].as_str().unwrap().to_string();
    let ntime_hex = params[7].as_str().unwrap().to_string();

    let submit_request = format!(
        "{{\"id\":3,\"method\":\"mining.submit\",\"params\":[\"{address}.worker1\",\"{job_id_hex}\",\"00000001\",\"{ntime_hex}\",\"00000000\"]}}\n"
    );
    write_half.write_all(submit_request.as_bytes()).await.unwrap();
    let submit_response = read_line(&mut reader).await;
    assert_eq!(submit_response["result"], Value::Bool(true), "share should be accepted against a near-maximal target");

    cancel.cancel();
}
