//! JSON-RPC client for the Radiant node, reached over HTTP with basic auth
//! embedded in the URL.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Value,
    error: Option<Value>,
}

/// Thin wrapper around a pooled `reqwest::Client` targeting one node URL.
#[derive(Clone)]
pub struct NodeRpcClient {
    http: reqwest::Client,
    url: String,
}

impl NodeRpcClient {
    pub fn new(url: String, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, url })
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "stratum",
            "method": method,
            "params": params,
        });
        let resp: RpcResponse = self.http.post(&self.url).json(&body).send().await?.json().await?;
        if let Some(err) = resp.error {
            if !err.is_null() {
                return Err(Error::NodeRpcResponse(err.to_string()));
            }
        }
        Ok(resp.result)
    }

    /// `getblocktemplate({})`. Radiant does not use SegWit so the plain
    /// template shape is requested.
    pub async fn getblocktemplate(&self) -> Result<Value> {
        self.call("getblocktemplate", json!([{}])).await
    }

    /// `submitblock(hex)`. A `null` result means the node accepted the
    /// block; any other value is logged as a rejection upstream.
    pub async fn submitblock(&self, block_hex: &str) -> Result<Value> {
        self.call("submitblock", json!([block_hex])).await
    }

    pub async fn getblock(&self, block_hash: &str) -> Result<Value> {
        self.call("getblock", json!([block_hash])).await
    }

    pub async fn getblockchaininfo(&self) -> Result<Value> {
        self.call("getblockchaininfo", json!([])).await
    }

    pub async fn getmininginfo(&self) -> Result<Value> {
        self.call("getmininginfo", json!([])).await
    }
}
