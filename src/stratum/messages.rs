//! Stratum v1 JSON-RPC wire types: newline-delimited requests/responses on
//! the socket, plus the notification values pushed out of band.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An incoming request. `id` may be missing for some miner firmwares that
/// send notification-shaped submits; we still try to answer if present.
#[derive(Debug, Clone, Deserialize)]
pub struct Request {
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub const INVALID_PARAMS: i32 = -32602;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Bad address version byte or bad hash length on `mining.authorize`.
    pub const BAD_ADDRESS: i32 = 20;

    pub fn invalid_params(msg: impl Into<String>) -> Self {
        Self {
            code: Self::INVALID_PARAMS,
            message: msg.into(),
        }
    }

    pub fn bad_address(msg: impl Into<String>) -> Self {
        Self {
            code: Self::BAD_ADDRESS,
            message: msg.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub id: Value,
    pub result: Option<Value>,
    pub error: Option<RpcError>,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, error: RpcError) -> Self {
        Self {
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn to_line(&self) -> String {
        #[derive(Serialize)]
        struct Wire<'a> {
            id: &'a Value,
            result: &'a Option<Value>,
            error: &'a Option<RpcError>,
        }
        let wire = Wire {
            id: &self.id,
            result: &self.result,
            error: &self.error,
        };
        serde_json::to_string(&wire).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Pushed to a session's outgoing channel; framed the same as a request but
/// without an `id` the client expects a reply to.
#[derive(Debug, Clone)]
pub enum Notification {
    SetDifficulty(f64),
    Notify(Value),
}

impl Notification {
    pub fn to_line(&self) -> String {
        let (method, params) = match self {
            Notification::SetDifficulty(diff) => ("mining.set_difficulty", serde_json::json!([diff])),
            Notification::Notify(params) => ("mining.notify", params.clone()),
        };
        let value = serde_json::json!({
            "id": Value::Null,
            "method": method,
            "params": params,
        });
        serde_json::to_string(&value).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_positional_submit_request() {
        let line = r#"{"id":1,"method":"mining.submit","params":["worker1","5f5e100","00000001","5f5e101","00112233"]}"#;
        let req: Request = serde_json::from_str(line).unwrap();
        assert_eq!(req.method, "mining.submit");
        assert_eq!(req.params.as_array().unwrap().len(), 5);
    }

    #[test]
    fn response_serializes_with_null_error_on_success() {
        let resp = Response::ok(Value::from(1), Value::Bool(true));
        let line = resp.to_line();
        assert!(line.contains("\"result\":true"));
        assert!(line.contains("\"error\":null"));
    }

    #[test]
    fn notify_line_has_expected_method() {
        let notif = Notification::Notify(serde_json::json!(["job1"]));
        assert!(notif.to_line().contains("mining.notify"));
    }
}
