//! Library surface for `rxd-stratum-proxy`, split out from the binary so
//! integration tests under `tests/` can drive the Stratum listener and the
//! share pipeline end to end against an in-process fake node RPC.

pub mod coinbase;
pub mod config;
pub mod encoding;
pub mod error;
pub mod events;
pub mod hashrate;
pub mod rpc;
pub mod stratum;
pub mod template;
pub mod tracing_setup;
pub mod updater;
pub mod validator;
pub mod vardiff;
pub mod zmq_listener;
