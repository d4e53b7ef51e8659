//! Share reconstruction, proof-of-work evaluation, and block submission.
//!
//! Reads a single consistent snapshot of the template before doing any
//! hashing or I/O, per the concurrency note in the design: readers bind
//! the relevant fields to local variables up front.

use ruint::aliases::U256;

use crate::encoding::{diff1_target, dsha256, fold_branch_index0, sha512_256d, var_int};
use crate::error::{Error, Result};
use crate::rpc::NodeRpcClient;
use crate::template::Template;

/// A `mining.submit` request's parameters, already demultiplexed from
/// positional or named JSON-RPC args by the session layer.
#[derive(Debug, Clone)]
pub struct SubmitParams {
    pub worker: String,
    pub job_id_hex: String,
    pub extranonce2_hex: String,
    pub ntime_hex: String,
    pub nonce_hex: String,
}

/// Result of validating one submission.
#[derive(Debug, Clone)]
pub enum Outcome {
    RejectedJobMismatch,
    RejectedTemplateNotReady,
    RejectedInsufficientDifficulty { share_diff: f64 },
    Accepted { share_diff: f64 },
    Block { share_diff: f64, block_hash_be: [u8; 32] },
}

impl Outcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Outcome::Accepted { .. } | Outcome::Block { .. })
    }

    pub fn is_block(&self) -> bool {
        matches!(self, Outcome::Block { .. })
    }

    pub fn share_diff(&self) -> Option<f64> {
        match self {
            Outcome::Accepted { share_diff } | Outcome::RejectedInsufficientDifficulty { share_diff } => Some(*share_diff),
            Outcome::Block { share_diff, .. } => Some(*share_diff),
            _ => None,
        }
    }
}

fn reverse_hex_bytes(hex_str: &str) -> Result<Vec<u8>> {
    let mut bytes = hex::decode(hex_str).map_err(|e| Error::Protocol(format!("invalid hex: {e}")))?;
    bytes.reverse();
    Ok(bytes)
}

/// Validate a submission against a template snapshot. Does not touch the
/// node or the filesystem; callers submit accepted blocks separately via
/// [`submit_block`].
pub fn validate_submit(
    template: &Template,
    extranonce1: [u8; 4],
    params: &SubmitParams,
    sent_difficulty: f64,
) -> Result<Outcome> {
    if params.job_id_hex != format!("{:x}", template.job_id) {
        return Ok(Outcome::RejectedJobMismatch);
    }

    let extranonce2 = hex::decode(&params.extranonce2_hex).map_err(|e| Error::Protocol(format!("bad extranonce2: {e}")))?;
    let mut coinbase = template.coinbase.coinbase1.clone();
    coinbase.extend_from_slice(&extranonce1);
    coinbase.extend_from_slice(&extranonce2);
    coinbase.extend_from_slice(&template.coinbase.coinbase2);
    let coinbase_txid_le = dsha256(&coinbase);

    let merkle_root_le = fold_branch_index0(coinbase_txid_le, &template.merkle_branch);

    let ntime_le = reverse_hex_bytes(&params.ntime_hex)?;
    let nonce_le = reverse_hex_bytes(&params.nonce_hex)?;
    if ntime_le.len() != 4 || nonce_le.len() != 4 {
        return Err(Error::Protocol("ntime/nonce must be 4 bytes".to_string()));
    }

    let mut header = Vec::with_capacity(80);
    header.extend_from_slice(&template.version.to_le_bytes());
    header.extend_from_slice(&template.prev_hash_header_le);
    header.extend_from_slice(&merkle_root_le);
    header.extend_from_slice(&ntime_le);
    header.extend_from_slice(&template.bits.to_le_bytes());
    header.extend_from_slice(&nonce_le);

    let pow_digest_le = sha512_256d(&header);
    let h = U256::from_le_bytes(pow_digest_le);

    let is_block = h <= template.target;
    let divisor = h.max(U256::from(1u64));
    let share_diff = crate::encoding::u256_ratio(diff1_target(), divisor);

    if !is_block && share_diff < 0.99 * sent_difficulty {
        return Ok(Outcome::RejectedInsufficientDifficulty { share_diff });
    }

    if is_block {
        let mut block_hash_be = dsha256(&header);
        block_hash_be.reverse();
        Ok(Outcome::Block { share_diff, block_hash_be })
    } else {
        Ok(Outcome::Accepted { share_diff })
    }
}

/// Serialize and submit a block found by [`validate_submit`]. Returns the
/// node's RPC response alongside the header's PoW digest, for the
/// forensics dump in [`write_submit_history`].
pub async fn submit_block(
    template: &Template,
    extranonce1: [u8; 4],
    params: &SubmitParams,
    rpc: &NodeRpcClient,
) -> Result<(serde_json::Value, [u8; 32])> {
    let extranonce2 = hex::decode(&params.extranonce2_hex).map_err(|e| Error::Protocol(format!("bad extranonce2: {e}")))?;
    let mut coinbase_full = template.coinbase.coinbase1.clone();
    coinbase_full.extend_from_slice(&extranonce1);
    coinbase_full.extend_from_slice(&extranonce2);
    coinbase_full.extend_from_slice(&template.coinbase.coinbase2);

    let ntime_le = reverse_hex_bytes(&params.ntime_hex)?;
    let nonce_le = reverse_hex_bytes(&params.nonce_hex)?;
    let coinbase_txid_le = dsha256(&coinbase_full);
    let merkle_root_le = fold_branch_index0(coinbase_txid_le, &template.merkle_branch);

    let mut header = Vec::with_capacity(80);
    header.extend_from_slice(&template.version.to_le_bytes());
    header.extend_from_slice(&template.prev_hash_header_le);
    header.extend_from_slice(&merkle_root_le);
    header.extend_from_slice(&ntime_le);
    header.extend_from_slice(&template.bits.to_le_bytes());
    header.extend_from_slice(&nonce_le);

    let tx_count = 1 + template.external_txs.len() as u64;
    let mut block = header.clone();
    block.extend_from_slice(&var_int(tx_count));
    block.extend_from_slice(&coinbase_full);
    for tx in &template.external_txs {
        block.extend_from_slice(tx);
    }

    let block_hex = hex::encode(&block);
    let pow_digest_le = sha512_256d(&header);
    let response = rpc.submitblock(&block_hex).await?;
    Ok((response, pow_digest_le))
}

/// Dump full submission context to `submit_history/RXD_<height>_<job_id>.txt`
/// for forensics. Runs on a blocking task so it never stalls share handling.
pub async fn write_submit_history(
    height: i64,
    job_id: u64,
    worker: &str,
    params: SubmitParams,
    pow_digest_le: [u8; 32],
    rpc_response: serde_json::Value,
) {
    let worker = worker.to_string();
    let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
        std::fs::create_dir_all("submit_history")?;
        let path = format!("submit_history/RXD_{height}_{job_id}.txt");
        let dump = format!(
            "=== RXD BLOCK SUBMISSION ===\n\
             Worker: {worker}\n\
             Job ID: {}\n\
             Block Height: {height}\n\
             Extranonce2: {}\n\
             Ntime: {}\n\
             Nonce: {}\n\
             PoW Hash (SHA512/256d): {}\n\
             RPC Response:\n{}\n",
            params.job_id_hex,
            params.extranonce2_hex,
            params.ntime_hex,
            params.nonce_hex,
            hex::encode(pow_digest_le),
            rpc_response,
        );
        std::fs::write(path, dump)
    })
    .await;
    if let Ok(Err(e)) = result {
        tracing::debug!(error = %e, "failed to write submit history");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coinbase::build_coinbase;
    use crate::encoding::{bits_to_target, merkle_branch_index0};

    fn sample_template(bits: u32) -> Template {
        let coinbase = build_coinbase(&[0xAB; 20], 100, b"/test/", 5_000_000_000, &[]);
        let txids = vec![coinbase.txid];
        let merkle_branch = merkle_branch_index0(&txids);
        Template {
            height: 100,
            version: 1,
            bits_hex: format!("{bits:08x}"),
            bits,
            target: bits_to_target(bits),
            prev_hash_be: [0; 32],
            prev_hash_header_le: [0; 32],
            prev_hash_notify: [0; 32],
            timestamp: 0,
            job_id: 0x5f5e100,
            merkle_branch,
            external_txs: vec![],
            coinbase,
            advertised_diff: 1.0,
        }
    }

    #[test]
    fn rejects_wrong_job_id() {
        let template = sample_template(0x1d00ffff);
        let params = SubmitParams {
            worker: "alice".into(),
            job_id_hex: "deadbeef".into(),
            extranonce2_hex: "00000001".into(),
            ntime_hex: "00000000".into(),
            nonce_hex: "00000000".into(),
        };
        let outcome = validate_submit(&template, [0; 4], &params, 1.0).unwrap();
        assert!(matches!(outcome, Outcome::RejectedJobMismatch));
    }

    #[test]
    fn extremely_easy_target_accepts_almost_any_nonce() {
        // bits with exponent 32 and full mantissa gives an enormous target,
        // virtually guaranteeing is_block for nonce 0.
        let template = sample_template(0x20ffffff);
        let params = SubmitParams {
            worker: "alice".into(),
            job_id_hex: format!("{:x}", template.job_id),
            extranonce2_hex: "00000001".into(),
            ntime_hex: "00000000".into(),
            nonce_hex: "00000000".into(),
        };
        let outcome = validate_submit(&template, [0; 4], &params, 1.0).unwrap();
        assert!(outcome.is_accepted());
    }
}
