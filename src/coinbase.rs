//! BIP34 height encoding and coinbase transaction assembly.
//!
//! Radiant coinbases are plain Bitcoin-style transactions: version 1,
//! single null-outpoint input, no witness data.

use crate::encoding::{dsha256, op_push, var_int};

/// Extra outputs beyond the miner's own payout, as `(value, script)` pairs.
pub type ExtraOutput = (u64, Vec<u8>);

/// A fully assembled coinbase transaction and its Stratum splits.
#[derive(Debug, Clone)]
pub struct Coinbase {
    pub tx: Vec<u8>,
    pub txid: [u8; 32],
    pub coinbase1: Vec<u8>,
    pub coinbase2: Vec<u8>,
}

/// Encode a block height for the coinbase scriptSig per BIP34, with the
/// Radiant refinement that heights 1..=16 use a bare `OP_N` opcode (no
/// length prefix) rather than a pushed script number.
pub fn encode_bip34_height(height: u32) -> Vec<u8> {
    if height == 0 {
        return vec![0x00];
    }
    if (1..=16).contains(&height) {
        return vec![0x50 + height as u8];
    }
    let mut body = Vec::new();
    let mut value = height as u64;
    while value != 0 {
        body.push((value & 0xFF) as u8);
        value >>= 8;
    }
    if body.last().copied().unwrap_or(0) & 0x80 != 0 {
        body.push(0x00);
    }
    let mut out = op_push(body.len());
    out.extend_from_slice(&body);
    out
}

/// Assemble a coinbase transaction paying `miner_value` to the P2PKH output
/// for `payout_h160`, with an 8-byte reserved extranonce region between
/// `coinbase1` and `coinbase2`.
pub fn build_coinbase(
    payout_h160: &[u8; 20],
    height: u32,
    arbitrary: &[u8],
    miner_value: u64,
    extra_outputs: &[ExtraOutput],
) -> Coinbase {
    let height_script = encode_bip34_height(height);

    let mut script_without_extranonce = height_script;
    script_without_extranonce.extend_from_slice(&op_push(arbitrary.len()));
    script_without_extranonce.extend_from_slice(arbitrary);

    const EXTRANONCE_PLACEHOLDER_SIZE: usize = 8;
    let total_script_len = script_without_extranonce.len() + EXTRANONCE_PLACEHOLDER_SIZE;

    let mut txin_start = Vec::new();
    txin_start.extend_from_slice(&[0u8; 32]); // null prevout hash
    txin_start.extend_from_slice(&[0xFF; 4]); // prevout index 0xFFFFFFFF
    txin_start.extend_from_slice(&var_int(total_script_len as u64));
    txin_start.extend_from_slice(&script_without_extranonce);
    let txin_end = vec![0xFFu8; 4]; // sequence

    let mut vout_to_miner = vec![0x76, 0xA9, 0x14];
    vout_to_miner.extend_from_slice(payout_h160);
    vout_to_miner.extend_from_slice(&[0x88, 0xAC]);

    let mut outputs = Vec::new();
    let mut primary = miner_value.to_le_bytes().to_vec();
    primary.extend_from_slice(&op_push(vout_to_miner.len()));
    primary.extend_from_slice(&vout_to_miner);
    outputs.push(primary);

    for (value, script) in extra_outputs {
        let mut out = value.to_le_bytes().to_vec();
        out.extend_from_slice(&op_push(script.len()));
        out.extend_from_slice(script);
        outputs.push(out);
    }

    let num_outputs = outputs.len() as u64;
    let outputs_bytes: Vec<u8> = outputs.into_iter().flatten().collect();

    const TX_VERSION: i32 = 1;

    let mut tx = Vec::new();
    tx.extend_from_slice(&TX_VERSION.to_le_bytes());
    tx.push(0x01); // one input
    tx.extend_from_slice(&txin_start);
    tx.extend_from_slice(&txin_end);
    tx.extend_from_slice(&var_int(num_outputs));
    tx.extend_from_slice(&outputs_bytes);
    tx.extend_from_slice(&[0u8; 4]); // locktime

    let mut coinbase1 = Vec::new();
    coinbase1.extend_from_slice(&TX_VERSION.to_le_bytes());
    coinbase1.push(0x01);
    coinbase1.extend_from_slice(&txin_start);

    let mut coinbase2 = Vec::new();
    coinbase2.extend_from_slice(&txin_end);
    coinbase2.extend_from_slice(&var_int(num_outputs));
    coinbase2.extend_from_slice(&outputs_bytes);
    coinbase2.extend_from_slice(&[0u8; 4]);

    let txid = dsha256(&tx);

    Coinbase {
        tx,
        txid,
        coinbase1,
        coinbase2,
    }
}
