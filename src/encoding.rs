//! Binary encoding primitives shared by the coinbase builder, the template
//! updater and the share validator: varints, script push opcodes, the two
//! double-hash functions, and index-0 merkle folding.

use ruint::aliases::U256;
use sha2::{Digest, Sha256, Sha512_256};

/// Bitcoin-style compact size prefix.
pub fn var_int(n: u64) -> Vec<u8> {
    if n < 0xFD {
        vec![n as u8]
    } else if n <= 0xFFFF {
        let mut out = vec![0xFD];
        out.extend_from_slice(&(n as u16).to_le_bytes());
        out
    } else if n <= 0xFFFF_FFFF {
        let mut out = vec![0xFE];
        out.extend_from_slice(&(n as u32).to_le_bytes());
        out
    } else {
        let mut out = vec![0xFF];
        out.extend_from_slice(&n.to_le_bytes());
        out
    }
}

/// Script push opcode for a payload of `n` bytes.
pub fn op_push(n: usize) -> Vec<u8> {
    if n < 0x4C {
        vec![n as u8]
    } else if n <= 0xFF {
        vec![0x4C, n as u8]
    } else if n <= 0xFFFF {
        let mut out = vec![0x4D];
        out.extend_from_slice(&(n as u16).to_le_bytes());
        out
    } else {
        let mut out = vec![0x4E];
        out.extend_from_slice(&(n as u32).to_le_bytes());
        out
    }
}

/// Double SHA-256.
pub fn dsha256(b: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(b);
    let second = Sha256::digest(first);
    second.into()
}

/// Double SHA-512/256, the Radiant proof-of-work primitive.
///
/// `Sha512_256` is the NIST-standardized variant with its own initialization
/// vectors, distinct from truncating a plain SHA-512 digest. Using the wrong
/// primitive here means shares never verify against real node targets.
pub fn sha512_256d(b: &[u8]) -> [u8; 32] {
    let first = Sha512_256::digest(b);
    let second = Sha512_256::digest(first);
    second.into()
}

/// Merkle root over little-endian txids, with odd-level duplication.
///
/// An empty list returns `dsha256(b"")` rather than panicking; a
/// single-element list returns that element unchanged.
pub fn merkle_root_le(txids: &[[u8; 32]]) -> [u8; 32] {
    if txids.is_empty() {
        return dsha256(&[]);
    }
    let mut level: Vec<[u8; 32]> = txids.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().unwrap());
        }
        level = level
            .chunks_exact(2)
            .map(|pair| {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&pair[0]);
                buf[32..].copy_from_slice(&pair[1]);
                dsha256(&buf)
            })
            .collect();
    }
    level[0]
}

/// The sibling sequence that folds leaf index 0 back to the merkle root.
pub fn merkle_branch_index0(txids: &[[u8; 32]]) -> Vec<[u8; 32]> {
    if txids.len() <= 1 {
        return Vec::new();
    }
    let mut branch = Vec::new();
    let mut idx = 0usize;
    let mut level: Vec<[u8; 32]> = txids.to_vec();
    while level.len() > 1 {
        if level.len() % 2 == 1 {
            level.push(*level.last().unwrap());
        }
        branch.push(level[idx ^ 1]);
        level = level
            .chunks_exact(2)
            .map(|pair| {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(&pair[0]);
                buf[32..].copy_from_slice(&pair[1]);
                dsha256(&buf)
            })
            .collect();
        idx /= 2;
    }
    branch
}

/// Fold a leaf (always the left child, since its index is 0 at every level)
/// through a branch produced by [`merkle_branch_index0`].
pub fn fold_branch_index0(leaf: [u8; 32], branch: &[[u8; 32]]) -> [u8; 32] {
    let mut h = leaf;
    for sibling in branch {
        let mut buf = [0u8; 64];
        buf[..32].copy_from_slice(&h);
        buf[32..].copy_from_slice(sibling);
        h = dsha256(&buf);
    }
    h
}

/// `diff1_target = 0x00000000FFFF0000...0`, the Bitcoin-convention
/// unit-difficulty target.
pub fn diff1_target() -> U256 {
    U256::from(0xFFFFu64) << 208
}

/// Expand a 4-byte compact `bits` encoding into a full 256-bit target.
pub fn bits_to_target(bits: u32) -> U256 {
    let exp = (bits >> 24) as i32;
    let mant = U256::from(bits & 0x00FF_FFFF);
    if exp <= 3 {
        mant >> (8 * (3 - exp)) as usize
    } else {
        mant << (8 * (exp - 3)) as usize
    }
}

/// Difficulty corresponding to a 256-bit target (`diff1_target / target`).
pub fn target_to_difficulty(target: U256) -> f64 {
    if target.is_zero() {
        return f64::INFINITY;
    }
    u256_ratio(diff1_target(), target)
}

/// Divide two `U256` values as a floating point ratio without overflowing
/// `f64` conversion of the full-width operands.
pub fn u256_ratio(numerator: U256, denominator: U256) -> f64 {
    if denominator.is_zero() {
        return f64::INFINITY;
    }
    let (quotient, remainder) = numerator.div_rem(denominator);
    let quotient_f = u256_to_f64(quotient);
    let remainder_f = u256_to_f64(remainder) / u256_to_f64(denominator);
    quotient_f + remainder_f
}

fn u256_to_f64(value: U256) -> f64 {
    let mut result = 0.0f64;
    for limb in value.as_limbs().iter().rev() {
        result = result * (u64::MAX as f64 + 1.0) + (*limb as f64);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn var_int_round_trips_reference_values() {
        assert_eq!(var_int(0), vec![0x00]);
        assert_eq!(var_int(0xFC), vec![0xFC]);
        assert_eq!(var_int(0xFD), vec![0xFD, 0xFD, 0x00]);
        assert_eq!(var_int(0xFFFF), vec![0xFD, 0xFF, 0xFF]);
        assert_eq!(var_int(0x10000), vec![0xFE, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(
            var_int(0xFFFF_FFFF),
            vec![0xFE, 0xFF, 0xFF, 0xFF, 0xFF]
        );
        assert_eq!(
            var_int(0x1_0000_0000),
            vec![0xFF, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn op_push_thresholds() {
        assert_eq!(op_push(0x4B), vec![0x4B]);
        assert_eq!(op_push(0x4C), vec![0x4C, 0x4C]);
        assert_eq!(op_push(0xFF), vec![0x4C, 0xFF]);
        assert_eq!(op_push(0x100), vec![0x4D, 0x00, 0x01]);
        assert_eq!(op_push(0x10000), vec![0x4E, 0x00, 0x00, 0x01, 0x00]);
    }

    #[test]
    fn empty_merkle_root_is_dsha256_of_empty() {
        let root = merkle_root_le(&[]);
        let expected = dsha256(&[]);
        assert_eq!(root, expected);
        assert_eq!(hex::encode(root), "5df6e0e2761359d30a8275058e299fcc0381534545f55cf43e41983f5d4c9456");
    }

    #[test]
    fn single_leaf_merkle_root_and_branch() {
        let leaf = [0x42u8; 32];
        assert_eq!(merkle_root_le(&[leaf]), leaf);
        assert!(merkle_branch_index0(&[leaf]).is_empty());
        assert_eq!(fold_branch_index0(leaf, &[]), leaf);
    }

    #[test]
    fn branch_folds_back_to_root_for_several_sizes() {
        for n in 1..8 {
            let txids: Vec<[u8; 32]> = (0..n)
                .map(|i| {
                    let mut leaf = [0u8; 32];
                    leaf[0] = i as u8;
                    leaf
                })
                .collect();
            let root = merkle_root_le(&txids);
            let branch = merkle_branch_index0(&txids);
            assert_eq!(fold_branch_index0(txids[0], &branch), root, "n={n}");
        }
    }

    #[test]
    fn sha512_256d_is_not_truncated_sha512() {
        // NIST SHA-512/256 of the empty string.
        let single = Sha512_256::digest(b"");
        assert_eq!(
            hex::encode(single),
            "c672b8d1ef56ed28ab87c3622c5114069bdd3ad7b8f9737498d0c01ecef0967a"
        );
        let doubled = sha512_256d(b"");
        assert_eq!(doubled, {
            let h1 = Sha512_256::digest(b"");
            let h2 = Sha512_256::digest(h1);
            let out: [u8; 32] = h2.into();
            out
        });
    }

    #[test]
    fn bits_to_target_matches_compact_encoding() {
        // bits = 0x1d00ffff -> the historical Bitcoin genesis-style target.
        let target = bits_to_target(0x1d00ffff);
        assert_eq!(target, U256::from(0xFFFFu64) << 208);
    }

    #[test]
    fn target_to_difficulty_of_diff1_is_one() {
        let target = bits_to_target(0x1d00ffff);
        let diff = target_to_difficulty(target);
        assert!((diff - 1.0).abs() < 1e-9, "diff={diff}");
    }
}
