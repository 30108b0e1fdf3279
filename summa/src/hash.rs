//! Hashing primitives for the event chain and balance checksums.
//!
//! Event hashes and balance checksums use HMAC-SHA256 when a chain secret
//! is configured and plain SHA-256 otherwise. Merkle trees are always plain
//! SHA-256 so inclusion proofs can be verified by third parties that hold
//! the anchored root but not the secret.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::LedgerError;

type HmacSha256 = Hmac<Sha256>;

/// The five mutable balance fields of an account row, in checksum order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BalanceTuple {
    pub balance: i64,
    pub credit_balance: i64,
    pub debit_balance: i64,
    pub pending_debit: i64,
    pub pending_credit: i64,
}

/// Keyed (or unkeyed) digest context shared by the engine.
#[derive(Clone)]
pub struct Hasher {
    secret: Option<Vec<u8>>,
}

impl Hasher {
    pub fn new(secret: Option<&[u8]>) -> Self {
        Self {
            secret: secret.map(|s| s.to_vec()),
        }
    }

    fn digest(&self, bytes: &[u8]) -> String {
        match &self.secret {
            Some(key) => {
                let mut mac = HmacSha256::new_from_slice(key)
                    .expect("hmac accepts any key length");
                mac.update(bytes);
                hex::encode(mac.finalize().into_bytes())
            }
            None => hex::encode(Sha256::digest(bytes)),
        }
    }

    /// Hash an event given the previous event's hash in the same aggregate
    /// chain. The previous digest contributes its raw bytes; the chain head
    /// contributes nothing.
    pub fn event_hash(
        &self,
        prev_hash: Option<&str>,
        event_data: &serde_json::Value,
    ) -> Result<String, LedgerError> {
        let mut bytes = match prev_hash {
            Some(prev) => hex::decode(prev).map_err(|_| {
                LedgerError::ChainIntegrityViolation(format!(
                    "stored prev_hash is not valid hex: {prev}"
                ))
            })?,
            None => Vec::new(),
        };
        bytes.extend_from_slice(canonical_json(event_data).as_bytes());
        Ok(self.digest(&bytes))
    }

    /// Checksum over the five balance fields plus the row version.
    pub fn balance_checksum(
        &self,
        balances: &BalanceTuple,
        lock_version: i64,
    ) -> String {
        let canonical = format!(
            "{}:{}:{}:{}:{}:{}",
            balances.balance,
            balances.credit_balance,
            balances.debit_balance,
            balances.pending_debit,
            balances.pending_credit,
            lock_version,
        );
        self.digest(canonical.as_bytes())
    }
}

/// Serialize a JSON value with stable key order and no whitespace, so the
/// same logical payload always hashes identically.
pub fn canonical_json(value: &serde_json::Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &serde_json::Value, out: &mut String) {
    use serde_json::Value;
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            out.push_str(
                &serde_json::to_string(s).expect("string serialization"),
            );
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(
                    &serde_json::to_string(key).expect("string serialization"),
                );
                out.push(':');
                write_canonical(&map[*key], out);
            }
            out.push('}');
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Constant-time comparison of two hex digests.
pub fn digests_equal(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Clone)]
pub struct MerkleTree {
    pub root: String,
    pub depth: u32,
    /// levels[0] is the leaf level; the last level holds the root alone.
    pub levels: Vec<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MerkleProof {
    pub leaf: String,
    pub siblings: Vec<String>,
    /// true when the node is the right child at that level, so the sibling
    /// is hashed on the left.
    pub path_bits: Vec<bool>,
    pub root: String,
}

fn pair_hash(left: &str, right: &str) -> Result<String, LedgerError> {
    let mut bytes = decode_digest(left)?;
    bytes.extend_from_slice(&decode_digest(right)?);
    Ok(sha256_hex(&bytes))
}

fn decode_digest(hash: &str) -> Result<Vec<u8>, LedgerError> {
    hex::decode(hash).map_err(|_| {
        LedgerError::ChainIntegrityViolation(format!(
            "merkle node is not valid hex: {hash}"
        ))
    })
}

/// Pairwise SHA-256 up the tree; an odd level duplicates its last node.
pub fn build_merkle_tree(
    leaves: &[String],
) -> Result<MerkleTree, LedgerError> {
    if leaves.is_empty() {
        return Ok(MerkleTree {
            root: sha256_hex(b""),
            depth: 0,
            levels: Vec::new(),
        });
    }
    let mut levels = vec![leaves.to_vec()];
    while levels.last().unwrap().len() > 1 {
        let current = levels.last().unwrap();
        let mut next = Vec::with_capacity(current.len().div_ceil(2));
        for pair in current.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            next.push(pair_hash(left, right)?);
        }
        levels.push(next);
    }
    Ok(MerkleTree {
        root: levels.last().unwrap()[0].clone(),
        depth: (levels.len() - 1) as u32,
        levels,
    })
}

pub fn generate_merkle_proof(
    leaves: &[String],
    index: usize,
) -> Result<MerkleProof, LedgerError> {
    if index >= leaves.len() {
        return Err(LedgerError::InvalidArgument(format!(
            "merkle leaf index {index} out of range ({} leaves)",
            leaves.len()
        )));
    }
    let tree = build_merkle_tree(leaves)?;
    let mut siblings = Vec::with_capacity(tree.depth as usize);
    let mut path_bits = Vec::with_capacity(tree.depth as usize);
    let mut idx = index;
    for level in &tree.levels[..tree.levels.len() - 1] {
        let sibling_idx = idx ^ 1;
        // An odd tail pairs with itself.
        let sibling = level.get(sibling_idx).unwrap_or(&level[idx]);
        siblings.push(sibling.clone());
        path_bits.push(idx & 1 == 1);
        idx /= 2;
    }
    Ok(MerkleProof {
        leaf: leaves[index].clone(),
        siblings,
        path_bits,
        root: tree.root,
    })
}

pub fn verify_merkle_proof(proof: &MerkleProof) -> bool {
    if proof.siblings.len() != proof.path_bits.len() {
        return false;
    }
    let mut current = proof.leaf.clone();
    for (sibling, is_right) in proof.siblings.iter().zip(&proof.path_bits) {
        current = match if *is_right {
            pair_hash(sibling, &current)
        } else {
            pair_hash(&current, sibling)
        } {
            Ok(hash) => hash,
            Err(_) => return false,
        };
    }
    digests_equal(&current, &proof.root)
}
