//! Deterministic account and transfer identifiers.
//!
//! Every id is a hash of a semantic label, so a retried operation produces
//! the same id and the ledger's duplicate detection makes it idempotent.

use sha2::{Digest, Sha256};

use crate::ratelimit::types::LimitKey;

/// Map a label to a 128-bit id that is never zero or `u128::MAX`.
pub fn id128(label: &str) -> u128 {
    let digest = Sha256::digest(label.as_bytes());
    let mut raw = [0u8; 16];
    raw.copy_from_slice(&digest[..16]);
    if raw.iter().all(|b| *b == 0) || raw.iter().all(|b| *b == 0xFF) {
        raw[0] ^= 0x01;
    }
    u128::from_le_bytes(raw)
}

pub fn operator_account_id() -> u128 {
    id128("acct:operator")
}

pub fn limit_account_id(key: &LimitKey) -> u128 {
    id128(&format!("acct:limit:{}", key))
}

pub fn debt_account_id(key: &LimitKey) -> u128 {
    id128(&format!("acct:debt:{}", key))
}

pub fn reserve_transfer_id(lease_id: &str, key: &LimitKey) -> u128 {
    id128(&format!("xfer:reserve:{}:{}", lease_id, key))
}

pub fn void_transfer_id(lease_id: &str, key: &LimitKey) -> u128 {
    id128(&format!("xfer:void:{}:{}", lease_id, key))
}

pub fn rereserve_transfer_id(lease_id: &str, key: &LimitKey) -> u128 {
    id128(&format!("xfer:rereserve:{}:{}", lease_id, key))
}

pub fn debt_transfer_id(lease_id: &str, key: &LimitKey) -> u128 {
    id128(&format!("xfer:debt:{}:{}", lease_id, key))
}

/// Capacity top-up toward `target`, given the account's posted credits.
pub fn capacity_transfer_id(key: &LimitKey, target: u64, credits_posted: u64) -> u128 {
    id128(&format!("xfer:capacity:{}:{}:{}", key, target, credits_posted))
}

/// Capacity reduction to `target`, given the account's posted debits.
pub fn decrease_transfer_id(key: &LimitKey, target: u64, debits_posted: u64) -> u128 {
    id128(&format!("xfer:decrease:{}:{}:{}", key, target, debits_posted))
}

/// Serde adapter writing `u128` ids as 32-digit lowercase hex strings.
pub mod hex {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{:032x}", value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        let s = String::deserialize(deserializer)?;
        u128::from_str_radix(&s, 16).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_deterministic() {
        let key = LimitKey::from("k1");
        assert_eq!(limit_account_id(&key), limit_account_id(&key));
        assert_eq!(reserve_transfer_id("L1", &key), reserve_transfer_id("L1", &key));
    }

    #[test]
    fn test_ids_differ_by_label() {
        let key = LimitKey::from("k1");
        assert_ne!(limit_account_id(&key), debt_account_id(&key));
        assert_ne!(reserve_transfer_id("L1", &key), reserve_transfer_id("L2", &key));
        assert_ne!(reserve_transfer_id("L1", &key), void_transfer_id("L1", &key));
        assert_ne!(capacity_transfer_id(&key, 5, 0), capacity_transfer_id(&key, 5, 5));
        assert_ne!(decrease_transfer_id(&key, 1, 0), decrease_transfer_id(&key, 1, 3));
    }

    #[test]
    fn test_id_matches_sha256_prefix() {
        let digest = Sha256::digest(b"acct:operator");
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&digest[..16]);
        assert_eq!(operator_account_id(), u128::from_le_bytes(raw));
        assert_ne!(operator_account_id(), 0);
        assert_ne!(operator_account_id(), u128::MAX);
    }
}
