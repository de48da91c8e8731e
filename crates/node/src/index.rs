use std::collections::HashMap;
use std::sync::Mutex;

use crate::subs::ScriptHash;
use crate::util::hex_encode;

use sha2::{Digest, Sha256};

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct HistoryItem {
    pub height: i64,
    pub tx_hash: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UtxoItem {
    pub height: i64,
    pub tx_hash: String,
    pub tx_pos: u32,
    pub value: i64,
}

/// Query surface of the chain index. The index itself (key-value store,
/// compaction, ingestion) lives behind this seam; sessions only ever issue
/// these CPU-bound lookups, always from worker-pool jobs.
pub trait IndexQuery: Send + Sync {
    /// Electrum status hash for a scripthash: sha256 over the concatenated
    /// "tx_hash:height:" history lines, or None for an empty history.
    fn scripthash_status(&self, hash: &ScriptHash) -> Result<Option<String>, String>;

    /// Confirmed history, oldest first. `limit` is the server's max_history;
    /// an over-limit history is an error for the caller to surface, never a
    /// silent truncation.
    fn scripthash_history(&self, hash: &ScriptHash, limit: usize)
        -> Result<Vec<HistoryItem>, String>;

    /// (confirmed, unconfirmed) balance in satoshis.
    fn scripthash_balance(&self, hash: &ScriptHash) -> Result<(i64, i64), String>;

    fn scripthash_unspent(&self, hash: &ScriptHash) -> Result<Vec<UtxoItem>, String>;

    /// Every scripthash known to the index (diagnostic dump support).
    fn all_scripthashes(&self) -> Vec<ScriptHash>;
}

pub fn status_hash_of(history: &[HistoryItem]) -> Option<String> {
    if history.is_empty() {
        return None;
    }
    let mut hasher = Sha256::new();
    for item in history {
        hasher.update(item.tx_hash.as_bytes());
        hasher.update(b":");
        hasher.update(item.height.to_string().as_bytes());
        hasher.update(b":");
    }
    Some(hex_encode(&hasher.finalize()))
}

/// In-memory index used until the real backend attaches, and by tests.
#[derive(Default)]
pub struct MemIndex {
    entries: Mutex<HashMap<ScriptHash, Vec<HistoryItem>>>,
    unspent: Mutex<HashMap<ScriptHash, Vec<UtxoItem>>>,
}

impl MemIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_history(&self, hash: ScriptHash, item: HistoryItem) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.entry(hash).or_default().push(item);
        }
    }

    pub fn push_unspent(&self, hash: ScriptHash, item: UtxoItem) {
        if let Ok(mut unspent) = self.unspent.lock() {
            unspent.entry(hash).or_default().push(item);
        }
    }
}

impl IndexQuery for MemIndex {
    fn scripthash_status(&self, hash: &ScriptHash) -> Result<Option<String>, String> {
        let entries = self.entries.lock().map_err(|_| "index lock poisoned")?;
        Ok(entries
            .get(hash)
            .and_then(|history| status_hash_of(history)))
    }

    fn scripthash_history(
        &self,
        hash: &ScriptHash,
        limit: usize,
    ) -> Result<Vec<HistoryItem>, String> {
        let entries = self.entries.lock().map_err(|_| "index lock poisoned")?;
        let history = entries.get(hash).cloned().unwrap_or_default();
        if history.len() > limit {
            return Err(format!(
                "history too large (> {limit} items); try a smaller address"
            ));
        }
        Ok(history)
    }

    fn scripthash_balance(&self, hash: &ScriptHash) -> Result<(i64, i64), String> {
        let unspent = self.unspent.lock().map_err(|_| "index lock poisoned")?;
        let confirmed = unspent
            .get(hash)
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item.height > 0)
                    .map(|item| item.value)
                    .sum()
            })
            .unwrap_or(0);
        let unconfirmed = unspent
            .get(hash)
            .map(|items| {
                items
                    .iter()
                    .filter(|item| item.height <= 0)
                    .map(|item| item.value)
                    .sum()
            })
            .unwrap_or(0);
        Ok((confirmed, unconfirmed))
    }

    fn scripthash_unspent(&self, hash: &ScriptHash) -> Result<Vec<UtxoItem>, String> {
        let unspent = self.unspent.lock().map_err(|_| "index lock poisoned")?;
        Ok(unspent.get(hash).cloned().unwrap_or_default())
    }

    fn all_scripthashes(&self) -> Vec<ScriptHash> {
        self.entries
            .lock()
            .map(|entries| entries.keys().copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(n: u8) -> ScriptHash {
        let mut h = [0u8; 32];
        h[0] = n;
        h
    }

    #[test]
    fn empty_status_is_none() {
        let index = MemIndex::new();
        assert_eq!(index.scripthash_status(&hash(1)).unwrap(), None);
    }

    #[test]
    fn status_changes_with_history() {
        let index = MemIndex::new();
        index.push_history(
            hash(1),
            HistoryItem {
                height: 100,
                tx_hash: "aa".repeat(32),
            },
        );
        let status1 = index.scripthash_status(&hash(1)).unwrap();
        assert!(status1.is_some());
        index.push_history(
            hash(1),
            HistoryItem {
                height: 101,
                tx_hash: "bb".repeat(32),
            },
        );
        let status2 = index.scripthash_status(&hash(1)).unwrap();
        assert_ne!(status1, status2);
    }

    #[test]
    fn oversize_history_is_an_error_not_a_truncation() {
        let index = MemIndex::new();
        for i in 0..3 {
            index.push_history(
                hash(1),
                HistoryItem {
                    height: 100 + i,
                    tx_hash: "cc".repeat(32),
                },
            );
        }
        assert_eq!(index.scripthash_history(&hash(1), 3).unwrap().len(), 3);
        let err = index.scripthash_history(&hash(1), 2).unwrap_err();
        assert!(err.contains("history too large"), "{err}");
    }

    #[test]
    fn balance_splits_confirmed_and_mempool() {
        let index = MemIndex::new();
        index.push_unspent(
            hash(1),
            UtxoItem {
                height: 100,
                tx_hash: "aa".repeat(32),
                tx_pos: 0,
                value: 5000,
            },
        );
        index.push_unspent(
            hash(1),
            UtxoItem {
                height: 0,
                tx_hash: "bb".repeat(32),
                tx_pos: 1,
                value: 700,
            },
        );
        assert_eq!(index.scripthash_balance(&hash(1)).unwrap(), (5000, 700));
    }
}
