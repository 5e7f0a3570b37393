//! In-memory Portal State Store
//!
//! Implements `PortalStateStore` over a single key-value map. Keys are
//! `hex(sha256(prefix || id))`, values are JSON.

use crate::domain::{InstructionKind, PortalError, StatusRecord};
use crate::ports::outbound::{BlockCommit, PortalSnapshot, PortalStateStore};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use tracing::{debug, info};

const SNAPSHOT_PREFIX: &str = "portal-snapshot-";
const HEIGHT_PREFIX: &str = "portal-height-";
const USED_TX_PREFIX: &str = "portal-used-external-tx-";
const PORTING_ID_PREFIX: &str = "portal-porting-id-";
const REDEEM_ID_PREFIX: &str = "portal-redeem-id-";
const STATUS_PREFIX: &str = "portal-status-";

/// Object key for `id` under `prefix`.
pub fn storage_key(prefix: &str, id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prefix.as_bytes());
    hasher.update(id.as_bytes());
    hex::encode(hasher.finalize())
}

fn status_key(kind: InstructionKind, id: &str) -> String {
    storage_key(&format!("{STATUS_PREFIX}{}-", kind.type_id()), id)
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, PortalError> {
    serde_json::to_vec(value).map_err(|e| PortalError::Store(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, PortalError> {
    serde_json::from_slice(bytes).map_err(|e| PortalError::Store(e.to_string()))
}

/// In-memory state store.
///
/// A block's writes are staged and then applied under one write lock, so
/// readers see either the previous block or the new one.
pub struct InMemoryPortalStore {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    fail_commits: RwLock<bool>,
}

impl InMemoryPortalStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            fail_commits: RwLock::new(false),
        }
    }

    /// Make every following commit fail, for testing.
    pub fn set_fail_commits(&self, fail: bool) {
        *self.fail_commits.write() = fail;
    }

    /// Mark an external transaction as consumed.
    pub fn mark_external_tx_used(&self, tx_id: &str) {
        self.entries
            .write()
            .insert(storage_key(USED_TX_PREFIX, tx_id), vec![1]);
    }

    /// Mark a porting ID as taken.
    pub fn mark_porting_id_used(&self, porting_id: &str) {
        self.entries
            .write()
            .insert(storage_key(PORTING_ID_PREFIX, porting_id), vec![1]);
    }

    /// Mark a redeem ID as taken.
    pub fn mark_redeem_id_used(&self, redeem_id: &str) {
        self.entries
            .write()
            .insert(storage_key(REDEEM_ID_PREFIX, redeem_id), vec![1]);
    }

    /// Height of the last committed block.
    pub fn last_height(&self) -> Result<Option<u64>, PortalError> {
        self.entries
            .read()
            .get(&storage_key(HEIGHT_PREFIX, ""))
            .map(|bytes| decode(bytes))
            .transpose()
    }

    /// Copy of every stored entry.
    pub fn dump(&self) -> BTreeMap<String, Vec<u8>> {
        self.entries.read().clone()
    }

    fn contains(&self, prefix: &str, id: &str) -> bool {
        self.entries.read().contains_key(&storage_key(prefix, id))
    }
}

impl Default for InMemoryPortalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PortalStateStore for InMemoryPortalStore {
    fn load_snapshot(&self) -> Result<PortalSnapshot, PortalError> {
        match self.entries.read().get(&storage_key(SNAPSHOT_PREFIX, "")) {
            Some(bytes) => decode(bytes),
            None => Ok(PortalSnapshot::default()),
        }
    }

    fn commit_block(&self, commit: BlockCommit) -> Result<(), PortalError> {
        if *self.fail_commits.read() {
            return Err(PortalError::Store(format!(
                "commit of block {} refused",
                commit.beacon_height
            )));
        }

        let mut batch = vec![
            (storage_key(SNAPSHOT_PREFIX, ""), encode(&commit.snapshot)?),
            (storage_key(HEIGHT_PREFIX, ""), encode(&commit.beacon_height)?),
        ];
        for tx_id in &commit.used_external_tx_ids {
            batch.push((storage_key(USED_TX_PREFIX, tx_id), vec![1]));
        }
        for id in &commit.porting_ids {
            batch.push((storage_key(PORTING_ID_PREFIX, id), vec![1]));
        }
        for id in &commit.redeem_ids {
            batch.push((storage_key(REDEEM_ID_PREFIX, id), vec![1]));
        }
        for status in &commit.statuses {
            batch.push((status_key(status.kind, &status.id), encode(status)?));
        }

        debug!(
            "[qc-15] Committing block {} ({} entries)",
            commit.beacon_height,
            batch.len()
        );
        let mut entries = self.entries.write();
        for (key, value) in batch {
            entries.insert(key, value);
        }
        info!("[qc-15] Block {} committed", commit.beacon_height);
        Ok(())
    }

    fn is_external_tx_used(&self, tx_id: &str) -> Result<bool, PortalError> {
        Ok(self.contains(USED_TX_PREFIX, tx_id))
    }

    fn porting_id_exists(&self, porting_id: &str) -> Result<bool, PortalError> {
        Ok(self.contains(PORTING_ID_PREFIX, porting_id))
    }

    fn redeem_id_exists(&self, redeem_id: &str) -> Result<bool, PortalError> {
        Ok(self.contains(REDEEM_ID_PREFIX, redeem_id))
    }

    fn get_status(
        &self,
        kind: InstructionKind,
        id: &str,
    ) -> Result<Option<StatusRecord>, PortalError> {
        self.entries
            .read()
            .get(&status_key(kind, id))
            .map(|bytes| decode(bytes))
            .transpose()
    }
}
