//! # Audit Log - Tamper-Evident Admission and Execution Record
//!
//! Append-only log of substrate events with SHA-256 Merkle accumulation.
//! Every append computes a leaf hash over the canonical record encoding and
//! updates the running root, so a third party holding the leaf sequence can
//! recompute and verify any historical root without trusting the process.
//!
//! ## Leaf Format
//!
//! ```text
//! leaf bytes = version byte | u32-BE record length | canonical JSON record
//! leaf hash  = SHA-256(0x00 || leaf bytes)
//! inner hash = SHA-256(0x01 || left || right)
//! ```
//!
//! Unpaired nodes promote to the next level, so `root_at(k)` is recomputable
//! from the first `k + 1` leaves alone.
//!
//! The log is volatile: nothing persists across process restart. Durability is
//! an extension point — a sidecar may serialize the leaf bytes to an
//! append-only file without involving the core.

use bytes::{BufMut, BytesMut};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::{QvmError, Result};

/// Version byte prefixed to every encoded leaf
pub const LEAF_FORMAT_VERSION: u8 = 1;

/// Event classes recorded by the substrate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    SessionOpened,
    SessionClosed,
    AdmissionCertified,
    AdmissionRejected,
    JobStateChanged,
    OperationExecuted,
    CapabilityAllowed,
    CapabilityDenied,
    FirewallAllowed,
    FirewallDenied,
    UnloadCompleted,
    CleanupError,
}

/// One audit leaf prior to encoding
///
/// `index` is assigned at append time and is strictly monotonic. Timestamps
/// are wall-clock milliseconds and deliberately excluded from determinism
/// guarantees; replaying a job reproduces the kind/subject sequence, not the
/// clock readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub index: u64,
    pub timestamp_ms: i64,
    pub kind: AuditEventKind,
    pub tenant: String,
    pub subject_ids: Vec<String>,
    pub details: Value,
}

struct LogState {
    leaves: Vec<AuditRecord>,
    leaf_hashes: Vec<[u8; 32]>,
}

/// Append-only, internally serialized audit log
///
/// Appends take the write lock for the duration of one hash computation;
/// readers clone a snapshot and never block writers for longer than a read
/// lock acquisition.
pub struct AuditLog {
    state: RwLock<LogState>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LogState {
                leaves: Vec::new(),
                leaf_hashes: Vec::new(),
            }),
        }
    }

    /// Append a record, returning its leaf index
    ///
    /// Encoding failures degrade to a placeholder record rather than losing
    /// the event; the log must never drop an admission or denial.
    pub fn append(
        &self,
        kind: AuditEventKind,
        tenant: &str,
        subject_ids: Vec<String>,
        details: Value,
    ) -> u64 {
        let mut state = self.state.write();
        let index = state.leaves.len() as u64;
        let record = AuditRecord {
            index,
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            kind,
            tenant: tenant.to_string(),
            subject_ids,
            details,
        };
        let encoded = encode_leaf(&record).unwrap_or_else(|_| {
            let mut fallback = BytesMut::new();
            fallback.put_u8(LEAF_FORMAT_VERSION);
            fallback.put_u32(0);
            fallback.to_vec()
        });
        let hash = leaf_hash(&encoded);
        state.leaves.push(record);
        state.leaf_hashes.push(hash);
        index
    }

    pub fn len(&self) -> usize {
        self.state.read().leaves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all leaves in append order
    pub fn leaves(&self) -> Vec<AuditRecord> {
        self.state.read().leaves.clone()
    }

    /// Snapshot of all leaf hashes in append order
    pub fn leaf_hashes(&self) -> Vec<[u8; 32]> {
        self.state.read().leaf_hashes.clone()
    }

    /// Merkle root over the whole log, `None` while empty
    pub fn root(&self) -> Option<[u8; 32]> {
        compute_root(&self.state.read().leaf_hashes)
    }

    /// Merkle root after the `index`-th leaf was appended
    ///
    /// # Errors
    ///
    /// Returns `NotFound` when fewer than `index + 1` leaves exist.
    pub fn root_at(&self, index: u64) -> Result<[u8; 32]> {
        let state = self.state.read();
        let end = index as usize + 1;
        if end > state.leaf_hashes.len() {
            return Err(QvmError::NotFound(format!(
                "audit leaf {index} not yet appended"
            )));
        }
        Ok(compute_root(&state.leaf_hashes[..end]).expect("non-empty prefix has a root"))
    }

    pub fn query_by_tenant(&self, tenant: &str) -> Vec<AuditRecord> {
        self.state
            .read()
            .leaves
            .iter()
            .filter(|r| r.tenant == tenant)
            .cloned()
            .collect()
    }

    pub fn query_by_kind(&self, kind: AuditEventKind) -> Vec<AuditRecord> {
        self.state
            .read()
            .leaves
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    /// Records with `from_ms <= timestamp < to_ms`
    pub fn query_by_time_range(&self, from_ms: i64, to_ms: i64) -> Vec<AuditRecord> {
        self.state
            .read()
            .leaves
            .iter()
            .filter(|r| r.timestamp_ms >= from_ms && r.timestamp_ms < to_ms)
            .cloned()
            .collect()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Canonical leaf encoding: version byte | length-prefixed canonical record
pub fn encode_leaf(record: &AuditRecord) -> Result<Vec<u8>> {
    let body = serde_json::to_vec(record)
        .map_err(|e| QvmError::Serialization(format!("audit record encoding failed: {e}")))?;
    let mut buf = BytesMut::with_capacity(body.len() + 5);
    buf.put_u8(LEAF_FORMAT_VERSION);
    buf.put_u32(body.len() as u32);
    buf.put_slice(&body);
    Ok(buf.to_vec())
}

/// `SHA-256(0x00 || leaf_bytes)`
pub fn leaf_hash(leaf_bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([0x00]);
    hasher.update(leaf_bytes);
    hasher.finalize().into()
}

/// `SHA-256(0x01 || left || right)`
pub fn inner_hash(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update([0x01]);
    hasher.update(left);
    hasher.update(right);
    hasher.finalize().into()
}

/// Fold a leaf-hash sequence into its Merkle root
///
/// Unpaired nodes promote unchanged to the next level. Exposed so external
/// verifiers can recompute roots from a leaf dump.
pub fn compute_root(leaf_hashes: &[[u8; 32]]) -> Option<[u8; 32]> {
    if leaf_hashes.is_empty() {
        return None;
    }
    let mut level: Vec<[u8; 32]> = leaf_hashes.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity(level.len().div_ceil(2));
        for pair in level.chunks(2) {
            match pair {
                [left, right] => next.push(inner_hash(left, right)),
                [odd] => next.push(*odd),
                _ => unreachable!(),
            }
        }
        level = next;
    }
    Some(level[0])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_log(n: usize) -> AuditLog {
        let log = AuditLog::new();
        for i in 0..n {
            log.append(
                AuditEventKind::OperationExecuted,
                "tenant-a",
                vec![format!("node-{i}")],
                json!({"op": "APPLY_H"}),
            );
        }
        log
    }

    #[test]
    fn test_append_assigns_monotonic_indices() {
        let log = sample_log(5);
        let leaves = log.leaves();
        for (i, leaf) in leaves.iter().enumerate() {
            assert_eq!(leaf.index, i as u64);
        }
        assert_eq!(log.len(), 5);
    }

    #[test]
    fn test_root_matches_external_recomputation() {
        let log = sample_log(7);
        let hashes = log.leaf_hashes();

        // A third party recomputes every historical root from the leaves alone
        for k in 0..hashes.len() {
            let external = compute_root(&hashes[..=k]).unwrap();
            assert_eq!(log.root_at(k as u64).unwrap(), external);
        }
        assert_eq!(log.root(), compute_root(&hashes));
    }

    #[test]
    fn test_root_changes_on_every_append()  {
        let log = AuditLog::new();
        assert!(log.root().is_none());
        let mut seen = Vec::new();
        for i in 0..4 {
            log.append(
                AuditEventKind::CapabilityAllowed,
                "tenant-a",
                vec![format!("tok-{i}")],
                Value::Null,
            );
            let root = log.root().unwrap();
            assert!(!seen.contains(&root));
            seen.push(root);
        }
    }

    #[test]
    fn test_root_at_out_of_range_is_not_found() {
        let log = sample_log(2);
        assert!(matches!(log.root_at(5), Err(QvmError::NotFound(_))));
    }

    #[test]
    fn test_leaf_encoding_layout() {
        let record = AuditRecord {
            index: 0,
            timestamp_ms: 1_700_000_000_000,
            kind: AuditEventKind::AdmissionCertified,
            tenant: "tenant-a".to_string(),
            subject_ids: vec!["job-1".to_string()],
            details: Value::Null,
        };
        let encoded = encode_leaf(&record).unwrap();
        assert_eq!(encoded[0], LEAF_FORMAT_VERSION);
        let len = u32::from_be_bytes(encoded[1..5].try_into().unwrap()) as usize;
        assert_eq!(len, encoded.len() - 5);
        let decoded: AuditRecord = serde_json::from_slice(&encoded[5..]).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_queries_filter_by_tenant_and_kind() {
        let log = AuditLog::new();
        log.append(AuditEventKind::SessionOpened, "tenant-a", vec![], Value::Null);
        log.append(AuditEventKind::SessionOpened, "tenant-b", vec![], Value::Null);
        log.append(
            AuditEventKind::AdmissionRejected,
            "tenant-a",
            vec!["job-9".to_string()],
            json!({"rule": "cyclic"}),
        );

        assert_eq!(log.query_by_tenant("tenant-a").len(), 2);
        assert_eq!(log.query_by_kind(AuditEventKind::SessionOpened).len(), 2);
        assert_eq!(log.query_by_kind(AuditEventKind::AdmissionRejected).len(), 1);
    }
}
