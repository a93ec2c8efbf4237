// Tamper-evident integrity chain over sealed event batches.
//
// Sealing builds a Merkle tree (SHA-256, 0x00 leaf / 0x01 node domain
// separation, last leaf duplicated at odd levels) over the canonical byte
// encoding of each event and links the block to its predecessor by hashing
// the predecessor's Merkle root. Verification recomputes both links and
// roots and reports the first inconsistency.

use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use toolsmith_core::canonical_json;

use crate::store::EventStore;
use crate::{now_ms, EventError, EventRecord, EventResult, IntegrityBlock};

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

/// Outcome of a full chain verification.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyReport {
    pub valid: bool,
    /// First failing block, if any
    pub failed_block_id: Option<String>,
    pub blocks_checked: usize,
    pub events_checked: usize,
    pub reason: Option<String>,
}

impl VerifyReport {
    fn ok(blocks_checked: usize, events_checked: usize) -> Self {
        Self {
            valid: true,
            failed_block_id: None,
            blocks_checked,
            events_checked,
            reason: None,
        }
    }

    fn broken(block_id: &str, blocks_checked: usize, events_checked: usize, reason: String) -> Self {
        Self {
            valid: false,
            failed_block_id: Some(block_id.to_string()),
            blocks_checked,
            events_checked,
            reason: Some(reason),
        }
    }
}

/// Builds and verifies the hash chain over sealed event batches.
pub struct IntegrityChain {
    store: Arc<dyn EventStore>,
}

impl IntegrityChain {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Seal the next batch of unsealed events, up to `max_events`.
    ///
    /// Returns `None` when every event is already covered by a block.
    pub async fn seal_block(&self, max_events: usize) -> EventResult<Option<IntegrityBlock>> {
        if max_events == 0 {
            return Ok(None);
        }
        let prior = self.store.latest_integrity_block().await?;
        let after_id = prior.as_ref().map(|b| b.end_event_id.as_str());
        let batch = self.store.load_events_after_id(after_id, max_events).await?;
        if batch.is_empty() {
            return Ok(None);
        }

        let leaves: Vec<Vec<u8>> = batch.iter().map(canonical_event_bytes).collect();
        let merkle_root = hex(&merkle_root(&leaves));
        let previous_block_hash = prior.as_ref().map(|b| hex(&sha256(b.merkle_root.as_bytes())));

        let block = IntegrityBlock {
            id: Uuid::now_v7().to_string(),
            previous_block_hash,
            merkle_root,
            start_event_id: batch[0].id.clone(),
            end_event_id: batch[batch.len() - 1].id.clone(),
            event_count: batch.len() as i64,
            created_at: now_ms(),
        };
        self.store.insert_integrity_block(&block).await?;
        info!(
            block_id = %block.id,
            events = block.event_count,
            "sealed integrity block"
        );
        Ok(Some(block))
    }

    /// Walk every sealed block in order and verify links, counts, and
    /// Merkle roots against the stored events.
    pub async fn verify_chain(&self) -> EventResult<VerifyReport> {
        let blocks = self.store.load_integrity_blocks().await?;
        let mut events_checked = 0usize;
        let mut prior_root: Option<String> = None;

        for (index, block) in blocks.iter().enumerate() {
            let expected_link = prior_root.as_ref().map(|root| hex(&sha256(root.as_bytes())));
            if block.previous_block_hash != expected_link {
                warn!(block_id = %block.id, "integrity chain link mismatch");
                return Ok(VerifyReport::broken(
                    &block.id,
                    index,
                    events_checked,
                    "previous block hash does not match prior root".to_string(),
                ));
            }

            let batch = self
                .store
                .load_events_in_id_range(&block.start_event_id, &block.end_event_id)
                .await?;
            if batch.len() as i64 != block.event_count {
                warn!(block_id = %block.id, expected = block.event_count, found = batch.len(), "integrity event count mismatch");
                return Ok(VerifyReport::broken(
                    &block.id,
                    index,
                    events_checked,
                    format!(
                        "event count mismatch: block records {}, store holds {}",
                        block.event_count,
                        batch.len()
                    ),
                ));
            }

            let leaves: Vec<Vec<u8>> = batch.iter().map(canonical_event_bytes).collect();
            let recomputed = hex(&merkle_root(&leaves));
            events_checked += batch.len();
            if recomputed != block.merkle_root {
                warn!(block_id = %block.id, "integrity merkle root mismatch");
                return Ok(VerifyReport::broken(
                    &block.id,
                    index,
                    events_checked,
                    "merkle root mismatch".to_string(),
                ));
            }

            prior_root = Some(block.merkle_root.clone());
        }

        Ok(VerifyReport::ok(blocks.len(), events_checked))
    }

    /// Verify and convert a broken chain into an error, for strict boot.
    pub async fn verify_strict(&self) -> EventResult<VerifyReport> {
        let report = self.verify_chain().await?;
        if report.valid {
            return Ok(report);
        }
        Err(EventError::IntegrityChainBroken {
            block_id: report.failed_block_id.clone().unwrap_or_default(),
            message: report.reason.clone().unwrap_or_default(),
        })
    }
}

/// Canonical byte encoding of an event for leaf hashing. The contract is on
/// these bytes, not on any structured type.
fn canonical_event_bytes(event: &EventRecord) -> Vec<u8> {
    canonical_json(&json!({
        "id": event.id,
        "entity_id": event.entity_id,
        "type": event.event_type,
        "payload": event.payload,
        "timestamp": event.timestamp,
        "version": event.version,
    }))
    .into_bytes()
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn hex(bytes: &[u8; 32]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Merkle root with domain separation: leaves are hashed under 0x00,
/// internal nodes under 0x01, and odd levels duplicate their last hash.
fn merkle_root(leaves: &[Vec<u8>]) -> [u8; 32] {
    if leaves.is_empty() {
        return sha256(&[LEAF_PREFIX]);
    }
    let mut level: Vec<[u8; 32]> = leaves
        .iter()
        .map(|leaf| {
            let mut hasher = Sha256::new();
            hasher.update([LEAF_PREFIX]);
            hasher.update(leaf);
            hasher.finalize().into()
        })
        .collect();

    while level.len() > 1 {
        if level.len() % 2 == 1 {
            let last = level[level.len() - 1];
            level.push(last);
        }
        level = level
            .chunks(2)
            .map(|pair| {
                let mut hasher = Sha256::new();
                hasher.update([NODE_PREFIX]);
                hasher.update(pair[0]);
                hasher.update(pair[1]);
                hasher.finalize().into()
            })
            .collect();
    }
    level[0]
}
