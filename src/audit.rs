//! Audit log writer — hashes action inputs and appends Process Decision
//! Records through the store.

use std::sync::Arc;

use serde::Serialize;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::{AuditRecord, Outcome};
use crate::store::Store;

/// Writes append-only audit records for state-mutating actions.
#[derive(Clone)]
pub struct PdrWriter {
    store: Arc<Store>,
}

impl PdrWriter {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    /// Record one audit entry. The inputs are hashed, never stored verbatim.
    pub fn record<T: Serialize>(
        &self,
        action: &str,
        inputs: &T,
        outcome: Outcome,
        task_id: Option<Uuid>,
        details: Option<&str>,
    ) -> Result<AuditRecord, StoreError> {
        let hash = hash_inputs(inputs);
        self.store
            .write_pdr(action, &hash, outcome, task_id, details)
    }
}

/// Lowercase hex SHA-256 over the JSON serialization of the inputs.
///
/// serde_json serializes map keys in sorted order and struct fields in
/// declaration order, so equal inputs always hash equally.
fn hash_inputs<T: Serialize>(inputs: &T) -> String {
    match serde_json::to_vec(inputs) {
        Ok(bytes) => {
            let digest = Sha256::digest(&bytes);
            hex_encode(&digest)
        }
        Err(_) => "hash_error".to_string(),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    bytes.iter().fold(String::with_capacity(bytes.len() * 2), |mut out, b| {
        let _ = write!(out, "{b:02x}");
        out
    })
}
