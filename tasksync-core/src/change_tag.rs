use crate::models::TodoRecord;
use sha2::{Digest, Sha256};

/// SHA-256 over the canonical JSON of a record's fields, excluding the tag itself.
pub fn calculate_change_tag(record: &TodoRecord) -> String {
    let mut canonical = record.clone();
    canonical.change_tag = None;
    let json_bytes = serde_json::to_vec(&canonical).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&json_bytes);
    format!("{:x}", hasher.finalize())
}
