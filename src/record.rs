//! Record type shared between the local store and the remote transport.

use crate::{RecordId, Timestamp};
use serde::{Deserialize, Serialize};

/// A domain record held in the local store.
///
/// Timestamps are milliseconds since the Unix epoch and are assigned by the
/// server: a record created locally carries `None` for both until the first
/// confirmation comes back. Once assigned, `id` never changes and
/// `updated_at` is non-decreasing across server-confirmed versions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Record {
    /// Unique identifier, chosen by the client at creation time.
    pub id: RecordId,
    /// Server-assigned creation time.
    pub created_at: Option<Timestamp>,
    /// Server-assigned last-update time.
    pub updated_at: Option<Timestamp>,
    /// Domain fields as a JSON object.
    pub fields: serde_json::Value,
}

impl Record {
    /// Create a new local (unconfirmed) record.
    pub fn new(id: impl Into<RecordId>, fields: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            created_at: None,
            updated_at: None,
            fields,
        }
    }

    /// Create a server-confirmed record with assigned timestamps.
    pub fn confirmed(
        id: impl Into<RecordId>,
        fields: serde_json::Value,
        created_at: Timestamp,
        updated_at: Timestamp,
    ) -> Self {
        Self {
            id: id.into(),
            created_at: Some(created_at),
            updated_at: Some(updated_at),
            fields,
        }
    }

    /// Whether the server has confirmed this record at least once.
    pub fn is_confirmed(&self) -> bool {
        self.updated_at.is_some()
    }

    /// Merge a partial update into the record's fields.
    pub fn apply_patch(&mut self, patch: &serde_json::Value) {
        merge_patch(&mut self.fields, patch);
    }
}

/// Shallow right-biased merge of JSON object patches.
///
/// Keys present in `patch` replace the corresponding keys in `base`; keys
/// absent from `patch` are kept. Non-object patches replace `base` wholesale.
pub(crate) fn merge_patch(base: &mut serde_json::Value, patch: &serde_json::Value) {
    match (base.as_object_mut(), patch.as_object()) {
        (Some(base_map), Some(patch_map)) => {
            for (key, value) in patch_map {
                base_map.insert(key.clone(), value.clone());
            }
        }
        _ => *base = patch.clone(),
    }
}
