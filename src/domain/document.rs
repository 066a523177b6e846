//! The `Document` record (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::property::PropertyMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Deleted,
}

/// Location of the document's original bytes in the object store (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub bucket: String,
    pub object_key: String,
    pub etag: String,
    pub size: u64,
    pub content_type: String,
}

/// A user-owned record of an ingested source (spec §3 `Document`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: i64,
    pub owner_id: i64,
    pub display_name: String,
    pub file_type: String,
    pub status: DocumentStatus,
    pub location: Option<ObjectLocation>,
    pub metadata: PropertyMap,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(id: i64, owner_id: i64, display_name: impl Into<String>, file_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            owner_id,
            display_name: display_name.into(),
            file_type: file_type.into(),
            status: DocumentStatus::Pending,
            location: None,
            metadata: PropertyMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Soft-delete: sets status to `deleted` and records a tombstone
    /// timestamp in metadata (spec §3 `Document`).
    pub fn soft_delete(&mut self) {
        self.status = DocumentStatus::Deleted;
        self.metadata.insert(
            "deleted_at".to_string(),
            super::property::PropertyValue::String(Utc::now().to_rfc3339()),
        );
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_delete_sets_status_and_tombstone() {
        let mut doc = Document::new(1, 1, "a.txt", "text/plain");
        doc.soft_delete();
        assert_eq!(doc.status, DocumentStatus::Deleted);
        assert!(doc.metadata.contains_key("deleted_at"));
    }
}
