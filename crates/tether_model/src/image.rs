//! Binary attachments.

use crate::id::EntityId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Type descriptor used in fetch requests that target attachments.
pub const IMAGE_TYPE: &str = "tether.Image";

/// A binary blob attached to an entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageAttachment {
    /// Unique identifier.
    pub id: EntityId,
    /// Id of the entity the blob belongs to.
    pub relation_id: EntityId,
    /// Type descriptor of the owning entity.
    pub related_type: String,
    /// Creation time (UTC).
    pub created_at: DateTime<Utc>,
    /// Last modification time (UTC).
    pub modified_at: DateTime<Utc>,
    /// Raw bytes.
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
    /// True once the authoritative side has accepted this version.
    #[serde(default)]
    pub synced: bool,
}

impl ImageAttachment {
    /// Creates an attachment for `owner_id` of type `owner_type`.
    pub fn new(owner_id: EntityId, owner_type: impl Into<String>, data: Vec<u8>) -> Self {
        let now = Utc::now();
        Self {
            id: EntityId::new(),
            relation_id: owner_id,
            related_type: owner_type.into(),
            created_at: now,
            modified_at: now,
            data,
            synced: false,
        }
    }

    /// Size of the payload in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_attachment_points_at_owner() {
        let owner = EntityId::new();
        let image = ImageAttachment::new(owner, "Person", vec![0xFF; 4]);
        assert_eq!(image.relation_id, owner);
        assert_eq!(image.related_type, "Person");
        assert_eq!(image.len(), 4);
        assert!(!image.synced);
    }
}
