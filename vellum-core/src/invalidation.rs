//! Cache invalidation messages exchanged between connections and nodes.

use serde::{Deserialize, Serialize};

use crate::identity::DocumentId;

/// What happened to the document.
///
/// Receivers evict in both cases; the kind only feeds logging.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvalidationKind {
    #[default]
    Modified,
    Deleted,
}

/// "Document X changed" notice.
///
/// Delivered at least once and unordered across documents, so applying it
/// must be an idempotent eviction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationMessage {
    pub document_id: DocumentId,
    pub origin_node_id: String,
    #[serde(default)]
    pub kind: InvalidationKind,
}

impl InvalidationMessage {
    pub fn modified(document_id: DocumentId, origin_node_id: impl Into<String>) -> Self {
        Self {
            document_id,
            origin_node_id: origin_node_id.into(),
            kind: InvalidationKind::Modified,
        }
    }

    pub fn deleted(document_id: DocumentId, origin_node_id: impl Into<String>) -> Self {
        Self {
            document_id,
            origin_node_id: origin_node_id.into(),
            kind: InvalidationKind::Deleted,
        }
    }

    /// Encode for the cluster transport.
    pub fn to_wire(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_wire(bytes: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_format_uses_camel_case() {
        let msg = InvalidationMessage::deleted(DocumentId::from("doc-1"), "node-a");
        let json: serde_json::Value = serde_json::from_slice(&msg.to_wire().unwrap()).unwrap();
        assert_eq!(json["documentId"], "doc-1");
        assert_eq!(json["originNodeId"], "node-a");
        assert_eq!(json["kind"], "deleted");
    }

    #[test]
    fn test_kind_defaults_to_modified_when_absent() {
        let msg =
            InvalidationMessage::from_wire(br#"{"documentId":"x","originNodeId":"n1"}"#).unwrap();
        assert_eq!(msg.kind, InvalidationKind::Modified);
        assert_eq!(msg.document_id, DocumentId::from("x"));
    }
}
