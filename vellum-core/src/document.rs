//! Document records, access snapshots and principals.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::identity::{DocumentId, Timestamp};

bitflags! {
    /// Lifecycle and storage markers carried by a record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DocumentFlags: u8 {
        /// Document sits in the trash
        const TRASHED = 0b0000_0001;
        /// Document is hidden from navigation
        const HIDDEN = 0b0000_0010;
        /// Document is a frozen version of another document
        const VERSION = 0b0000_0100;
        /// Document is a proxy pointing at another document
        const PROXY = 0b0000_1000;
    }
}

impl Default for DocumentFlags {
    fn default() -> Self {
        Self::empty()
    }
}

/// Identity of the caller a session acts for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub administrator: bool,
}

impl Principal {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            groups: Vec::new(),
            administrator: false,
        }
    }

    /// Built-in principal that bypasses access checks.
    pub fn system() -> Self {
        Self {
            name: "system".to_string(),
            groups: Vec::new(),
            administrator: true,
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.groups.push(group.into());
        self
    }
}

/// Read-access snapshot stored alongside a record.
///
/// An empty `readers` set with `everyone == false` means nobody but
/// administrators can read the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclSnapshot {
    pub everyone: bool,
    #[serde(default)]
    pub readers: BTreeSet<String>,
}

impl Default for AclSnapshot {
    fn default() -> Self {
        Self::open()
    }
}

impl AclSnapshot {
    /// Readable by every principal.
    pub fn open() -> Self {
        Self {
            everyone: true,
            readers: BTreeSet::new(),
        }
    }

    /// Readable only by the listed users or groups.
    pub fn restricted<I, S>(readers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            everyone: false,
            readers: readers.into_iter().map(Into::into).collect(),
        }
    }

    pub fn permits(&self, principal: &Principal) -> bool {
        if principal.administrator || self.everyone {
            return true;
        }
        self.readers.contains(&principal.name)
            || principal.groups.iter().any(|g| self.readers.contains(g))
    }
}

/// A raw document as held by the backing store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: DocumentId,
    /// `None` only for the repository root.
    pub parent_id: Option<DocumentId>,
    pub name: String,
    /// Display path, derivable from the parent chain.
    pub path: String,
    /// Type tag used to pick a node factory (e.g. `Folder`, `File`).
    pub doc_type: String,
    #[serde(default)]
    pub state: serde_json::Value,
    #[serde(default)]
    pub acl: AclSnapshot,
    #[serde(default)]
    pub flags: DocumentFlags,
    pub modified_at: Timestamp,
}

impl DocumentRecord {
    /// Build the repository root record.
    pub fn root(id: DocumentId) -> Self {
        Self {
            id,
            parent_id: None,
            name: String::new(),
            path: "/".to_string(),
            doc_type: "Root".to_string(),
            state: serde_json::Value::Null,
            acl: AclSnapshot::open(),
            flags: DocumentFlags::empty(),
            modified_at: chrono::Utc::now(),
        }
    }

    /// Build a child record of `parent`, deriving the path from the parent's.
    pub fn child_of(parent: &DocumentRecord, name: impl Into<String>, doc_type: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: DocumentId::generate(),
            parent_id: Some(parent.id.clone()),
            path: join_path(&parent.path, &name),
            name,
            doc_type: doc_type.into(),
            state: serde_json::Value::Null,
            acl: AclSnapshot::open(),
            flags: DocumentFlags::empty(),
            modified_at: chrono::Utc::now(),
        }
    }

    pub fn with_acl(mut self, acl: AclSnapshot) -> Self {
        self.acl = acl;
        self
    }

    pub fn with_flags(mut self, flags: DocumentFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_state(mut self, state: serde_json::Value) -> Self {
        self.state = state;
        self
    }

    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }

    /// Whether the record shows up in descendant enumerations.
    ///
    /// Trashed and hidden documents are skipped; versions and proxies carry
    /// no path of their own and are never part of a subtree listing.
    pub fn is_listable(&self) -> bool {
        !self.flags.intersects(
            DocumentFlags::TRASHED | DocumentFlags::HIDDEN | DocumentFlags::VERSION | DocumentFlags::PROXY,
        )
    }
}

/// Join a parent path and a child name with exactly one separator.
pub fn join_path(parent: &str, name: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), name)
}
