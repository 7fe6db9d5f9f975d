//! Change records: what one member reports about one record in one pass.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;
use crate::types::{Category, Fingerprint, UniqueId};

/// Classification of one reported change.
///
/// Members may claim a kind when they report, but the engine re-derives it
/// from the fingerprint table; only member-reported `Deleted` is taken at
/// face value (there is nothing left to fingerprint).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u16)]
pub enum ChangeKind {
    /// No change since the last pass.
    Unmodified = 0,
    /// Not present in the last pass.
    Added = 1,
    /// Present in the last pass with a different fingerprint.
    Modified = 2,
    /// Present in the last pass, gone now.
    Deleted = 3,
}

impl ChangeKind {
    /// Whether this kind represents an actual change to propagate.
    pub fn is_dirty(&self) -> bool {
        !matches!(self, ChangeKind::Unmodified)
    }

    /// Numeric discriminant, used by persisted storage.
    pub fn as_u16(&self) -> u16 {
        *self as u16
    }
}

impl TryFrom<u16> for ChangeKind {
    type Error = CoreError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ChangeKind::Unmodified),
            1 => Ok(ChangeKind::Added),
            2 => Ok(ChangeKind::Modified),
            3 => Ok(ChangeKind::Deleted),
            other => Err(CoreError::InvalidKind(other)),
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChangeKind::Unmodified => "unmodified",
            ChangeKind::Added => "added",
            ChangeKind::Modified => "modified",
            ChangeKind::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Identifies the serialization format of an opaque payload
/// ("text/x-vcard", "text/calendar", ...). The engine never looks inside.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FormatTag(String);

impl FormatTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FormatTag({})", self.0)
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FormatTag {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A single reported change from one member.
///
/// Immutable once classified; superseded by the next report for the same id.
/// The payload is absent in metadata-only fetches and for deletions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub category: Category,
    pub unique_id: UniqueId,
    pub fingerprint: Fingerprint,
    pub payload: Option<Bytes>,
    pub format: FormatTag,
    pub kind: ChangeKind,
}

impl ChangeRecord {
    /// A report carrying full data.
    pub fn with_payload(
        category: Category,
        unique_id: UniqueId,
        fingerprint: Fingerprint,
        payload: Bytes,
        format: FormatTag,
        kind: ChangeKind,
    ) -> Self {
        Self {
            category,
            unique_id,
            fingerprint,
            payload: Some(payload),
            format,
            kind,
        }
    }

    /// A metadata-only report (preview fetches).
    pub fn metadata_only(
        category: Category,
        unique_id: UniqueId,
        fingerprint: Fingerprint,
        format: FormatTag,
        kind: ChangeKind,
    ) -> Self {
        Self {
            category,
            unique_id,
            fingerprint,
            payload: None,
            format,
            kind,
        }
    }

    /// A deletion report. Deletions carry no payload and no meaningful
    /// fingerprint.
    pub fn deletion(category: Category, unique_id: UniqueId, format: FormatTag) -> Self {
        Self {
            category,
            unique_id,
            fingerprint: Fingerprint::new(""),
            payload: None,
            format,
            kind: ChangeKind::Deleted,
        }
    }

    /// Whether the member claims this record was deleted.
    pub fn is_deletion(&self) -> bool {
        self.kind == ChangeKind::Deleted
    }
}
