//! Strong type definitions for the Accord engine.
//!
//! All identifiers are newtypes to prevent misuse at compile time. A sync
//! touches four coordinate axes (member, category, unique id, mapping) and
//! mixing them up silently corrupts state, so none of them is a bare string
//! or integer in any API.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one member (device or application endpoint) within a group.
///
/// Members are referenced by id everywhere; nothing in the engine holds a
/// direct handle to another component's member state.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId(pub u32);

impl MemberId {
    /// Create a member id from its numeric value.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the numeric value.
    pub const fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Debug for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemberId(m{})", self.0)
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

impl From<u32> for MemberId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// A data category synchronized independently per member ("contacts",
/// "events", "notes", "tasks").
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Category(String);

impl Category {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Category({})", self.0)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Category {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A record identifier, unique within one (member, category).
///
/// Unique ids are member-assigned and opaque. The engine preserves them when
/// propagating a record to a destination, which is what makes cross-member
/// correlation by id possible on later sessions.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UniqueId(String);

impl UniqueId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UniqueId({})", self.0)
    }
}

impl fmt::Display for UniqueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UniqueId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An opaque content fingerprint for one record revision.
///
/// Two fingerprints are only ever compared for equality. Members that track
/// their own revision strings report those; members that do not get one
/// derived from the payload via [`Fingerprint::of_payload`].
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Derive a fingerprint from raw payload bytes (Blake3, hex).
    pub fn of_payload(payload: &[u8]) -> Self {
        Self(hex::encode(blake3::hash(payload).as_bytes()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Derived fingerprints are 64 hex chars; keep debug output short.
        match self.0.get(..16) {
            Some(prefix) if self.0.len() > 16 => write!(f, "Fingerprint({prefix}..)"),
            _ => write!(f, "Fingerprint({})", self.0),
        }
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Fingerprint {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A member's data-store identity token for one category.
///
/// A member reports its current token on connect. If it differs from the
/// stored one the category must be slow-synced: the member's data store was
/// replaced or reset and incremental deletion inference would be wrong.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnchorToken(String);

impl AnchorToken {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AnchorToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnchorToken({})", self.0)
    }
}

impl fmt::Display for AnchorToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AnchorToken {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of one cross-member identity grouping ([`crate::Mapping`]).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MappingId(pub u64);

impl MappingId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for MappingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MappingId({})", self.0)
    }
}

impl fmt::Display for MappingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of one archived payload, monotonically increasing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArchiveId(pub u64);

impl ArchiveId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ArchiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchiveId({})", self.0)
    }
}

impl fmt::Display for ArchiveId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_id_display() {
        assert_eq!(format!("{}", MemberId::new(3)), "m3");
    }

    #[test]
    fn test_fingerprint_of_payload_is_stable() {
        let a = Fingerprint::of_payload(b"BEGIN:VCARD");
        let b = Fingerprint::of_payload(b"BEGIN:VCARD");
        assert_eq!(a, b);
        assert_ne!(a, Fingerprint::of_payload(b"BEGIN:VCALENDAR"));
    }

    #[test]
    fn test_fingerprint_debug_truncates() {
        let fp = Fingerprint::of_payload(b"x");
        let debug = format!("{:?}", fp);
        assert!(debug.ends_with("..)"));
        assert!(debug.len() < 40);
    }

    #[test]
    fn test_short_fingerprint_debug_not_truncated() {
        let fp = Fingerprint::new("rev-9");
        assert_eq!(format!("{:?}", fp), "Fingerprint(rev-9)");
    }

    #[test]
    fn test_category_ordering_is_lexicographic() {
        let mut cats = vec![Category::new("notes"), Category::new("contacts")];
        cats.sort();
        assert_eq!(cats[0].as_str(), "contacts");
    }
}
