//! Buffers (spec §3): append-only, content-addressed blob streams.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state. One-directional: active → soft-deleted → purged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BufferState {
    Active,
    SoftDeleted,
    Purged,
}

/// Case-insensitive tag keys; stored here as the normalized (lowercased)
/// key so two differently-cased writers of the same key collide, matching
/// "tag set fits a tag-index key" in spec §3.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagSet(BTreeMap<String, String>);

impl TagSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into().to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(&key.to_ascii_lowercase()).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, filter: &TagSet) -> bool {
        filter.iter().all(|(k, v)| self.get(k) == Some(v))
    }
}

impl FromIterator<(String, String)> for TagSet {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let mut set = Self::default();
        for (k, v) in iter {
            set.insert(k, v);
        }
        set
    }
}

/// A buffer record as held by the repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Buffer {
    pub id: String,
    pub location: String,
    pub tags: TagSet,
    /// Monotonic, bumped on every tag change; used as the `ifMatchETag`
    /// precondition in `UpdateBufferTags`.
    pub etag: u64,
    pub state: BufferState,
    pub created_at: DateTime<Utc>,
    pub soft_deleted_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Buffer {
    pub fn new(id: impl Into<String>, location: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            location: location.into(),
            tags: TagSet::new(),
            etag: 0,
            state: BufferState::Active,
            created_at: now,
            soft_deleted_at: None,
            expires_at: None,
        }
    }

    pub fn soft_delete(&mut self, now: DateTime<Utc>) {
        self.state = BufferState::SoftDeleted;
        self.soft_deleted_at = Some(now);
    }

    pub fn restore(&mut self) {
        self.state = BufferState::Active;
        self.soft_deleted_at = None;
    }

    pub fn purge(&mut self) {
        self.state = BufferState::Purged;
    }
}

/// Permission mask for a buffer access URL (spec §4.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferAccessPermissions {
    pub read: bool,
    pub add: bool,
    pub create: bool,
    pub write: bool,
    pub delete: bool,
}

impl BufferAccessPermissions {
    pub fn read_only() -> Self {
        Self {
            read: true,
            add: false,
            create: false,
            write: false,
            delete: false,
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            add: true,
            create: true,
            write: true,
            delete: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_keys_are_case_insensitive() {
        let mut tags = TagSet::new();
        tags.insert("Color", "blue");
        assert_eq!(tags.get("color"), Some("blue"));
        assert_eq!(tags.get("COLOR"), Some("blue"));
    }

    #[test]
    fn filter_matches_subset() {
        let mut tags = TagSet::new();
        tags.insert("bufferName", "in");
        tags.insert("owner", "alice");

        let mut filter = TagSet::new();
        filter.insert("owner", "alice");
        assert!(tags.matches(&filter));

        let mut wrong = TagSet::new();
        wrong.insert("owner", "bob");
        assert!(!tags.matches(&wrong));
    }

    #[test]
    fn lifecycle_is_one_directional() {
        let now = Utc::now();
        let mut buffer = Buffer::new("buf1", "zone-a", now);
        assert_eq!(buffer.state, BufferState::Active);
        buffer.soft_delete(now);
        assert_eq!(buffer.state, BufferState::SoftDeleted);
        buffer.purge();
        assert_eq!(buffer.state, BufferState::Purged);
    }
}
