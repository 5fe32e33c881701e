//! Tag inverted index.
//!
//! Tracks tag → keys and key → tags relations so invalidation fans out
//! without scanning the store. The index has no lock of its own: it is owned
//! by the store and mutated inside the same critical section as the entry
//! mutation it describes, which keeps it a pure function of store contents.

use std::collections::{HashMap, HashSet};

/// Bidirectional tag index.
#[derive(Debug, Default)]
pub struct TagIndex {
    /// Maps tags to all keys carrying them.
    tag_to_keys: HashMap<String, HashSet<String>>,
    /// Maps keys to the tags they carry.
    key_to_tags: HashMap<String, HashSet<String>>,
}

impl TagIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a key's tag memberships.
    ///
    /// Prior memberships are removed first, so re-putting a key with
    /// different tags never leaves the old relation behind.
    pub fn index(&mut self, key: &str, tags: &HashSet<String>) {
        self.deindex(key);

        for tag in tags {
            self.tag_to_keys
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
        if !tags.is_empty() {
            self.key_to_tags.insert(key.to_string(), tags.clone());
        }
    }

    /// Remove all memberships for a key. Called on evict and before re-put.
    pub fn deindex(&mut self, key: &str) {
        if let Some(tags) = self.key_to_tags.remove(key) {
            for tag in tags {
                if let Some(keys) = self.tag_to_keys.get_mut(&tag) {
                    keys.remove(key);
                    if keys.is_empty() {
                        self.tag_to_keys.remove(&tag);
                    }
                }
            }
        }
    }

    /// All keys currently carrying a tag.
    pub fn keys_for_tag(&self, tag: &str) -> HashSet<String> {
        self.tag_to_keys.get(tag).cloned().unwrap_or_default()
    }

    /// All tags a key currently carries.
    pub fn tags_for_key(&self, key: &str) -> HashSet<String> {
        self.key_to_tags.get(key).cloned().unwrap_or_default()
    }

    pub fn clear(&mut self) {
        self.tag_to_keys.clear();
        self.key_to_tags.clear();
    }
}
