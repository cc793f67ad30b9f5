//! Tag Index Module
//!
//! Derived index from tag to the keys carrying it, used for bulk invalidation.

use std::collections::{HashMap, HashSet};

// == Tag Index ==
/// Maps each tag to the set of keys whose live entry carries it.
///
/// The index never owns entries. Buckets are dropped as soon as their last
/// key is removed, so `len()` is the number of tags in use.
#[derive(Debug, Default)]
pub struct TagIndex {
    by_tag: HashMap<String, HashSet<String>>,
}

impl TagIndex {
    // == Constructor ==
    /// Creates a new empty tag index.
    pub fn new() -> Self {
        Self {
            by_tag: HashMap::new(),
        }
    }

    // == Add ==
    /// Registers `key` under every tag in `tags`.
    pub fn add<'a, I>(&mut self, key: &str, tags: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for tag in tags {
            self.by_tag
                .entry(tag.clone())
                .or_default()
                .insert(key.to_string());
        }
    }

    // == Remove ==
    /// Removes `key` from every tag in `tags`, dropping emptied buckets.
    pub fn remove<'a, I>(&mut self, key: &str, tags: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for tag in tags {
            if let Some(keys) = self.by_tag.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.by_tag.remove(tag);
                }
            }
        }
    }

    // == Keys For Any ==
    /// Returns every key carrying at least one of `tags`.
    pub fn keys_for_any<S: AsRef<str>>(&self, tags: &[S]) -> HashSet<String> {
        tags.iter()
            .filter_map(|tag| self.by_tag.get(tag.as_ref()))
            .flat_map(|keys| keys.iter().cloned())
            .collect()
    }

    // == Contains ==
    /// Checks if `key` is indexed under `tag`.
    pub fn contains(&self, tag: &str, key: &str) -> bool {
        self.by_tag.get(tag).is_some_and(|keys| keys.contains(key))
    }

    /// Returns true if `tag` has a bucket.
    pub fn has_tag(&self, tag: &str) -> bool {
        self.by_tag.contains_key(tag)
    }

    /// Number of tags currently in use.
    pub fn len(&self) -> usize {
        self.by_tag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_tag.clear();
    }
}
