//! Configuration for the sorted-subkey index.
//!
//! This module defines where the index keeps its satellite records (root map,
//! block chain), the block split threshold, and the lock lease parameters.

use more_asserts as ma;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::keys;
use crate::value::RecordKey;

/// Default split threshold: entries per block before it divides in two.
///
/// Block maps must stay under the store's per-record size ceiling; the
/// threshold should be large enough that splits are rare and small enough
/// that a full block plus one transient extra entry still fits.
pub const DEFAULT_MAX_ELEMENTS_PER_BLOCK: u64 = 10_000;

/// Default advisory-lock lease in milliseconds.
///
/// A crashed holder stalls its record for at most this long. Operators must
/// keep it above the worst-case duration of a single lock-scoped operation.
pub const DEFAULT_MAX_LOCK_TIME_MS: u64 = 100;

/// Default poll interval while waiting on a held lock.
pub const DEFAULT_LOCK_RETRY_MS: u64 = 1;

/// Configuration for index layout and locking.
///
/// # Example
///
/// ```rust,ignore
/// let config = SubkeyIndexConfig::builder()
///     .root_map_namespace("meta".to_string())   // memory-resident namespace
///     .root_map_set("rootMap".to_string())
///     .max_elements_per_block(15)
///     .send_key(true)
///     .build();
/// ```
#[derive(Clone, Debug, PartialEq, TypedBuilder, Serialize, Deserialize)]
pub struct SubkeyIndexConfig {
    /// Namespace for the root map record; empty means "same namespace as the
    /// parent key". The root map is rebuildable, so a memory-resident
    /// namespace is a reasonable home for it.
    #[builder(default)]
    #[serde(default)]
    pub root_map_namespace: String,

    /// Set for the root map record; empty means the parent's set plus the
    /// meta suffix.
    #[builder(default)]
    #[serde(default)]
    pub root_map_set: String,

    /// Bin holding the root map.
    #[builder(default = SubkeyIndexConfig::default_map_bin())]
    #[serde(default = "SubkeyIndexConfig::default_map_bin")]
    pub root_map_bin: String,

    /// Bin holding each block's key-ordered entry map.
    #[builder(default = SubkeyIndexConfig::default_map_bin())]
    #[serde(default = "SubkeyIndexConfig::default_map_bin")]
    pub block_map_bin: String,

    /// Bin holding each block's forward pointer (empty string = none).
    #[builder(default = SubkeyIndexConfig::default_next_bin())]
    #[serde(default = "SubkeyIndexConfig::default_next_bin")]
    pub block_next_bin: String,

    /// Bin holding each block's backward pointer (empty string = none).
    #[builder(default = SubkeyIndexConfig::default_prev_bin())]
    #[serde(default = "SubkeyIndexConfig::default_prev_bin")]
    pub block_prev_bin: String,

    /// Entries per block before it splits.
    #[builder(default = DEFAULT_MAX_ELEMENTS_PER_BLOCK)]
    #[serde(default = "SubkeyIndexConfig::default_max_elements_per_block")]
    pub max_elements_per_block: u64,

    /// Persist user keys alongside records the index writes.
    #[builder(default)]
    #[serde(default)]
    pub send_key: bool,

    /// Advisory-lock lease in milliseconds.
    #[builder(default = DEFAULT_MAX_LOCK_TIME_MS)]
    #[serde(default = "SubkeyIndexConfig::default_max_lock_time_ms")]
    pub max_lock_time_ms: u64,

    /// Poll interval while waiting on a held lock, in milliseconds.
    #[builder(default = DEFAULT_LOCK_RETRY_MS)]
    #[serde(default = "SubkeyIndexConfig::default_lock_retry_ms")]
    pub lock_retry_ms: u64,
}

impl SubkeyIndexConfig {
    /// Default bin name for the root and block maps.
    pub fn default_map_bin() -> String {
        "map".to_string()
    }

    /// Default bin name for forward pointers.
    pub fn default_next_bin() -> String {
        "next".to_string()
    }

    /// Default bin name for backward pointers.
    pub fn default_prev_bin() -> String {
        "prev".to_string()
    }

    /// Default split threshold for serde deserialization.
    pub fn default_max_elements_per_block() -> u64 {
        DEFAULT_MAX_ELEMENTS_PER_BLOCK
    }

    /// Default lock lease for serde deserialization.
    pub fn default_max_lock_time_ms() -> u64 {
        DEFAULT_MAX_LOCK_TIME_MS
    }

    /// Default lock poll interval for serde deserialization.
    pub fn default_lock_retry_ms() -> u64 {
        DEFAULT_LOCK_RETRY_MS
    }

    /// Namespace the root map record lives in for the given parent.
    pub fn root_namespace_for<'a>(&'a self, parent: &'a RecordKey) -> &'a str {
        if self.root_map_namespace.is_empty() {
            &parent.namespace
        } else {
            &self.root_map_namespace
        }
    }

    /// Set the root map record lives in for the given parent.
    pub fn root_set_for(&self, parent: &RecordKey) -> String {
        if self.root_map_set.is_empty() {
            format!("{}{}", parent.set_name, keys::META_SET_SUFFIX)
        } else {
            self.root_map_set.clone()
        }
    }

    /// Validate that configuration values are usable.
    ///
    /// # Panics
    ///
    /// Panics if the split threshold is zero or a lock interval is zero.
    pub fn validate(&self) {
        ma::assert_ge!(self.max_elements_per_block, 1);
        ma::assert_ge!(self.max_lock_time_ms, 1);
        ma::assert_ge!(self.lock_retry_ms, 1);
    }
}

impl Default for SubkeyIndexConfig {
    fn default() -> Self {
        Self {
            root_map_namespace: String::new(),
            root_map_set: String::new(),
            root_map_bin: Self::default_map_bin(),
            block_map_bin: Self::default_map_bin(),
            block_next_bin: Self::default_next_bin(),
            block_prev_bin: Self::default_prev_bin(),
            max_elements_per_block: DEFAULT_MAX_ELEMENTS_PER_BLOCK,
            send_key: false,
            max_lock_time_ms: DEFAULT_MAX_LOCK_TIME_MS,
            lock_retry_ms: DEFAULT_LOCK_RETRY_MS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SubkeyIndexConfig::default();
        assert_eq!(config.root_map_bin, "map");
        assert_eq!(config.block_next_bin, "next");
        assert_eq!(config.max_elements_per_block, 10_000);
        config.validate();
    }

    #[test]
    fn test_root_location_falls_back_to_parent() {
        let config = SubkeyIndexConfig::default();
        let parent = RecordKey::new("test", "users", "Tim");
        assert_eq!(config.root_namespace_for(&parent), "test");
        assert_eq!(config.root_set_for(&parent), "users-meta");

        let config = SubkeyIndexConfig::builder()
            .root_map_namespace("meta".to_string())
            .root_map_set("rootMap".to_string())
            .build();
        assert_eq!(config.root_namespace_for(&parent), "meta");
        assert_eq!(config.root_set_for(&parent), "rootMap");
    }
}
