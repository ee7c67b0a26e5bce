//! Store client trait for abstracting the key-value store.
//!
//! This module defines the [`StoreClient`] trait which abstracts the remote
//! store's record operations for testability and flexibility in choosing a
//! client implementation, together with the operation and policy model the
//! index issues against it.
//!
//! The index relies on exactly three store capabilities:
//!
//! 1. **Atomic multi-op** — [`StoreClient::operate`] applies a list of
//!    operations to one record all-or-nothing and returns one result per
//!    operation. Every structural mutation of a block, including taking and
//!    releasing its advisory lock, is a single `operate` call.
//! 2. **Key-ordered map bins** — map entries are kept sorted by key, with
//!    rank-addressed reads ([`Operation::MapGetByIndex`],
//!    [`Operation::MapGetByKeyRelativeIndexRange`]) and guarded writes
//!    ([`MapWriteMode::CreateOnly`]).
//! 3. **Digests** — content-independent record identifiers, so child records
//!    can be batch-fetched without their primary keys.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;

use crate::error::{SubkeyIndexError, SubkeyIndexResult};
use crate::value::{compute_digest, Bin, Digest, KeyIdent, MapKey, RecordKey, Value};

/// Record-level existence policy for a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RecordExistsAction {
    /// Create or update the record.
    #[default]
    Update,
    /// Fail with `KeyExists` if the record is already present.
    CreateOnly,
    /// Fail with `KeyNotFound` if the record is absent.
    UpdateOnly,
}

/// Write policy applied to a store operation.
#[derive(Clone, Debug, PartialEq)]
pub struct WritePolicy {
    /// Record existence requirement.
    pub exists: RecordExistsAction,
    /// Record TTL in seconds; `<= 0` means no expiry.
    pub expiration_secs: i32,
    /// Persist the user key alongside the record.
    pub send_key: bool,
    /// When set, the write only applies if the record generation matches.
    pub generation: Option<u32>,
    /// Bounded retry attempts for contended multi-ops.
    pub max_retries: u32,
    /// Sleep between retry attempts.
    pub sleep_between_retries_ms: u64,
    /// Overall deadline across retries; `0` means none.
    pub total_timeout_ms: u64,
}

impl Default for WritePolicy {
    fn default() -> Self {
        Self {
            exists: RecordExistsAction::Update,
            expiration_secs: 0,
            send_key: false,
            generation: None,
            max_retries: 3,
            sleep_between_retries_ms: 5,
            total_timeout_ms: 0,
        }
    }
}

impl WritePolicy {
    /// Policy that fails if the record already exists.
    pub fn create_only() -> Self {
        Self {
            exists: RecordExistsAction::CreateOnly,
            ..Self::default()
        }
    }

    /// Policy that fails if the record is absent.
    pub fn update_only() -> Self {
        Self {
            exists: RecordExistsAction::UpdateOnly,
            ..Self::default()
        }
    }

    /// Set the record TTL in seconds.
    pub fn with_expiration(mut self, secs: i32) -> Self {
        self.expiration_secs = secs;
        self
    }

    /// Require the record generation to equal `generation`.
    pub fn with_generation(mut self, generation: u32) -> Self {
        self.generation = Some(generation);
        self
    }
}

/// Entry-level write mode for a single map-put.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum MapWriteMode {
    /// Insert or overwrite the entry.
    #[default]
    Upsert,
    /// Fail with `ElementExists` if the map already holds the key.
    CreateOnly,
}

/// What a map read/remove operation returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapReturn {
    /// No result payload.
    None,
    /// The entry key.
    Key,
    /// The entry value.
    Value,
    /// Key-value entry pairs.
    KeyValue,
    /// The entry's rank in key order (`-1` when absent).
    Index,
    /// A count of affected entries.
    Count,
}

/// A single operation inside an atomic multi-op.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    /// Read a bin.
    Get {
        /// Bin name.
        bin: String,
    },
    /// Write a bin.
    Put {
        /// Bin name.
        bin: String,
        /// New value.
        value: Value,
    },
    /// Atomically add to an integer bin, creating it at zero if absent.
    Add {
        /// Bin name.
        bin: String,
        /// Signed delta.
        delta: i64,
    },
    /// Put one entry into a key-ordered map bin. Returns the map size.
    MapPut {
        /// Bin name.
        bin: String,
        /// Entry key.
        key: MapKey,
        /// Entry value.
        value: Value,
        /// Entry-level write mode.
        mode: MapWriteMode,
    },
    /// Put many entries into a key-ordered map bin. Returns the map size.
    MapPutItems {
        /// Bin name.
        bin: String,
        /// Entries to insert or overwrite.
        items: Vec<(MapKey, Value)>,
    },
    /// Number of entries in the map.
    MapSize {
        /// Bin name.
        bin: String,
    },
    /// Remove every entry from the map.
    MapClear {
        /// Bin name.
        bin: String,
    },
    /// Look up one entry by key.
    MapGetByKey {
        /// Bin name.
        bin: String,
        /// Entry key.
        key: MapKey,
        /// Result shape.
        ret: MapReturn,
    },
    /// Look up one entry by rank; negative ranks count from the end.
    MapGetByIndex {
        /// Bin name.
        bin: String,
        /// Rank in key order.
        index: i64,
        /// Result shape.
        ret: MapReturn,
    },
    /// Read `count` entries starting at a rank; negative ranks count from
    /// the end.
    MapGetByIndexRange {
        /// Bin name.
        bin: String,
        /// Starting rank.
        index: i64,
        /// Number of entries.
        count: u64,
        /// Result shape.
        ret: MapReturn,
    },
    /// Read `count` entries from the window `[rank(key)+offset,
    /// rank(key)+offset+count)`, where `rank(key)` is the number of map keys
    /// strictly less than `key`. Out-of-bounds parts of the window yield
    /// nothing.
    MapGetByKeyRelativeIndexRange {
        /// Bin name.
        bin: String,
        /// Anchor key.
        key: MapKey,
        /// Window offset relative to the anchor's rank.
        offset: i64,
        /// Window size.
        count: u64,
        /// Result shape.
        ret: MapReturn,
    },
    /// Remove one entry by key.
    MapRemoveByKey {
        /// Bin name.
        bin: String,
        /// Entry key.
        key: MapKey,
        /// Result shape (`Index` reports the removed entry's rank, `-1` if
        /// it was absent).
        ret: MapReturn,
    },
    /// Remove every entry whose value equals `value`.
    MapRemoveByValue {
        /// Bin name.
        bin: String,
        /// Value to match.
        value: Value,
    },
    /// Remove every entry whose value falls in `[begin, end)`.
    MapRemoveByValueRange {
        /// Bin name.
        bin: String,
        /// Inclusive lower bound.
        begin: Value,
        /// Exclusive upper bound.
        end: Value,
        /// Result shape.
        ret: MapReturn,
    },
}

impl Operation {
    /// True if this operation mutates the record.
    pub fn is_write(&self) -> bool {
        !matches!(
            self,
            Operation::Get { .. }
                | Operation::MapSize { .. }
                | Operation::MapGetByKey { .. }
                | Operation::MapGetByIndex { .. }
                | Operation::MapGetByIndexRange { .. }
                | Operation::MapGetByKeyRelativeIndexRange { .. }
        )
    }
}

/// Result of one operation inside a multi-op.
#[derive(Clone, Debug, PartialEq)]
pub enum OpResult {
    /// Nothing to report (writes, `MapReturn::None`, missing singletons).
    None,
    /// Entry count or map size.
    Count(u64),
    /// Rank in key order; `-1` means "not present".
    Index(i64),
    /// A single entry key.
    Key(MapKey),
    /// A single value.
    Value(Value),
    /// Key-value entry pairs, in map key order.
    Entries(Vec<(MapKey, Value)>),
    /// A bin read; `None` when the bin is absent.
    Bin(Option<Value>),
}

impl OpResult {
    /// Interpret as a count.
    pub fn as_count(&self) -> SubkeyIndexResult<u64> {
        match self {
            OpResult::Count(c) => Ok(*c),
            other => Err(SubkeyIndexError::internal(format!(
                "expected count result, got {:?}",
                other
            ))),
        }
    }

    /// Interpret as a rank.
    ///
    /// Some store versions return single-element lists where a bare rank is
    /// expected; both shapes are accepted.
    pub fn as_index(&self) -> SubkeyIndexResult<i64> {
        match self {
            OpResult::Index(i) => Ok(*i),
            OpResult::Value(Value::Int(i)) => Ok(*i),
            OpResult::Value(Value::List(items)) if items.len() == 1 => items[0]
                .as_int()
                .ok_or_else(|| SubkeyIndexError::internal("non-integer rank in list result")),
            other => Err(SubkeyIndexError::internal(format!(
                "expected rank result, got {:?}",
                other
            ))),
        }
    }

    /// Interpret as an optional entry key.
    pub fn as_key(&self) -> SubkeyIndexResult<Option<&MapKey>> {
        match self {
            OpResult::Key(k) => Ok(Some(k)),
            OpResult::None => Ok(None),
            other => Err(SubkeyIndexError::internal(format!(
                "expected key result, got {:?}",
                other
            ))),
        }
    }

    /// Interpret as an optional single value.
    pub fn as_value(&self) -> SubkeyIndexResult<Option<&Value>> {
        match self {
            OpResult::Value(v) => Ok(Some(v)),
            OpResult::None => Ok(None),
            other => Err(SubkeyIndexError::internal(format!(
                "expected value result, got {:?}",
                other
            ))),
        }
    }

    /// Interpret as entry pairs.
    pub fn as_entries(&self) -> SubkeyIndexResult<&[(MapKey, Value)]> {
        match self {
            OpResult::Entries(e) => Ok(e),
            other => Err(SubkeyIndexError::internal(format!(
                "expected entries result, got {:?}",
                other
            ))),
        }
    }

    /// Interpret as a string bin read, defaulting absent bins to `""`.
    pub fn as_bin_str(&self) -> SubkeyIndexResult<&str> {
        match self {
            OpResult::Bin(Some(Value::Str(s))) => Ok(s),
            OpResult::Bin(None) => Ok(""),
            other => Err(SubkeyIndexError::internal(format!(
                "expected string bin result, got {:?}",
                other
            ))),
        }
    }

    /// Interpret as an integer bin read.
    pub fn as_bin_int(&self) -> SubkeyIndexResult<i64> {
        match self {
            OpResult::Bin(Some(Value::Int(i))) => Ok(*i),
            other => Err(SubkeyIndexError::internal(format!(
                "expected integer bin result, got {:?}",
                other
            ))),
        }
    }

    /// Interpret as an optional bin value.
    pub fn as_bin(&self) -> SubkeyIndexResult<Option<&Value>> {
        match self {
            OpResult::Bin(v) => Ok(v.as_ref()),
            other => Err(SubkeyIndexError::internal(format!(
                "expected bin result, got {:?}",
                other
            ))),
        }
    }
}

/// Outcome of an atomic multi-op: the record's post-op generation plus one
/// result per operation, in operation order.
#[derive(Clone, Debug)]
pub struct OpOutput {
    /// Record generation after the operation.
    pub generation: u32,
    /// One result per submitted operation.
    pub results: Vec<OpResult>,
}

/// A record snapshot returned by reads.
#[derive(Clone, Debug, Default)]
pub struct StoredRecord {
    /// Record generation at read time.
    pub generation: u32,
    /// Bin values; map bins surface as [`Value::Map`].
    pub bins: HashMap<String, Value>,
}

impl StoredRecord {
    /// String bin accessor, defaulting absent bins to `""`.
    pub fn string_bin(&self, name: &str) -> &str {
        self.bins.get(name).and_then(Value::as_str).unwrap_or("")
    }

    /// Integer bin accessor.
    pub fn int_bin(&self, name: &str) -> Option<i64> {
        self.bins.get(name).and_then(Value::as_int)
    }

    /// Map bin accessor.
    pub fn map_bin(&self, name: &str) -> Option<&[(MapKey, Value)]> {
        self.bins.get(name).and_then(Value::as_map)
    }
}

/// Abstraction over the key-value store.
///
/// This trait allows different client implementations:
/// - Production: a real distributed-store client
/// - Testing: [`MockStoreClient`](crate::mock_client::MockStoreClient)
///
/// # Atomicity
///
/// `operate` must apply its operation list atomically: all operations apply
/// and one result per operation is returned, or none apply and an error is
/// returned. The lock protocol and every structural block mutation depend on
/// this.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Apply `ops` to the record at `key` atomically.
    ///
    /// # Errors
    ///
    /// - `KeyNotFound` when the record is absent and the policy (or a
    ///   read-only op list) requires it to exist
    /// - `KeyExists` for a create-only policy on an existing record
    /// - `ElementExists` for a create-only map-put on an existing entry
    /// - `GenerationMismatch` when the policy's generation check fails
    async fn operate(
        &self,
        policy: &WritePolicy,
        key: &RecordKey,
        ops: &[Operation],
    ) -> SubkeyIndexResult<OpOutput>;

    /// Read a record, optionally restricted to named bins. Returns `None` if
    /// the record does not exist.
    async fn get(
        &self,
        key: &RecordKey,
        bins: Option<&[&str]>,
    ) -> SubkeyIndexResult<Option<StoredRecord>>;

    /// Write bins to a record under the given policy.
    async fn put(
        &self,
        policy: &WritePolicy,
        key: &RecordKey,
        bins: &[Bin],
    ) -> SubkeyIndexResult<()>;

    /// Delete a record. Returns `true` if it existed.
    async fn delete(&self, policy: &WritePolicy, key: &RecordKey) -> SubkeyIndexResult<bool>;

    /// Fetch many records in one round trip, preserving input order.
    /// Missing records come back as `None`.
    async fn batch_get(&self, keys: &[RecordKey]) -> SubkeyIndexResult<Vec<Option<StoredRecord>>>;

    /// Deterministic digest for a record key.
    fn digest(&self, key: &RecordKey) -> Digest {
        match &key.ident {
            KeyIdent::Digest(d) => d.clone(),
            KeyIdent::User(u) => compute_digest(&key.set_name, u),
        }
    }
}

/// Milliseconds since the Unix epoch.
pub fn epoch_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
