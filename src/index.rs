//! The public sorted-subkey index facade.
//!
//! [`SubkeyIndex`] maintains, for each parent key, an externally stored
//! ordering of child records sorted by a caller-chosen key type, supporting
//! pagination from any position in either direction. See the crate docs for
//! the data layout.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::chain::{BlockChain, BlockRoute};
use crate::client::{
    epoch_millis, MapReturn, MapWriteMode, Operation, StoreClient, StoredRecord, WritePolicy,
};
use crate::config::SubkeyIndexConfig;
use crate::error::{SubkeyIndexError, SubkeyIndexResult};
use crate::keys;
use crate::value::{Bin, MapKey, RecordKey, SortKey, Value};

/// Attempts at the first-insert initialization race before giving up.
const INITIALIZE_ATTEMPTS: u32 = 3;

/// Resume point for a paged range scan.
///
/// Opaque to callers: hold it between pages and pass it back to
/// [`SubkeyIndex::continue_range`].
#[derive(Clone, Debug)]
pub struct Continuation<K> {
    parent: RecordKey,
    block_pointer: Option<String>,
    last_key: Option<K>,
    forwards: bool,
}

impl<K> Continuation<K> {
    /// True once a scan has consumed its final block; continuing an at-end
    /// continuation yields an empty page.
    pub fn is_at_end(&self) -> bool {
        self.block_pointer.is_none()
    }

    /// Scan direction this continuation resumes in.
    pub fn forwards(&self) -> bool {
        self.forwards
    }

    /// The last key a page returned, if any.
    pub fn last_key(&self) -> Option<&K> {
        self.last_key.as_ref()
    }
}

/// One page of a range scan: child records in scan order plus the
/// continuation to fetch the next page.
///
/// A record slot is `None` when its entry was live in the index but the
/// record itself was gone by the time of the batch fetch (expired or deleted
/// underneath the index).
#[derive(Clone, Debug)]
pub struct ScanPage<K> {
    /// Child records, in scan order.
    pub records: Vec<Option<StoredRecord>>,
    /// Resume point for the next page.
    pub continuation: Continuation<K>,
}

/// A sorted, paginable secondary ordering over child records of a parent
/// key, stored entirely in the remote store.
///
/// Cheap to clone; clones share the store client and configuration.
///
/// # Concurrency
///
/// Safe for concurrent use from any number of tasks and processes against
/// the same store. Inserts and deletes of a given sort key are linearizable
/// (serialized on the owning block's advisory lock); scans are not isolated
/// from concurrent structural changes.
///
/// # Replication caveat
///
/// Active-active replication of the root map is not supported: concurrent
/// writers against diverged root maps may lose entries.
pub struct SubkeyIndex<K: SortKey> {
    chain: Arc<BlockChain>,
    _sort_key: PhantomData<fn(K)>,
}

impl<K: SortKey> Clone for SubkeyIndex<K> {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            _sort_key: PhantomData,
        }
    }
}

impl<K: SortKey> SubkeyIndex<K> {
    /// Create an index handle over a store client.
    pub fn new(client: Arc<dyn StoreClient>, config: SubkeyIndexConfig) -> Self {
        Self {
            chain: Arc::new(BlockChain::new(client, config)),
            _sort_key: PhantomData,
        }
    }

    /// The index configuration.
    pub fn config(&self) -> &SubkeyIndexConfig {
        &self.chain.config
    }

    /// Insert `sub_key` into the parent's ordering and write `bins` to the
    /// child data record.
    ///
    /// Re-putting an existing key replaces its entry and payload; the
    /// ordering keeps exactly one entry per key.
    pub async fn put(
        &self,
        parent: &RecordKey,
        sub_key: &K,
        policy: Option<&WritePolicy>,
        bins: &[Bin],
    ) -> SubkeyIndexResult<()> {
        self.put_inner(parent, sub_key, policy, None, bins).await
    }

    /// Insert `sub_key` with the ordering entry pointing at an independent
    /// record at `data_key` instead of the derived child record.
    ///
    /// Useful for inverted orderings where the child is an existing record
    /// (e.g. segment membership pointing back at user records).
    pub async fn put_with_data_key(
        &self,
        parent: &RecordKey,
        sub_key: &K,
        policy: Option<&WritePolicy>,
        data_key: &RecordKey,
        bins: &[Bin],
    ) -> SubkeyIndexResult<()> {
        self.put_inner(parent, sub_key, policy, Some(data_key), bins)
            .await
    }

    async fn put_inner(
        &self,
        parent: &RecordKey,
        sub_key: &K,
        policy: Option<&WritePolicy>,
        data_key: Option<&RecordKey>,
        bins: &[Bin],
    ) -> SubkeyIndexResult<()> {
        let chain = &self.chain;
        let map_key = sub_key.to_map_key();
        let derived_key = keys::data_record_key(parent, &map_key)?;

        let mut data_policy = policy.cloned().unwrap_or_default();
        data_policy.send_key = chain.config.send_key;

        let expiry_ms = if data_policy.expiration_secs <= 0 {
            i64::MAX
        } else {
            epoch_millis() + i64::from(data_policy.expiration_secs) * 1000
        };
        let digest = chain
            .client
            .digest(data_key.unwrap_or(&derived_key));
        let entry = Value::List(vec![Value::Int(expiry_ms), Value::Bytes(digest)]);

        let mut attempts = 0;
        let block_id = loop {
            match chain.route_block(parent, &map_key).await? {
                BlockRoute::Block(id) => break id,
                BlockRoute::Uninitialized => {
                    match chain
                        .initialize_blocks(parent, &map_key, entry.clone())
                        .await
                    {
                        Ok(()) => {
                            if !bins.is_empty() {
                                chain.client.put(&data_policy, &derived_key, bins).await?;
                            }
                            return Ok(());
                        }
                        // Another writer initialized concurrently; re-route.
                        Err(e) if e.is_key_exists() => {
                            attempts += 1;
                            if attempts >= INITIALIZE_ATTEMPTS {
                                return Err(e);
                            }
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        };

        // Under the block's lock, atomically: read the size, upsert the
        // entry, and read back its rank. The three results classify the
        // write: pure update, new minimum, or plain insert.
        let block_key = keys::block_key(parent, block_id)?;
        let block_policy = chain.write_policy();
        let results = chain
            .locks
            .perform_under_lock(
                &block_policy,
                &block_key,
                vec![
                    Operation::MapSize {
                        bin: chain.config.block_map_bin.clone(),
                    },
                    Operation::MapPut {
                        bin: chain.config.block_map_bin.clone(),
                        key: map_key.clone(),
                        value: entry,
                        mode: MapWriteMode::Upsert,
                    },
                    Operation::MapGetByKey {
                        bin: chain.config.block_map_bin.clone(),
                        key: map_key.clone(),
                        ret: MapReturn::Index,
                    },
                ],
            )
            .await?;

        let original_count = results[0].as_count()?;
        let updated_count = results[1].as_count()?;
        let inserted_index = results[2].as_index()?;

        if updated_count != original_count {
            if inserted_index == 0 && original_count > 0 {
                // The block gained a new minimum; repoint its root entry.
                chain.update_root_min(parent, &map_key, block_id).await?;
            }
            if updated_count > chain.config.max_elements_per_block {
                chain.split_block(parent, block_id).await?;
            }
        }

        if !bins.is_empty() {
            chain.client.put(&data_policy, &derived_key, bins).await?;
        }
        Ok(())
    }

    /// Remove `sub_key` from the parent's ordering and delete its child data
    /// record. Returns `false` if the key was not present.
    pub async fn delete(
        &self,
        parent: &RecordKey,
        sub_key: &K,
        policy: Option<&WritePolicy>,
    ) -> SubkeyIndexResult<bool> {
        let chain = &self.chain;
        let map_key = sub_key.to_map_key();
        let block_id = match chain.route_block(parent, &map_key).await? {
            BlockRoute::Uninitialized => return Ok(false),
            BlockRoute::Block(id) => id,
        };

        // Removing the entry must atomically report whether it was the
        // block's minimum and what the new minimum is — even when it was the
        // last entry. A transient infinity sentinel keeps the map non-empty
        // for the duration of the multi-op so the post-remove minimum read
        // always has something to return.
        let block_key = keys::block_key(parent, block_id)?;
        let mut delete_policy = policy.cloned().unwrap_or_default();
        delete_policy.send_key = chain.config.send_key;
        let results = chain
            .locks
            .perform_under_lock(
                &chain.write_policy(),
                &block_key,
                vec![
                    Operation::MapPut {
                        bin: chain.config.block_map_bin.clone(),
                        key: MapKey::Infinity,
                        value: Value::Infinity,
                        mode: MapWriteMode::Upsert,
                    },
                    Operation::MapRemoveByKey {
                        bin: chain.config.block_map_bin.clone(),
                        key: map_key.clone(),
                        ret: MapReturn::Index,
                    },
                    Operation::MapGetByIndex {
                        bin: chain.config.block_map_bin.clone(),
                        index: 0,
                        ret: MapReturn::Key,
                    },
                    Operation::MapRemoveByKey {
                        bin: chain.config.block_map_bin.clone(),
                        key: MapKey::Infinity,
                        ret: MapReturn::None,
                    },
                ],
            )
            .await?;

        let removed_index = results[1].as_index()?;
        let post_minimum = results[2].as_key()?.cloned();

        if removed_index == -1 {
            return Ok(false);
        }
        match post_minimum {
            Some(MapKey::Infinity) | None => {
                // Only the sentinel remained: the block is now empty.
                chain.remove_empty_block(parent, block_id).await?;
            }
            Some(new_min) if removed_index == 0 => {
                chain.update_root_min(parent, &new_min, block_id).await?;
            }
            Some(_) => {}
        }

        let derived_key = keys::data_record_key(parent, &map_key)?;
        chain.client.delete(&delete_policy, &derived_key).await
    }

    /// Read the child data record for `sub_key`. Returns `None` if absent.
    pub async fn get(
        &self,
        parent: &RecordKey,
        sub_key: &K,
    ) -> SubkeyIndexResult<Option<StoredRecord>> {
        let derived_key = keys::data_record_key(parent, &sub_key.to_map_key())?;
        self.chain.client.get(&derived_key, None).await
    }

    /// Read up to `max` child records in sorted order.
    ///
    /// Starts at `first_key` (`None` means the relevant end of the chain),
    /// including or excluding an exact match per `include_first`, ascending
    /// when `forwards` else descending. Entries whose expiry has passed are
    /// skipped.
    pub async fn get_range(
        &self,
        parent: &RecordKey,
        first_key: Option<&K>,
        include_first: bool,
        forwards: bool,
        max: usize,
    ) -> SubkeyIndexResult<ScanPage<K>> {
        if max == 0 {
            return Err(SubkeyIndexError::invalid_argument(
                "the maximum number of records must be positive",
            ));
        }
        let first_map_key = first_key.map(SortKey::to_map_key);
        let page = self
            .chain
            .collect_digests(
                parent,
                first_map_key.as_ref(),
                include_first,
                forwards,
                max,
                epoch_millis(),
            )
            .await?;

        let record_keys: Vec<RecordKey> = page
            .digests
            .iter()
            .map(|digest| keys::data_key_from_digest(parent, digest.clone()))
            .collect();
        let records = if record_keys.is_empty() {
            Vec::new()
        } else {
            self.chain.client.batch_get(&record_keys).await?
        };

        let last_key = match &page.last_key {
            Some(map_key) => Some(K::from_map_key(map_key).ok_or_else(|| {
                SubkeyIndexError::internal("scan returned a key of a foreign type")
            })?),
            None => first_key.cloned(),
        };
        Ok(ScanPage {
            records,
            continuation: Continuation {
                parent: parent.clone(),
                block_pointer: page.block_pointer,
                last_key,
                forwards,
            },
        })
    }

    /// Fetch the next page of a scan started by [`Self::get_range`].
    pub async fn continue_range(
        &self,
        continuation: &Continuation<K>,
        max: usize,
    ) -> SubkeyIndexResult<ScanPage<K>> {
        if continuation.is_at_end() {
            return Ok(ScanPage {
                records: Vec::new(),
                continuation: continuation.clone(),
            });
        }
        self.get_range(
            &continuation.parent,
            continuation.last_key.as_ref(),
            false,
            continuation.forwards,
            max,
        )
        .await
    }

    /// Regenerate the parent's root map from the chain and repair back
    /// pointers. Administrative: assumes no concurrent writers.
    pub async fn rebuild_root(&self, parent: &RecordKey) -> SubkeyIndexResult<()> {
        self.chain.rebuild_root(parent).await
    }
}
