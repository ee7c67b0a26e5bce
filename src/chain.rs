//! Block-chain engine: routing, initialization, split and unlink.
//!
//! The ordering for one parent key is a doubly-linked chain of block records,
//! each holding a key-ordered map of `sort key -> [expiry_ms, digest]`, with
//! adjacent blocks strictly ordered (every key in a block is greater than
//! every key in its predecessor). A root map record summarizes the chain as
//! `min key in block -> block id` for routing.
//!
//! Structural mutation of a block is serialized by that block's advisory
//! lock. Root-map maintenance deliberately takes no lock: every change is an
//! idempotent `remove-by-value` + `put` pair, and a lost race degrades
//! routing by at most one block, which traversal absorbs and a rebuild
//! repairs.

use std::sync::Arc;

use tracing::debug;

use crate::client::{
    MapReturn, MapWriteMode, Operation, StoreClient, StoredRecord, WritePolicy,
};
use crate::config::SubkeyIndexConfig;
use crate::error::{SubkeyIndexError, SubkeyIndexResult};
use crate::keys;
use crate::lock::{LockManager, LockOwner};
use crate::value::{Bin, MapKey, RecordKey, Value};

/// Bin carrying a block's advisory lock entry while locked.
pub(crate) const LOCK_BIN: &str = "lck";

/// Where routing decided a sort key belongs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum BlockRoute {
    /// No root map exists yet; the caller must initialize the chain.
    Uninitialized,
    /// The block that owns (or would own) the key.
    Block(u64),
}

/// Shared engine behind the public facade: store client, layout
/// configuration and the lock manager.
pub(crate) struct BlockChain {
    pub(crate) client: Arc<dyn StoreClient>,
    pub(crate) config: SubkeyIndexConfig,
    pub(crate) locks: LockManager,
}

impl BlockChain {
    pub(crate) fn new(client: Arc<dyn StoreClient>, config: SubkeyIndexConfig) -> Self {
        config.validate();
        let locks = LockManager::new(
            client.clone(),
            LOCK_BIN,
            config.max_lock_time_ms,
            config.lock_retry_ms,
        );
        Self {
            client,
            config,
            locks,
        }
    }

    /// Write policy for records the index owns.
    pub(crate) fn write_policy(&self) -> WritePolicy {
        WritePolicy {
            send_key: self.config.send_key,
            ..WritePolicy::default()
        }
    }

    fn root_key(&self, parent: &RecordKey) -> RecordKey {
        keys::root_key(&self.config, self.client.as_ref(), parent)
    }

    /// Decide which block holds (or would hold) `key`.
    ///
    /// One atomic root-map read pairs an exact lookup with a floor lookup
    /// (the entry immediately at-or-below `key`). A key below every block
    /// minimum routes to the head, which acts as the chain's left sentinel.
    pub(crate) async fn route_block(
        &self,
        parent: &RecordKey,
        key: &MapKey,
    ) -> SubkeyIndexResult<BlockRoute> {
        let root = self.root_key(parent);
        let ops = [
            Operation::MapGetByKey {
                bin: self.config.root_map_bin.clone(),
                key: key.clone(),
                ret: MapReturn::KeyValue,
            },
            Operation::MapGetByKeyRelativeIndexRange {
                bin: self.config.root_map_bin.clone(),
                key: key.clone(),
                offset: -1,
                count: 1,
                ret: MapReturn::KeyValue,
            },
        ];
        let out = match self.client.operate(&WritePolicy::default(), &root, &ops).await {
            Ok(out) => out,
            Err(e) if e.is_key_not_found() => return Ok(BlockRoute::Uninitialized),
            Err(e) => return Err(e),
        };

        if let Some((_, value)) = out.results[0].as_entries()?.first() {
            return Ok(BlockRoute::Block(block_id_value(value)?));
        }
        if let Some((floor_key, value)) = out.results[1].as_entries()?.first() {
            if floor_key <= key {
                return Ok(BlockRoute::Block(block_id_value(value)?));
            }
        }
        Ok(BlockRoute::Block(keys::HEAD_BLOCK_ID))
    }

    /// First insert for a parent: create the head block holding the single
    /// entry, then publish it in the root map.
    ///
    /// The head is created `CREATE_ONLY`; a concurrent first insert loses
    /// with `KeyExists` and the caller re-routes.
    pub(crate) async fn initialize_blocks(
        &self,
        parent: &RecordKey,
        key: &MapKey,
        entry: Value,
    ) -> SubkeyIndexResult<()> {
        let head = keys::block_key(parent, keys::HEAD_BLOCK_ID)?;
        let mut policy = WritePolicy::create_only();
        policy.send_key = self.config.send_key;
        self.client
            .operate(
                &policy,
                &head,
                &[
                    Operation::MapPut {
                        bin: self.config.block_map_bin.clone(),
                        key: key.clone(),
                        value: entry,
                        mode: MapWriteMode::Upsert,
                    },
                    Operation::Put {
                        bin: self.config.block_next_bin.clone(),
                        value: Value::Str(keys::NO_BLOCK.to_string()),
                    },
                    Operation::Put {
                        bin: self.config.block_prev_bin.clone(),
                        value: Value::Str(keys::NO_BLOCK.to_string()),
                    },
                ],
            )
            .await?;

        let root = self.root_key(parent);
        self.client
            .operate(
                &self.write_policy(),
                &root,
                &[Operation::MapPut {
                    bin: self.config.root_map_bin.clone(),
                    key: key.clone(),
                    value: Value::Int(keys::HEAD_BLOCK_ID as i64),
                    mode: MapWriteMode::Upsert,
                }],
            )
            .await?;
        Ok(())
    }

    /// Replace a block's root-map entry with a new minimum key.
    ///
    /// Idempotent: `remove-by-value(id)` then `put(new_min -> id)` can be
    /// re-executed safely, so no lock is needed.
    pub(crate) async fn update_root_min(
        &self,
        parent: &RecordKey,
        new_min: &MapKey,
        block_id: u64,
    ) -> SubkeyIndexResult<()> {
        let root = self.root_key(parent);
        self.client
            .operate(
                &WritePolicy::default(),
                &root,
                &[
                    Operation::MapRemoveByValue {
                        bin: self.config.root_map_bin.clone(),
                        value: Value::Int(block_id as i64),
                    },
                    Operation::MapPut {
                        bin: self.config.root_map_bin.clone(),
                        key: new_min.clone(),
                        value: Value::Int(block_id as i64),
                        mode: MapWriteMode::Upsert,
                    },
                ],
            )
            .await?;
        Ok(())
    }

    /// Allocate the next block id for this parent via an atomic add on the
    /// parent's counter record.
    pub(crate) async fn allocate_block_id(&self, parent: &RecordKey) -> SubkeyIndexResult<u64> {
        let counter = keys::counter_key(self.client.as_ref(), parent);
        let out = self
            .client
            .operate(
                &self.write_policy(),
                &counter,
                &[
                    Operation::Add {
                        bin: "id".to_string(),
                        delta: 1,
                    },
                    Operation::Get {
                        bin: "id".to_string(),
                    },
                ],
            )
            .await?;
        Ok(out.results[1].as_bin_int()? as u64)
    }

    /// Split an over-full block into two.
    ///
    /// Write order is chosen for crash safety: (a) create the second block
    /// off-chain, (b) publish it in the root map, (c) shrink the original
    /// under its held lock, (d) patch the successor's back pointer. At every
    /// intermediate crash point the chain stays routable; an orphaned second
    /// block from a crash between (a) and (b) is unreachable and a rebuild
    /// clears it from consideration.
    pub(crate) async fn split_block(&self, parent: &RecordKey, block_id: u64) -> SubkeyIndexResult<()> {
        let block_key = keys::block_key(parent, block_id)?;
        let owner = self.locks.new_owner();
        let bins = [
            self.config.block_map_bin.as_str(),
            self.config.block_next_bin.as_str(),
            self.config.block_prev_bin.as_str(),
        ];
        let Some(snapshot) = self
            .locks
            .acquire(&owner, &block_key, self.config.max_lock_time_ms, &bins)
            .await?
        else {
            return Ok(());
        };

        let result = self
            .split_locked(parent, block_id, &block_key, &snapshot)
            .await;
        let released = self.locks.release(&owner, &block_key).await;
        result?;
        released?;
        Ok(())
    }

    async fn split_locked(
        &self,
        parent: &RecordKey,
        block_id: u64,
        block_key: &RecordKey,
        snapshot: &StoredRecord,
    ) -> SubkeyIndexResult<()> {
        let entries = snapshot
            .map_bin(&self.config.block_map_bin)
            .unwrap_or(&[]);
        if entries.len() as u64 <= self.config.max_elements_per_block {
            // Another splitter got here first while we queued on the lock.
            return Ok(());
        }
        let Some((first_half, second_half, split_min)) = split_entries(entries) else {
            return Ok(());
        };
        let old_next = snapshot.string_bin(&self.config.block_next_bin).to_string();
        let old_prev = snapshot.string_bin(&self.config.block_prev_bin).to_string();
        let self_pointer = keys::block_pointer(parent, block_id)?;

        // (a) Write the second block. Not linked into the chain yet; only a
        // successor's unpatched back pointer could name it, and nothing
        // traverses backward from an unreferenced block.
        let mut create = WritePolicy::create_only();
        create.send_key = self.config.send_key;
        let (new_id, new_pointer) = loop {
            let new_id = self.allocate_block_id(parent).await?;
            let new_pointer = keys::block_pointer(parent, new_id)?;
            let new_key = keys::block_key_from_pointer(parent, &new_pointer);
            let created = self
                .client
                .operate(
                    &create,
                    &new_key,
                    &[
                        Operation::MapPutItems {
                            bin: self.config.block_map_bin.clone(),
                            items: second_half.clone(),
                        },
                        Operation::Put {
                            bin: self.config.block_next_bin.clone(),
                            value: Value::Str(old_next.clone()),
                        },
                        Operation::Put {
                            bin: self.config.block_prev_bin.clone(),
                            value: Value::Str(self_pointer.clone()),
                        },
                    ],
                )
                .await;
            match created {
                Ok(_) => break (new_id, new_pointer),
                // The id is already in use (a torn counter, or the very
                // first allocation colliding with the head): allocate again.
                Err(e) if e.is_key_exists() => continue,
                Err(e) => return Err(e),
            }
        };
        debug!(
            parent = %parent.describe(),
            block = block_id,
            new_block = new_id,
            split_min = %split_min,
            entries = entries.len(),
            "splitting block"
        );

        // (b) Publish the second block. Routing for keys >= split_min now
        // reaches it.
        let root = self.root_key(parent);
        self.client
            .operate(
                &self.write_policy(),
                &root,
                &[Operation::MapPut {
                    bin: self.config.root_map_bin.clone(),
                    key: split_min.clone(),
                    value: Value::Int(new_id as i64),
                    mode: MapWriteMode::Upsert,
                }],
            )
            .await?;

        // (c) Shrink the original block, still under its lock. The lock bin
        // is untouched, so the lock survives until our release.
        self.client
            .operate(
                &self.write_policy(),
                block_key,
                &[
                    Operation::MapClear {
                        bin: self.config.block_map_bin.clone(),
                    },
                    Operation::MapPutItems {
                        bin: self.config.block_map_bin.clone(),
                        items: first_half,
                    },
                    Operation::Put {
                        bin: self.config.block_next_bin.clone(),
                        value: Value::Str(new_pointer.clone()),
                    },
                    Operation::Put {
                        bin: self.config.block_prev_bin.clone(),
                        value: Value::Str(old_prev),
                    },
                ],
            )
            .await?;

        // (d) Patch the successor's back pointer. Done without its lock:
        // only splits rewrite an existing block's back pointer, and we hold
        // the only split lock that can reach this successor.
        if old_next != keys::NO_BLOCK {
            self.client
                .put(
                    &self.write_policy(),
                    &keys::block_key_from_pointer(parent, &old_next),
                    &[Bin::new(
                        self.config.block_prev_bin.clone(),
                        Value::Str(new_pointer),
                    )],
                )
                .await?;
        }
        Ok(())
    }

    /// Unlink and delete a block that went empty, restitching its neighbors
    /// and the root map. The head block is never removed: it stays as the
    /// chain's left sentinel.
    pub(crate) async fn remove_empty_block(
        &self,
        parent: &RecordKey,
        block_id: u64,
    ) -> SubkeyIndexResult<()> {
        if block_id == keys::HEAD_BLOCK_ID {
            return Ok(());
        }
        let block_key = keys::block_key(parent, block_id)?;
        let owner = self.locks.new_owner();
        let bins = [
            self.config.block_map_bin.as_str(),
            self.config.block_next_bin.as_str(),
            self.config.block_prev_bin.as_str(),
        ];
        let Some(snapshot) = self
            .locks
            .acquire(&owner, &block_key, self.config.max_lock_time_ms, &bins)
            .await?
        else {
            return Ok(());
        };

        match self
            .unlink_locked(parent, block_id, &owner, &block_key, &snapshot)
            .await
        {
            Ok(deleted) => {
                if !deleted {
                    self.locks.release(&owner, &block_key).await?;
                }
                Ok(())
            }
            Err(e) => {
                let _ = self.locks.release(&owner, &block_key).await;
                Err(e)
            }
        }
    }

    /// Returns `true` if the block record was deleted (its lock died with
    /// it), `false` if the unlink was abandoned.
    async fn unlink_locked(
        &self,
        parent: &RecordKey,
        block_id: u64,
        owner: &LockOwner,
        block_key: &RecordKey,
        snapshot: &StoredRecord,
    ) -> SubkeyIndexResult<bool> {
        let size = snapshot
            .map_bin(&self.config.block_map_bin)
            .unwrap_or(&[])
            .len();
        if size != 0 {
            // An insert landed between our delete and this lock.
            return Ok(false);
        }
        let next_pointer = snapshot.string_bin(&self.config.block_next_bin).to_string();
        let prev_pointer = snapshot.string_bin(&self.config.block_prev_bin).to_string();
        if prev_pointer.is_empty() {
            // A non-head block with no back pointer is mid-repair; leave it
            // for a rebuild.
            return Ok(false);
        }

        // Neighbor locks in ascending block-id order.
        let mut neighbors = vec![(pointer_id(&prev_pointer)?, prev_pointer.clone())];
        if !next_pointer.is_empty() {
            neighbors.push((pointer_id(&next_pointer)?, next_pointer.clone()));
        }
        neighbors.sort_by_key(|(id, _)| *id);

        let mut held: Vec<RecordKey> = Vec::new();
        for (_, pointer) in &neighbors {
            let neighbor_key = keys::block_key_from_pointer(parent, pointer);
            match self
                .locks
                .acquire(owner, &neighbor_key, self.config.max_lock_time_ms, &[])
                .await
            {
                Ok(Some(_)) => held.push(neighbor_key),
                Ok(None) | Err(SubkeyIndexError::LockTimeout { .. }) => {
                    // Neighbor vanished or stayed contended: abandon the
                    // unlink. The empty block stays linked (scans skip it)
                    // and a rebuild can drop it.
                    self.release_all(owner, &held).await;
                    return Ok(false);
                }
                Err(e) => {
                    self.release_all(owner, &held).await;
                    return Err(e);
                }
            }
        }

        debug!(
            parent = %parent.describe(),
            block = block_id,
            prev = %prev_pointer,
            next = %next_pointer,
            "unlinking empty block"
        );

        let result: SubkeyIndexResult<()> = async {
            let prev_key = keys::block_key_from_pointer(parent, &prev_pointer);
            self.client
                .operate(
                    &self.write_policy(),
                    &prev_key,
                    &[Operation::Put {
                        bin: self.config.block_next_bin.clone(),
                        value: Value::Str(next_pointer.clone()),
                    }],
                )
                .await?;
            if !next_pointer.is_empty() {
                let next_key = keys::block_key_from_pointer(parent, &next_pointer);
                self.client
                    .operate(
                        &self.write_policy(),
                        &next_key,
                        &[Operation::Put {
                            bin: self.config.block_prev_bin.clone(),
                            value: Value::Str(prev_pointer.clone()),
                        }],
                    )
                    .await?;
            }
            let root = self.root_key(parent);
            self.client
                .operate(
                    &WritePolicy::default(),
                    &root,
                    &[Operation::MapRemoveByValue {
                        bin: self.config.root_map_bin.clone(),
                        value: Value::Int(block_id as i64),
                    }],
                )
                .await?;
            self.client.delete(&self.write_policy(), block_key).await?;
            Ok(())
        }
        .await;

        self.release_all(owner, &held).await;
        result.map(|()| true)
    }

    async fn release_all(&self, owner: &LockOwner, held: &[RecordKey]) {
        for key in held.iter().rev() {
            let _ = self.locks.release(owner, key).await;
        }
    }

    /// Regenerate the root map from the chain and repair back pointers.
    ///
    /// Walks `next` from the head, rereading each block's minimum. Not safe
    /// under concurrent writers.
    pub(crate) async fn rebuild_root(&self, parent: &RecordKey) -> SubkeyIndexResult<()> {
        let root = self.root_key(parent);
        self.client
            .operate(
                &self.write_policy(),
                &root,
                &[Operation::MapClear {
                    bin: self.config.root_map_bin.clone(),
                }],
            )
            .await?;

        let mut pointer = keys::block_pointer(parent, keys::HEAD_BLOCK_ID)?;
        let mut expected_prev = keys::NO_BLOCK.to_string();
        loop {
            let block_key = keys::block_key_from_pointer(parent, &pointer);
            let out = match self
                .client
                .operate(
                    &WritePolicy::default(),
                    &block_key,
                    &[
                        Operation::MapGetByIndex {
                            bin: self.config.block_map_bin.clone(),
                            index: 0,
                            ret: MapReturn::Key,
                        },
                        Operation::Get {
                            bin: self.config.block_next_bin.clone(),
                        },
                        Operation::Get {
                            bin: self.config.block_prev_bin.clone(),
                        },
                    ],
                )
                .await
            {
                Ok(out) => out,
                // No head block means no chain at all; a broken next pointer
                // ends the walk.
                Err(e) if e.is_key_not_found() => break,
                Err(e) => return Err(e),
            };

            let min_key = out.results[0].as_key()?.cloned();
            let next_pointer = out.results[1].as_bin_str()?.to_string();
            let stored_prev = out.results[2].as_bin_str()?.to_string();
            let block_id = pointer_id(&pointer)?;

            let min_display = min_key
                .as_ref()
                .map(|k| k.to_string())
                .unwrap_or_else(|| "<empty>".to_string());
            debug!(
                parent = %parent.describe(),
                block = block_id,
                min = %min_display,
                next = %next_pointer,
                "rebuild visiting block"
            );

            if let Some(min_key) = min_key {
                self.client
                    .operate(
                        &self.write_policy(),
                        &root,
                        &[Operation::MapPut {
                            bin: self.config.root_map_bin.clone(),
                            key: min_key,
                            value: Value::Int(block_id as i64),
                            mode: MapWriteMode::Upsert,
                        }],
                    )
                    .await?;
            }
            if stored_prev != expected_prev {
                self.client
                    .put(
                        &self.write_policy(),
                        &block_key,
                        &[Bin::new(
                            self.config.block_prev_bin.clone(),
                            Value::Str(expected_prev.clone()),
                        )],
                    )
                    .await?;
            }
            if next_pointer.is_empty() {
                break;
            }
            expected_prev = pointer;
            pointer = next_pointer;
        }
        Ok(())
    }
}

fn block_id_value(value: &Value) -> SubkeyIndexResult<u64> {
    value
        .as_int()
        .map(|i| i as u64)
        .ok_or_else(|| SubkeyIndexError::internal("root map value is not a block id"))
}

fn pointer_id(pointer: &str) -> SubkeyIndexResult<u64> {
    keys::block_id_from_pointer(pointer).ok_or_else(|| {
        SubkeyIndexError::internal(format!("unparseable block pointer '{}'", pointer))
    })
}

/// Divide a block's entries at `ceil(n/2)`: the first half keeps the
/// original block, the second half seeds the new one. Returns the halves and
/// the new block's minimum key, or `None` for maps too small to split.
pub(crate) fn split_entries(
    entries: &[(MapKey, Value)],
) -> Option<(Vec<(MapKey, Value)>, Vec<(MapKey, Value)>, MapKey)> {
    if entries.len() < 2 {
        return None;
    }
    let split_point = (entries.len() + 1) / 2;
    let first = entries[..split_point].to_vec();
    let second = entries[split_point..].to_vec();
    let split_min = second[0].0.clone();
    Some((first, second, split_min))
}
