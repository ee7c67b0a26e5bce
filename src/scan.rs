//! Directional range scans across the block chain.
//!
//! A scan picks a starting block (routed by the first key, or an end of the
//! chain), reads entries and both link pointers in one atomic op per block,
//! filters out expired entries, and walks `next`/`prev` pointers until the
//! page is full or the chain ends. The page carries the digests in order
//! plus what a continuation needs to resume: the block being read and the
//! last key returned.
//!
//! Scans take no locks. They can run concurrently with splits and deletes;
//! the split's publish-before-shrink ordering keeps routed reads consistent,
//! at the cost of no snapshot isolation across blocks.

use tracing::debug;

use crate::chain::{BlockChain, BlockRoute};
use crate::client::{MapReturn, Operation, WritePolicy};
use crate::error::{SubkeyIndexError, SubkeyIndexResult};
use crate::keys;
use crate::value::{Digest, MapKey, RecordKey, Value};

/// One page of digests plus the state a continuation resumes from.
#[derive(Clone, Debug, Default)]
pub(crate) struct DigestPage {
    /// Digests of live entries, in scan order.
    pub digests: Vec<Digest>,
    /// Pointer of the block the scan stopped in; `None` when the chain was
    /// exhausted.
    pub block_pointer: Option<String>,
    /// Key of the last entry returned, if any.
    pub last_key: Option<MapKey>,
}

/// Exclusive/inclusive boundary applied while filtering a window.
struct Boundary {
    key: MapKey,
    inclusive: bool,
}

impl BlockChain {
    /// Block id at the chain's scan edge: minimum root entry for forward
    /// scans, maximum for backward. `None` when no root map exists.
    async fn edge_block_id(
        &self,
        parent: &RecordKey,
        forwards: bool,
    ) -> SubkeyIndexResult<Option<u64>> {
        let root = keys::root_key(&self.config, self.client.as_ref(), parent);
        let index = if forwards { 0 } else { -1 };
        let out = match self
            .client
            .operate(
                &WritePolicy::default(),
                &root,
                &[Operation::MapGetByIndex {
                    bin: self.config.root_map_bin.clone(),
                    index,
                    ret: MapReturn::Value,
                }],
            )
            .await
        {
            Ok(out) => out,
            Err(e) if e.is_key_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };
        match out.results[0].as_value()? {
            Some(Value::Int(id)) => Ok(Some(*id as u64)),
            Some(_) => Err(SubkeyIndexError::internal(
                "root map value is not a block id",
            )),
            None => Ok(None),
        }
    }

    /// Read op for a whole-block window in scan direction.
    fn whole_block_read(&self, forwards: bool, count: u64) -> Operation {
        let index = if forwards { 0 } else { -(count as i64) };
        Operation::MapGetByIndexRange {
            bin: self.config.block_map_bin.clone(),
            index,
            count,
            ret: MapReturn::KeyValue,
        }
    }

    /// Read op for a window anchored at `first`: forward scans read `count`
    /// entries from the anchor's rank upward, backward scans read the anchor
    /// plus its predecessors.
    fn anchored_block_read(&self, first: &MapKey, forwards: bool, count: u64) -> Operation {
        let offset = if forwards { 0 } else { -((count as i64) - 1) };
        Operation::MapGetByKeyRelativeIndexRange {
            bin: self.config.block_map_bin.clone(),
            key: first.clone(),
            offset,
            count,
            ret: MapReturn::KeyValue,
        }
    }

    /// Collect up to `max` live digests starting at `first_key` (or the
    /// chain edge when `None`), walking blocks in the scan direction.
    pub(crate) async fn collect_digests(
        &self,
        parent: &RecordKey,
        first_key: Option<&MapKey>,
        include_first: bool,
        forwards: bool,
        max: usize,
        now_ms: i64,
    ) -> SubkeyIndexResult<DigestPage> {
        let mut pointer = match first_key {
            None => match self.edge_block_id(parent, forwards).await? {
                Some(id) => keys::block_pointer(parent, id)?,
                None => return Ok(DigestPage::default()),
            },
            Some(key) => match self.route_block(parent, key).await? {
                BlockRoute::Uninitialized => return Ok(DigestPage::default()),
                BlockRoute::Block(id) => keys::block_pointer(parent, id)?,
            },
        };

        let mut digests: Vec<Digest> = Vec::with_capacity(max);
        let mut last_key: Option<MapKey> = None;
        let mut boundary = first_key.map(|key| Boundary {
            key: key.clone(),
            inclusive: include_first,
        });
        let (mut op, mut requested) = match first_key {
            Some(key) => (
                self.anchored_block_read(key, forwards, max as u64 + 1),
                max + 1,
            ),
            None => (self.whole_block_read(forwards, max as u64), max),
        };

        let mut exhausted = false;
        loop {
            let block_key = keys::block_key_from_pointer(parent, &pointer);
            let out = match self
                .client
                .operate(
                    &WritePolicy::default(),
                    &block_key,
                    &[
                        op.clone(),
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
                Err(e) if e.is_key_not_found() => {
                    // The block vanished mid-scan; treat as chain end.
                    exhausted = true;
                    break;
                }
                Err(e) => return Err(e),
            };

            let entries = out.results[0].as_entries()?;
            if let Some(added) =
                append_live_entries(entries, forwards, now_ms, max, boundary.as_ref(), &mut digests)?
            {
                last_key = Some(added);
            }
            debug!(
                parent = %parent.describe(),
                block = %pointer,
                read = entries.len(),
                collected = digests.len(),
                forwards,
                "scan iteration"
            );

            if digests.len() >= max {
                break;
            }

            let remaining = max - digests.len();
            if entries.len() < requested {
                // This block is exhausted; hop along the chain.
                let hop = if forwards {
                    out.results[1].as_bin_str()?
                } else {
                    out.results[2].as_bin_str()?
                };
                if hop.is_empty() {
                    exhausted = true;
                    break;
                }
                pointer = hop.to_string();
                op = self.whole_block_read(forwards, remaining as u64);
                requested = remaining;
                // Keep the directional filter across blocks.
                boundary = last_key.clone().map(|key| Boundary {
                    key,
                    inclusive: false,
                });
            } else {
                // The window filled without draining the block: continue in
                // place from the last key examined (not the last returned —
                // a window of entirely expired entries must still advance).
                let cursor = if forwards {
                    entries.last()
                } else {
                    entries.first()
                };
                let Some((cursor, _)) = cursor else {
                    exhausted = true;
                    break;
                };
                op = self.anchored_block_read(cursor, forwards, remaining as u64 + 1);
                requested = remaining + 1;
                boundary = Some(Boundary {
                    key: cursor.clone(),
                    inclusive: false,
                });
            }
        }

        Ok(DigestPage {
            digests,
            block_pointer: if exhausted { None } else { Some(pointer) },
            last_key,
        })
    }
}

/// Append digests of live entries from one window, in scan direction, up to
/// `max` total. Returns the key of the last entry appended, if any.
///
/// An entry qualifies when it passes the boundary test (strictly beyond the
/// boundary key, or equal when inclusive) and its expiry lies in the future.
fn append_live_entries(
    entries: &[(MapKey, Value)],
    forwards: bool,
    now_ms: i64,
    max: usize,
    boundary: Option<&Boundary>,
    digests: &mut Vec<Digest>,
) -> SubkeyIndexResult<Option<MapKey>> {
    let mut appended = None;
    let ordered: Box<dyn Iterator<Item = &(MapKey, Value)>> = if forwards {
        Box::new(entries.iter())
    } else {
        Box::new(entries.iter().rev())
    };
    for (key, value) in ordered {
        if digests.len() >= max {
            break;
        }
        if let Some(b) = boundary {
            let past_boundary = match key.cmp(&b.key) {
                std::cmp::Ordering::Equal => b.inclusive,
                std::cmp::Ordering::Greater => forwards,
                std::cmp::Ordering::Less => !forwards,
            };
            if !past_boundary {
                continue;
            }
        }
        let (expiry_ms, digest) = decode_entry(value)?;
        if expiry_ms > now_ms {
            digests.push(digest);
            appended = Some(key.clone());
        }
    }
    Ok(appended)
}

/// Decode a block map entry `[expiry_ms, digest]`.
fn decode_entry(value: &Value) -> SubkeyIndexResult<(i64, Digest)> {
    let items = value
        .as_list()
        .ok_or_else(|| SubkeyIndexError::internal("block entry is not a list"))?;
    match items {
        [Value::Int(expiry_ms), Value::Bytes(digest)] => Ok((*expiry_ms, digest.clone())),
        _ => Err(SubkeyIndexError::internal(
            "block entry is not [expiry, digest]",
        )),
    }
}
