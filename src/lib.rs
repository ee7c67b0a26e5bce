//! # Sorted Subkey Index
//!
//! This crate implements a sorted, paginable, arbitrarily large secondary
//! ordering over records in a distributed key-value store whose native query
//! layer returns data in unspecified order and caps single-record size.
//!
//! ## Overview
//!
//! For each "parent" key and a caller-chosen sort key type, the index keeps
//! the parent's child references in sorted order, supports forward and
//! backward pagination from any position, and scales past the per-record
//! size ceiling by chaining many sorted map records together.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      SubkeyIndex<K>                           │
//! │  (put / delete / get_range / continue_range / rebuild_root)  │
//! ├──────────────────────────────────────────────────────────────┤
//! │  BlockChain engine          │  LockManager                   │
//! │  routing · split · unlink   │  lease · reentrance · takeover │
//! ├──────────────────────────────────────────────────────────────┤
//! │                 StoreClient (trait object)                    │
//! │        atomic multi-ops · key-ordered maps · digests          │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Data layout
//!
//! Three satellite records per parent key `P` (set `S`, namespace `N`):
//!
//! ```text
//! root map   rootNs/rootSet/digest(P)   { min key in block -> block id }
//! blocks     N/S-meta/"{P}-{id}"        map: sort key -> [expiry, digest]
//!                                       next/prev: neighbor pointers
//! counter    N/S-meta/digest(P)         monotonic block-id allocator
//! data       N/S-subkeys/"{P}-{K}"      caller payload per sort key
//! ```
//!
//! Blocks form a doubly-linked list in strict key order; block 1 is the
//! permanent head. When a block outgrows `max_elements_per_block` it splits
//! in two; a block deleted down to empty is unlinked (the head always
//! stays). The root map makes any key reachable in one routing read.
//!
//! ## Concurrency
//!
//! There is no global transaction. Per-block advisory locks (leased entries
//! inside the block record itself) serialize structural mutation, and every
//! lock-scoped mutation travels as a single atomic multi-op, so partial
//! structural updates cannot be observed. Root-map maintenance is lock-free
//! and idempotent; a lost root-map race degrades routing by at most one
//! block and is repaired by [`SubkeyIndex::rebuild_root`].
//!
//! ## Example
//!
//! ```rust,ignore
//! let client: Arc<dyn StoreClient> = Arc::new(MyStoreClient::connect(...)?);
//! let index: SubkeyIndex<i64> =
//!     SubkeyIndex::new(client, SubkeyIndexConfig::default());
//!
//! let tim = RecordKey::new("test", "Messages", "Tim");
//! index.put(&tim, &1000, None, &[Bin::new("Message", "hello")]).await?;
//!
//! let page = index.get_range(&tim, None, true, true, 100).await?;
//! for record in page.records.iter().flatten() {
//!     println!("{}", record.string_bin("Message"));
//! }
//! ```
//!
//! ## Limitations
//!
//! - Duplicate sort keys replace the prior entry; callers needing
//!   non-unique orderings encode a tiebreak into the key.
//! - No cross-block atomicity or snapshot isolation for readers.
//! - Active-active replication of the root map is unsupported; concurrent
//!   writers against diverged root maps may lose entries.

mod chain;
mod client;
mod config;
mod error;
mod index;
mod keys;
mod lock;
mod scan;
mod value;

pub use client::{
    epoch_millis, MapReturn, MapWriteMode, OpOutput, OpResult, Operation, RecordExistsAction,
    StoreClient, StoredRecord, WritePolicy,
};
pub use config::{
    SubkeyIndexConfig, DEFAULT_LOCK_RETRY_MS, DEFAULT_MAX_ELEMENTS_PER_BLOCK,
    DEFAULT_MAX_LOCK_TIME_MS,
};
pub use error::{SubkeyIndexError, SubkeyIndexResult};
pub use index::{Continuation, ScanPage, SubkeyIndex};
pub use lock::{LockManager, LockOwner};
pub use value::{splitmix64, Bin, Digest, KeyIdent, MapKey, RecordKey, SortKey, UserKey, Value};

#[cfg(test)]
pub(crate) mod mock_client;
