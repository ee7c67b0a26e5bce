//! Derivation of the satellite record keys attached to a parent.
//!
//! Per parent key `P` at namespace `N`, set `S`:
//!
//! - data record for sort key `K`: `N / S-subkeys / "{P}-{K}"`
//! - block record with id `i`:     `N / S-meta / "{P}-{i}"`
//! - id-counter record:            `N / S-meta / digest(P)`
//! - root map record:              `rootNs / rootSet / digest(P)`
//!
//! Block pointers stored in `next`/`prev` bins are the block records' user
//! key strings; an empty string means "no neighbor".

use crate::client::StoreClient;
use crate::config::SubkeyIndexConfig;
use crate::error::{SubkeyIndexError, SubkeyIndexResult};
use crate::value::{map_key_fragment, Digest, MapKey, RecordKey, UserKey};

/// Set-name suffix for child data records.
pub(crate) const SUBKEY_SET_SUFFIX: &str = "-subkeys";

/// Set-name suffix for block, counter and (by default) root records.
pub(crate) const META_SET_SUFFIX: &str = "-meta";

/// Separator between a parent fragment and a sort-key or block-id fragment.
pub(crate) const KEY_SEPARATOR: &str = "-";

/// Pointer value meaning "no neighbor block".
pub(crate) const NO_BLOCK: &str = "";

/// The permanent head block's id. The head is created on first insert and
/// never removed while the chain exists.
pub(crate) const HEAD_BLOCK_ID: u64 = 1;

/// String fragment of the parent's user key.
///
/// Parents must be string- or integer-keyed; anything else cannot name the
/// derived satellite records.
pub(crate) fn parent_fragment(parent: &RecordKey) -> SubkeyIndexResult<String> {
    match parent.user_key() {
        Some(UserKey::Str(s)) => Ok(s.clone()),
        Some(UserKey::Int(i)) => Ok(i.to_string()),
        None => Err(SubkeyIndexError::invalid_argument(
            "parent keys must carry a string or integer user key",
        )),
    }
}

/// Set name holding the parent's child data records.
pub(crate) fn subkey_set(parent: &RecordKey) -> String {
    format!("{}{}", parent.set_name, SUBKEY_SET_SUFFIX)
}

/// Set name holding the parent's block and counter records.
pub(crate) fn meta_set(parent: &RecordKey) -> String {
    format!("{}{}", parent.set_name, META_SET_SUFFIX)
}

/// Key of the data record for `(parent, sort key)`.
pub(crate) fn data_record_key(parent: &RecordKey, key: &MapKey) -> SubkeyIndexResult<RecordKey> {
    let user_key = format!(
        "{}{}{}",
        parent_fragment(parent)?,
        KEY_SEPARATOR,
        map_key_fragment(key)?
    );
    Ok(RecordKey::new(
        parent.namespace.clone(),
        subkey_set(parent),
        user_key,
    ))
}

/// Key of a data record addressed by a stored digest.
pub(crate) fn data_key_from_digest(parent: &RecordKey, digest: Digest) -> RecordKey {
    RecordKey::from_digest(parent.namespace.clone(), subkey_set(parent), digest)
}

/// Pointer string naming the block record with the given id.
pub(crate) fn block_pointer(parent: &RecordKey, block_id: u64) -> SubkeyIndexResult<String> {
    Ok(format!(
        "{}{}{}",
        parent_fragment(parent)?,
        KEY_SEPARATOR,
        block_id
    ))
}

/// Key of the block record with the given id.
pub(crate) fn block_key(parent: &RecordKey, block_id: u64) -> SubkeyIndexResult<RecordKey> {
    Ok(RecordKey::new(
        parent.namespace.clone(),
        meta_set(parent),
        block_pointer(parent, block_id)?,
    ))
}

/// Key of the block record named by a stored pointer string.
pub(crate) fn block_key_from_pointer(parent: &RecordKey, pointer: &str) -> RecordKey {
    RecordKey::new(parent.namespace.clone(), meta_set(parent), pointer)
}

/// Block id encoded at the tail of a pointer string, if parseable.
pub(crate) fn block_id_from_pointer(pointer: &str) -> Option<u64> {
    pointer
        .rsplit_once(KEY_SEPARATOR)
        .and_then(|(_, id)| id.parse().ok())
}

/// Key of the parent's id-counter record. Digest-keyed so it covers both the
/// parent's set name and user key.
pub(crate) fn counter_key(client: &dyn StoreClient, parent: &RecordKey) -> RecordKey {
    RecordKey::from_digest(parent.namespace.clone(), meta_set(parent), client.digest(parent))
}

/// Key of the parent's root map record.
pub(crate) fn root_key(
    config: &SubkeyIndexConfig,
    client: &dyn StoreClient,
    parent: &RecordKey,
) -> RecordKey {
    RecordKey::from_digest(
        config.root_namespace_for(parent).to_string(),
        config.root_set_for(parent),
        client.digest(parent),
    )
}
