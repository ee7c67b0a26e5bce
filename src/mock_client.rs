//! Mock store client for testing.
//!
//! An in-memory [`StoreClient`] with the semantics the index depends on:
//! atomic multi-ops (each `operate` call applies all-or-nothing under one
//! mutex), per-record generations, record- and entry-level create-only
//! guards, and key-ordered map operations including rank windows.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::client::{
    MapReturn, MapWriteMode, OpOutput, OpResult, Operation, RecordExistsAction, StoreClient,
    StoredRecord, WritePolicy,
};
use crate::error::{SubkeyIndexError, SubkeyIndexResult};
use crate::value::{Bin, Digest, MapKey, RecordKey, Value};

/// A bin in a mock record: either a scalar or a key-ordered map.
#[derive(Clone, Debug)]
enum MockBin {
    Scalar(Value),
    Map(BTreeMap<MapKey, Value>),
}

#[derive(Clone, Debug, Default)]
struct MockRecord {
    generation: u32,
    bins: HashMap<String, MockBin>,
}

impl MockRecord {
    fn snapshot(&self, bins: Option<&[&str]>) -> StoredRecord {
        let mut out = StoredRecord {
            generation: self.generation,
            bins: HashMap::new(),
        };
        for (name, bin) in &self.bins {
            if let Some(wanted) = bins {
                if !wanted.contains(&name.as_str()) {
                    continue;
                }
            }
            out.bins.insert(name.clone(), bin_value(bin));
        }
        out
    }
}

fn bin_value(bin: &MockBin) -> Value {
    match bin {
        MockBin::Scalar(v) => v.clone(),
        MockBin::Map(m) => Value::Map(m.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
    }
}

/// In-memory mock store for unit tests.
///
/// Records live in a `HashMap` keyed by `(namespace, digest)`, guarded by a
/// single mutex so every multi-op is atomic, exactly like the store contract
/// requires.
pub(crate) struct MockStoreClient {
    records: Mutex<HashMap<(String, Digest), MockRecord>>,
}

impl MockStoreClient {
    /// Create an empty mock store.
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Check whether a record exists (synchronous, for tests).
    pub fn contains(&self, key: &RecordKey) -> bool {
        let ident = (key.namespace.clone(), self.digest(key));
        self.records.lock().unwrap().contains_key(&ident)
    }

    /// Number of stored records (synchronous, for tests).
    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Drop every record.
    pub fn clear(&self) {
        self.records.lock().unwrap().clear();
    }
}

impl Default for MockStoreClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StoreClient for MockStoreClient {
    async fn operate(
        &self,
        policy: &WritePolicy,
        key: &RecordKey,
        ops: &[Operation],
    ) -> SubkeyIndexResult<OpOutput> {
        let ident = (key.namespace.clone(), self.digest(key));
        let describe = key.describe();
        let mut store = self.records.lock().unwrap();
        let has_write = ops.iter().any(Operation::is_write);

        let mut record = match store.get(&ident) {
            Some(existing) => {
                if policy.exists == RecordExistsAction::CreateOnly {
                    return Err(SubkeyIndexError::KeyExists { key: describe });
                }
                if let Some(expected) = policy.generation {
                    if expected != existing.generation {
                        return Err(SubkeyIndexError::GenerationMismatch { key: describe });
                    }
                }
                existing.clone()
            }
            None => {
                if !has_write || policy.exists == RecordExistsAction::UpdateOnly {
                    return Err(SubkeyIndexError::KeyNotFound { key: describe });
                }
                MockRecord::default()
            }
        };

        // Apply to the clone; commit only if every op succeeded.
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            results.push(apply_op(&mut record, op, &describe)?);
        }
        if has_write {
            record.generation += 1;
        }
        let generation = record.generation;
        if has_write {
            store.insert(ident, record);
        }
        Ok(OpOutput {
            generation,
            results,
        })
    }

    async fn get(
        &self,
        key: &RecordKey,
        bins: Option<&[&str]>,
    ) -> SubkeyIndexResult<Option<StoredRecord>> {
        let ident = (key.namespace.clone(), self.digest(key));
        let store = self.records.lock().unwrap();
        Ok(store.get(&ident).map(|r| r.snapshot(bins)))
    }

    async fn put(
        &self,
        policy: &WritePolicy,
        key: &RecordKey,
        bins: &[Bin],
    ) -> SubkeyIndexResult<()> {
        let ops: Vec<Operation> = bins
            .iter()
            .map(|b| Operation::Put {
                bin: b.name.clone(),
                value: b.value.clone(),
            })
            .collect();
        self.operate(policy, key, &ops).await.map(|_| ())
    }

    async fn delete(&self, _policy: &WritePolicy, key: &RecordKey) -> SubkeyIndexResult<bool> {
        let ident = (key.namespace.clone(), self.digest(key));
        let mut store = self.records.lock().unwrap();
        Ok(store.remove(&ident).is_some())
    }

    async fn batch_get(&self, keys: &[RecordKey]) -> SubkeyIndexResult<Vec<Option<StoredRecord>>> {
        let store = self.records.lock().unwrap();
        Ok(keys
            .iter()
            .map(|key| {
                let ident = (key.namespace.clone(), self.digest(key));
                store.get(&ident).map(|r| r.snapshot(None))
            })
            .collect())
    }
}

fn map_bin<'a>(
    record: &'a mut MockRecord,
    bin: &str,
    describe: &str,
) -> SubkeyIndexResult<&'a mut BTreeMap<MapKey, Value>> {
    let entry = record
        .bins
        .entry(bin.to_string())
        .or_insert_with(|| MockBin::Map(BTreeMap::new()));
    match entry {
        MockBin::Map(m) => Ok(m),
        MockBin::Scalar(_) => Err(SubkeyIndexError::store(
            "map-op",
            describe,
            format!("bin '{}' holds a scalar", bin),
        )),
    }
}

/// Rank of `key`: the number of map keys strictly less than it.
fn rank(map: &BTreeMap<MapKey, Value>, key: &MapKey) -> usize {
    map.range(..key.clone()).count()
}

/// Entries in the rank window `[start, start + count)`, clipped to the map.
fn window(map: &BTreeMap<MapKey, Value>, start: i64, count: u64) -> Vec<(MapKey, Value)> {
    let len = map.len() as i64;
    let lo = start.max(0).min(len);
    let hi = (start.saturating_add(count as i64)).max(0).min(len);
    if hi <= lo {
        return Vec::new();
    }
    map.iter()
        .skip(lo as usize)
        .take((hi - lo) as usize)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn range_result(entries: Vec<(MapKey, Value)>, ret: MapReturn) -> SubkeyIndexResult<OpResult> {
    match ret {
        MapReturn::KeyValue => Ok(OpResult::Entries(entries)),
        MapReturn::Count => Ok(OpResult::Count(entries.len() as u64)),
        other => Err(SubkeyIndexError::internal(format!(
            "unsupported range return shape {:?}",
            other
        ))),
    }
}

fn apply_op(
    record: &mut MockRecord,
    op: &Operation,
    describe: &str,
) -> SubkeyIndexResult<OpResult> {
    match op {
        Operation::Get { bin } => Ok(OpResult::Bin(record.bins.get(bin).map(bin_value))),
        Operation::Put { bin, value } => {
            let stored = match value {
                Value::Map(entries) => MockBin::Map(entries.iter().cloned().collect()),
                other => MockBin::Scalar(other.clone()),
            };
            record.bins.insert(bin.clone(), stored);
            Ok(OpResult::None)
        }
        Operation::Add { bin, delta } => {
            let entry = record
                .bins
                .entry(bin.clone())
                .or_insert_with(|| MockBin::Scalar(Value::Int(0)));
            match entry {
                MockBin::Scalar(Value::Int(current)) => {
                    *current += delta;
                    Ok(OpResult::None)
                }
                _ => Err(SubkeyIndexError::store(
                    "add",
                    describe,
                    format!("bin '{}' is not an integer", bin),
                )),
            }
        }
        Operation::MapPut {
            bin,
            key,
            value,
            mode,
        } => {
            let map = map_bin(record, bin, describe)?;
            if *mode == MapWriteMode::CreateOnly && map.contains_key(key) {
                return Err(SubkeyIndexError::ElementExists {
                    key: describe.to_string(),
                });
            }
            map.insert(key.clone(), value.clone());
            Ok(OpResult::Count(map.len() as u64))
        }
        Operation::MapPutItems { bin, items } => {
            let map = map_bin(record, bin, describe)?;
            for (k, v) in items {
                map.insert(k.clone(), v.clone());
            }
            Ok(OpResult::Count(map.len() as u64))
        }
        Operation::MapSize { bin } => {
            let map = map_bin(record, bin, describe)?;
            Ok(OpResult::Count(map.len() as u64))
        }
        Operation::MapClear { bin } => {
            let map = map_bin(record, bin, describe)?;
            map.clear();
            Ok(OpResult::None)
        }
        Operation::MapGetByKey { bin, key, ret } => {
            let map = map_bin(record, bin, describe)?;
            match map.get(key).cloned() {
                Some(value) => match ret {
                    MapReturn::Index => Ok(OpResult::Index(rank(map, key) as i64)),
                    MapReturn::Key => Ok(OpResult::Key(key.clone())),
                    MapReturn::Value => Ok(OpResult::Value(value)),
                    MapReturn::KeyValue => Ok(OpResult::Entries(vec![(key.clone(), value)])),
                    MapReturn::Count => Ok(OpResult::Count(1)),
                    MapReturn::None => Ok(OpResult::None),
                },
                None => match ret {
                    MapReturn::Index => Ok(OpResult::Index(-1)),
                    MapReturn::KeyValue => Ok(OpResult::Entries(Vec::new())),
                    MapReturn::Count => Ok(OpResult::Count(0)),
                    _ => Ok(OpResult::None),
                },
            }
        }
        Operation::MapGetByIndex { bin, index, ret } => {
            let map = map_bin(record, bin, describe)?;
            let len = map.len() as i64;
            let resolved = if *index < 0 { len + index } else { *index };
            if resolved < 0 || resolved >= len {
                return Ok(OpResult::None);
            }
            let (key, value) = map
                .iter()
                .nth(resolved as usize)
                .map(|(k, v)| (k.clone(), v.clone()))
                .expect("index within bounds");
            match ret {
                MapReturn::Key => Ok(OpResult::Key(key)),
                MapReturn::Value => Ok(OpResult::Value(value)),
                MapReturn::KeyValue => Ok(OpResult::Entries(vec![(key, value)])),
                MapReturn::Index => Ok(OpResult::Index(resolved)),
                MapReturn::Count => Ok(OpResult::Count(1)),
                MapReturn::None => Ok(OpResult::None),
            }
        }
        Operation::MapGetByIndexRange {
            bin,
            index,
            count,
            ret,
        } => {
            let map = map_bin(record, bin, describe)?;
            let len = map.len() as i64;
            let start = if *index < 0 { len + index } else { *index };
            range_result(window(map, start, *count), *ret)
        }
        Operation::MapGetByKeyRelativeIndexRange {
            bin,
            key,
            offset,
            count,
            ret,
        } => {
            let map = map_bin(record, bin, describe)?;
            let start = rank(map, key) as i64 + offset;
            range_result(window(map, start, *count), *ret)
        }
        Operation::MapRemoveByKey { bin, key, ret } => {
            let map = map_bin(record, bin, describe)?;
            let removed_rank = if map.contains_key(key) {
                rank(map, key) as i64
            } else {
                -1
            };
            map.remove(key);
            match ret {
                MapReturn::Index => Ok(OpResult::Index(removed_rank)),
                _ => Ok(OpResult::None),
            }
        }
        Operation::MapRemoveByValue { bin, value } => {
            let map = map_bin(record, bin, describe)?;
            map.retain(|_, v| v != value);
            Ok(OpResult::None)
        }
        Operation::MapRemoveByValueRange {
            bin,
            begin,
            end,
            ret,
        } => {
            let map = map_bin(record, bin, describe)?;
            let before = map.len();
            map.retain(|_, v| !(&*v >= begin && &*v < end));
            let removed = (before - map.len()) as u64;
            match ret {
                MapReturn::Count => Ok(OpResult::Count(removed)),
                _ => Ok(OpResult::None),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> RecordKey {
        RecordKey::new("test", "things", "thing-1")
    }

    fn kv_range(bin: &str, anchor: i64, offset: i64, count: u64) -> Operation {
        Operation::MapGetByKeyRelativeIndexRange {
            bin: bin.into(),
            key: MapKey::Int(anchor),
            offset,
            count,
            ret: MapReturn::KeyValue,
        }
    }

    async fn seed_map(client: &MockStoreClient, keys: &[i64]) {
        let items: Vec<_> = keys
            .iter()
            .map(|k| (MapKey::Int(*k), Value::Int(*k)))
            .collect();
        client
            .operate(
                &WritePolicy::default(),
                &key(),
                &[Operation::MapPutItems {
                    bin: "map".into(),
                    items,
                }],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_read_only_ops_on_missing_record_error() {
        let client = MockStoreClient::new();
        let err = client
            .operate(
                &WritePolicy::default(),
                &key(),
                &[Operation::MapSize { bin: "map".into() }],
            )
            .await
            .unwrap_err();
        assert!(err.is_key_not_found());
    }

    #[tokio::test]
    async fn test_create_only_record_guard() {
        let client = MockStoreClient::new();
        let put = [Operation::Put {
            bin: "next".into(),
            value: Value::Str("".into()),
        }];
        client
            .operate(&WritePolicy::create_only(), &key(), &put)
            .await
            .unwrap();
        let err = client
            .operate(&WritePolicy::create_only(), &key(), &put)
            .await
            .unwrap_err();
        assert!(err.is_key_exists());
    }

    #[tokio::test]
    async fn test_create_only_map_entry_guard_rolls_back() {
        let client = MockStoreClient::new();
        seed_map(&client, &[1]).await;

        // Second op fails, so the first op's effect must not commit.
        let err = client
            .operate(
                &WritePolicy::default(),
                &key(),
                &[
                    Operation::MapPut {
                        bin: "map".into(),
                        key: MapKey::Int(99),
                        value: Value::Int(99),
                        mode: MapWriteMode::Upsert,
                    },
                    Operation::MapPut {
                        bin: "map".into(),
                        key: MapKey::Int(1),
                        value: Value::Int(1),
                        mode: MapWriteMode::CreateOnly,
                    },
                ],
            )
            .await
            .unwrap_err();
        assert!(err.is_element_exists());

        let out = client
            .operate(
                &WritePolicy::default(),
                &key(),
                &[Operation::MapSize { bin: "map".into() }],
            )
            .await
            .unwrap();
        assert_eq!(out.results[0].as_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_generation_check() {
        let client = MockStoreClient::new();
        seed_map(&client, &[1]).await;
        let snapshot = client.get(&key(), None).await.unwrap().unwrap();

        let good = WritePolicy::default().with_generation(snapshot.generation);
        client
            .operate(
                &good,
                &key(),
                &[Operation::Put {
                    bin: "x".into(),
                    value: Value::Int(1),
                }],
            )
            .await
            .unwrap();

        // The write bumped the generation, so the same check now fails.
        let err = client
            .operate(
                &good,
                &key(),
                &[Operation::Put {
                    bin: "x".into(),
                    value: Value::Int(2),
                }],
            )
            .await
            .unwrap_err();
        assert!(err.is_generation_mismatch());
    }

    async fn read_keys(client: &MockStoreClient, op: Operation) -> Vec<i64> {
        let out = client
            .operate(&WritePolicy::default(), &key(), &[op])
            .await
            .unwrap();
        out.results[0]
            .as_entries()
            .unwrap()
            .iter()
            .map(|(k, _)| match k {
                MapKey::Int(i) => *i,
                _ => panic!("unexpected key"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_relative_index_range_windows() {
        let client = MockStoreClient::new();
        seed_map(&client, &[100, 200, 300]).await;

        // Floor probe: anchor between keys finds the predecessor.
        assert_eq!(read_keys(&client, kv_range("map", 150, -1, 1)).await, vec![100]);
        // Floor probe on an exact key still yields the predecessor; the
        // router's paired exact lookup covers that case.
        assert_eq!(read_keys(&client, kv_range("map", 200, -1, 1)).await, vec![100]);
        // Below every key the window is empty (head fallback territory).
        assert_eq!(
            read_keys(&client, kv_range("map", 50, -1, 1)).await,
            Vec::<i64>::new()
        );
        // Forward page anchored at a key includes it.
        assert_eq!(
            read_keys(&client, kv_range("map", 200, 0, 5)).await,
            vec![200, 300]
        );
        // Backward page window: anchor plus predecessors, clipped at the
        // map start rather than spilling onto successors.
        assert_eq!(
            read_keys(&client, kv_range("map", 200, -2, 3)).await,
            vec![100, 200]
        );
        assert_eq!(
            read_keys(&client, kv_range("map", 100, -1, 2)).await,
            vec![100]
        );
        assert_eq!(
            read_keys(&client, kv_range("map", 100, -2, 2)).await,
            Vec::<i64>::new()
        );
    }

    #[tokio::test]
    async fn test_index_range_from_end() {
        let client = MockStoreClient::new();
        seed_map(&client, &[1, 2, 3, 4, 5]).await;
        let out = client
            .operate(
                &WritePolicy::default(),
                &key(),
                &[Operation::MapGetByIndexRange {
                    bin: "map".into(),
                    index: -2,
                    count: 2,
                    ret: MapReturn::KeyValue,
                }],
            )
            .await
            .unwrap();
        let entries = out.results[0].as_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, MapKey::Int(4));
        assert_eq!(entries[1].0, MapKey::Int(5));
    }

    #[tokio::test]
    async fn test_remove_by_key_reports_rank() {
        let client = MockStoreClient::new();
        seed_map(&client, &[10, 20, 30]).await;
        let out = client
            .operate(
                &WritePolicy::default(),
                &key(),
                &[
                    Operation::MapRemoveByKey {
                        bin: "map".into(),
                        key: MapKey::Int(10),
                        ret: MapReturn::Index,
                    },
                    Operation::MapRemoveByKey {
                        bin: "map".into(),
                        key: MapKey::Int(99),
                        ret: MapReturn::Index,
                    },
                ],
            )
            .await
            .unwrap();
        assert_eq!(out.results[0].as_index().unwrap(), 0);
        assert_eq!(out.results[1].as_index().unwrap(), -1);
    }

    #[tokio::test]
    async fn test_remove_by_value_range_is_owner_scoped() {
        let client = MockStoreClient::new();
        let entry = |owner: &str, expiry: i64| {
            Value::List(vec![Value::Str(owner.into()), Value::Int(expiry)])
        };
        client
            .operate(
                &WritePolicy::default(),
                &key(),
                &[Operation::MapPut {
                    bin: "lck".into(),
                    key: MapKey::Str("locked".into()),
                    value: entry("owner-b", 500),
                    mode: MapWriteMode::Upsert,
                }],
            )
            .await
            .unwrap();

        // owner-a's release range must not remove owner-b's entry.
        let out = client
            .operate(
                &WritePolicy::default(),
                &key(),
                &[Operation::MapRemoveByValueRange {
                    bin: "lck".into(),
                    begin: entry("owner-a", i64::MIN),
                    end: entry("owner-a", i64::MAX),
                    ret: MapReturn::Count,
                }],
            )
            .await
            .unwrap();
        assert_eq!(out.results[0].as_count().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batch_get_preserves_order_with_gaps() {
        let client = MockStoreClient::new();
        let a = RecordKey::new("test", "things", "a");
        let b = RecordKey::new("test", "things", "b");
        client
            .put(&WritePolicy::default(), &a, &[Bin::new("v", 1i64)])
            .await
            .unwrap();

        let results = client
            .batch_get(&[b.clone(), a.clone(), b])
            .await
            .unwrap();
        assert!(results[0].is_none());
        assert_eq!(results[1].as_ref().unwrap().int_bin("v"), Some(1));
        assert!(results[2].is_none());
    }
}
