//! Record-level advisory locking over the store's atomic multi-op.
//!
//! The lock is a single entry `"locked" -> [owner, lease_expiry_ms]` inside a
//! designated lock bin of the record it protects. Keeping the lock inside the
//! protected record is what makes acquire + mutate + release composable into
//! one atomic multi-op; a separate lock record would break that atomicity.
//!
//! Leases bound the damage of a crashed holder: once a lease expires, any
//! waiter may take the lock over with a generation-checked forced write.
//! Correctness requires the lease to exceed the worst-case duration of a
//! single lock-scoped operation; a holder that outlives its lease can race a
//! takeover.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;
use uuid::Uuid;

use crate::client::{
    epoch_millis, MapReturn, MapWriteMode, OpOutput, OpResult, Operation, StoreClient,
    StoredRecord, WritePolicy,
};
use crate::error::{SubkeyIndexError, SubkeyIndexResult};
use crate::value::{MapKey, RecordKey, Value};

/// Map key of the lock entry inside the lock bin.
const LOCK_ENTRY_KEY: &str = "locked";

/// A lock-holder identity, stable for one logical operation.
///
/// Owners are minted explicitly rather than derived from the current thread:
/// async tasks migrate between threads across await points, so a thread id
/// does not identify an execution context. Re-acquiring with the same owner
/// is a no-op success (reentrance), and release removes only this owner's
/// entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LockOwner(String);

impl std::fmt::Display for LockOwner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Advisory lock manager for records in the store.
pub struct LockManager {
    client: Arc<dyn StoreClient>,
    lock_bin: String,
    lease_ms: u64,
    retry_ms: u64,
    session: String,
    next_owner: AtomicU64,
}

impl LockManager {
    /// Create a lock manager writing lock entries into `lock_bin`.
    pub fn new(
        client: Arc<dyn StoreClient>,
        lock_bin: impl Into<String>,
        lease_ms: u64,
        retry_ms: u64,
    ) -> Self {
        Self {
            client,
            lock_bin: lock_bin.into(),
            lease_ms,
            retry_ms: retry_ms.max(1),
            session: Uuid::new_v4().to_string(),
            next_owner: AtomicU64::new(0),
        }
    }

    /// Mint a fresh owner identity for one logical operation.
    pub fn new_owner(&self) -> LockOwner {
        let seq = self.next_owner.fetch_add(1, Ordering::Relaxed);
        LockOwner(format!("{}-{}", self.session, seq))
    }

    fn lock_entry_value(&self, owner: &LockOwner, now_ms: i64) -> Value {
        Value::List(vec![
            Value::Str(owner.0.clone()),
            Value::Int(now_ms + self.lease_ms as i64),
        ])
    }

    /// Operation that takes the lock, failing with `ElementExists` if held.
    pub(crate) fn acquire_operation(&self, owner: &LockOwner, now_ms: i64) -> Operation {
        Operation::MapPut {
            bin: self.lock_bin.clone(),
            key: MapKey::Str(LOCK_ENTRY_KEY.to_string()),
            value: self.lock_entry_value(owner, now_ms),
            mode: MapWriteMode::CreateOnly,
        }
    }

    /// Operation that drops this owner's lock entry (and nobody else's): a
    /// removal over the value range `[[owner, MIN], [owner, MAX])`.
    pub(crate) fn release_operation(&self, owner: &LockOwner) -> Operation {
        Operation::MapRemoveByValueRange {
            bin: self.lock_bin.clone(),
            begin: Value::List(vec![Value::Str(owner.0.clone()), Value::Int(i64::MIN)]),
            end: Value::List(vec![Value::Str(owner.0.clone()), Value::Int(i64::MAX)]),
            ret: MapReturn::Count,
        }
    }

    /// Acquire the lock on `key`, reading `bins` in the same atomic snapshot.
    ///
    /// Busy-waits (poll + sleep) while the lock is live, up to `timeout_ms`.
    /// Returns `None` when the record does not exist — the caller decides
    /// whether to create it. Re-acquiring a lock this owner already holds
    /// succeeds immediately.
    ///
    /// # Errors
    ///
    /// `LockTimeout` when the lock stayed held past the deadline; store
    /// errors are propagated.
    pub async fn acquire(
        &self,
        owner: &LockOwner,
        key: &RecordKey,
        timeout_ms: u64,
        bins: &[&str],
    ) -> SubkeyIndexResult<Option<StoredRecord>> {
        let start_ms = epoch_millis();
        let deadline_ms = start_ms + timeout_ms as i64;

        loop {
            let now_ms = epoch_millis();
            let mut ops = Vec::with_capacity(bins.len() + 1);
            ops.push(self.acquire_operation(owner, now_ms));
            for bin in bins {
                ops.push(Operation::Get {
                    bin: (*bin).to_string(),
                });
            }

            let policy = WritePolicy::update_only();
            match self.client.operate(&policy, key, &ops).await {
                Ok(out) => return Ok(Some(snapshot_from_reads(out, bins)?)),
                Err(e) if e.is_key_not_found() => return Ok(None),
                Err(e) if e.is_element_exists() => {
                    // Lock entry already present: reentrant hold, live
                    // contention, or an expired lease.
                }
                Err(e) => return Err(e),
            }

            let record = if bins.is_empty() {
                self.client.get(key, Some(&[self.lock_bin.as_str()])).await?
            } else {
                self.client.get(key, None).await?
            };
            let Some(record) = record else {
                // Record vanished between the failed put and the read; the
                // next acquire attempt observes the absence directly.
                continue;
            };

            let lock_entries = record.map_bin(&self.lock_bin).unwrap_or(&[]);
            let Some((holder, lease_expiry_ms)) = parse_lock_entry(lock_entries) else {
                // Released between the failed put and the read; retry now.
                continue;
            };

            if holder == owner.0 {
                return Ok(Some(record));
            }

            let now_ms = epoch_millis();
            if now_ms < lease_expiry_ms {
                if timeout_ms > 0 && now_ms >= deadline_ms {
                    return Err(SubkeyIndexError::LockTimeout {
                        key: key.describe(),
                        waited_ms: (now_ms - start_ms) as u64,
                    });
                }
                sleep(Duration::from_millis(self.retry_ms)).await;
                continue;
            }

            // The lease has expired; force the entry over with a generation
            // check so exactly one waiter wins the takeover.
            debug!(
                key = %key.describe(),
                holder = %holder,
                lease_expiry_ms,
                "taking over expired lock lease"
            );
            let mut ops = Vec::with_capacity(bins.len() + 1);
            ops.push(Operation::MapPut {
                bin: self.lock_bin.clone(),
                key: MapKey::Str(LOCK_ENTRY_KEY.to_string()),
                value: self.lock_entry_value(owner, now_ms),
                mode: MapWriteMode::Upsert,
            });
            for bin in bins {
                ops.push(Operation::Get {
                    bin: (*bin).to_string(),
                });
            }
            let policy = WritePolicy::update_only().with_generation(record.generation);
            match self.client.operate(&policy, key, &ops).await {
                Ok(out) => return Ok(Some(snapshot_from_reads(out, bins)?)),
                Err(e) if e.is_generation_mismatch() => {
                    // Another waiter won the takeover; go around again.
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Release the lock on `key` if this owner holds it.
    ///
    /// Returns `true` iff exactly one entry (ours) was removed. Foreign
    /// owners' entries are never touched.
    pub async fn release(&self, owner: &LockOwner, key: &RecordKey) -> SubkeyIndexResult<bool> {
        self.update_and_release(owner, key, None, Vec::new()).await
    }

    /// Apply `ops` and release the lock as one atomic multi-op, optionally
    /// under a generation check taken at acquire time.
    ///
    /// Returns `true` iff this owner's lock entry was removed.
    pub async fn update_and_release(
        &self,
        owner: &LockOwner,
        key: &RecordKey,
        expected_generation: Option<u32>,
        ops: Vec<Operation>,
    ) -> SubkeyIndexResult<bool> {
        let mut all_ops = ops;
        all_ops.push(self.release_operation(owner));
        let mut policy = WritePolicy::default();
        policy.generation = expected_generation;
        let out = self.client.operate(&policy, key, &all_ops).await?;
        let removed = match out.results.last() {
            Some(r) => r.as_count()?,
            None => 0,
        };
        Ok(removed == 1)
    }

    /// Perform `ops` under the record's lock: `[acquire, ops…, release]` as a
    /// single atomic multi-op, so the lock is never observably held by this
    /// caller between store round trips.
    ///
    /// On contention (`ElementExists` at the acquire step) the whole multi-op
    /// is retried per the policy's `max_retries` / `sleep_between_retries_ms`,
    /// within `total_timeout_ms` when set. Exhaustion surfaces as
    /// `LockTimeout`; any other error propagates unchanged.
    ///
    /// Returns the caller ops' results (acquire and release stripped).
    pub async fn perform_under_lock(
        &self,
        policy: &WritePolicy,
        key: &RecordKey,
        ops: Vec<Operation>,
    ) -> SubkeyIndexResult<Vec<OpResult>> {
        let owner = self.new_owner();
        let start_ms = epoch_millis();
        let deadline_ms = if policy.total_timeout_ms > 0 {
            Some(start_ms + policy.total_timeout_ms as i64)
        } else {
            None
        };

        let mut attempt: u32 = 0;
        loop {
            let now_ms = epoch_millis();
            let mut all_ops = Vec::with_capacity(ops.len() + 2);
            all_ops.push(self.acquire_operation(&owner, now_ms));
            all_ops.extend(ops.iter().cloned());
            all_ops.push(self.release_operation(&owner));

            match self.client.operate(policy, key, &all_ops).await {
                Ok(mut out) => {
                    out.results.pop();
                    out.results.remove(0);
                    return Ok(out.results);
                }
                Err(e) if e.is_element_exists() => {
                    attempt += 1;
                    let now_ms = epoch_millis();
                    let deadline_passed = deadline_ms
                        .map(|d| now_ms + policy.sleep_between_retries_ms as i64 >= d)
                        .unwrap_or(false);
                    if attempt > policy.max_retries || deadline_passed {
                        return Err(SubkeyIndexError::LockTimeout {
                            key: key.describe(),
                            waited_ms: (now_ms - start_ms) as u64,
                        });
                    }
                    if policy.sleep_between_retries_ms > 0 {
                        sleep(Duration::from_millis(policy.sleep_between_retries_ms)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Build a record snapshot from the read results trailing an acquire op.
fn snapshot_from_reads(out: OpOutput, bins: &[&str]) -> SubkeyIndexResult<StoredRecord> {
    let mut record = StoredRecord {
        generation: out.generation,
        bins: Default::default(),
    };
    for (i, bin) in bins.iter().enumerate() {
        if let Some(value) = out.results[i + 1].as_bin()? {
            record.bins.insert((*bin).to_string(), value.clone());
        }
    }
    Ok(record)
}

/// Parse `[owner, lease_expiry]` out of the lock bin's entries.
fn parse_lock_entry(entries: &[(MapKey, Value)]) -> Option<(String, i64)> {
    let (_, value) = entries
        .iter()
        .find(|(k, _)| matches!(k, MapKey::Str(s) if s == LOCK_ENTRY_KEY))?;
    let items = value.as_list()?;
    match items {
        [Value::Str(owner), Value::Int(expiry)] => Some((owner.clone(), *expiry)),
        _ => None,
    }
}
