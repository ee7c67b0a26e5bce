//! Store value model: record keys, map keys, values and digests.
//!
//! The store orders map keys (and values, for value-range operations) across
//! types: integers sort before strings, strings before bytes and so on, with
//! a dedicated `Infinity` sentinel sorting after everything. The sentinel is
//! what lets a delete keep its block map observably non-empty for the
//! duration of one atomic multi-op.

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;

use crate::error::{SubkeyIndexError, SubkeyIndexResult};

/// The store's content-independent record identifier.
pub type Digest = Bytes;

/// User-supplied part of a record key. Parents of a subkey ordering must be
/// string- or integer-keyed so satellite key strings can be derived.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum UserKey {
    /// Integer key.
    Int(i64),
    /// String key.
    Str(String),
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserKey::Int(i) => write!(f, "{}", i),
            UserKey::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for UserKey {
    fn from(v: i64) -> Self {
        UserKey::Int(v)
    }
}

impl From<&str> for UserKey {
    fn from(v: &str) -> Self {
        UserKey::Str(v.to_string())
    }
}

impl From<String> for UserKey {
    fn from(v: String) -> Self {
        UserKey::Str(v)
    }
}

/// How a record key addresses its record: by user key or directly by digest.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum KeyIdent {
    /// Address by namespace/set/user-key; the digest is derived.
    User(UserKey),
    /// Address by a previously computed digest.
    Digest(Digest),
}

/// Full address of a record in the store.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RecordKey {
    /// Namespace holding the record.
    pub namespace: String,
    /// Set (table) name within the namespace.
    pub set_name: String,
    /// User key or digest.
    pub ident: KeyIdent,
}

impl RecordKey {
    /// Create a key addressed by user key.
    pub fn new(
        namespace: impl Into<String>,
        set_name: impl Into<String>,
        user_key: impl Into<UserKey>,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            set_name: set_name.into(),
            ident: KeyIdent::User(user_key.into()),
        }
    }

    /// Create a key addressed directly by digest.
    pub fn from_digest(
        namespace: impl Into<String>,
        set_name: impl Into<String>,
        digest: Digest,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            set_name: set_name.into(),
            ident: KeyIdent::Digest(digest),
        }
    }

    /// The user key, if this key is user-key addressed.
    pub fn user_key(&self) -> Option<&UserKey> {
        match &self.ident {
            KeyIdent::User(u) => Some(u),
            KeyIdent::Digest(_) => None,
        }
    }

    /// Human-readable description for error messages.
    pub fn describe(&self) -> String {
        match &self.ident {
            KeyIdent::User(u) => format!("{}/{}/{}", self.namespace, self.set_name, u),
            KeyIdent::Digest(d) => {
                format!("{}/{}/digest:{:02x?}", self.namespace, self.set_name, &d[..4.min(d.len())])
            }
        }
    }
}

/// A key in a key-ordered map bin.
///
/// `Infinity` sorts after every real key; it exists for the delete protocol's
/// transient sentinel entry and never appears in a stable block map.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MapKey {
    /// Integer map key.
    Int(i64),
    /// String map key.
    Str(String),
    /// Sorts after everything.
    Infinity,
}

impl MapKey {
    fn type_rank(&self) -> u8 {
        match self {
            MapKey::Int(_) => 0,
            MapKey::Str(_) => 1,
            MapKey::Infinity => 2,
        }
    }
}

impl Ord for MapKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (MapKey::Int(a), MapKey::Int(b)) => a.cmp(b),
            (MapKey::Str(a), MapKey::Str(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialOrd for MapKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MapKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MapKey::Int(i) => write!(f, "{}", i),
            MapKey::Str(s) => write!(f, "{}", s),
            MapKey::Infinity => write!(f, "<inf>"),
        }
    }
}

/// A value in a record bin or map entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    /// Integer value.
    Int(i64),
    /// String value.
    Str(String),
    /// Byte-blob value (digests travel as this).
    Bytes(Bytes),
    /// Ordered list value.
    List(Vec<Value>),
    /// Key-ordered map value, sorted by key.
    Map(Vec<(MapKey, Value)>),
    /// Sorts after everything; pairs with `MapKey::Infinity` in the delete
    /// sentinel entry.
    Infinity,
}

impl Value {
    fn type_rank(&self) -> u8 {
        match self {
            Value::Int(_) => 0,
            Value::Str(_) => 1,
            Value::Bytes(_) => 2,
            Value::List(_) => 3,
            Value::Map(_) => 4,
            Value::Infinity => 5,
        }
    }

    /// Integer accessor.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// String accessor.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Bytes accessor.
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// List accessor.
    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Map-entries accessor.
    pub fn as_map(&self) -> Option<&[(MapKey, Value)]> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::List(a), Value::List(b)) => a.cmp(b),
            (Value::Map(a), Value::Map(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Value::Bytes(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::List(v)
    }
}

impl From<&MapKey> for Value {
    fn from(k: &MapKey) -> Self {
        match k {
            MapKey::Int(i) => Value::Int(*i),
            MapKey::Str(s) => Value::Str(s.clone()),
            MapKey::Infinity => Value::Infinity,
        }
    }
}

/// A named bin and its value, for record-level writes.
#[derive(Clone, Debug, PartialEq)]
pub struct Bin {
    /// Bin name.
    pub name: String,
    /// Bin value.
    pub value: Value,
}

impl Bin {
    /// Create a bin.
    pub fn new(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Sort keys the index can order: convertible to and from store map keys.
///
/// Implemented for `i64` and `String`. Callers needing non-unique sort keys
/// encode a tiebreak into the key itself (e.g. `"{score}-{id}"`).
pub trait SortKey: Clone + Ord + Send + Sync + fmt::Debug {
    /// Convert to the store's map-key representation.
    fn to_map_key(&self) -> MapKey;

    /// Convert back from the store's map-key representation. Returns `None`
    /// for a key of a foreign type (or the infinity sentinel).
    fn from_map_key(key: &MapKey) -> Option<Self>;
}

impl SortKey for i64 {
    fn to_map_key(&self) -> MapKey {
        MapKey::Int(*self)
    }

    fn from_map_key(key: &MapKey) -> Option<Self> {
        match key {
            MapKey::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl SortKey for String {
    fn to_map_key(&self) -> MapKey {
        MapKey::Str(self.clone())
    }

    fn from_map_key(key: &MapKey) -> Option<Self> {
        match key {
            MapKey::Str(s) => Some(s.clone()),
            _ => None,
        }
    }
}

/// High-quality hash function used as the digest mixer.
///
/// SplitMix64 is a fast, non-cryptographic hash function with excellent
/// statistical properties.
pub fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Deterministic 20-byte digest over `(set_name, user_key)`.
///
/// The namespace is deliberately excluded: a record's digest is stable across
/// namespaces, matching stores that address replicas of a set by digest.
pub(crate) fn compute_digest(set_name: &str, user_key: &UserKey) -> Digest {
    let mut h: u64 = 0x5375624B65794D61; // arbitrary fixed seed
    for b in set_name.as_bytes() {
        h = splitmix64(h ^ u64::from(*b));
    }
    // Distinguish integer keys from their decimal string spelling.
    match user_key {
        UserKey::Int(i) => {
            h = splitmix64(h ^ 0x01);
            h = splitmix64(h ^ (*i as u64));
        }
        UserKey::Str(s) => {
            h = splitmix64(h ^ 0x02);
            for b in s.as_bytes() {
                h = splitmix64(h ^ u64::from(*b));
            }
        }
    }
    let mut out = Vec::with_capacity(20);
    let mut lane = h;
    for _ in 0..3 {
        lane = splitmix64(lane);
        out.extend_from_slice(&lane.to_be_bytes());
    }
    out.truncate(20);
    Bytes::from(out)
}

/// Fragment of a map key usable in a derived record-key string.
pub(crate) fn map_key_fragment(key: &MapKey) -> SubkeyIndexResult<String> {
    match key {
        MapKey::Int(i) => Ok(i.to_string()),
        MapKey::Str(s) => Ok(s.clone()),
        MapKey::Infinity => Err(SubkeyIndexError::invalid_argument(
            "the infinity sentinel cannot name a data record",
        )),
    }
}
