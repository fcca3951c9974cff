//! Records persisted in the volume indexes and queues.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};

/// Serializes a [`Duration`] as whole seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    /// Serializes `d` as its whole seconds.
    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    /// Deserializes whole seconds into a [`Duration`].
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Encodes a timestamp as an RFC3339 string at second precision.
///
/// Keys built this way sort lexicographically in time order.
pub fn timestamp_key(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Key of the expiry bucket holding `expires_at`.
///
/// The instant is rounded up to a whole second so a bucket only comes due
/// once every file in it has expired.
pub fn expiry_key(expires_at: DateTime<Utc>) -> String {
    let floor = expires_at.trunc_subsecs(0);
    if floor < expires_at {
        timestamp_key(floor + chrono::Duration::seconds(1))
    } else {
        timestamp_key(floor)
    }
}

/// Decodes a key produced by [`timestamp_key`].
pub fn parse_timestamp_key(key: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(key)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidState(format!("bad timestamp key {:?}: {}", key, e)))
}

fn push_unique(list: &mut Vec<String>, value: &str) -> bool {
    if list.iter().any(|v| v == value) {
        false
    } else {
        list.push(value.to_string());
        true
    }
}

fn remove_value(list: &mut Vec<String>, value: &str) -> bool {
    let before = list.len();
    list.retain(|v| v != value);
    list.len() != before
}

/// Content-addressed file record, keyed by signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    /// Lowercase hex SHA-1 of the content.
    pub signature: String,
    /// User keys pointing at this content, in insertion order.
    pub keys: Vec<String>,
    /// Peer volumes known to hold this content, never including this volume.
    pub volume_ids: Vec<String>,
    /// Desired total copies including the owner; 0 disables replication.
    pub replica: u32,
    /// Content length in bytes.
    pub size: u64,
    /// Creation time of the content.
    pub created_at: DateTime<Utc>,
    /// Lifetime measured from `created_at`; zero never expires.
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
}

impl File {
    /// Creates a record holding a single key.
    pub fn new(
        signature: impl Into<String>,
        key: impl Into<String>,
        size: u64,
        replica: u32,
        ttl: Duration,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            signature: signature.into(),
            keys: vec![key.into()],
            volume_ids: Vec::new(),
            replica,
            size,
            created_at,
            ttl,
        }
    }

    /// Returns true if `key` references this content.
    pub fn has_key(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }

    /// Adds `key`; returns false if it was already present.
    pub fn add_key(&mut self, key: &str) -> bool {
        push_unique(&mut self.keys, key)
    }

    /// Removes `key`; returns false if it was absent.
    pub fn remove_key(&mut self, key: &str) -> bool {
        remove_value(&mut self.keys, key)
    }

    /// Adds a holder volume; returns false if it was already known.
    pub fn add_volume_id(&mut self, volume_id: &str) -> bool {
        push_unique(&mut self.volume_ids, volume_id)
    }

    /// Removes a holder volume; returns false if it was unknown.
    pub fn remove_volume_id(&mut self, volume_id: &str) -> bool {
        remove_value(&mut self.volume_ids, volume_id)
    }

    /// Expiry instant, or `None` when the record never expires.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        if self.ttl.is_zero() {
            return None;
        }
        let ttl = chrono::Duration::from_std(self.ttl).ok()?;
        self.created_at.checked_add_signed(ttl)
    }
}

/// User key to signature mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdxKey {
    /// User key.
    pub key: String,
    /// Signature of the content the key points at.
    pub signature: String,
}

impl IdxKey {
    /// Creates a mapping.
    pub fn new(key: impl Into<String>, signature: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            signature: signature.into(),
        }
    }
}

/// Expiry bucket: every signature expiring at the same second.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdxTtl {
    /// Bucket instant.
    pub expires_at: DateTime<Utc>,
    /// Signatures in the bucket, each at most once.
    pub signatures: Vec<String>,
}

impl IdxTtl {
    /// Creates an empty bucket.
    pub fn new(expires_at: DateTime<Utc>) -> Self {
        Self {
            expires_at,
            signatures: Vec::new(),
        }
    }

    /// Adds a signature; idempotent.
    pub fn add_signature(&mut self, signature: &str) -> bool {
        push_unique(&mut self.signatures, signature)
    }

    /// Removes a signature.
    pub fn remove_signature(&mut self, signature: &str) -> bool {
        remove_value(&mut self.signatures, signature)
    }
}

/// Signatures known to be replicated on a peer volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdxVolume {
    /// Peer volume id.
    pub volume_id: String,
    /// Signatures held there.
    pub signatures: Vec<String>,
}

impl IdxVolume {
    /// Creates an empty entry.
    pub fn new(volume_id: impl Into<String>) -> Self {
        Self {
            volume_id: volume_id.into(),
            signatures: Vec::new(),
        }
    }

    /// Adds a signature; idempotent.
    pub fn add_signature(&mut self, signature: &str) -> bool {
        push_unique(&mut self.signatures, signature)
    }

    /// Removes a signature.
    pub fn remove_signature(&mut self, signature: &str) -> bool {
        remove_value(&mut self.signatures, signature)
    }
}

/// Intent to place additional copies of a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaPendent {
    /// Unique intent id.
    pub id: Uuid,
    /// Requested total copies including the owner.
    pub replica: u32,
    /// User key to replicate.
    pub key: String,
    /// Content signature.
    pub signature: String,
    /// Owner volume id.
    pub volume_id: String,
    /// Lifetime carried to replicas.
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
    /// Creation time carried to replicas.
    pub created_at: DateTime<Utc>,
    /// Queue position; minted on insert.
    #[serde(default)]
    pub seq: u64,
}

impl ReplicaPendent {
    /// Creates an intent for `file` under `key`, owned by `volume_id`.
    pub fn for_file(file: &File, key: &str, volume_id: &str, replica: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            replica,
            key: key.to_string(),
            signature: file.signature.clone(),
            volume_id: volume_id.to_string(),
            ttl: file.ttl,
            created_at: file.created_at,
            seq: 0,
        }
    }
}

/// Accepted placement the owner still has to push to peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    /// Unique record id.
    pub id: Uuid,
    /// User key to replicate.
    pub key: String,
    /// Content signature.
    pub signature: String,
    /// Owner volume id.
    pub volume_id: String,
    /// Lifetime carried to replicas.
    #[serde(with = "duration_secs")]
    pub ttl: Duration,
    /// Creation time carried to replicas.
    pub created_at: DateTime<Utc>,
    /// Requested total copies including the owner.
    pub original_count: u32,
    /// Copies still to place.
    pub count: u32,
    /// Every volume already holding the key, owner included.
    pub volume_ids: Vec<String>,
    /// Queue position; minted on insert.
    #[serde(default)]
    pub volume_replica_id: u64,
}

impl Replica {
    /// Turns a popped pendent into an accepted record.
    ///
    /// The owner already holds one copy, so `count` starts at `replica - 1`.
    pub fn from_pendent(pendent: &ReplicaPendent) -> Self {
        Self {
            id: pendent.id,
            key: pendent.key.clone(),
            signature: pendent.signature.clone(),
            volume_id: pendent.volume_id.clone(),
            ttl: pendent.ttl,
            created_at: pendent.created_at,
            original_count: pendent.replica,
            count: pendent.replica.saturating_sub(1),
            volume_ids: vec![pendent.volume_id.clone()],
            volume_replica_id: 0,
        }
    }

    /// Records a new holder; returns false if it was already listed.
    pub fn add_volume_id(&mut self, volume_id: &str) -> bool {
        push_unique(&mut self.volume_ids, volume_id)
    }
}

/// A replica push the accepting side could not store and must fetch again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaRetry {
    /// The placement to satisfy; `pendent.volume_id` is the owner to fetch from.
    pub pendent: ReplicaPendent,
    /// Local volume expected to store the copy.
    pub volume_id: String,
    /// Failed attempts so far.
    #[serde(default)]
    pub attempts: u32,
    /// Queue position; minted on insert.
    #[serde(default)]
    pub seq: u64,
}

/// Capacity snapshot of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    /// Volume root.
    pub mountpoint: String,
    /// Size of the underlying filesystem in bytes.
    pub system_total: u64,
    /// Bytes used on the underlying filesystem.
    pub system_used: u64,
    /// Configured volume size in bytes; -1 means unbounded.
    pub volume_total: i64,
    /// Bytes of content stored by this volume.
    pub volume_used: u64,
    /// Last refresh.
    pub updated_at: DateTime<Utc>,
}

impl State {
    /// Marker for an unbounded volume.
    pub const UNBOUNDED: i64 = -1;

    /// Creates a snapshot for `mountpoint` with no content.
    pub fn new(mountpoint: impl Into<String>, volume_total: i64) -> Self {
        Self {
            mountpoint: mountpoint.into(),
            system_total: 0,
            system_used: 0,
            volume_total,
            volume_used: 0,
            updated_at: Utc::now(),
        }
    }

    fn unbounded(&self) -> bool {
        self.volume_total == Self::UNBOUNDED
    }

    /// Effective size: the filesystem size when unbounded, else the volume size.
    pub fn total_size(&self) -> u64 {
        if self.unbounded() {
            self.system_total
        } else {
            self.volume_total.max(0) as u64
        }
    }

    /// Effective usage matching [`State::total_size`].
    pub fn used_size(&self) -> u64 {
        if self.unbounded() {
            self.system_used
        } else {
            self.volume_used
        }
    }

    /// Bytes still available.
    pub fn available(&self) -> u64 {
        self.total_size().saturating_sub(self.used_size())
    }

    /// Accounts `bytes` of new content, failing when it does not fit.
    ///
    /// An unbounded volume whose filesystem size is unknown accepts any write.
    pub fn reserve(&mut self, bytes: u64) -> StoreResult<()> {
        let unknown = self.unbounded() && self.system_total == 0;
        if !unknown && self.used_size().saturating_add(bytes) > self.total_size() {
            return Err(StoreError::CapacityExhausted {
                requested: bytes,
                available: self.available(),
            });
        }
        self.volume_used = self.volume_used.saturating_add(bytes);
        Ok(())
    }

    /// Releases `bytes` of removed content.
    pub fn release(&mut self, bytes: u64) {
        self.volume_used = self.volume_used.saturating_sub(bytes);
    }
}
