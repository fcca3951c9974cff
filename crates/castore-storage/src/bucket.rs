//! redb table definitions and the transaction-bound bucket handle.

use redb::{
    Database, ReadTransaction, ReadableTable, TableDefinition, TableHandle, WriteTransaction,
};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{StoreError, StoreResult};

/// Table alias: every bucket maps raw bytes to JSON bytes.
pub type BucketDef = TableDefinition<'static, &'static [u8], &'static [u8]>;

/// Signature to [`crate::model::File`].
pub const FILES: BucketDef = TableDefinition::new("files");
/// User key to [`crate::model::IdxKey`].
pub const IDX_KEYS: BucketDef = TableDefinition::new("idxkeys");
/// RFC3339 expiry to [`crate::model::IdxTtl`].
pub const IDX_TTLS: BucketDef = TableDefinition::new("idxttls");
/// Peer volume id to [`crate::model::IdxVolume`].
pub const IDX_VOLUMES: BucketDef = TableDefinition::new("idxvolumes");
/// Queue key to [`crate::model::Replica`].
pub const REPLICAS: BucketDef = TableDefinition::new("replica");
/// Queue key to [`crate::model::ReplicaPendent`].
pub const REPLICA_PENDENT: BucketDef = TableDefinition::new("replica-pendent");
/// Queue key to [`crate::model::ReplicaRetry`].
pub const REPLICA_RETRY: BucketDef = TableDefinition::new("replica-retry");
/// Volume state and identity.
pub const STATE: BucketDef = TableDefinition::new("state");

/// Every bucket of a volume database.
pub const ALL_BUCKETS: [BucketDef; 8] = [
    FILES,
    IDX_KEYS,
    IDX_TTLS,
    IDX_VOLUMES,
    REPLICAS,
    REPLICA_PENDENT,
    REPLICA_RETRY,
    STATE,
];

/// Creates every bucket so read transactions can always open them.
pub fn create_buckets(db: &Database) -> StoreResult<()> {
    let txn = db.begin_write()?;
    for def in ALL_BUCKETS {
        txn.open_table(def)?;
    }
    txn.commit()?;
    Ok(())
}

/// The database transaction of one unit of work.
pub enum Txn {
    /// Shared snapshot.
    Read(ReadTransaction),
    /// Exclusive writer.
    Write(WriteTransaction),
}

impl Txn {
    /// Returns true for a write transaction.
    pub fn is_write(&self) -> bool {
        matches!(self, Txn::Write(_))
    }

    /// Commits a write transaction; a read transaction is simply released.
    pub fn commit(self) -> StoreResult<()> {
        match self {
            Txn::Read(_) => Ok(()),
            Txn::Write(txn) => Ok(txn.commit()?),
        }
    }

    /// Discards every change.
    pub fn abort(self) -> StoreResult<()> {
        match self {
            Txn::Read(_) => Ok(()),
            Txn::Write(txn) => Ok(txn.abort()?),
        }
    }
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn read_get<T, R>(table: &R, key: &[u8]) -> StoreResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static [u8], &'static [u8]>,
{
    match table.get(key)? {
        Some(value) => Ok(Some(decode(value.value())?)),
        None => Ok(None),
    }
}

fn read_first<T, R>(table: &R) -> StoreResult<Option<(Vec<u8>, T)>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static [u8], &'static [u8]>,
{
    match table.first()? {
        Some((key, value)) => Ok(Some((key.value().to_vec(), decode(value.value())?))),
        None => Ok(None),
    }
}

fn read_range<T, R>(table: &R, lo: &[u8], hi: &[u8]) -> StoreResult<Vec<(Vec<u8>, T)>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static [u8], &'static [u8]>,
{
    let mut out = Vec::new();
    for entry in table.range(lo..=hi)? {
        let (key, value) = entry?;
        out.push((key.value().to_vec(), decode(value.value())?));
    }
    Ok(out)
}

fn read_all<T, R>(table: &R) -> StoreResult<Vec<(Vec<u8>, T)>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static [u8], &'static [u8]>,
{
    let mut out = Vec::new();
    for entry in table.iter()? {
        let (key, value) = entry?;
        out.push((key.value().to_vec(), decode(value.value())?));
    }
    Ok(out)
}

/// One bucket bound to the transaction of the current unit of work.
///
/// The underlying table is opened per call, so several buckets of the same
/// transaction can be used side by side.
pub struct Bucket<'t> {
    txn: &'t Txn,
    def: BucketDef,
}

impl<'t> Bucket<'t> {
    /// Binds `def` to `txn`.
    pub fn new(txn: &'t Txn, def: BucketDef) -> Self {
        Self { txn, def }
    }

    /// Bucket name.
    pub fn name(&self) -> &str {
        self.def.name()
    }

    fn writer(&self) -> StoreResult<&'t WriteTransaction> {
        match self.txn {
            Txn::Write(txn) => Ok(txn),
            Txn::Read(_) => Err(StoreError::InvalidState(format!(
                "bucket {} is read-only in a read unit of work",
                self.def.name()
            ))),
        }
    }

    /// Decodes the value stored at `key`.
    pub fn get<T: DeserializeOwned>(&self, key: &[u8]) -> StoreResult<Option<T>> {
        match self.txn {
            Txn::Read(txn) => read_get(&txn.open_table(self.def)?, key),
            Txn::Write(txn) => read_get(&txn.open_table(self.def)?, key),
        }
    }

    /// Entry with the smallest key.
    pub fn first<T: DeserializeOwned>(&self) -> StoreResult<Option<(Vec<u8>, T)>> {
        match self.txn {
            Txn::Read(txn) => read_first(&txn.open_table(self.def)?),
            Txn::Write(txn) => read_first(&txn.open_table(self.def)?),
        }
    }

    /// Entries with keys in `lo..=hi`, ascending.
    pub fn range<T: DeserializeOwned>(&self, lo: &[u8], hi: &[u8]) -> StoreResult<Vec<(Vec<u8>, T)>> {
        if lo > hi {
            return Ok(Vec::new());
        }
        match self.txn {
            Txn::Read(txn) => read_range(&txn.open_table(self.def)?, lo, hi),
            Txn::Write(txn) => read_range(&txn.open_table(self.def)?, lo, hi),
        }
    }

    /// Every entry, ascending by key.
    pub fn entries<T: DeserializeOwned>(&self) -> StoreResult<Vec<(Vec<u8>, T)>> {
        match self.txn {
            Txn::Read(txn) => read_all(&txn.open_table(self.def)?),
            Txn::Write(txn) => read_all(&txn.open_table(self.def)?),
        }
    }

    /// Upserts `value` at `key`.
    pub fn put<T: Serialize>(&self, key: &[u8], value: &T) -> StoreResult<()> {
        let bytes = serde_json::to_vec(value)?;
        let mut table = self.writer()?.open_table(self.def)?;
        table.insert(key, bytes.as_slice())?;
        Ok(())
    }

    /// Removes `key`; absent keys are not an error.
    pub fn delete(&self, key: &[u8]) -> StoreResult<()> {
        let mut table = self.writer()?.open_table(self.def)?;
        table.remove(key)?;
        Ok(())
    }
}
