//! FIFO queue repositories keyed by [`KeyGenerator`] keys.

use crate::bucket::{Bucket, Txn, REPLICAS, REPLICA_PENDENT, REPLICA_RETRY};
use crate::error::StoreResult;
use crate::keygen::KeyGenerator;
use crate::model::{Replica, ReplicaPendent, ReplicaRetry};

fn decode_key(raw: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let n = raw.len().min(8);
    buf[8 - n..].copy_from_slice(&raw[raw.len() - n..]);
    u64::from_be_bytes(buf)
}

/// Accepted replica queue.
pub struct Replicas<'t> {
    bucket: Bucket<'t>,
    keygen: &'t KeyGenerator,
}

impl<'t> Replicas<'t> {
    pub(crate) fn bind(txn: &'t Txn, keygen: &'t KeyGenerator) -> Self {
        Self {
            bucket: Bucket::new(txn, REPLICAS),
            keygen,
        }
    }

    /// Oldest record.
    pub fn first(&self) -> StoreResult<Option<Replica>> {
        Ok(self.bucket.first::<Replica>()?.map(|(raw, mut replica)| {
            replica.volume_replica_id = decode_key(&raw);
            replica
        }))
    }

    /// Appends `replica` under a freshly minted key and returns the stored record.
    pub fn create(&self, replica: &Replica) -> StoreResult<Replica> {
        let mut stored = replica.clone();
        stored.volume_replica_id = self.keygen.next();
        self.bucket
            .put(&KeyGenerator::encode(stored.volume_replica_id), &stored)?;
        Ok(stored)
    }

    /// Overwrites `replica` in place, keeping its queue position.
    pub fn create_or_replace(&self, replica: &Replica) -> StoreResult<()> {
        self.bucket
            .put(&KeyGenerator::encode(replica.volume_replica_id), replica)
    }

    /// Removes the record at `volume_replica_id`.
    pub fn delete(&self, volume_replica_id: u64) -> StoreResult<()> {
        self.bucket.delete(&KeyGenerator::encode(volume_replica_id))
    }

    /// Moves `replica` to the tail of the queue.
    pub fn requeue(&self, replica: &Replica) -> StoreResult<Replica> {
        self.delete(replica.volume_replica_id)?;
        self.create(replica)
    }

    /// Every queued record, oldest first.
    pub fn all(&self) -> StoreResult<Vec<Replica>> {
        Ok(self
            .bucket
            .entries::<Replica>()?
            .into_iter()
            .map(|(raw, mut replica)| {
                replica.volume_replica_id = decode_key(&raw);
                replica
            })
            .collect())
    }
}

/// Pendent placement queue.
pub struct ReplicaPendents<'t> {
    bucket: Bucket<'t>,
    keygen: &'t KeyGenerator,
}

impl<'t> ReplicaPendents<'t> {
    pub(crate) fn bind(txn: &'t Txn, keygen: &'t KeyGenerator) -> Self {
        Self {
            bucket: Bucket::new(txn, REPLICA_PENDENT),
            keygen,
        }
    }

    /// Oldest intent.
    pub fn first(&self) -> StoreResult<Option<ReplicaPendent>> {
        Ok(self
            .bucket
            .first::<ReplicaPendent>()?
            .map(|(raw, mut pendent)| {
                pendent.seq = decode_key(&raw);
                pendent
            }))
    }

    /// Appends `pendent` and returns the stored record.
    pub fn create(&self, pendent: &ReplicaPendent) -> StoreResult<ReplicaPendent> {
        let mut stored = pendent.clone();
        stored.seq = self.keygen.next();
        self.bucket.put(&KeyGenerator::encode(stored.seq), &stored)?;
        Ok(stored)
    }

    /// Removes the intent at `seq`.
    pub fn delete(&self, seq: u64) -> StoreResult<()> {
        self.bucket.delete(&KeyGenerator::encode(seq))
    }

    /// Number of queued intents.
    pub fn len(&self) -> StoreResult<usize> {
        Ok(self.bucket.entries::<ReplicaPendent>()?.len())
    }

    /// Returns true when nothing is queued.
    pub fn is_empty(&self) -> StoreResult<bool> {
        Ok(self.first()?.is_none())
    }
}

/// Deferred replica fetch queue on the accepting side.
pub struct ReplicaRetries<'t> {
    bucket: Bucket<'t>,
    keygen: &'t KeyGenerator,
}

impl<'t> ReplicaRetries<'t> {
    pub(crate) fn bind(txn: &'t Txn, keygen: &'t KeyGenerator) -> Self {
        Self {
            bucket: Bucket::new(txn, REPLICA_RETRY),
            keygen,
        }
    }

    /// Oldest retry.
    pub fn first(&self) -> StoreResult<Option<ReplicaRetry>> {
        Ok(self.bucket.first::<ReplicaRetry>()?.map(|(raw, mut retry)| {
            retry.seq = decode_key(&raw);
            retry
        }))
    }

    /// Appends `retry` and returns the stored record.
    pub fn create(&self, retry: &ReplicaRetry) -> StoreResult<ReplicaRetry> {
        let mut stored = retry.clone();
        stored.seq = self.keygen.next();
        self.bucket.put(&KeyGenerator::encode(stored.seq), &stored)?;
        Ok(stored)
    }

    /// Removes the retry at `seq`.
    pub fn delete(&self, seq: u64) -> StoreResult<()> {
        self.bucket.delete(&KeyGenerator::encode(seq))
    }

    /// Moves `retry` to the tail of the queue.
    pub fn requeue(&self, retry: &ReplicaRetry) -> StoreResult<ReplicaRetry> {
        self.delete(retry.seq)?;
        self.create(retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::create_buckets;
    use crate::model::File;
    use chrono::Utc;
    use redb::Database;
    use std::time::Duration;
    use tempfile::TempDir;

    fn open_db(dir: &TempDir) -> Database {
        let db = Database::create(dir.path().join("queue.db")).unwrap();
        create_buckets(&db).unwrap();
        db
    }

    fn pendent(key: &str, replica: u32) -> ReplicaPendent {
        let file = File::new("sig", key, 1, replica, Duration::ZERO, Utc::now());
        ReplicaPendent::for_file(&file, key, "owner", replica)
    }

    #[test]
    fn test_decode_key_round_trips_encode() {
        assert_eq!(decode_key(&KeyGenerator::encode(0x0102_0304_0506_0708)), 0x0102_0304_0506_0708);
    }

    #[test]
    fn test_replicas_fifo() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let keygen = KeyGenerator::new();
        let txn = Txn::Write(db.begin_write().unwrap());
        let replicas = Replicas::bind(&txn, &keygen);

        assert!(replicas.first().unwrap().is_none());
        let a = replicas.create(&Replica::from_pendent(&pendent("a", 3))).unwrap();
        let b = replicas.create(&Replica::from_pendent(&pendent("b", 3))).unwrap();
        assert!(a.volume_replica_id < b.volume_replica_id);
        assert_eq!(replicas.first().unwrap().unwrap().key, "a");

        let a = replicas.requeue(&a).unwrap();
        assert_eq!(replicas.first().unwrap().unwrap().key, "b");
        replicas.delete(b.volume_replica_id).unwrap();
        assert_eq!(replicas.first().unwrap().unwrap(), a);
    }

    #[test]
    fn test_replica_replace_keeps_position() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let keygen = KeyGenerator::new();
        let txn = Txn::Write(db.begin_write().unwrap());
        let replicas = Replicas::bind(&txn, &keygen);

        let mut a = replicas.create(&Replica::from_pendent(&pendent("a", 3))).unwrap();
        replicas.create(&Replica::from_pendent(&pendent("b", 3))).unwrap();
        a.count = 1;
        replicas.create_or_replace(&a).unwrap();
        let head = replicas.first().unwrap().unwrap();
        assert_eq!(head.key, "a");
        assert_eq!(head.count, 1);
        assert_eq!(replicas.all().unwrap().len(), 2);
    }

    #[test]
    fn test_pendents_fifo() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let keygen = KeyGenerator::new();
        let txn = Txn::Write(db.begin_write().unwrap());
        let pendents = ReplicaPendents::bind(&txn, &keygen);

        assert!(pendents.is_empty().unwrap());
        for key in ["x", "y", "z"] {
            pendents.create(&pendent(key, 2)).unwrap();
        }
        assert_eq!(pendents.len().unwrap(), 3);
        let head = pendents.first().unwrap().unwrap();
        assert_eq!(head.key, "x");
        pendents.delete(head.seq).unwrap();
        assert_eq!(pendents.first().unwrap().unwrap().key, "y");
    }

    #[test]
    fn test_retries_requeue() {
        let dir = TempDir::new().unwrap();
        let db = open_db(&dir);
        let keygen = KeyGenerator::new();
        let txn = Txn::Write(db.begin_write().unwrap());
        let retries = ReplicaRetries::bind(&txn, &keygen);

        let make = |key: &str| ReplicaRetry {
            pendent: pendent(key, 2),
            volume_id: "local".into(),
            attempts: 0,
            seq: 0,
        };
        let first = retries.create(&make("a")).unwrap();
        retries.create(&make("b")).unwrap();
        retries.requeue(&first).unwrap();
        assert_eq!(retries.first().unwrap().unwrap().pendent.key, "b");
    }
}
