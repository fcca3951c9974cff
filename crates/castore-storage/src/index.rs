//! Index repositories: files, keys, expiry buckets and peer volumes.
//!
//! Repositories only exist inside a unit of work, bound to its transaction.

use chrono::{DateTime, Duration, Utc};

use crate::bucket::{Bucket, Txn, FILES, IDX_KEYS, IDX_TTLS, IDX_VOLUMES};
use crate::error::{StoreError, StoreResult};
use crate::model::{expiry_key, timestamp_key, File, IdxKey, IdxTtl, IdxVolume};

/// How far back [`IdxTtls::filter`] looks for expired buckets.
pub const TTL_LOOKBACK_DAYS: i64 = 1;

/// Signature to [`File`] repository.
pub struct Files<'t> {
    bucket: Bucket<'t>,
}

impl<'t> Files<'t> {
    pub(crate) fn bind(txn: &'t Txn) -> Self {
        Self {
            bucket: Bucket::new(txn, FILES),
        }
    }

    /// Finds the record for `signature`.
    pub fn find_by_signature(&self, signature: &str) -> StoreResult<File> {
        self.find(signature)?
            .ok_or_else(|| StoreError::not_found(format!("file {}", signature)))
    }

    /// Finds the record for `signature`, `None` when absent.
    pub fn find(&self, signature: &str) -> StoreResult<Option<File>> {
        self.bucket.get(signature.as_bytes())
    }

    /// Upserts `file`.
    pub fn create_or_replace(&self, file: &File) -> StoreResult<()> {
        self.bucket.put(file.signature.as_bytes(), file)
    }

    /// Deletes the record for `signature`.
    pub fn delete(&self, signature: &str) -> StoreResult<()> {
        self.bucket.delete(signature.as_bytes())
    }

    /// Every record, ordered by signature.
    pub fn all(&self) -> StoreResult<Vec<File>> {
        Ok(self
            .bucket
            .entries()?
            .into_iter()
            .map(|(_, file)| file)
            .collect())
    }
}

/// User key to signature repository.
pub struct IdxKeys<'t> {
    bucket: Bucket<'t>,
}

impl<'t> IdxKeys<'t> {
    pub(crate) fn bind(txn: &'t Txn) -> Self {
        Self {
            bucket: Bucket::new(txn, IDX_KEYS),
        }
    }

    /// Finds the mapping for `key`.
    pub fn find_by_key(&self, key: &str) -> StoreResult<IdxKey> {
        self.find(key)?
            .ok_or_else(|| StoreError::not_found(format!("key {}", key)))
    }

    /// Finds the mapping for `key`, `None` when absent.
    pub fn find(&self, key: &str) -> StoreResult<Option<IdxKey>> {
        self.bucket.get(key.as_bytes())
    }

    /// Upserts a mapping.
    pub fn create_or_replace(&self, idx: &IdxKey) -> StoreResult<()> {
        self.bucket.put(idx.key.as_bytes(), idx)
    }

    /// Deletes the mapping for `key`.
    pub fn delete(&self, key: &str) -> StoreResult<()> {
        self.bucket.delete(key.as_bytes())
    }

    /// Every mapping, ordered by key.
    pub fn all(&self) -> StoreResult<Vec<IdxKey>> {
        Ok(self
            .bucket
            .entries()?
            .into_iter()
            .map(|(_, idx)| idx)
            .collect())
    }
}

/// Expiry bucket repository.
pub struct IdxTtls<'t> {
    bucket: Bucket<'t>,
}

impl<'t> IdxTtls<'t> {
    pub(crate) fn bind(txn: &'t Txn) -> Self {
        Self {
            bucket: Bucket::new(txn, IDX_TTLS),
        }
    }

    /// Finds the bucket for `expires_at`.
    pub fn find(&self, expires_at: DateTime<Utc>) -> StoreResult<Option<IdxTtl>> {
        self.bucket.get(expiry_key(expires_at).as_bytes())
    }

    /// Adds `signature` to the bucket for `expires_at`, creating it if needed.
    pub fn add_signature(&self, expires_at: DateTime<Utc>, signature: &str) -> StoreResult<()> {
        let key = expiry_key(expires_at);
        let mut idx = self
            .bucket
            .get(key.as_bytes())?
            .unwrap_or_else(|| IdxTtl::new(expires_at));
        if idx.add_signature(signature) {
            self.bucket.put(key.as_bytes(), &idx)?;
        }
        Ok(())
    }

    /// Removes `signature` from the bucket for `expires_at`; empty buckets are dropped.
    pub fn remove_signature(&self, expires_at: DateTime<Utc>, signature: &str) -> StoreResult<()> {
        let key = expiry_key(expires_at);
        let Some(mut idx) = self.bucket.get::<IdxTtl>(key.as_bytes())? else {
            return Ok(());
        };
        if !idx.remove_signature(signature) {
            return Ok(());
        }
        if idx.signatures.is_empty() {
            self.bucket.delete(key.as_bytes())
        } else {
            self.bucket.put(key.as_bytes(), &idx)
        }
    }

    /// Buckets expiring within `[as_of - 1 day, as_of]`, oldest first.
    ///
    /// Bucket keys are rounded up, so no returned file expires after `as_of`.
    pub fn filter(&self, as_of: DateTime<Utc>) -> StoreResult<Vec<IdxTtl>> {
        let lo = timestamp_key(as_of - Duration::days(TTL_LOOKBACK_DAYS));
        let hi = timestamp_key(as_of);
        Ok(self
            .bucket
            .range(lo.as_bytes(), hi.as_bytes())?
            .into_iter()
            .map(|(_, idx)| idx)
            .collect())
    }

    /// Deletes the bucket for `expires_at`.
    pub fn delete(&self, expires_at: DateTime<Utc>) -> StoreResult<()> {
        self.bucket.delete(expiry_key(expires_at).as_bytes())
    }
}

/// Peer volume to signatures repository.
pub struct IdxVolumes<'t> {
    bucket: Bucket<'t>,
}

impl<'t> IdxVolumes<'t> {
    pub(crate) fn bind(txn: &'t Txn) -> Self {
        Self {
            bucket: Bucket::new(txn, IDX_VOLUMES),
        }
    }

    /// Finds the entry for `volume_id`.
    pub fn find_by_volume_id(&self, volume_id: &str) -> StoreResult<Option<IdxVolume>> {
        self.bucket.get(volume_id.as_bytes())
    }

    /// Records that `volume_id` holds `signature`.
    pub fn add_signature(&self, volume_id: &str, signature: &str) -> StoreResult<()> {
        let mut idx = self
            .find_by_volume_id(volume_id)?
            .unwrap_or_else(|| IdxVolume::new(volume_id));
        if idx.add_signature(signature) {
            self.bucket.put(volume_id.as_bytes(), &idx)?;
        }
        Ok(())
    }

    /// Forgets that `volume_id` holds `signature`; empty entries are dropped.
    pub fn remove_signature(&self, volume_id: &str, signature: &str) -> StoreResult<()> {
        let Some(mut idx) = self.find_by_volume_id(volume_id)? else {
            return Ok(());
        };
        if !idx.remove_signature(signature) {
            return Ok(());
        }
        if idx.signatures.is_empty() {
            self.bucket.delete(volume_id.as_bytes())
        } else {
            self.bucket.put(volume_id.as_bytes(), &idx)
        }
    }

    /// Deletes the entry for `volume_id`.
    pub fn delete(&self, volume_id: &str) -> StoreResult<()> {
        self.bucket.delete(volume_id.as_bytes())
    }
}
