//! Upload record persistence
//!
//! [`UploadRepository`] is the seam the orchestrator writes through;
//! [`SledUploadRepository`] keeps records in sled, bincode encoded, with a
//! per-object index ordered by upload time.

use std::path::Path;

use parking_lot::Mutex;
use sled::{Db, Tree};
use tracing::{debug, info};

use super::model::UploadRecord;
use crate::error::{Error, Result};

/// Persistence for [`UploadRecord`]s.
///
/// `Ok(None)` means not found; `Err` is a persistence failure.
pub trait UploadRepository: Send + Sync {
    /// Store a new record; fails if a record with the same id exists
    fn insert(&self, record: &UploadRecord) -> Result<()>;

    /// Store or replace a record
    fn save(&self, record: &UploadRecord) -> Result<()>;

    /// Remove a record (no-op if absent)
    fn delete(&self, record_id: &str) -> Result<()>;

    fn find(&self, record_id: &str) -> Result<Option<UploadRecord>>;

    /// Latest successful record of an object
    fn find_current(&self, object_id: &str) -> Result<Option<UploadRecord>>;

    /// Every record of an object, oldest first
    fn find_by_object(&self, object_id: &str) -> Result<Vec<UploadRecord>>;
}

/// sled-backed record store
pub struct SledUploadRepository {
    db: Db,
    /// record id -> bincode(UploadRecord)
    records: Tree,
    /// object id \0 timestamp \0 record id -> ()
    by_object: Tree,
    /// Serializes writers so the index follows the records
    write_lock: Mutex<()>,
}

impl SledUploadRepository {
    /// Open or create the database at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let repo = Self::with_db(db)?;
        info!(
            "Upload repository opened at {:?} ({} records)",
            path.as_ref(),
            repo.records.len()
        );
        Ok(repo)
    }

    /// In-memory database (for testing)
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db)
    }

    fn with_db(db: Db) -> Result<Self> {
        let records = db.open_tree("upload_records")?;
        let by_object = db.open_tree("upload_records_by_object")?;
        Ok(Self {
            db,
            records,
            by_object,
            write_lock: Mutex::new(()),
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }

    fn object_prefix(object_id: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(object_id.len() + 1);
        key.extend_from_slice(object_id.as_bytes());
        key.push(0);
        key
    }

    /// Index keys sort by object, then upload time, then record id
    fn index_key(record: &UploadRecord) -> Vec<u8> {
        // Flip the sign bit so negative timestamps still sort first
        let micros = (record.timestamp.timestamp_micros() as u64) ^ (1 << 63);
        let mut key = Self::object_prefix(&record.object_id);
        key.extend_from_slice(&micros.to_be_bytes());
        key.push(0);
        key.extend_from_slice(record.id.as_bytes());
        key
    }

    fn load(&self, record_id: &[u8]) -> Result<Option<UploadRecord>> {
        match self.records.get(record_id)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn record_id_from_index(&self, key: &[u8], object_id: &str) -> Vec<u8> {
        // prefix, 8 timestamp bytes, separator
        key[object_id.len() + 1 + 8 + 1..].to_vec()
    }

    fn write(&self, record: &UploadRecord) -> Result<()> {
        if let Some(previous) = self.load(record.id.as_bytes())? {
            self.by_object.remove(Self::index_key(&previous))?;
        }

        let bytes = bincode::serialize(record)?;
        self.records.insert(record.id.as_bytes(), bytes)?;
        self.by_object.insert(Self::index_key(record), Vec::<u8>::new())?;
        self.db.flush()?;
        Ok(())
    }

    /// Records of an object in index order (oldest first)
    fn object_records(&self, object_id: &str) -> Result<Vec<UploadRecord>> {
        let mut records = Vec::new();
        for entry in self.by_object.scan_prefix(Self::object_prefix(object_id)) {
            let (key, _) = entry?;
            let record_id = self.record_id_from_index(&key, object_id);
            if let Some(record) = self.load(&record_id)? {
                records.push(record);
            }
        }
        Ok(records)
    }
}

impl UploadRepository for SledUploadRepository {
    fn insert(&self, record: &UploadRecord) -> Result<()> {
        let _guard = self.write_lock.lock();
        if self.records.contains_key(record.id.as_bytes())? {
            return Err(Error::Persistence(format!(
                "Upload record {} already exists",
                record.id
            )));
        }
        self.write(record)?;
        debug!(
            "Inserted upload record {} for object {} (success={})",
            record.id, record.object_id, record.success
        );
        Ok(())
    }

    fn save(&self, record: &UploadRecord) -> Result<()> {
        let _guard = self.write_lock.lock();
        self.write(record)
    }

    fn delete(&self, record_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        if let Some(record) = self.load(record_id.as_bytes())? {
            self.by_object.remove(Self::index_key(&record))?;
            self.records.remove(record_id.as_bytes())?;
            self.db.flush()?;
            debug!("Deleted upload record {}", record_id);
        }
        Ok(())
    }

    fn find(&self, record_id: &str) -> Result<Option<UploadRecord>> {
        self.load(record_id.as_bytes())
    }

    fn find_current(&self, object_id: &str) -> Result<Option<UploadRecord>> {
        for entry in self
            .by_object
            .scan_prefix(Self::object_prefix(object_id))
            .rev()
        {
            let (key, _) = entry?;
            let record_id = self.record_id_from_index(&key, object_id);
            if let Some(record) = self.load(&record_id)? {
                if record.success {
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }

    fn find_by_object(&self, object_id: &str) -> Result<Vec<UploadRecord>> {
        self.object_records(object_id)
    }
}
