//! Shared helpers for storage integration tests.

#![allow(dead_code)]

use cipherstore_storage::{Database, Oid, StorageBackend, StorageError, StorageResult, Tid, TransactionMeta};
use cipherstore_transform::{EncryptionConfig, RecordTransform};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// A test record: a value plus the oids it refers to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub value: i64,
    pub refs: Vec<u64>,
}

impl Record {
    pub fn new(value: i64, refs: &[Oid]) -> Self {
        Self {
            value,
            refs: refs.iter().map(|oid| oid.as_u64()).collect(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap()
    }

    pub fn decode(data: &[u8]) -> Self {
        serde_json::from_slice(data).unwrap()
    }
}

/// Reference resolver for [`Record`] payloads.
pub fn json_references(data: &[u8], oids: &mut Vec<Oid>) -> StorageResult<()> {
    let record: Record = serde_json::from_slice(data)
        .map_err(|e| StorageError::invalid(format!("not a record: {e}")))?;
    oids.extend(record.refs.into_iter().map(Oid::from_u64));
    Ok(())
}

/// A database that hex-encodes record data and records invalidations.
#[derive(Debug, Default)]
pub struct HexDatabase {
    pub invalidated: Mutex<Vec<(Tid, Vec<Oid>)>>,
    pub cache_flushes: Mutex<usize>,
}

impl Database for HexDatabase {
    fn invalidate_cache(&self) -> StorageResult<()> {
        *self.cache_flushes.lock() += 1;
        Ok(())
    }

    fn invalidate(&self, tid: Tid, oids: &[Oid]) -> StorageResult<()> {
        self.invalidated.lock().push((tid, oids.to_vec()));
        Ok(())
    }

    fn references(&self, record: &[u8], oids: &mut Vec<Oid>) -> StorageResult<()> {
        json_references(&self.untransform_record_data(record)?, oids)
    }

    fn transform_record_data(&self, data: &[u8]) -> StorageResult<Vec<u8>> {
        Ok(hex::encode(data).into_bytes())
    }

    fn untransform_record_data(&self, data: &[u8]) -> StorageResult<Vec<u8>> {
        hex::decode(data).map_err(|e| StorageError::invalid(e.to_string()))
    }
}

/// Writes an encryption config into `dir` and builds the transform from it.
pub fn keyed_transform(dir: &Path) -> RecordTransform {
    let path = dir.join("cipherstore.toml");
    if !path.exists() {
        fs::write(
            &path,
            "[encryption]\n\
             enabled = true\n\
             kek-path = \"kek.key\"\n\
             dek-storage-path = \"dek-storage\"\n",
        )
        .unwrap();
    }
    EncryptionConfig::load(&path).unwrap().build().unwrap()
}

/// Commits `writes` in one transaction and returns its tid.
pub fn commit(storage: &dyn StorageBackend, writes: &[(Oid, Vec<u8>)]) -> Tid {
    let txn = TransactionMeta::new("tester", "commit");
    storage.tpc_begin(&txn).unwrap();
    for (oid, data) in writes {
        let serial = storage.load(*oid).map_or(Tid::ZERO, |(_, tid)| tid);
        storage.store(*oid, serial, data, &txn).unwrap();
    }
    storage.tpc_vote(&txn).unwrap();
    storage.tpc_finish(&txn).unwrap()
}

/// Commits one record with a blob whose content is `content`.
pub fn commit_blob(storage: &dyn StorageBackend, oid: Oid, data: &[u8], content: &[u8], scratch: &Path) -> Tid {
    let file = scratch.join(format!("upload-{}", oid.to_hex()));
    fs::write(&file, content).unwrap();

    let txn = TransactionMeta::new("tester", "blob");
    storage.tpc_begin(&txn).unwrap();
    let serial = storage.load(oid).map_or(Tid::ZERO, |(_, tid)| tid);
    storage.store_blob(oid, serial, data, &file, &txn).unwrap();
    storage.tpc_vote(&txn).unwrap();
    storage.tpc_finish(&txn).unwrap()
}
