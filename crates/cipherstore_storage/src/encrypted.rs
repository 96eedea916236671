//! Encrypting storage proxy.
//!
//! [`EncryptingBackend`] wraps another storage and runs every record and blob
//! through a [`RecordTransform`] on the way in and out. Operations that do not
//! touch record bytes are forwarded unchanged.
//!
//! ## Client and Server Side
//!
//! A client-side proxy protects on store and unprotects on load. When a
//! storage server sits between the client and the real storage, the server
//! holds a server-side proxy ([`EncryptingBackend::server`]) that passes record
//! bytes through as they are, so data stays encrypted on the wire. It still
//! decrypts where the server itself must read records: blob loading, reference
//! resolution during pack, and the database transform hooks.

use crate::backend::{Database, ReferencesFn, StorageBackend};
use crate::blob;
use crate::error::{StorageError, StorageResult};
use crate::iterator::{ProtectedTransactionIterator, TransactionIterator};
use crate::types::{
    Capabilities, HistoryEntry, IterRecord, LoadedRevision, Oid, Tid, TransactionMeta, UndoEntry,
};
use cipherstore_transform::RecordTransform;
use parking_lot::RwLock;
use std::borrow::Cow;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

/// Which end of a client/server deployment a proxy serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Records are protected and unprotected by this proxy.
    Client,
    /// Records pass through; the client does the transform.
    Server,
}

/// A storage wrapper that encrypts record data and blobs.
///
/// # Example
///
/// ```rust
/// use cipherstore_storage::{EncryptingBackend, InMemoryBackend, Oid, StorageBackend, Tid, TransactionMeta};
/// use cipherstore_transform::RecordTransform;
/// use std::sync::Arc;
///
/// let base = Arc::new(InMemoryBackend::new());
/// let storage = EncryptingBackend::new(base.clone(), RecordTransform::trivial());
///
/// let txn = TransactionMeta::new("alice", "init");
/// storage.tpc_begin(&txn).unwrap();
/// storage.store(Oid::ROOT, Tid::ZERO, b"root", &txn).unwrap();
/// storage.tpc_vote(&txn).unwrap();
/// storage.tpc_finish(&txn).unwrap();
///
/// assert_eq!(storage.load(Oid::ROOT).unwrap().0, b"root");
/// assert!(base.load(Oid::ROOT).unwrap().0.starts_with(b".e"));
/// ```
pub struct EncryptingBackend {
    base: Arc<dyn StorageBackend>,
    transform: RecordTransform,
    encrypt: bool,
    side: Side,
    db: RwLock<Option<Weak<dyn Database>>>,
}

impl EncryptingBackend {
    /// Wraps `base`, encrypting everything written through the proxy.
    pub fn new(base: Arc<dyn StorageBackend>, transform: RecordTransform) -> Arc<Self> {
        Self::with_encrypt(base, transform, true)
    }

    /// Wraps `base`. With `encrypt = false` data is written as given, while
    /// reads still unprotect whatever is already encrypted.
    pub fn with_encrypt(
        base: Arc<dyn StorageBackend>,
        transform: RecordTransform,
        encrypt: bool,
    ) -> Arc<Self> {
        Self::wrap(base, transform, encrypt, Side::Client)
    }

    /// Wraps `base` for use inside a storage server.
    pub fn server(base: Arc<dyn StorageBackend>, transform: RecordTransform) -> Arc<Self> {
        Self::wrap(base, transform, true, Side::Server)
    }

    fn wrap(
        base: Arc<dyn StorageBackend>,
        transform: RecordTransform,
        encrypt: bool,
        side: Side,
    ) -> Arc<Self> {
        let proxy = Arc::new(Self {
            base,
            transform,
            encrypt,
            side,
            db: RwLock::new(None),
        });
        let weak: Weak<dyn Database> = Arc::downgrade(&proxy) as Weak<dyn Database>;
        proxy.base.register_db(weak);
        proxy
    }

    /// Returns the wrapped storage.
    #[must_use]
    pub fn base(&self) -> &Arc<dyn StorageBackend> {
        &self.base
    }

    /// Returns the record transform.
    #[must_use]
    pub fn transform(&self) -> &RecordTransform {
        &self.transform
    }

    /// Returns `true` if writes are protected.
    #[must_use]
    pub fn encrypts(&self) -> bool {
        self.encrypt
    }

    /// Returns which side this proxy serves.
    #[must_use]
    pub fn side(&self) -> Side {
        self.side
    }

    fn is_server(&self) -> bool {
        self.side == Side::Server
    }

    fn outbound<'a>(&self, data: &'a [u8]) -> StorageResult<Cow<'a, [u8]>> {
        if self.encrypt {
            Ok(self.transform.protect(data)?)
        } else {
            Ok(Cow::Borrowed(data))
        }
    }

    fn outbound_opt<'a>(&self, data: Option<&'a [u8]>) -> StorageResult<Option<Cow<'a, [u8]>>> {
        data.map(|d| self.outbound(d)).transpose()
    }

    fn inbound(&self, data: Vec<u8>) -> StorageResult<Vec<u8>> {
        let plain = match self.transform.unprotect(&data)? {
            Cow::Borrowed(_) => None,
            Cow::Owned(plain) => Some(plain),
        };
        Ok(plain.unwrap_or(data))
    }

    /// Returns the registered database: `None` before registration.
    fn registered(&self) -> StorageResult<Option<Arc<dyn Database>>> {
        match self.db.read().as_ref() {
            None => Ok(None),
            Some(weak) => weak.upgrade().map(Some).ok_or(StorageError::DatabaseGone),
        }
    }

    fn db(&self) -> StorageResult<Arc<dyn Database>> {
        self.registered()?.ok_or(StorageError::NotRegistered)
    }
}

impl StorageBackend for EncryptingBackend {
    fn capabilities(&self) -> Capabilities {
        self.base.capabilities()
    }

    fn name(&self) -> String {
        self.base.name()
    }

    fn size(&self) -> u64 {
        self.base.size()
    }

    fn len(&self) -> usize {
        self.base.len()
    }

    fn is_read_only(&self) -> bool {
        self.base.is_read_only()
    }

    fn close(&self) -> StorageResult<()> {
        self.base.close()
    }

    fn sort_key(&self) -> String {
        self.base.sort_key()
    }

    fn last_transaction(&self) -> Tid {
        self.base.last_transaction()
    }

    fn new_oid(&self) -> StorageResult<Oid> {
        self.base.new_oid()
    }

    fn history(&self, oid: Oid, size: usize) -> StorageResult<Vec<HistoryEntry>> {
        self.base.history(oid, size)
    }

    fn load(&self, oid: Oid) -> StorageResult<(Vec<u8>, Tid)> {
        let (data, serial) = self.base.load(oid)?;
        if self.is_server() {
            return Ok((data, serial));
        }
        Ok((self.inbound(data)?, serial))
    }

    fn load_before(&self, oid: Oid, tid: Tid) -> StorageResult<Option<LoadedRevision>> {
        let loaded = self.base.load_before(oid, tid)?;
        if self.is_server() {
            return Ok(loaded);
        }
        loaded
            .map(|rev| -> StorageResult<LoadedRevision> {
                Ok(LoadedRevision {
                    data: self.inbound(rev.data)?,
                    ..rev
                })
            })
            .transpose()
    }

    fn load_serial(&self, oid: Oid, serial: Tid) -> StorageResult<Vec<u8>> {
        let data = self.base.load_serial(oid, serial)?;
        if self.is_server() {
            return Ok(data);
        }
        self.inbound(data)
    }

    fn store(
        &self,
        oid: Oid,
        serial: Tid,
        data: &[u8],
        txn: &TransactionMeta,
    ) -> StorageResult<()> {
        if self.is_server() {
            return self.base.store(oid, serial, data, txn);
        }
        self.base.store(oid, serial, &self.outbound(data)?, txn)
    }

    fn restore(
        &self,
        oid: Oid,
        serial: Tid,
        data: Option<&[u8]>,
        prev_txn: Option<Tid>,
        txn: &TransactionMeta,
    ) -> StorageResult<()> {
        if self.is_server() {
            return self.base.restore(oid, serial, data, prev_txn, txn);
        }
        let data = self.outbound_opt(data)?;
        self.base
            .restore(oid, serial, data.as_deref(), prev_txn, txn)
    }

    fn tpc_begin(&self, txn: &TransactionMeta) -> StorageResult<()> {
        self.base.tpc_begin(txn)
    }

    fn tpc_vote(&self, txn: &TransactionMeta) -> StorageResult<()> {
        self.base.tpc_vote(txn)
    }

    fn tpc_finish(&self, txn: &TransactionMeta) -> StorageResult<Tid> {
        self.base.tpc_finish(txn)
    }

    fn tpc_abort(&self, txn: &TransactionMeta) -> StorageResult<()> {
        self.base.tpc_abort(txn)
    }

    fn iterator(
        &self,
        start: Option<Tid>,
        stop: Option<Tid>,
    ) -> StorageResult<Box<dyn TransactionIterator>> {
        let inner = self.base.iterator(start, stop)?;
        if self.is_server() {
            return Ok(inner);
        }
        Ok(Box::new(ProtectedTransactionIterator::new(
            inner,
            self.transform.clone(),
        )))
    }

    fn record_iternext(&self, next: Option<Oid>) -> StorageResult<IterRecord> {
        let record = self.base.record_iternext(next)?;
        if self.is_server() {
            return Ok(record);
        }
        Ok(IterRecord {
            data: self.inbound(record.data)?,
            ..record
        })
    }

    fn pack(&self, pack_time: Tid, references: &ReferencesFn<'_>, gc: bool) -> StorageResult<()> {
        let transform = &self.transform;
        let unprotected = |record: &[u8], oids: &mut Vec<Oid>| -> StorageResult<()> {
            references(&*transform.unprotect(record)?, oids)
        };
        self.base.pack(pack_time, &unprotected, gc)
    }

    fn register_db(&self, db: Weak<dyn Database>) {
        *self.db.write() = Some(db);
    }

    fn temporary_directory(&self) -> StorageResult<PathBuf> {
        self.base.temporary_directory()
    }

    fn supports_undo(&self) -> bool {
        self.base.supports_undo()
    }

    fn undo(&self, id: &[u8], txn: &TransactionMeta) -> StorageResult<Vec<Oid>> {
        self.base.undo(id, txn)
    }

    fn undo_log(&self, first: usize, last: usize) -> StorageResult<Vec<UndoEntry>> {
        self.base.undo_log(first, last)
    }

    fn undo_info(&self, first: usize, last: usize) -> StorageResult<Vec<UndoEntry>> {
        self.base.undo_info(first, last)
    }

    fn blob_dir(&self) -> StorageResult<PathBuf> {
        self.base.blob_dir()
    }

    fn blob_filename(&self, oid: Oid, serial: Tid) -> StorageResult<PathBuf> {
        self.base.blob_filename(oid, serial)
    }

    fn store_blob(
        &self,
        oid: Oid,
        old_serial: Tid,
        data: &[u8],
        blob_file: &Path,
        txn: &TransactionMeta,
    ) -> StorageResult<()> {
        if self.is_server() {
            return self.base.store_blob(oid, old_serial, data, blob_file, txn);
        }
        if self.encrypt {
            blob::encrypt_in_place(&self.transform, blob_file)?;
        }
        self.base
            .store_blob(oid, old_serial, &self.outbound(data)?, blob_file, txn)
    }

    fn restore_blob(
        &self,
        oid: Oid,
        serial: Tid,
        data: Option<&[u8]>,
        blob_file: &Path,
        prev_txn: Option<Tid>,
        txn: &TransactionMeta,
    ) -> StorageResult<()> {
        if self.is_server() {
            return self
                .base
                .restore_blob(oid, serial, data, blob_file, prev_txn, txn);
        }
        let dir = blob::temp_root(&self.base.blob_dir()?);
        let copy = blob::private_copy(&self.transform, blob_file, &dir, self.encrypt)?;
        let data = self.outbound_opt(data)?;
        self.base
            .restore_blob(oid, serial, data.as_deref(), &copy, prev_txn, txn)
    }

    fn load_blob(&self, oid: Oid, serial: Tid) -> StorageResult<PathBuf> {
        let path = self.base.load_blob(oid, serial)?;
        blob::decrypt_to_temp(&self.transform, &path, &self.base.blob_dir()?)
    }

    fn open_committed_blob_file(&self, oid: Oid, serial: Tid) -> StorageResult<File> {
        Ok(File::open(self.load_blob(oid, serial)?)?)
    }
}

impl Database for EncryptingBackend {
    fn invalidate_cache(&self) -> StorageResult<()> {
        self.db()?.invalidate_cache()
    }

    fn invalidate(&self, tid: Tid, oids: &[Oid]) -> StorageResult<()> {
        self.db()?.invalidate(tid, oids)
    }

    fn references(&self, record: &[u8], oids: &mut Vec<Oid>) -> StorageResult<()> {
        let db = self.db()?;
        db.references(&self.transform.unprotect(record)?, oids)
    }

    fn transform_record_data(&self, data: &[u8]) -> StorageResult<Vec<u8>> {
        let transformed = match self.registered()? {
            Some(db) => db.transform_record_data(data)?,
            None => data.to_vec(),
        };
        Ok(self.outbound(&transformed)?.into_owned())
    }

    fn untransform_record_data(&self, data: &[u8]) -> StorageResult<Vec<u8>> {
        let plain = self.transform.unprotect(data)?;
        match self.registered()? {
            Some(db) => db.untransform_record_data(&plain),
            None => Ok(plain.into_owned()),
        }
    }
}

impl fmt::Debug for EncryptingBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EncryptingBackend")
            .field("base", &self.base.name())
            .field("transform", &self.transform)
            .field("encrypt", &self.encrypt)
            .field("side", &self.side)
            .finish_non_exhaustive()
    }
}
