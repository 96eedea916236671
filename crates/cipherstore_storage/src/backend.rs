//! Storage and database traits.

use crate::error::{StorageError, StorageResult};
use crate::iterator::TransactionIterator;
use crate::types::{
    Capabilities, HistoryEntry, IterRecord, LoadedRevision, Oid, Tid, TransactionMeta, UndoEntry,
};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Weak;

/// Reference resolver used by `pack`: appends the oids `record` refers to.
pub type ReferencesFn<'a> = dyn Fn(&[u8], &mut Vec<Oid>) -> StorageResult<()> + 'a;

/// A transactional object store.
///
/// Records are opaque byte buffers addressed by object id; every committed
/// transaction produces a new revision, identified by its tid. Blob side files
/// are optional and advertised through [`Capabilities`].
///
/// # Two-phase commit
///
/// Writes happen between `tpc_begin` and `tpc_finish` (or `tpc_abort`) and
/// name the transaction they belong to. Only one transaction is in progress at
/// a time.
///
/// # Implementors
///
/// - [`crate::InMemoryBackend`] - reference storage for tests and tooling
/// - [`crate::EncryptingBackend`] - wrapper that protects record bytes
pub trait StorageBackend: Send + Sync {
    /// Returns the optional features this storage provides.
    fn capabilities(&self) -> Capabilities;

    /// Returns a human-readable name.
    fn name(&self) -> String;

    /// Returns the approximate size of the stored data in bytes.
    fn size(&self) -> u64;

    /// Returns the number of live objects.
    fn len(&self) -> usize;

    /// Returns `true` if no objects are stored.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if the storage rejects writes.
    fn is_read_only(&self) -> bool;

    /// Closes the storage. Further calls fail with [`StorageError::Closed`].
    ///
    /// # Errors
    ///
    /// Returns an error if resources cannot be released.
    fn close(&self) -> StorageResult<()>;

    /// Returns a key ordering storages that take part in one commit.
    fn sort_key(&self) -> String;

    /// Returns the tid of the last committed transaction.
    fn last_transaction(&self) -> Tid;

    /// Allocates a new object id.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage is closed or read-only.
    fn new_oid(&self) -> StorageResult<Oid>;

    /// Returns up to `size` revisions of `oid`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] for an unknown object.
    fn history(&self, oid: Oid, size: usize) -> StorageResult<Vec<HistoryEntry>>;

    /// Loads the current revision of `oid`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if the object does not exist.
    fn load(&self, oid: Oid) -> StorageResult<(Vec<u8>, Tid)>;

    /// Loads the revision of `oid` that was current just before `tid`.
    ///
    /// Returns `None` if the object had no revision before `tid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    fn load_before(&self, oid: Oid, tid: Tid) -> StorageResult<Option<LoadedRevision>>;

    /// Loads the revision of `oid` written by `serial`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if there is no such revision.
    fn load_serial(&self, oid: Oid, serial: Tid) -> StorageResult<Vec<u8>>;

    /// Stores a new revision of `oid` based on revision `serial`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Conflict`] if `serial` is not current, or
    /// [`StorageError::TransactionMismatch`] if `txn` is not in progress.
    fn store(&self, oid: Oid, serial: Tid, data: &[u8], txn: &TransactionMeta)
        -> StorageResult<()>;

    /// Writes a revision without conflict checks, as part of copying history.
    ///
    /// `data = None` with `prev_txn` reuses the data of that earlier revision;
    /// `None` without `prev_txn` records a deletion.
    ///
    /// # Errors
    ///
    /// Returns an error if `txn` is not in progress.
    fn restore(
        &self,
        oid: Oid,
        serial: Tid,
        data: Option<&[u8]>,
        prev_txn: Option<Tid>,
        txn: &TransactionMeta,
    ) -> StorageResult<()>;

    /// Begins the two-phase commit of `txn`.
    ///
    /// # Errors
    ///
    /// Returns an error if another transaction is in progress.
    fn tpc_begin(&self, txn: &TransactionMeta) -> StorageResult<()>;

    /// Votes on `txn`, checking everything `tpc_finish` needs.
    ///
    /// # Errors
    ///
    /// Returns an error if `txn` is not in progress.
    fn tpc_vote(&self, txn: &TransactionMeta) -> StorageResult<()>;

    /// Commits `txn` and returns its tid. The commit is all or nothing: on
    /// error nothing is committed and `txn` stays in progress.
    ///
    /// # Errors
    ///
    /// Returns an error if `txn` has not been voted, or if a file checked at
    /// vote time has since gone away.
    fn tpc_finish(&self, txn: &TransactionMeta) -> StorageResult<Tid>;

    /// Discards `txn`.
    ///
    /// # Errors
    ///
    /// Returns an error if `txn` is not in progress.
    fn tpc_abort(&self, txn: &TransactionMeta) -> StorageResult<()>;

    /// Iterates committed transactions with tids in `start..=stop`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unsupported`] by default.
    fn iterator(
        &self,
        start: Option<Tid>,
        stop: Option<Tid>,
    ) -> StorageResult<Box<dyn TransactionIterator>> {
        let _ = (start, stop);
        Err(StorageError::Unsupported("iterator"))
    }

    /// Returns the live record at or after cursor `next` (`None` = start).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unsupported`] by default.
    fn record_iternext(&self, next: Option<Oid>) -> StorageResult<IterRecord> {
        let _ = next;
        Err(StorageError::Unsupported("record_iternext"))
    }

    /// Removes history older than `pack_time`; with `gc`, also removes objects
    /// unreachable from [`Oid::ROOT`] as resolved by `references`.
    ///
    /// # Errors
    ///
    /// Returns an error if `references` fails.
    fn pack(&self, pack_time: Tid, references: &ReferencesFn<'_>, gc: bool) -> StorageResult<()>;

    /// Registers the database-facing wrapper of this storage.
    fn register_db(&self, db: Weak<dyn Database>);

    /// Returns a directory for temporary files that can be renamed into the
    /// storage.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unsupported`] by default.
    fn temporary_directory(&self) -> StorageResult<PathBuf> {
        Err(StorageError::Unsupported("temporary_directory"))
    }

    /// Returns `true` if [`undo`](Self::undo) is available.
    fn supports_undo(&self) -> bool {
        false
    }

    /// Undoes the transaction identified by `id` as part of `txn`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unsupported`] by default.
    fn undo(&self, id: &[u8], txn: &TransactionMeta) -> StorageResult<Vec<Oid>> {
        let _ = (id, txn);
        Err(StorageError::Unsupported("undo"))
    }

    /// Returns undoable transactions in `first..last`, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unsupported`] by default.
    fn undo_log(&self, first: usize, last: usize) -> StorageResult<Vec<UndoEntry>> {
        let _ = (first, last);
        Err(StorageError::Unsupported("undo_log"))
    }

    /// Like [`undo_log`](Self::undo_log).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unsupported`] by default.
    fn undo_info(&self, first: usize, last: usize) -> StorageResult<Vec<UndoEntry>> {
        let _ = (first, last);
        Err(StorageError::Unsupported("undo_info"))
    }

    /// Returns the blob directory.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unsupported`] if the storage has no blobs.
    fn blob_dir(&self) -> StorageResult<PathBuf> {
        Err(StorageError::Unsupported("blobs"))
    }

    /// Returns where the blob of `oid` at `serial` is (or would be) stored.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unsupported`] if the storage has no blobs.
    fn blob_filename(&self, oid: Oid, serial: Tid) -> StorageResult<PathBuf> {
        let _ = (oid, serial);
        Err(StorageError::Unsupported("blobs"))
    }

    /// Stores a record with a blob. The storage takes ownership of
    /// `blob_file` and moves it into place when the transaction commits.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unsupported`] by default.
    fn store_blob(
        &self,
        oid: Oid,
        old_serial: Tid,
        data: &[u8],
        blob_file: &Path,
        txn: &TransactionMeta,
    ) -> StorageResult<()> {
        let _ = (oid, old_serial, data, blob_file, txn);
        Err(StorageError::Unsupported("blobs"))
    }

    /// Restores a record with a blob, taking ownership of `blob_file`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unsupported`] by default.
    fn restore_blob(
        &self,
        oid: Oid,
        serial: Tid,
        data: Option<&[u8]>,
        blob_file: &Path,
        prev_txn: Option<Tid>,
        txn: &TransactionMeta,
    ) -> StorageResult<()> {
        let _ = (oid, serial, data, blob_file, prev_txn, txn);
        Err(StorageError::Unsupported("blobs"))
    }

    /// Returns the path of the committed blob of `oid` at `serial`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if there is no such blob.
    fn load_blob(&self, oid: Oid, serial: Tid) -> StorageResult<PathBuf> {
        let path = self.blob_filename(oid, serial)?;
        if path.exists() {
            Ok(path)
        } else {
            Err(StorageError::revision_not_found(oid, serial))
        }
    }

    /// Opens the committed blob of `oid` at `serial` for reading.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::NotFound`] if there is no such blob.
    fn open_committed_blob_file(&self, oid: Oid, serial: Tid) -> StorageResult<File> {
        Ok(File::open(self.load_blob(oid, serial)?)?)
    }
}

/// The database layer above a storage.
///
/// A storage calls back into its registered database to invalidate caches,
/// and wrappers ask it to resolve references and to transform record data.
pub trait Database: Send + Sync {
    /// Drops every cached object.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be reached.
    fn invalidate_cache(&self) -> StorageResult<()>;

    /// Invalidates cached copies of `oids` changed by `tid`.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be reached.
    fn invalidate(&self, tid: Tid, oids: &[Oid]) -> StorageResult<()>;

    /// Appends the oids referenced by `record` to `oids`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be parsed.
    fn references(&self, record: &[u8], oids: &mut Vec<Oid>) -> StorageResult<()>;

    /// Transforms record bytes on their way to storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the transform fails.
    fn transform_record_data(&self, data: &[u8]) -> StorageResult<Vec<u8>> {
        Ok(data.to_vec())
    }

    /// Reverses [`transform_record_data`](Self::transform_record_data).
    ///
    /// # Errors
    ///
    /// Returns an error if the transform fails.
    fn untransform_record_data(&self, data: &[u8]) -> StorageResult<Vec<u8>> {
        Ok(data.to_vec())
    }
}
