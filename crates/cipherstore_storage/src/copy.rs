//! Storage-to-storage copy.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::iterator::TransactionRecord;
use crate::types::TransactionMeta;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Copies every transaction of `source` into `dest`, keeping tids.
///
/// Each transaction is replayed with `restore` (or `restore_blob` when the
/// source holds a blob for the record) inside its own two-phase commit. Blob
/// files are copied first, since the destination takes ownership of the files
/// it is given. Returns the number of transactions copied.
///
/// Copying a plaintext storage into an [`EncryptingBackend`](crate::EncryptingBackend)
/// encrypts it.
///
/// # Errors
///
/// Returns the first error from either storage; the transaction being copied
/// is aborted in `dest`.
pub fn copy_transactions(
    source: &dyn StorageBackend,
    dest: &dyn StorageBackend,
) -> StorageResult<usize> {
    let blobs = source.capabilities().blobs && dest.capabilities().blobs;
    let staging = if blobs {
        Some(dest.temporary_directory()?)
    } else {
        None
    };

    let mut iter = source.iterator(None, None)?;
    let mut copied = 0;
    for txn in iter.by_ref() {
        let txn = txn?;
        let tid = txn.tid;
        let meta = TransactionMeta::new(txn.user.clone(), txn.description.clone())
            .with_extension(txn.extension.clone())
            .with_tid(tid);

        dest.tpc_begin(&meta)?;
        let mut staged = Vec::new();
        let result = copy_one(source, dest, txn, &meta, staging.as_deref(), &mut staged)
            .and_then(|()| dest.tpc_vote(&meta))
            .and_then(|()| dest.tpc_finish(&meta));
        if result.is_err() {
            if let Err(e) = dest.tpc_abort(&meta) {
                debug!(%tid, error = %e, "abort after failed copy");
            }
        }
        for path in staged {
            remove_if_present(&path)?;
        }
        result?;

        debug!(%tid, "copied transaction");
        copied += 1;
    }
    iter.close();

    info!(transactions = copied, from = %source.name(), to = %dest.name(), "copy finished");
    Ok(copied)
}

fn copy_one(
    source: &dyn StorageBackend,
    dest: &dyn StorageBackend,
    txn: TransactionRecord,
    meta: &TransactionMeta,
    staging: Option<&Path>,
    staged: &mut Vec<PathBuf>,
) -> StorageResult<()> {
    for record in txn {
        let record = record?;
        let blob = match staging {
            Some(dir) => match source.load_blob(record.oid, record.tid) {
                Ok(path) => Some(stage_blob(&path, dir)?),
                Err(StorageError::NotFound { .. }) => None,
                Err(e) => return Err(e),
            },
            None => None,
        };

        match blob {
            Some(path) => {
                dest.restore_blob(
                    record.oid,
                    record.tid,
                    record.data.as_deref(),
                    &path,
                    record.data_txn,
                    meta,
                )?;
                staged.push(path);
            }
            None => dest.restore(
                record.oid,
                record.tid,
                record.data.as_deref(),
                record.data_txn,
                meta,
            )?,
        }
    }
    Ok(())
}

fn stage_blob(path: &Path, dir: &Path) -> StorageResult<PathBuf> {
    let mut tmp = NamedTempFile::new_in(dir)?;
    io::copy(&mut File::open(path)?, tmp.as_file_mut())?;
    let (_, staged) = tmp.keep().map_err(|e| e.error)?;
    Ok(staged)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}
