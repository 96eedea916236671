//! In-memory reference storage.

use crate::backend::{Database, ReferencesFn, StorageBackend};
use crate::error::{StorageError, StorageResult};
use crate::iterator::{DataRecord, TransactionIterator, TransactionRecord};
use crate::types::{
    Capabilities, HistoryEntry, IterRecord, LoadedRevision, Oid, Tid, TransactionMeta,
};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Revision {
    tid: Tid,
    /// `None` marks a deletion.
    data: Option<Vec<u8>>,
    data_txn: Option<Tid>,
}

#[derive(Debug, Clone)]
struct CommittedTxn {
    user: String,
    description: String,
    extension: Vec<u8>,
    oids: Vec<Oid>,
}

#[derive(Debug)]
struct PendingWrite {
    oid: Oid,
    data: Option<Vec<u8>>,
    data_txn: Option<Tid>,
    blob: Option<PathBuf>,
}

#[derive(Debug)]
struct Pending {
    handle: Uuid,
    meta: TransactionMeta,
    writes: Vec<PendingWrite>,
    tid: Option<Tid>,
}

/// The committed content of an [`InMemoryBackend`].
///
/// Taking a snapshot and building a new backend from it is how tests close and
/// reopen a store.
#[derive(Debug, Clone, Default)]
pub struct MemorySnapshot {
    objects: BTreeMap<Oid, Vec<Revision>>,
    transactions: BTreeMap<Tid, CommittedTxn>,
    last_tid: Tid,
    last_oid: u64,
    blob_dir: Option<PathBuf>,
    name: String,
}

impl MemorySnapshot {
    /// Returns the number of objects, live or deleted, in the snapshot.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.objects.len()
    }
}

#[derive(Debug, Default)]
struct State {
    committed: MemorySnapshot,
    pending: Option<Pending>,
    closed: bool,
}

/// An in-memory storage.
///
/// Records live in memory; blob files, if a blob directory is configured, live
/// on disk as `<blob_dir>/<oid hex>/<tid hex>.blob`. Nothing is durable beyond
/// [`MemorySnapshot`].
///
/// This storage is suitable for:
/// - Unit and integration tests
/// - Tooling that stages data before copying it elsewhere
///
/// # Example
///
/// ```rust
/// use cipherstore_storage::{InMemoryBackend, Oid, StorageBackend, Tid, TransactionMeta};
///
/// let storage = InMemoryBackend::new();
/// let txn = TransactionMeta::new("alice", "init");
/// storage.tpc_begin(&txn).unwrap();
/// storage.store(Oid::ROOT, Tid::ZERO, b"root", &txn).unwrap();
/// storage.tpc_vote(&txn).unwrap();
/// let tid = storage.tpc_finish(&txn).unwrap();
///
/// assert_eq!(storage.load(Oid::ROOT).unwrap(), (b"root".to_vec(), tid));
/// ```
#[derive(Default)]
pub struct InMemoryBackend {
    state: RwLock<State>,
    read_only: bool,
    db: RwLock<Option<Weak<dyn Database>>>,
}

impl InMemoryBackend {
    /// Creates an empty storage without blob support.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a storage from a snapshot.
    #[must_use]
    pub fn from_snapshot(snapshot: MemorySnapshot) -> Self {
        Self {
            state: RwLock::new(State {
                committed: snapshot,
                pending: None,
                closed: false,
            }),
            ..Self::default()
        }
    }

    /// Enables blobs, stored under `blob_dir`.
    #[must_use]
    pub fn with_blob_dir(self, blob_dir: impl Into<PathBuf>) -> Self {
        self.state.write().committed.blob_dir = Some(blob_dir.into());
        self
    }

    /// Sets the storage name.
    #[must_use]
    pub fn with_name(self, name: impl Into<String>) -> Self {
        self.state.write().committed.name = name.into();
        self
    }

    /// Makes the storage reject writes.
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Returns a copy of the committed content.
    #[must_use]
    pub fn snapshot(&self) -> MemorySnapshot {
        self.state.read().committed.clone()
    }

    /// Returns the registered database, if it is still alive.
    #[must_use]
    pub fn registered_db(&self) -> Option<Arc<dyn Database>> {
        self.db.read().as_ref().and_then(Weak::upgrade)
    }

    fn check_open(state: &State) -> StorageResult<()> {
        if state.closed {
            Err(StorageError::Closed)
        } else {
            Ok(())
        }
    }

    fn check_writable(&self, state: &State) -> StorageResult<()> {
        Self::check_open(state)?;
        if self.read_only {
            Err(StorageError::ReadOnly)
        } else {
            Ok(())
        }
    }

    fn pending_mut<'a>(state: &'a mut State, txn: &TransactionMeta) -> StorageResult<&'a mut Pending> {
        match state.pending.as_mut() {
            Some(p) if p.handle == txn.handle() => Ok(p),
            _ => Err(StorageError::TransactionMismatch),
        }
    }

    fn blob_path(blob_dir: &Path, oid: Oid, tid: Tid) -> PathBuf {
        blob_dir
            .join(oid.to_hex())
            .join(format!("{}.blob", tid.to_hex()))
    }

    fn queue(
        &self,
        txn: &TransactionMeta,
        write: PendingWrite,
        check: Option<Tid>,
    ) -> StorageResult<()> {
        let mut state = self.state.write();
        self.check_writable(&state)?;
        Self::pending_mut(&mut state, txn)?;

        if let Some(expected) = check {
            let committed = state
                .committed
                .objects
                .get(&write.oid)
                .and_then(|revs| revs.last())
                .map_or(Tid::ZERO, |rev| rev.tid);
            if committed != expected {
                return Err(StorageError::Conflict {
                    oid: write.oid,
                    expected,
                    committed,
                });
            }
        }

        let last_oid = &mut state.committed.last_oid;
        *last_oid = (*last_oid).max(write.oid.as_u64());
        Self::pending_mut(&mut state, txn)?.writes.push(write);
        Ok(())
    }

    fn move_file(src: &Path, dst: &Path) -> io::Result<()> {
        if let Some(dir) = dst.parent() {
            fs::create_dir_all(dir)?;
        }
        if fs::rename(src, dst).is_err() {
            fs::copy(src, dst)?;
            fs::remove_file(src)?;
        }
        Ok(())
    }

    /// Moves every pending blob into place, or none of them.
    fn move_blobs(blob_dir: &Path, writes: &[PendingWrite], tid: Tid) -> StorageResult<()> {
        let mut moved: Vec<(&Path, PathBuf)> = Vec::new();
        for write in writes {
            let Some(src) = write.blob.as_deref() else {
                continue;
            };
            let dst = Self::blob_path(blob_dir, write.oid, tid);
            if let Err(e) = Self::move_file(src, &dst) {
                for (src, dst) in moved.iter().rev() {
                    if let Err(undo) = Self::move_file(dst, src) {
                        warn!(blob = %dst.display(), error = %undo, "could not return blob file");
                    }
                }
                return Err(e.into());
            }
            moved.push((src, dst));
        }
        Ok(())
    }

    fn remove_blob(blob_dir: Option<&Path>, oid: Oid, tid: Tid) -> io::Result<()> {
        let Some(blob_dir) = blob_dir else {
            return Ok(());
        };
        match fs::remove_file(Self::blob_path(blob_dir, oid, tid)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Resolves the data a write should store, following backpointers.
fn resolve_data(
    objects: &BTreeMap<Oid, Vec<Revision>>,
    write: &PendingWrite,
) -> StorageResult<Option<Vec<u8>>> {
    match (&write.data, write.data_txn) {
        (Some(data), _) => Ok(Some(data.clone())),
        (None, Some(prev)) => objects
            .get(&write.oid)
            .and_then(|revs| revs.iter().find(|r| r.tid == prev))
            .map(|r| r.data.clone())
            .ok_or(StorageError::revision_not_found(write.oid, prev)),
        (None, None) => Ok(None),
    }
}

impl StorageBackend for InMemoryBackend {
    fn capabilities(&self) -> Capabilities {
        Capabilities {
            blobs: self.state.read().committed.blob_dir.is_some(),
            undo: false,
            iteration: true,
            record_iteration: true,
            restore: true,
        }
    }

    fn name(&self) -> String {
        let name = &self.state.read().committed.name;
        if name.is_empty() {
            "InMemoryBackend".to_string()
        } else {
            name.clone()
        }
    }

    fn size(&self) -> u64 {
        self.state
            .read()
            .committed
            .objects
            .values()
            .flatten()
            .filter_map(|rev| rev.data.as_ref())
            .map(|data| data.len() as u64)
            .sum()
    }

    fn len(&self) -> usize {
        self.state
            .read()
            .committed
            .objects
            .values()
            .filter(|revs| revs.last().is_some_and(|rev| rev.data.is_some()))
            .count()
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn close(&self) -> StorageResult<()> {
        let mut state = self.state.write();
        state.pending = None;
        state.closed = true;
        Ok(())
    }

    fn sort_key(&self) -> String {
        self.name()
    }

    fn last_transaction(&self) -> Tid {
        self.state.read().committed.last_tid
    }

    fn new_oid(&self) -> StorageResult<Oid> {
        let mut state = self.state.write();
        self.check_writable(&state)?;
        state.committed.last_oid += 1;
        Ok(Oid::from_u64(state.committed.last_oid))
    }

    fn history(&self, oid: Oid, size: usize) -> StorageResult<Vec<HistoryEntry>> {
        let state = self.state.read();
        Self::check_open(&state)?;
        let revs = state
            .committed
            .objects
            .get(&oid)
            .ok_or(StorageError::not_found(oid))?;

        Ok(revs
            .iter()
            .rev()
            .take(size)
            .map(|rev| {
                let txn = state.committed.transactions.get(&rev.tid);
                HistoryEntry {
                    tid: rev.tid,
                    user: txn.map(|t| t.user.clone()).unwrap_or_default(),
                    description: txn.map(|t| t.description.clone()).unwrap_or_default(),
                    size: rev.data.as_ref().map_or(0, Vec::len),
                }
            })
            .collect())
    }

    fn load(&self, oid: Oid) -> StorageResult<(Vec<u8>, Tid)> {
        let state = self.state.read();
        Self::check_open(&state)?;
        state
            .committed
            .objects
            .get(&oid)
            .and_then(|revs| revs.last())
            .and_then(|rev| rev.data.clone().map(|data| (data, rev.tid)))
            .ok_or(StorageError::not_found(oid))
    }

    fn load_before(&self, oid: Oid, tid: Tid) -> StorageResult<Option<LoadedRevision>> {
        let state = self.state.read();
        Self::check_open(&state)?;
        let Some(revs) = state.committed.objects.get(&oid) else {
            return Err(StorageError::not_found(oid));
        };

        let Some(idx) = revs.iter().rposition(|rev| rev.tid < tid) else {
            return Ok(None);
        };
        let rev = &revs[idx];
        let data = rev
            .data
            .clone()
            .ok_or(StorageError::revision_not_found(oid, rev.tid))?;
        Ok(Some(LoadedRevision {
            data,
            serial: rev.tid,
            next_serial: revs.get(idx + 1).map(|next| next.tid),
        }))
    }

    fn load_serial(&self, oid: Oid, serial: Tid) -> StorageResult<Vec<u8>> {
        let state = self.state.read();
        Self::check_open(&state)?;
        state
            .committed
            .objects
            .get(&oid)
            .and_then(|revs| revs.iter().find(|rev| rev.tid == serial))
            .and_then(|rev| rev.data.clone())
            .ok_or(StorageError::revision_not_found(oid, serial))
    }

    fn store(
        &self,
        oid: Oid,
        serial: Tid,
        data: &[u8],
        txn: &TransactionMeta,
    ) -> StorageResult<()> {
        let write = PendingWrite {
            oid,
            data: Some(data.to_vec()),
            data_txn: None,
            blob: None,
        };
        self.queue(txn, write, Some(serial))
    }

    fn restore(
        &self,
        oid: Oid,
        _serial: Tid,
        data: Option<&[u8]>,
        prev_txn: Option<Tid>,
        txn: &TransactionMeta,
    ) -> StorageResult<()> {
        let write = PendingWrite {
            oid,
            data: data.map(<[u8]>::to_vec),
            data_txn: prev_txn,
            blob: None,
        };
        self.queue(txn, write, None)
    }

    fn tpc_begin(&self, txn: &TransactionMeta) -> StorageResult<()> {
        let mut state = self.state.write();
        self.check_writable(&state)?;
        match &state.pending {
            Some(p) if p.handle == txn.handle() => return Ok(()),
            Some(_) => {
                return Err(StorageError::invalid(
                    "another transaction is in progress",
                ))
            }
            None => {}
        }
        state.pending = Some(Pending {
            handle: txn.handle(),
            meta: txn.clone(),
            writes: Vec::new(),
            tid: None,
        });
        Ok(())
    }

    fn tpc_vote(&self, txn: &TransactionMeta) -> StorageResult<()> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        Self::check_open(state)?;
        let last_tid = state.committed.last_tid;
        let objects = &state.committed.objects;
        let pending = match state.pending.as_mut() {
            Some(p) if p.handle == txn.handle() => p,
            _ => return Err(StorageError::TransactionMismatch),
        };

        let tid = match pending.meta.tid {
            Some(tid) if tid <= last_tid => {
                return Err(StorageError::invalid(format!(
                    "forced tid {tid} is not after last transaction {last_tid}"
                )))
            }
            Some(tid) => tid,
            None => last_tid
                .next()
                .ok_or_else(|| StorageError::invalid(format!("no tids left after {last_tid}")))?,
        };

        // Backpointers and blob files must resolve before the commit point.
        for write in &pending.writes {
            resolve_data(objects, write)?;
            if let Some(blob) = &write.blob {
                if !blob.is_file() {
                    return Err(StorageError::invalid(format!(
                        "blob file {} is missing",
                        blob.display()
                    )));
                }
            }
        }
        pending.tid = Some(tid);
        Ok(())
    }

    fn tpc_finish(&self, txn: &TransactionMeta) -> StorageResult<Tid> {
        let mut guard = self.state.write();
        let state = &mut *guard;
        Self::check_open(state)?;
        let pending = match state.pending.as_ref() {
            Some(p) if p.handle == txn.handle() => p,
            _ => return Err(StorageError::TransactionMismatch),
        };
        let tid = pending
            .tid
            .ok_or_else(|| StorageError::invalid("tpc_finish called before tpc_vote"))?;

        // Everything that can fail happens before the committed state changes;
        // on error the transaction stays pending and can be aborted.
        let resolved = pending
            .writes
            .iter()
            .map(|write| resolve_data(&state.committed.objects, write))
            .collect::<StorageResult<Vec<_>>>()?;
        if let Some(blob_dir) = &state.committed.blob_dir {
            Self::move_blobs(blob_dir, &pending.writes, tid)?;
        }

        let Some(pending) = state.pending.take() else {
            return Err(StorageError::TransactionMismatch);
        };
        let committed = &mut state.committed;
        let mut oids = Vec::with_capacity(pending.writes.len());
        for (write, data) in pending.writes.iter().zip(resolved) {
            committed.objects.entry(write.oid).or_default().push(Revision {
                tid,
                data,
                data_txn: write.data_txn,
            });
            oids.push(write.oid);
        }

        committed.transactions.insert(
            tid,
            CommittedTxn {
                user: pending.meta.user,
                description: pending.meta.description,
                extension: pending.meta.extension,
                oids,
            },
        );
        committed.last_tid = tid;
        Ok(tid)
    }

    fn tpc_abort(&self, txn: &TransactionMeta) -> StorageResult<()> {
        let mut state = self.state.write();
        Self::pending_mut(&mut state, txn)?;
        state.pending = None;
        Ok(())
    }

    fn iterator(
        &self,
        start: Option<Tid>,
        stop: Option<Tid>,
    ) -> StorageResult<Box<dyn TransactionIterator>> {
        let state = self.state.read();
        Self::check_open(&state)?;
        let committed = &state.committed;

        let lo = start.unwrap_or(Tid::ZERO);
        let hi = stop.unwrap_or(Tid::from_u64(u64::MAX));
        let mut txns = VecDeque::new();
        if lo <= hi {
            for (&tid, txn) in committed.transactions.range(lo..=hi) {
                let records: Vec<_> = txn
                    .oids
                    .iter()
                    .filter_map(|oid| {
                        let rev = committed.objects.get(oid)?.iter().find(|r| r.tid == tid)?;
                        Some(Ok(DataRecord {
                            oid: *oid,
                            tid,
                            data: rev.data.clone(),
                            data_txn: rev.data_txn,
                        }))
                    })
                    .collect();
                txns.push_back(TransactionRecord::new(
                    tid,
                    txn.user.clone(),
                    txn.description.clone(),
                    txn.extension.clone(),
                    Box::new(records.into_iter()),
                ));
            }
        }
        Ok(Box::new(MemoryTransactionIterator { txns }))
    }

    fn record_iternext(&self, next: Option<Oid>) -> StorageResult<IterRecord> {
        let state = self.state.read();
        Self::check_open(&state)?;
        let from = next.unwrap_or(Oid::ROOT);

        let mut live = state
            .committed
            .objects
            .range(from..)
            .filter_map(|(oid, revs)| {
                let rev = revs.last()?;
                rev.data.as_ref().map(|data| (*oid, rev.tid, data))
            });
        let (oid, tid, data) = live.next().ok_or(StorageError::not_found(from))?;
        Ok(IterRecord {
            oid,
            tid,
            data: data.clone(),
            next: live.next().map(|(oid, _, _)| oid),
        })
    }

    fn pack(&self, pack_time: Tid, references: &ReferencesFn<'_>, gc: bool) -> StorageResult<()> {
        let mut state = self.state.write();
        self.check_writable(&state)?;
        let committed = &mut state.committed;
        let mut dropped: Vec<(Oid, Tid)> = Vec::new();

        // History: keep the revision current at pack time and everything after.
        for (oid, revs) in committed.objects.iter_mut() {
            let current = revs.iter().rposition(|rev| rev.tid <= pack_time);
            if let Some(idx) = current {
                dropped.extend(revs.drain(..idx).map(|rev| (*oid, rev.tid)));
                if revs.len() == 1 && revs[0].data.is_none() {
                    dropped.push((*oid, revs[0].tid));
                    revs.clear();
                }
            }
        }
        committed.objects.retain(|_, revs| !revs.is_empty());

        if gc {
            let mut reachable = HashSet::new();
            let mut queue = VecDeque::from([Oid::ROOT]);
            let mut refs = Vec::new();
            while let Some(oid) = queue.pop_front() {
                if !reachable.insert(oid) {
                    continue;
                }
                let Some(revs) = committed.objects.get(&oid) else {
                    continue;
                };
                for data in revs.iter().filter_map(|rev| rev.data.as_deref()) {
                    refs.clear();
                    references(data, &mut refs)?;
                    queue.extend(refs.iter().copied());
                }
            }

            let garbage: BTreeSet<Oid> = committed
                .objects
                .iter()
                .filter(|(oid, revs)| {
                    !reachable.contains(*oid) && revs.last().is_some_and(|r| r.tid <= pack_time)
                })
                .map(|(oid, _)| *oid)
                .collect();
            for oid in &garbage {
                if let Some(revs) = committed.objects.remove(oid) {
                    dropped.extend(revs.into_iter().map(|rev| (*oid, rev.tid)));
                }
            }
        }

        let dropped_set: HashSet<(Oid, Tid)> = dropped.iter().copied().collect();
        for (tid, txn) in committed.transactions.iter_mut() {
            txn.oids.retain(|oid| !dropped_set.contains(&(*oid, *tid)));
        }
        committed.transactions.retain(|_, txn| !txn.oids.is_empty());

        let blob_dir = committed.blob_dir.clone();
        for (oid, tid) in dropped {
            Self::remove_blob(blob_dir.as_deref(), oid, tid)?;
        }
        Ok(())
    }

    fn register_db(&self, db: Weak<dyn Database>) {
        *self.db.write() = Some(db);
    }

    fn temporary_directory(&self) -> StorageResult<PathBuf> {
        let blob_dir = self.blob_dir()?;
        let dir = blob_dir.join("tmp");
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn blob_dir(&self) -> StorageResult<PathBuf> {
        self.state
            .read()
            .committed
            .blob_dir
            .clone()
            .ok_or(StorageError::Unsupported("blobs"))
    }

    fn blob_filename(&self, oid: Oid, serial: Tid) -> StorageResult<PathBuf> {
        Ok(Self::blob_path(&self.blob_dir()?, oid, serial))
    }

    fn store_blob(
        &self,
        oid: Oid,
        old_serial: Tid,
        data: &[u8],
        blob_file: &Path,
        txn: &TransactionMeta,
    ) -> StorageResult<()> {
        self.blob_dir()?;
        let write = PendingWrite {
            oid,
            data: Some(data.to_vec()),
            data_txn: None,
            blob: Some(blob_file.to_path_buf()),
        };
        self.queue(txn, write, Some(old_serial))
    }

    fn restore_blob(
        &self,
        oid: Oid,
        _serial: Tid,
        data: Option<&[u8]>,
        blob_file: &Path,
        prev_txn: Option<Tid>,
        txn: &TransactionMeta,
    ) -> StorageResult<()> {
        self.blob_dir()?;
        let write = PendingWrite {
            oid,
            data: data.map(<[u8]>::to_vec),
            data_txn: prev_txn,
            blob: Some(blob_file.to_path_buf()),
        };
        self.queue(txn, write, None)
    }
}

impl std::fmt::Debug for InMemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("InMemoryBackend")
            .field("objects", &state.committed.objects.len())
            .field("last_tid", &state.committed.last_tid)
            .field("blob_dir", &state.committed.blob_dir)
            .field("read_only", &self.read_only)
            .field("closed", &state.closed)
            .finish()
    }
}

/// Iterator over a copy of the committed transactions.
struct MemoryTransactionIterator {
    txns: VecDeque<TransactionRecord>,
}

impl Iterator for MemoryTransactionIterator {
    type Item = StorageResult<TransactionRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.txns.pop_front().map(Ok)
    }
}

impl TransactionIterator for MemoryTransactionIterator {
    fn close(&mut self) {
        self.txns.clear();
    }
}
