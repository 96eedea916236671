//! Transaction iteration.

use crate::error::StorageResult;
use crate::types::{Oid, Tid};
use cipherstore_transform::RecordTransform;
use std::fmt;

/// Iterator over a transaction's data records.
pub type RecordIter = Box<dyn Iterator<Item = StorageResult<DataRecord>> + Send>;

/// One object revision inside a committed transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRecord {
    /// The object id.
    pub oid: Oid,
    /// The transaction that wrote this revision.
    pub tid: Tid,
    /// Record bytes; `None` for a deletion.
    pub data: Option<Vec<u8>>,
    /// For backpointers, the transaction whose data this revision reuses.
    pub data_txn: Option<Tid>,
}

/// A committed transaction: metadata plus a lazy sequence of its records.
///
/// Iterating a `TransactionRecord` yields its data records.
pub struct TransactionRecord {
    /// The transaction id.
    pub tid: Tid,
    /// Who made the change.
    pub user: String,
    /// What the change was.
    pub description: String,
    /// Opaque extension data.
    pub extension: Vec<u8>,
    records: RecordIter,
}

impl TransactionRecord {
    /// Creates a transaction record over `records`.
    pub fn new(
        tid: Tid,
        user: impl Into<String>,
        description: impl Into<String>,
        extension: Vec<u8>,
        records: RecordIter,
    ) -> Self {
        Self {
            tid,
            user: user.into(),
            description: description.into(),
            extension,
            records,
        }
    }

    /// Applies `f` to every record as it is pulled. Metadata is unchanged.
    #[must_use]
    pub fn map_records<F>(self, mut f: F) -> Self
    where
        F: FnMut(DataRecord) -> StorageResult<DataRecord> + Send + 'static,
    {
        let records = self.records.map(move |record| record.and_then(&mut f));
        Self {
            records: Box::new(records),
            ..self
        }
    }
}

impl Iterator for TransactionRecord {
    type Item = StorageResult<DataRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.records.next()
    }
}

impl fmt::Debug for TransactionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionRecord")
            .field("tid", &self.tid)
            .field("user", &self.user)
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// An iterator over committed transactions in tid order.
///
/// `close` releases the iterator's resources; after it, no more transactions
/// are expected.
pub trait TransactionIterator: Iterator<Item = StorageResult<TransactionRecord>> + Send {
    /// Closes the iterator.
    fn close(&mut self);
}

/// Wraps a delegate's transaction iterator and unprotects every record that
/// carries data.
///
/// Closing is forwarded to the delegate at most once; after `close` the
/// adapter yields nothing, whatever the delegate would still produce.
pub struct ProtectedTransactionIterator {
    inner: Option<Box<dyn TransactionIterator>>,
    transform: RecordTransform,
}

impl ProtectedTransactionIterator {
    /// Wraps `inner`.
    #[must_use]
    pub fn new(inner: Box<dyn TransactionIterator>, transform: RecordTransform) -> Self {
        Self {
            inner: Some(inner),
            transform,
        }
    }

    /// Returns `true` once the iterator has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

fn unprotect_record(transform: &RecordTransform, mut record: DataRecord) -> StorageResult<DataRecord> {
    if let Some(data) = record.data.as_deref().filter(|d| !d.is_empty()) {
        record.data = Some(transform.unprotect(data)?.into_owned());
    }
    Ok(record)
}

impl Iterator for ProtectedTransactionIterator {
    type Item = StorageResult<TransactionRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let txn = self.inner.as_mut()?.next()?;
        let transform = self.transform.clone();
        Some(txn.map(|t| t.map_records(move |record| unprotect_record(&transform, record))))
    }
}

impl TransactionIterator for ProtectedTransactionIterator {
    fn close(&mut self) {
        if let Some(mut inner) = self.inner.take() {
            inner.close();
        }
    }
}

impl Drop for ProtectedTransactionIterator {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for ProtectedTransactionIterator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectedTransactionIterator")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Keeps producing transactions after close and counts close calls.
    struct Unruly {
        closes: Arc<AtomicUsize>,
        transform: RecordTransform,
    }

    impl Iterator for Unruly {
        type Item = StorageResult<TransactionRecord>;

        fn next(&mut self) -> Option<Self::Item> {
            let framed = self.transform.protect(b"payload").unwrap().into_owned();
            let records = vec![
                Ok(DataRecord {
                    oid: Oid::from_u64(1),
                    tid: Tid::from_u64(1),
                    data: Some(framed),
                    data_txn: None,
                }),
                Ok(DataRecord {
                    oid: Oid::from_u64(2),
                    tid: Tid::from_u64(1),
                    data: None,
                    data_txn: None,
                }),
                Ok(DataRecord {
                    oid: Oid::from_u64(3),
                    tid: Tid::from_u64(1),
                    data: Some(Vec::new()),
                    data_txn: None,
                }),
            ];
            Some(Ok(TransactionRecord::new(
                Tid::from_u64(1),
                "user",
                "desc",
                b"ext".to_vec(),
                Box::new(records.into_iter()),
            )))
        }
    }

    impl TransactionIterator for Unruly {
        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn unruly() -> (ProtectedTransactionIterator, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let transform = RecordTransform::trivial();
        let inner = Unruly {
            closes: closes.clone(),
            transform: transform.clone(),
        };
        (
            ProtectedTransactionIterator::new(Box::new(inner), transform),
            closes,
        )
    }

    #[test]
    fn records_are_unprotected_lazily() {
        let (mut iter, _) = unruly();
        let txn = iter.next().unwrap().unwrap();
        assert_eq!(txn.tid, Tid::from_u64(1));
        assert_eq!(txn.user, "user");
        assert_eq!(txn.extension, b"ext");

        let records: Vec<_> = txn.map(Result::unwrap).collect();
        assert_eq!(records[0].data.as_deref(), Some(&b"payload"[..]));
        assert_eq!(records[1].data, None);
        assert_eq!(records[2].data.as_deref(), Some(&b""[..]));
    }

    #[test]
    fn close_stops_iteration_and_is_forwarded_once() {
        let (mut iter, closes) = unruly();
        assert!(iter.next().is_some());

        iter.close();
        assert!(iter.is_closed());
        assert!(iter.next().is_none());

        iter.close();
        assert!(iter.next().is_none());
        drop(iter);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_closes_delegate() {
        let (iter, closes) = unruly();
        drop(iter);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }
}
