//! # cipherstore storage
//!
//! Storage contract and the encrypting storage proxy.
//!
//! [`EncryptingBackend`] wraps any [`StorageBackend`] and routes every
//! operation that touches record bytes through a
//! [`RecordTransform`](cipherstore_transform::RecordTransform): stores are
//! protected, loads are unprotected, transaction iteration and pack-time
//! reference resolution see plaintext, and blob files are encrypted at rest
//! with decrypted copies handed out on read. Everything else is forwarded
//! unchanged, including the delegate's errors.
//!
//! ## Available Storages
//!
//! - [`InMemoryBackend`] - reference storage for tests and tooling
//! - [`EncryptingBackend`] - encrypting wrapper around another storage
//!
//! ## Example
//!
//! ```rust
//! use cipherstore_storage::{EncryptingBackend, InMemoryBackend, Oid, StorageBackend, Tid, TransactionMeta};
//! use cipherstore_transform::RecordTransform;
//! use std::sync::Arc;
//!
//! let storage = EncryptingBackend::new(Arc::new(InMemoryBackend::new()), RecordTransform::trivial());
//!
//! let txn = TransactionMeta::new("alice", "init");
//! storage.tpc_begin(&txn).unwrap();
//! storage.store(Oid::ROOT, Tid::ZERO, b"hello world", &txn).unwrap();
//! storage.tpc_vote(&txn).unwrap();
//! storage.tpc_finish(&txn).unwrap();
//!
//! assert_eq!(storage.load(Oid::ROOT).unwrap().0, b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
pub mod blob;
mod copy;
mod encrypted;
mod error;
mod iterator;
mod memory;
mod types;

pub use backend::{Database, ReferencesFn, StorageBackend};
pub use copy::copy_transactions;
pub use encrypted::{EncryptingBackend, Side};
pub use error::{StorageError, StorageResult};
pub use iterator::{
    DataRecord, ProtectedTransactionIterator, RecordIter, TransactionIterator, TransactionRecord,
};
pub use memory::{InMemoryBackend, MemorySnapshot};
pub use types::{
    Capabilities, HistoryEntry, IterRecord, LoadedRevision, Oid, Tid, TransactionMeta, UndoEntry,
};
