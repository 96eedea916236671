//! Identifiers and value types shared by storages.

use std::fmt;
use uuid::Uuid;

macro_rules! id_type {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
        pub struct $name([u8; 8]);

        impl $name {
            /// Creates an identifier from its big-endian bytes.
            #[must_use]
            pub const fn new(bytes: [u8; 8]) -> Self {
                Self(bytes)
            }

            /// Creates an identifier from an integer.
            #[must_use]
            pub const fn from_u64(value: u64) -> Self {
                Self(value.to_be_bytes())
            }

            /// Returns the identifier as an integer.
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                u64::from_be_bytes(self.0)
            }

            /// Returns the big-endian bytes.
            #[must_use]
            pub const fn as_bytes(&self) -> &[u8; 8] {
                &self.0
            }

            /// Returns 16 lowercase hex digits, as used in blob file names.
            #[must_use]
            pub fn to_hex(self) -> String {
                format!("{:016x}", self.as_u64())
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::from_u64(value)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}(0x{})", stringify!($name), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{}", self.to_hex())
            }
        }
    };
}

id_type!(
    /// An object identifier.
    Oid
);

id_type!(
    /// A transaction identifier, also used as the serial of a revision.
    ///
    /// Tids are strictly increasing in commit order.
    Tid
);

impl Oid {
    /// The root object, from which garbage collection starts.
    pub const ROOT: Self = Self([0; 8]);
}

impl Tid {
    /// The serial of an object that has never been stored.
    pub const ZERO: Self = Self([0; 8]);

    /// Returns the following tid, or `None` once the tid space is used up.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self.as_u64().checked_add(1) {
            Some(n) => Some(Self::from_u64(n)),
            None => None,
        }
    }
}

/// Metadata of a transaction passed through the two-phase commit calls.
///
/// Every instance carries a unique handle; clones share it, so the same value
/// can be passed to `tpc_begin`, `store` and `tpc_finish`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionMeta {
    handle: Uuid,
    /// Who made the change.
    pub user: String,
    /// What the change was.
    pub description: String,
    /// Opaque extension data.
    pub extension: Vec<u8>,
    /// The tid to commit at; set when copying or restoring history.
    pub tid: Option<Tid>,
}

impl TransactionMeta {
    /// Creates transaction metadata with a fresh handle.
    #[must_use]
    pub fn new(user: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            handle: Uuid::new_v4(),
            user: user.into(),
            description: description.into(),
            extension: Vec::new(),
            tid: None,
        }
    }

    /// Sets the extension data.
    #[must_use]
    pub fn with_extension(mut self, extension: Vec<u8>) -> Self {
        self.extension = extension;
        self
    }

    /// Forces the commit tid.
    #[must_use]
    pub fn with_tid(mut self, tid: Tid) -> Self {
        self.tid = Some(tid);
        self
    }

    /// Returns the handle identifying this transaction.
    #[must_use]
    pub fn handle(&self) -> Uuid {
        self.handle
    }
}

impl Default for TransactionMeta {
    fn default() -> Self {
        Self::new("", "")
    }
}

/// One entry of an object's history, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryEntry {
    /// The revision's tid.
    pub tid: Tid,
    /// The committing user.
    pub user: String,
    /// The transaction description.
    pub description: String,
    /// Size of the stored record in bytes.
    pub size: usize,
}

/// A revision returned by `load_before`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedRevision {
    /// Record bytes.
    pub data: Vec<u8>,
    /// The revision's tid.
    pub serial: Tid,
    /// The tid of the revision that replaced it, if any.
    pub next_serial: Option<Tid>,
}

/// A record returned by `record_iternext`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IterRecord {
    /// The object id.
    pub oid: Oid,
    /// The current revision's tid.
    pub tid: Tid,
    /// Record bytes.
    pub data: Vec<u8>,
    /// Cursor for the next call, `None` at the end.
    pub next: Option<Oid>,
}

/// An entry of the undo log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoEntry {
    /// Opaque undo identifier.
    pub id: Vec<u8>,
    /// The transaction's tid.
    pub tid: Tid,
    /// The committing user.
    pub user: String,
    /// The transaction description.
    pub description: String,
}

/// Optional features a storage provides.
///
/// Wrappers report the set of the storage they wrap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Blob side files.
    pub blobs: bool,
    /// Transactional undo.
    pub undo: bool,
    /// Transaction iteration.
    pub iteration: bool,
    /// Record iteration via `record_iternext`.
    pub record_iteration: bool,
    /// Restoring history with forced tids.
    pub restore: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_big_endian() {
        let oid = Oid::from_u64(0x0102);
        assert_eq!(oid.as_bytes(), &[0, 0, 0, 0, 0, 0, 1, 2]);
        assert_eq!(oid.to_hex(), "0000000000000102");
        assert_eq!(oid.to_string(), "0x0000000000000102");
        assert!(Oid::from_u64(1) < Oid::from_u64(256));
    }

    #[test]
    fn root_and_zero() {
        assert_eq!(Oid::ROOT.as_u64(), 0);
        assert_eq!(Tid::ZERO.next(), Some(Tid::from_u64(1)));
        assert_eq!(Tid::from_u64(u64::MAX).next(), None);
    }

    #[test]
    fn transaction_handles_are_unique() {
        let a = TransactionMeta::new("user", "first");
        let b = TransactionMeta::new("user", "first");
        assert_ne!(a.handle(), b.handle());
        assert_eq!(a.clone().handle(), a.handle());
    }
}
