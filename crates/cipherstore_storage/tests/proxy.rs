//! Integration tests for the encrypting storage proxy.

mod common;

use cipherstore_storage::{
    Database, EncryptingBackend, InMemoryBackend, Oid, StorageBackend, StorageError, Tid,
    TransactionMeta,
};
use cipherstore_transform::RecordTransform;
use common::{commit, commit_blob, json_references, keyed_transform, HexDatabase, Record};
use std::collections::BTreeSet;
use std::fs;
use std::io::Read;
use std::sync::Arc;
use tempfile::TempDir;

fn live_oids(storage: &dyn StorageBackend) -> BTreeSet<Oid> {
    let mut oids = BTreeSet::new();
    let mut cursor = None;
    loop {
        let record = match storage.record_iternext(cursor) {
            Ok(record) => record,
            Err(e) if e.is_not_found() => break,
            Err(e) => panic!("record_iternext failed: {e}"),
        };
        oids.insert(record.oid);
        match record.next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }
    oids
}

#[test]
fn end_to_end_close_and_reopen() {
    let dir = TempDir::new().unwrap();
    let blob_dir = dir.path().join("blobs");
    let scratch = dir.path().join("scratch");
    fs::create_dir_all(&scratch).unwrap();

    let base = Arc::new(InMemoryBackend::new().with_blob_dir(&blob_dir));
    let storage = EncryptingBackend::new(base.clone(), keyed_transform(dir.path()));

    let a = storage.new_oid().unwrap();
    let b = storage.new_oid().unwrap();
    commit(
        storage.as_ref(),
        &[
            (Oid::ROOT, Record::new(0, &[a, b]).encode()),
            (a, serde_json::to_vec(&42).unwrap()),
        ],
    );
    let blob_tid = commit_blob(
        storage.as_ref(),
        b,
        &Record::new(1, &[]).encode(),
        b"Hi\nworld.\n",
        &scratch,
    );
    storage.close().unwrap();
    let snapshot = base.snapshot();
    drop(storage);
    drop(base);

    // Reopen over the same data and key files.
    let base = Arc::new(InMemoryBackend::from_snapshot(snapshot));
    let storage = EncryptingBackend::new(base.clone(), keyed_transform(dir.path()));

    let (data, _) = storage.load(a).unwrap();
    assert_eq!(serde_json::from_slice::<i64>(&data).unwrap(), 42);

    let path = storage.load_blob(b, blob_tid).unwrap();
    assert_eq!(fs::read(&path).unwrap(), b"Hi\nworld.\n");
    assert!(path.starts_with(dir.path().join("tmp")));

    let mut content = Vec::new();
    storage
        .open_committed_blob_file(b, blob_tid)
        .unwrap()
        .read_to_end(&mut content)
        .unwrap();
    assert_eq!(content, b"Hi\nworld.\n");

    // The delegate only ever sees ciphertext.
    assert!(base.load(a).unwrap().0.starts_with(b".e"));
    let committed_blob = base.blob_filename(b, blob_tid).unwrap();
    assert!(fs::read(committed_blob).unwrap().starts_with(b".e"));
}

#[test]
fn missing_blob_is_not_found() {
    let dir = TempDir::new().unwrap();
    let base = Arc::new(InMemoryBackend::new().with_blob_dir(dir.path().join("blobs")));
    let storage = EncryptingBackend::new(base, RecordTransform::trivial());

    let err = storage.load_blob(Oid::from_u64(1), Tid::from_u64(1)).unwrap_err();
    assert!(matches!(
        err,
        StorageError::NotFound {
            serial: Some(_),
            ..
        }
    ));
}

#[test]
fn server_side_load_returns_ciphertext() {
    let dir = TempDir::new().unwrap();
    let transform = keyed_transform(dir.path());
    let base = Arc::new(InMemoryBackend::new().with_blob_dir(dir.path().join("blobs")));
    let client = EncryptingBackend::new(base.clone(), transform.clone());
    let server = EncryptingBackend::server(base.clone(), transform);

    let record = Record::new(7, &[]).encode();
    let tid = commit(client.as_ref(), &[(Oid::ROOT, record.clone())]);

    let (raw, serial) = server.load(Oid::ROOT).unwrap();
    assert_eq!(serial, tid);
    assert!(raw.starts_with(b".e"));
    assert_eq!(raw, base.load(Oid::ROOT).unwrap().0);
    assert_eq!(server.load_serial(Oid::ROOT, tid).unwrap(), raw);
    assert_eq!(client.load(Oid::ROOT).unwrap().0, record);

    // Records stored through the server are not encrypted a second time.
    let framed = client.transform_record_data(b"from the wire").unwrap();
    commit(server.as_ref(), &[(Oid::from_u64(1), framed.clone())]);
    assert_eq!(base.load(Oid::from_u64(1)).unwrap().0, framed);
    assert_eq!(client.load(Oid::from_u64(1)).unwrap().0, b"from the wire");

    // Iteration is raw on the server and decrypted on the client.
    let mut raw_iter = server.iterator(None, None).unwrap();
    let first = raw_iter.next().unwrap().unwrap();
    let records: Vec<_> = first.map(Result::unwrap).collect();
    assert!(records[0].data.as_deref().unwrap().starts_with(b".e"));
}

#[test]
fn server_side_still_decrypts_blobs_and_pack() {
    let dir = TempDir::new().unwrap();
    let scratch = dir.path().join("scratch");
    fs::create_dir_all(&scratch).unwrap();
    let transform = keyed_transform(dir.path());
    let base = Arc::new(InMemoryBackend::new().with_blob_dir(dir.path().join("blobs")));
    let client = EncryptingBackend::new(base.clone(), transform.clone());
    let server = EncryptingBackend::server(base.clone(), transform);

    let child = Oid::from_u64(1);
    commit(
        client.as_ref(),
        &[(Oid::ROOT, Record::new(0, &[child]).encode())],
    );
    let tid = commit_blob(
        client.as_ref(),
        child,
        &Record::new(1, &[]).encode(),
        b"blob body",
        &scratch,
    );

    assert_eq!(fs::read(server.load_blob(child, tid).unwrap()).unwrap(), b"blob body");

    server.pack(tid, &json_references, true).unwrap();
    assert!(server.load(child).is_ok());
}

#[test]
fn pack_keeps_the_same_objects_with_and_without_encryption() {
    let dir = TempDir::new().unwrap();
    let plain = Arc::new(InMemoryBackend::new());
    let encrypted_base = Arc::new(InMemoryBackend::new());
    let encrypted = EncryptingBackend::new(encrypted_base.clone(), keyed_transform(dir.path()));

    let stores: [&dyn StorageBackend; 2] = [plain.as_ref(), encrypted.as_ref()];
    let (a, b, c) = (Oid::from_u64(1), Oid::from_u64(2), Oid::from_u64(3));
    let mut pack_tid = Tid::ZERO;
    for storage in stores {
        commit(
            storage,
            &[
                (Oid::ROOT, Record::new(0, &[a, b]).encode()),
                (a, Record::new(1, &[]).encode()),
                (b, Record::new(2, &[c]).encode()),
                (c, Record::new(3, &[]).encode()),
            ],
        );
        // Dropping the reference to b leaves b and c unreachable.
        pack_tid = commit(
            storage,
            &[
                (Oid::ROOT, Record::new(0, &[a]).encode()),
                (a, Record::new(10, &[]).encode()),
            ],
        );
    }

    plain.pack(pack_tid, &json_references, true).unwrap();
    encrypted.pack(pack_tid, &json_references, true).unwrap();

    let expected: BTreeSet<Oid> = [Oid::ROOT, a].into_iter().collect();
    assert_eq!(live_oids(plain.as_ref()), expected);
    assert_eq!(live_oids(encrypted.as_ref()), expected);
    assert_eq!(Record::decode(&encrypted.load(a).unwrap().0).value, 10);
    assert!(encrypted_base.load(a).unwrap().0.starts_with(b".e"));
}

#[test]
fn pack_without_unprotect_would_fail() {
    let dir = TempDir::new().unwrap();
    let base = Arc::new(InMemoryBackend::new());
    let storage = EncryptingBackend::new(base.clone(), keyed_transform(dir.path()));
    let tid = commit(
        storage.as_ref(),
        &[(Oid::ROOT, Record::new(0, &[]).encode())],
    );

    // The delegate's records are ciphertext, which the resolver cannot parse.
    assert!(base.pack(tid, &json_references, true).is_err());
    assert!(storage.pack(tid, &json_references, true).is_ok());
}

#[test]
fn iteration_decrypts_records() {
    let dir = TempDir::new().unwrap();
    let base = Arc::new(InMemoryBackend::new());
    let storage = EncryptingBackend::new(base.clone(), keyed_transform(dir.path()));

    let t1 = commit(storage.as_ref(), &[(Oid::ROOT, b"first".to_vec())]);
    let t2 = commit(storage.as_ref(), &[(Oid::ROOT, b"second".to_vec())]);

    let mut iter = storage.iterator(None, None).unwrap();
    let txn = iter.next().unwrap().unwrap();
    assert_eq!(txn.tid, t1);
    assert_eq!(txn.user, "tester");
    let data: Vec<_> = txn.map(|r| r.unwrap().data.unwrap()).collect();
    assert_eq!(data, vec![b"first".to_vec()]);

    iter.close();
    assert!(iter.next().is_none());
    iter.close();

    let mut from_second = storage.iterator(Some(t2), Some(t2)).unwrap();
    let txn = from_second.next().unwrap().unwrap();
    let records: Vec<_> = txn.map(Result::unwrap).collect();
    assert_eq!(records[0].data.as_deref(), Some(&b"second"[..]));
    assert!(from_second.next().is_none());
}

#[test]
fn wrapper_hooks_compose_with_database_transform() {
    let storage = EncryptingBackend::new(Arc::new(InMemoryBackend::new()), RecordTransform::trivial());
    let hex_db = Arc::new(HexDatabase::default());
    let db: Arc<dyn Database> = hex_db.clone();
    storage.register_db(Arc::downgrade(&db));

    // Outbound: database transform first, then protect.
    let stored = storage.transform_record_data(b"abc").unwrap();
    assert_eq!(stored, b".e616263");
    // Inbound: unprotect first, then the database's inverse.
    assert_eq!(storage.untransform_record_data(&stored).unwrap(), b"abc");

    let record = Record::new(5, &[Oid::from_u64(9)]).encode();
    let stored = storage.transform_record_data(&record).unwrap();
    let mut oids = Vec::new();
    storage.references(&stored, &mut oids).unwrap();
    assert_eq!(oids, vec![Oid::from_u64(9)]);

    storage.invalidate(Tid::from_u64(3), &[Oid::ROOT]).unwrap();
    storage.invalidate_cache().unwrap();
    assert_eq!(
        hex_db.invalidated.lock().as_slice(),
        &[(Tid::from_u64(3), vec![Oid::ROOT])]
    );
    assert_eq!(*hex_db.cache_flushes.lock(), 1);

    drop(db);
    drop(hex_db);
    assert!(matches!(
        storage.invalidate_cache(),
        Err(StorageError::DatabaseGone)
    ));
}

#[test]
fn disabled_encryption_matches_bare_storage() {
    let dir = TempDir::new().unwrap();
    let bare = InMemoryBackend::new();
    let wrapped_base = Arc::new(InMemoryBackend::new().with_blob_dir(dir.path().join("blobs")));
    let storage =
        EncryptingBackend::with_encrypt(wrapped_base.clone(), keyed_transform(dir.path()), false);
    assert!(!storage.encrypts());

    let record = Record::new(1, &[]).encode();
    commit(&bare, &[(Oid::ROOT, record.clone())]);
    commit(storage.as_ref(), &[(Oid::ROOT, record.clone())]);
    assert_eq!(wrapped_base.load(Oid::ROOT).unwrap().0, bare.load(Oid::ROOT).unwrap().0);

    let scratch = dir.path().join("scratch");
    fs::create_dir_all(&scratch).unwrap();
    let tid = commit_blob(storage.as_ref(), Oid::from_u64(1), &record, b"plain blob", &scratch);
    let committed = wrapped_base.blob_filename(Oid::from_u64(1), tid).unwrap();
    assert_eq!(fs::read(committed).unwrap(), b"plain blob");
    assert_eq!(
        fs::read(storage.load_blob(Oid::from_u64(1), tid).unwrap()).unwrap(),
        b"plain blob"
    );
}

#[test]
fn restore_blob_leaves_caller_file_alone() {
    let dir = TempDir::new().unwrap();
    let base = Arc::new(InMemoryBackend::new().with_blob_dir(dir.path().join("blobs")));
    let storage = EncryptingBackend::new(base.clone(), keyed_transform(dir.path()));

    let incoming = dir.path().join("incoming.blob");
    fs::write(&incoming, b"restored body").unwrap();

    let oid = Oid::from_u64(4);
    let tid = Tid::from_u64(1000);
    let txn = TransactionMeta::new("copier", "restore").with_tid(tid);
    storage.tpc_begin(&txn).unwrap();
    storage
        .restore_blob(oid, tid, Some(&b"record"[..]), &incoming, None, &txn)
        .unwrap();
    storage.tpc_vote(&txn).unwrap();
    assert_eq!(storage.tpc_finish(&txn).unwrap(), tid);

    assert_eq!(fs::read(&incoming).unwrap(), b"restored body");
    let committed = fs::read(base.blob_filename(oid, tid).unwrap()).unwrap();
    assert!(committed.starts_with(b".e"));
    assert_eq!(fs::read(storage.load_blob(oid, tid).unwrap()).unwrap(), b"restored body");
    assert_eq!(storage.load(oid).unwrap().0, b"record");
}

#[test]
fn mixed_legacy_and_encrypted_records_load() {
    let dir = TempDir::new().unwrap();
    let base = Arc::new(InMemoryBackend::new());

    // Written before encryption was switched on.
    commit(base.as_ref(), &[(Oid::ROOT, b"legacy record".to_vec())]);

    let storage = EncryptingBackend::new(base.clone(), keyed_transform(dir.path()));
    commit(storage.as_ref(), &[(Oid::from_u64(1), b"new record".to_vec())]);

    assert_eq!(storage.load(Oid::ROOT).unwrap().0, b"legacy record");
    assert_eq!(storage.load(Oid::from_u64(1)).unwrap().0, b"new record");
}
