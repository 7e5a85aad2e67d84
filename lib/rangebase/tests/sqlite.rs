//! End-to-end tests that drive the storage backend through a real SQLite
//! connection.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OpenFlags};

use rangebase::{register, set_open_hook, set_write_hook, unregister, META_FILE_NAME};

const PAGE_SIZE: usize = 4096;

fn open(db: &Path, vfs: &str) -> Connection {
    Connection::open_with_flags_and_vfs(db, OpenFlags::default(), vfs).unwrap()
}

fn journal_path(db: &Path) -> PathBuf {
    let mut name = db.as_os_str().to_owned();
    name.push("-journal");
    PathBuf::from(name)
}

fn wal_path(db: &Path) -> PathBuf {
    let mut name = db.as_os_str().to_owned();
    name.push("-wal");
    PathBuf::from(name)
}

/// Every entry in the data directory must be the metadata file or a range
/// file; journals never land there.
fn assert_only_paged_storage(data: &Path) {
    for entry in fs::read_dir(data).unwrap() {
        let name = entry.unwrap().file_name();
        let name = name.to_string_lossy();
        assert!(
            name == META_FILE_NAME || (name.len() == 10 && name.chars().all(|c| c.is_ascii_digit())),
            "unexpected file in data directory: {}",
            name
        );
    }
}

#[test]
fn commits_land_in_range_files_and_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let db = dir.path().join("main.db");
    register("e2e-basic", &data, PAGE_SIZE).unwrap();

    {
        let conn = open(&db, "e2e-basic");
        conn.execute_batch(
            "CREATE TABLE kv (key TEXT PRIMARY KEY, value TEXT);
             INSERT INTO kv VALUES ('greeting', 'hello'), ('parting', 'goodbye');",
        )
        .unwrap();
    }

    assert!(data.join(META_FILE_NAME).exists());
    assert!(data.join("0000000001").exists());
    assert_only_paged_storage(&data);

    {
        let conn = open(&db, "e2e-basic");
        let value: String = conn
            .query_row("SELECT value FROM kv WHERE key = 'greeting'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(value, "hello");

        let rows: i64 = conn
            .query_row("SELECT count(*) FROM kv", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 2);
    }

    unregister("e2e-basic").unwrap();
}

#[test]
fn rollback_journal_passes_through_to_the_host_filesystem() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let db = dir.path().join("main.db");
    register("e2e-journal", &data, PAGE_SIZE).unwrap();

    let conn = open(&db, "e2e-journal");
    conn.execute_batch("CREATE TABLE t (x INTEGER)").unwrap();

    conn.execute_batch("BEGIN").unwrap();
    conn.execute("INSERT INTO t VALUES (1)", []).unwrap();
    // the hot journal lives beside the database, not in the data directory
    assert!(journal_path(&db).exists());
    assert_only_paged_storage(&data);
    conn.execute_batch("COMMIT").unwrap();
    assert!(!journal_path(&db).exists());

    // a rolled back transaction leaves the committed state intact
    conn.execute_batch("BEGIN").unwrap();
    conn.execute("INSERT INTO t VALUES (2)", []).unwrap();
    conn.execute_batch("ROLLBACK").unwrap();
    let rows: i64 = conn
        .query_row("SELECT count(*) FROM t", [], |row| row.get(0))
        .unwrap();
    assert_eq!(rows, 1);

    drop(conn);
    unregister("e2e-journal").unwrap();
}

#[test]
fn write_hook_sees_every_committed_page() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let db = dir.path().join("main.db");
    register("e2e-hook", &data, PAGE_SIZE).unwrap();

    let writes: Arc<Mutex<Vec<(u64, usize)>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&writes);
    set_write_hook("e2e-hook", move |offset, page| {
        recorder.lock().unwrap().push((offset, page.len()));
        0
    })
    .unwrap();

    let opens: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&opens);
    set_open_hook("e2e-hook", move |name| {
        recorder.lock().unwrap().push(name.to_owned());
    })
    .unwrap();

    {
        let conn = open(&db, "e2e-hook");
        conn.execute_batch(
            "CREATE TABLE t (x INTEGER);
             INSERT INTO t VALUES (42);",
        )
        .unwrap();
    }

    let writes = writes.lock().unwrap();
    assert!(!writes.is_empty());
    for (offset, len) in writes.iter() {
        assert_eq!(*len, PAGE_SIZE);
        assert_eq!(offset % PAGE_SIZE as u64, 0);
    }

    let opens = opens.lock().unwrap();
    assert!(opens.iter().any(|name| name.ends_with("main.db")));

    unregister("e2e-hook").unwrap();
}

#[test]
fn wal_mode_works_through_the_pass_through() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let db = dir.path().join("main.db");
    register("e2e-wal", &data, PAGE_SIZE).unwrap();

    {
        let conn = open(&db, "e2e-wal");
        let mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode, "wal");

        conn.execute_batch(
            "CREATE TABLE t (x INTEGER);
             INSERT INTO t VALUES (1), (2), (3);",
        )
        .unwrap();

        assert!(wal_path(&db).exists());
        assert_only_paged_storage(&data);
    }

    // closing the connection checkpointed the wal into the range files
    {
        let conn = open(&db, "e2e-wal");
        let rows: i64 = conn
            .query_row("SELECT count(*) FROM t", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 3);
    }

    unregister("e2e-wal").unwrap();
}

#[test]
fn a_database_larger_than_one_range_spans_multiple_files() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    let db = dir.path().join("main.db");
    register("e2e-spill", &data, PAGE_SIZE).unwrap();

    {
        let conn = open(&db, "e2e-spill");
        conn.execute_batch("CREATE TABLE blobs (data BLOB)").unwrap();
        // ~8 MiB of page data, two full ranges worth
        let blob = vec![0xABu8; 64 * 1024];
        for _ in 0..128 {
            conn.execute("INSERT INTO blobs VALUES (?1)", [&blob]).unwrap();
        }
    }

    assert!(data.join("0000000001").exists());
    assert!(data.join("0000000002").exists());
    let range1 = fs::metadata(data.join("0000000001")).unwrap().len();
    assert_eq!(range1, 1024 * PAGE_SIZE as u64);

    {
        let conn = open(&db, "e2e-spill");
        let rows: i64 = conn
            .query_row("SELECT count(*) FROM blobs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 128);
        let len: i64 = conn
            .query_row("SELECT length(data) FROM blobs LIMIT 1", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(len, 64 * 1024);
    }

    unregister("e2e-spill").unwrap();
}
