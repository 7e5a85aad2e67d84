use std::fs;
use std::sync::{Arc, Mutex};

use rangebase::{
    lookup, register, set_write_hook, unregister, StoreError, META_FILE_NAME, RANGE_PAGES,
};

const PAGE_SIZE: usize = 4096;

fn page_of(byte: u8) -> Vec<u8> {
    vec![byte; PAGE_SIZE]
}

fn page_offset(page: u64) -> u64 {
    (page - 1) * PAGE_SIZE as u64
}

#[test]
fn single_page_write_lands_in_first_range_file() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    register("scenario-single-page", &data, PAGE_SIZE).unwrap();
    let vfs = lookup("scenario-single-page").unwrap();

    vfs.write_page(0, &page_of(0xAA)).unwrap();

    let bytes = fs::read(data.join("0000000001")).unwrap();
    assert_eq!(bytes.len(), PAGE_SIZE);
    assert!(bytes.iter().all(|b| *b == 0xAA));

    let meta = fs::read(data.join(META_FILE_NAME)).unwrap();
    assert_eq!(meta, 1u64.to_le_bytes());
    assert_eq!(vfs.database_size(), PAGE_SIZE as u64);
    assert!(vfs.has_page_one());

    drop(vfs);
    unregister("scenario-single-page").unwrap();
}

#[test]
fn sequential_writes_cross_the_range_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    register("scenario-boundary", &data, PAGE_SIZE).unwrap();
    let vfs = lookup("scenario-boundary").unwrap();

    for page in 1..=1025u64 {
        vfs.write_page(page_offset(page), &page_of((page % 251) as u8))
            .unwrap();
    }

    let range1 = fs::read(data.join("0000000001")).unwrap();
    assert_eq!(range1.len() as u64, RANGE_PAGES * PAGE_SIZE as u64);
    let last_in_range1 = &range1[1023 * PAGE_SIZE..];
    assert!(last_in_range1.iter().all(|b| *b == (1024 % 251) as u8));

    let range2 = fs::read(data.join("0000000002")).unwrap();
    assert_eq!(range2.len(), PAGE_SIZE);
    assert!(range2.iter().all(|b| *b == (1025 % 251) as u8));

    let meta = fs::read(data.join(META_FILE_NAME)).unwrap();
    assert_eq!(meta, 1025u64.to_le_bytes());
    assert_eq!(vfs.database_size(), 1025 * PAGE_SIZE as u64);

    drop(vfs);
    unregister("scenario-boundary").unwrap();
}

#[test]
fn sparse_read_reports_short_read_with_zeroed_buffer() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    register("scenario-sparse", &data, PAGE_SIZE).unwrap();
    let vfs = lookup("scenario-sparse").unwrap();

    let mut buf = vec![0xFF; PAGE_SIZE];
    let err = vfs.read_page(0, &mut buf).unwrap_err();
    assert!(matches!(err, StoreError::ShortRead { got: 0, .. }));
    assert_eq!(
        err.sqlite_code(),
        libsqlite3_sys::SQLITE_IOERR_SHORT_READ
    );
    assert!(buf.iter().all(|b| *b == 0));

    // the range file was still created by the first reference
    assert!(data.join("0000000001").exists());
    assert!(!vfs.has_page_one());

    drop(vfs);
    unregister("scenario-sparse").unwrap();
}

#[test]
fn shrinking_truncate_removes_and_trims_tail_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    register("scenario-truncate", &data, PAGE_SIZE).unwrap();
    let vfs = lookup("scenario-truncate").unwrap();

    for page in 1..=2050u64 {
        vfs.write_page(page_offset(page), &page_of(page as u8))
            .unwrap();
    }
    assert!(data.join("0000000003").exists());

    vfs.truncate_pages(1500 * PAGE_SIZE as u64).unwrap();

    assert!(!data.join("0000000003").exists());
    let range2 = fs::metadata(data.join("0000000002")).unwrap().len();
    assert_eq!(range2, (1500 - 1024) * PAGE_SIZE as u64);
    let range1 = fs::metadata(data.join("0000000001")).unwrap().len();
    assert_eq!(range1, RANGE_PAGES * PAGE_SIZE as u64);

    // the page count keeps its pre-truncate value until the next write
    assert_eq!(vfs.database_size(), 2050 * PAGE_SIZE as u64);

    drop(vfs);
    unregister("scenario-truncate").unwrap();
}

#[test]
fn growing_truncate_is_a_no_op() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    register("scenario-truncate-grow", &data, PAGE_SIZE).unwrap();
    let vfs = lookup("scenario-truncate-grow").unwrap();

    vfs.write_page(0, &page_of(1)).unwrap();
    vfs.truncate_pages(100 * PAGE_SIZE as u64).unwrap();

    assert_eq!(
        fs::metadata(data.join("0000000001")).unwrap().len(),
        PAGE_SIZE as u64
    );
    assert_eq!(vfs.database_size(), PAGE_SIZE as u64);

    drop(vfs);
    unregister("scenario-truncate-grow").unwrap();
}

#[test]
fn write_hook_fires_once_per_page_write() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    register("scenario-hook", &data, PAGE_SIZE).unwrap();
    let vfs = lookup("scenario-hook").unwrap();

    let calls: Arc<Mutex<Vec<(u64, Vec<u8>)>>> = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&calls);
    set_write_hook("scenario-hook", move |offset, page| {
        recorder.lock().unwrap().push((offset, page.to_vec()));
        0
    })
    .unwrap();

    let page = page_of(0x5A);
    vfs.write_page(6 * PAGE_SIZE as u64, &page).unwrap();

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, 24576);
    assert_eq!(calls[0].1, page);

    drop(vfs);
    unregister("scenario-hook").unwrap();
}

#[test]
fn rewriting_a_page_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    register("scenario-idempotent", &data, PAGE_SIZE).unwrap();
    let vfs = lookup("scenario-idempotent").unwrap();

    let page = page_of(0x42);
    vfs.write_page(page_offset(3), &page).unwrap();
    let size_after_first = vfs.database_size();
    let range_after_first = fs::read(data.join("0000000001")).unwrap();

    vfs.write_page(page_offset(3), &page).unwrap();
    assert_eq!(vfs.database_size(), size_after_first);
    assert_eq!(fs::read(data.join("0000000001")).unwrap(), range_after_first);

    drop(vfs);
    unregister("scenario-idempotent").unwrap();
}

#[test]
fn reads_observe_the_latest_write() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");
    register("scenario-read-back", &data, PAGE_SIZE).unwrap();
    let vfs = lookup("scenario-read-back").unwrap();

    vfs.write_page(page_offset(9), &page_of(0x11)).unwrap();
    vfs.write_page(page_offset(9), &page_of(0x22)).unwrap();

    let mut buf = vec![0u8; PAGE_SIZE];
    vfs.read_page(page_offset(9), &mut buf).unwrap();
    assert!(buf.iter().all(|b| *b == 0x22));

    // partial header-style read of a cached page
    let mut header = vec![0u8; 100];
    vfs.read_page(page_offset(9), &mut header).unwrap();
    assert!(header.iter().all(|b| *b == 0x22));

    drop(vfs);
    unregister("scenario-read-back").unwrap();
}

#[test]
fn data_survives_unregister_and_reregister() {
    let dir = tempfile::tempdir().unwrap();
    let data = dir.path().join("data");

    register("scenario-persist-a", &data, PAGE_SIZE).unwrap();
    let vfs = lookup("scenario-persist-a").unwrap();
    for page in 1..=3u64 {
        vfs.write_page(page_offset(page), &page_of(page as u8))
            .unwrap();
    }
    drop(vfs);
    unregister("scenario-persist-a").unwrap();

    register("scenario-persist-b", &data, PAGE_SIZE).unwrap();
    let vfs = lookup("scenario-persist-b").unwrap();
    assert_eq!(vfs.database_size(), 3 * PAGE_SIZE as u64);

    let mut buf = vec![0u8; PAGE_SIZE];
    vfs.read_page(page_offset(2), &mut buf).unwrap();
    assert!(buf.iter().all(|b| *b == 2));

    drop(vfs);
    unregister("scenario-persist-b").unwrap();
}

#[test]
fn configuration_is_validated() {
    let dir = tempfile::tempdir().unwrap();

    assert!(matches!(
        register("scenario-small-pages", dir.path(), 256),
        Err(StoreError::Config(_))
    ));
    assert!(matches!(
        register("", dir.path(), PAGE_SIZE),
        Err(StoreError::Config(_))
    ));
    assert!(matches!(
        register("scenario-empty-path", "", PAGE_SIZE),
        Err(StoreError::Config(_))
    ));

    assert!(matches!(
        set_write_hook("scenario-never-registered", |_, _| 0),
        Err(StoreError::UnknownVfs(_))
    ));
    assert!(matches!(
        unregister("scenario-never-registered"),
        Err(StoreError::UnknownVfs(_))
    ));
    assert!(lookup("scenario-never-registered").is_none());
}
