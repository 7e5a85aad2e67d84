//! Store a small key/value table in a directory of range files and watch the
//! write hook stream every committed page.
//!
//! Run with: cargo run --example replicated-kv

use anyhow::Result;
use rusqlite::{Connection, OpenFlags};

fn main() -> Result<()> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Info)
        .init()?;

    let dir = tempfile::tempdir()?;
    let data_dir = dir.path().join("pages");
    let db_path = dir.path().join("kv.db");

    rangebase::register("rangebase", &data_dir, 4096)?;
    rangebase::set_write_hook("rangebase", |offset, page| {
        log::info!("replicate {} bytes at offset {}", page.len(), offset);
        0
    })?;

    let conn = Connection::open_with_flags_and_vfs(&db_path, OpenFlags::default(), "rangebase")?;
    conn.execute_batch(
        "CREATE TABLE kv (key TEXT PRIMARY KEY, value TEXT);
         INSERT INTO kv VALUES ('language', 'rust'), ('engine', 'sqlite');",
    )?;

    let value: String = conn.query_row("SELECT value FROM kv WHERE key = 'language'", [], |row| {
        row.get(0)
    })?;
    log::info!("read back: language = {}", value);

    log::info!("data directory {}:", data_dir.display());
    for entry in std::fs::read_dir(&data_dir)? {
        let entry = entry?;
        log::info!(
            "  {} ({} bytes)",
            entry.file_name().to_string_lossy(),
            entry.metadata()?.len()
        );
    }

    drop(conn);
    rangebase::unregister("rangebase")?;
    Ok(())
}
