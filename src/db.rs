use std::path::{Path, PathBuf};

use rusqlite::{Connection, OpenFlags};
use tracing::info;

use crate::errors::AppResult;

pub struct DatabaseContext {
    pub connection: Connection,
    pub path: PathBuf,
}

/// Opens (creating if necessary) the pipeline database and applies the
/// idempotent schema migrations. The zip reference table is read-only to the
/// pipeline; it is created here so a fresh database can be seeded.
pub fn bootstrap<P: AsRef<Path>>(database_path: P) -> AppResult<DatabaseContext> {
    let database_path = database_path.as_ref();
    if let Some(parent) = database_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
    let connection = Connection::open_with_flags(database_path, flags)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA foreign_keys = ON;
        "#,
    )?;
    run_migrations(&connection)?;

    info!(
        target: "database_bootstrap",
        path = %database_path.display(),
        "database context established"
    );

    Ok(DatabaseContext {
        connection,
        path: database_path.to_path_buf(),
    })
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS zip_codes (
            zip TEXT PRIMARY KEY,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            population TEXT
        );

        CREATE TABLE IF NOT EXISTS processing_progress (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            zip TEXT NOT NULL UNIQUE,
            processed_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );

        CREATE TABLE IF NOT EXISTS pois (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            housenumber TEXT,
            street TEXT,
            city TEXT,
            state TEXT,
            postcode TEXT,
            phone TEXT,
            website TEXT,
            opening_hours TEXT,
            latitude REAL NOT NULL,
            longitude REAL NOT NULL,
            UNIQUE (name, latitude, longitude)
        );

        CREATE INDEX IF NOT EXISTS idx_pois_lat_lon ON pois(latitude, longitude);
        "#,
    )?;
    Ok(())
}
