use std::path::Path;

use rusqlite::{params, Connection};
use serde::Deserialize;
use tracing::info;

use crate::errors::AppResult;

/// One row of the reference CSV. The population column is carried verbatim
/// into the store; coercion to a number happens at load time in one place.
#[derive(Debug, Deserialize)]
struct ZipSeedRow {
    zip: String,
    latitude: f64,
    longitude: f64,
    #[serde(default)]
    population: String,
}

/// Seeds the zip reference table from a CSV with headers
/// `zip,latitude,longitude,population`. Existing zips are left untouched, so
/// re-seeding the same file is a no-op. Returns the number of rows inserted.
pub fn seed_zip_codes(conn: &mut Connection, path: &Path) -> AppResult<usize> {
    let mut reader = csv::Reader::from_path(path)?;

    let tx = conn.transaction()?;
    let mut inserted = 0;
    {
        let mut stmt = tx.prepare(
            "INSERT OR IGNORE INTO zip_codes (zip, latitude, longitude, population)
            VALUES (?1, ?2, ?3, ?4)",
        )?;
        for row in reader.deserialize::<ZipSeedRow>() {
            let row = row?;
            inserted += stmt.execute(params![
                row.zip,
                row.latitude,
                row.longitude,
                row.population
            ])?;
        }
    }
    tx.commit()?;

    info!(path = %path.display(), inserted, "seeded zip reference table");
    Ok(inserted)
}
