use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension, Row, ToSql};

use crate::errors::AppResult;
use crate::geo::ZipRecord;
use crate::search::PoiRecord;

/// Loads the next batch of zip reference rows in ascending zip order,
/// strictly after the resume marker when one exists. The ordered scan is
/// what makes resumption deterministic across runs.
pub fn load_zip_records(
    conn: &Connection,
    after: Option<&str>,
    limit: usize,
) -> AppResult<Vec<ZipRecord>> {
    let mut records = Vec::new();
    match after {
        Some(marker) => {
            let mut stmt = conn.prepare(
                "SELECT zip, latitude, longitude, population FROM zip_codes
                WHERE zip > ?1 ORDER BY zip ASC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![marker, limit as i64], zip_record_from_row)?;
            for row in rows {
                records.push(row?);
            }
        }
        None => {
            let mut stmt = conn.prepare(
                "SELECT zip, latitude, longitude, population FROM zip_codes
                ORDER BY zip ASC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], zip_record_from_row)?;
            for row in rows {
                records.push(row?);
            }
        }
    }
    Ok(records)
}

fn zip_record_from_row(row: &Row<'_>) -> rusqlite::Result<ZipRecord> {
    Ok(ZipRecord {
        zip: row.get(0)?,
        latitude: row.get(1)?,
        longitude: row.get(2)?,
        population: coerce_population(row.get(3)?),
    })
}

/// The reference data stores population as delivered by its source, so the
/// value may be an integer, a numeric string, junk text, or absent.
/// Anything unparseable counts as zero rather than failing the scan.
fn coerce_population(value: Value) -> u64 {
    match value {
        Value::Integer(n) => u64::try_from(n).unwrap_or(0),
        Value::Real(f) if f.is_finite() && f >= 0.0 => f as u64,
        Value::Text(text) => text.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

pub fn last_processed(conn: &Connection) -> AppResult<Option<String>> {
    let marker = conn
        .query_row(
            "SELECT zip FROM processing_progress ORDER BY id DESC LIMIT 1",
            [],
            |row| row.get(0),
        )
        .optional()?;
    Ok(marker)
}

pub fn advance(conn: &Connection, zip: &str) -> AppResult<()> {
    conn.execute(
        "INSERT INTO processing_progress (zip, processed_at) VALUES (?1, ?2)
        ON CONFLICT(zip) DO NOTHING",
        params![zip, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Bulk-inserts result rows in one statement, silently skipping rows whose
/// (name, latitude, longitude) tuple is already stored. Returns the number
/// of rows actually inserted; previously stored attributes are never
/// mutated.
pub fn upsert_pois(conn: &Connection, rows: &[PoiRecord]) -> AppResult<usize> {
    if rows.is_empty() {
        return Ok(0);
    }

    let placeholders = vec!["(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"; rows.len()].join(", ");
    let sql = format!(
        "INSERT INTO pois (name, housenumber, street, city, state, postcode,
        phone, website, opening_hours, latitude, longitude)
        VALUES {placeholders}
        ON CONFLICT DO NOTHING"
    );

    let mut values: Vec<&dyn ToSql> = Vec::with_capacity(rows.len() * 11);
    for row in rows {
        values.push(&row.name);
        values.push(&row.housenumber);
        values.push(&row.street);
        values.push(&row.city);
        values.push(&row.state);
        values.push(&row.postcode);
        values.push(&row.phone);
        values.push(&row.website);
        values.push(&row.opening_hours);
        values.push(&row.latitude);
        values.push(&row.longitude);
    }

    let inserted = conn.execute(&sql, &values[..])?;
    Ok(inserted)
}

pub fn count_pois(conn: &Connection) -> AppResult<i64> {
    let count = conn.query_row("SELECT COUNT(*) FROM pois", [], |row| row.get(0))?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::bootstrap;
    use tempfile::tempdir;

    fn test_conn() -> (tempfile::TempDir, Connection) {
        let dir = tempdir().unwrap();
        let ctx = bootstrap(dir.path().join("store.db")).unwrap();
        (dir, ctx.connection)
    }

    fn insert_zip(conn: &Connection, zip: &str, lat: f64, lon: f64, population: &str) {
        conn.execute(
            "INSERT INTO zip_codes (zip, latitude, longitude, population) VALUES (?1, ?2, ?3, ?4)",
            params![zip, lat, lon, population],
        )
        .unwrap();
    }

    fn poi(name: &str, lat: f64, lon: f64, phone: Option<&str>) -> PoiRecord {
        PoiRecord {
            name: name.to_string(),
            housenumber: None,
            street: None,
            city: None,
            state: None,
            postcode: None,
            phone: phone.map(String::from),
            website: None,
            opening_hours: None,
            latitude: lat,
            longitude: lon,
        }
    }

    #[test]
    fn loads_records_strictly_after_marker_in_order() {
        let (_dir, conn) = test_conn();
        insert_zip(&conn, "10003", 40.73, -73.99, "1000");
        insert_zip(&conn, "10001", 40.75, -73.99, "1000");
        insert_zip(&conn, "10002", 40.72, -73.98, "1000");

        let all = load_zip_records(&conn, None, 100).unwrap();
        let zips: Vec<&str> = all.iter().map(|r| r.zip.as_str()).collect();
        assert_eq!(zips, vec!["10001", "10002", "10003"]);

        let resumed = load_zip_records(&conn, Some("10001"), 100).unwrap();
        let zips: Vec<&str> = resumed.iter().map(|r| r.zip.as_str()).collect();
        assert_eq!(zips, vec!["10002", "10003"]);

        let limited = load_zip_records(&conn, None, 2).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn malformed_population_counts_as_zero() {
        let (_dir, conn) = test_conn();
        insert_zip(&conn, "10001", 40.75, -73.99, "21000");
        insert_zip(&conn, "10002", 40.72, -73.98, "n/a");
        conn.execute(
            "INSERT INTO zip_codes (zip, latitude, longitude, population) VALUES ('10003', 40.7, -73.9, NULL)",
            [],
        )
        .unwrap();

        let records = load_zip_records(&conn, None, 100).unwrap();
        let populations: Vec<u64> = records.iter().map(|r| r.population).collect();
        assert_eq!(populations, vec![21000, 0, 0]);
    }

    #[test]
    fn progress_marker_roundtrip() {
        let (_dir, conn) = test_conn();
        assert_eq!(last_processed(&conn).unwrap(), None);

        advance(&conn, "10001").unwrap();
        advance(&conn, "10005").unwrap();
        assert_eq!(last_processed(&conn).unwrap().as_deref(), Some("10005"));

        // Re-advancing an already recorded marker is a no-op, not an error.
        advance(&conn, "10005").unwrap();
        assert_eq!(last_processed(&conn).unwrap().as_deref(), Some("10005"));
    }

    #[test]
    fn upsert_is_idempotent() {
        let (_dir, conn) = test_conn();
        let rows = vec![
            poi("Umi Sushi", 40.7512, -73.9936, Some("555-0100")),
            poi("Kaiten Bar", 40.7488, -73.9871, None),
        ];

        assert_eq!(upsert_pois(&conn, &rows).unwrap(), 2);
        assert_eq!(upsert_pois(&conn, &rows).unwrap(), 0);
        assert_eq!(count_pois(&conn).unwrap(), 2);
    }

    #[test]
    fn conflicting_rows_never_mutate_stored_attributes() {
        let (_dir, conn) = test_conn();
        let original = vec![poi("Umi Sushi", 40.7512, -73.9936, Some("555-0100"))];
        upsert_pois(&conn, &original).unwrap();

        let conflicting = vec![poi("Umi Sushi", 40.7512, -73.9936, Some("555-9999"))];
        assert_eq!(upsert_pois(&conn, &conflicting).unwrap(), 0);

        let phone: String = conn
            .query_row(
                "SELECT phone FROM pois WHERE name = 'Umi Sushi'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(phone, "555-0100");
    }

    #[test]
    fn empty_upsert_is_a_noop() {
        let (_dir, conn) = test_conn();
        assert_eq!(upsert_pois(&conn, &[]).unwrap(), 0);
        assert_eq!(count_pois(&conn).unwrap(), 0);
    }

    #[test]
    fn partial_overlap_inserts_only_new_rows() {
        let (_dir, conn) = test_conn();
        upsert_pois(&conn, &[poi("Umi Sushi", 40.7512, -73.9936, None)]).unwrap();

        let mixed = vec![
            poi("Umi Sushi", 40.7512, -73.9936, None),
            poi("Ginza Ten", 40.7601, -73.9844, None),
        ];
        assert_eq!(upsert_pois(&conn, &mixed).unwrap(), 1);
        assert_eq!(count_pois(&conn).unwrap(), 2);
    }
}
