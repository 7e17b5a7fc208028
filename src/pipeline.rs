use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::errors::AppResult;
use crate::fetcher::DetailFetcher;
use crate::geo::{dedupe_cells, SearchCell};
use crate::pacing::Pacer;
use crate::search::SearchService;
use crate::store;

/// Aggregate counts reported at the end of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cells_processed: usize,
    pub candidates_found: usize,
    pub newly_inserted: usize,
    pub total_stored: i64,
}

struct CellOutcome {
    candidates: usize,
    inserted: usize,
}

/// Drives the per-cell loop: load the next zip batch after the resume
/// marker, deduplicate into cells, then for each cell search, fetch details
/// in batches, persist, and checkpoint. Cells are processed strictly
/// sequentially; the pacer bounds the external request rate.
pub struct Pipeline {
    db: Arc<Mutex<Connection>>,
    search: SearchService,
    pacer: Pacer,
    search_term: String,
    zip_batch_limit: usize,
    detail_batch_size: usize,
    population_density: f64,
    min_radius_miles: f64,
}

impl Pipeline {
    pub fn new(db: Arc<Mutex<Connection>>, search: SearchService, config: &AppConfig) -> Self {
        Self {
            db,
            search,
            pacer: Pacer::new(config.pacing_delay, config.backoff),
            search_term: config.search_term.clone(),
            zip_batch_limit: config.zip_batch_limit,
            detail_batch_size: config.detail_batch_size,
            population_density: config.population_density,
            min_radius_miles: config.min_radius_miles,
        }
    }

    /// Runs one bounded batch. The stop flag is honored between cells, so an
    /// interrupted run always finishes the in-flight cell's persistence and
    /// checkpoint before returning.
    pub async fn run(&self, stop: &AtomicBool) -> AppResult<RunSummary> {
        let mut summary = RunSummary::default();

        let resume_after = {
            let conn = self.db.lock();
            store::last_processed(&conn)?
        };
        let records = {
            let conn = self.db.lock();
            store::load_zip_records(&conn, resume_after.as_deref(), self.zip_batch_limit)?
        };
        info!(
            loaded = records.len(),
            resume_after = resume_after.as_deref().unwrap_or("none"),
            "loaded zip batch"
        );

        if records.is_empty() {
            info!("no zip records remaining; backlog complete");
            summary.total_stored = {
                let conn = self.db.lock();
                store::count_pois(&conn)?
            };
            return Ok(summary);
        }

        let mut watermark = Watermark::new(records.iter().map(|record| record.zip.clone()));
        let cells = dedupe_cells(records);
        info!(cells = cells.len(), "deduplicated search cells");

        let fetcher = DetailFetcher::new(&self.search, &self.pacer, self.detail_batch_size);

        for cell in &cells {
            if stop.load(Ordering::SeqCst) {
                warn!("stop requested; halting after last checkpointed cell");
                break;
            }

            self.pacer.acquire().await;
            match self.process_cell(cell, &fetcher).await {
                Ok(outcome) => {
                    summary.candidates_found += outcome.candidates;
                    summary.newly_inserted += outcome.inserted;
                }
                Err(err) if err.is_store_failure() => return Err(err),
                Err(err) => {
                    warn!(cell = %cell.describe(), error = %err, "cell processing failed; skipping");
                    if err.wants_backoff() {
                        self.pacer.back_off().await;
                    }
                }
            }
            summary.cells_processed += 1;

            if let Some(marker) = watermark.complete(&cell.zips) {
                let conn = self.db.lock();
                store::advance(&conn, marker)?;
            }
        }

        summary.total_stored = {
            let conn = self.db.lock();
            store::count_pois(&conn)?
        };
        info!(
            cells = summary.cells_processed,
            candidates = summary.candidates_found,
            newly_inserted = summary.newly_inserted,
            total_stored = summary.total_stored,
            "run finished"
        );
        Ok(summary)
    }

    async fn process_cell(
        &self,
        cell: &SearchCell,
        fetcher: &DetailFetcher<'_>,
    ) -> AppResult<CellOutcome> {
        let bbox = cell.bounding_box(self.population_density, self.min_radius_miles);
        let candidates = self.search.search_candidates(&self.search_term, &bbox).await?;
        if candidates.is_empty() {
            info!(cell = %cell.describe(), "no candidates found");
            return Ok(CellOutcome {
                candidates: 0,
                inserted: 0,
            });
        }
        info!(cell = %cell.describe(), candidates = candidates.len(), "candidates found");

        let fetched = fetcher.fetch_all(&candidates, &cell.describe()).await;
        let inserted = {
            let conn = self.db.lock();
            store::upsert_pois(&conn, &fetched)?
        };
        info!(
            cell = %cell.describe(),
            fetched = fetched.len(),
            inserted,
            "persisted cell results"
        );
        Ok(CellOutcome {
            candidates: candidates.len(),
            inserted,
        })
    }
}

/// Tracks the resumption watermark for one loaded batch. A cell may
/// aggregate zips that are not adjacent in scan order, so the marker written
/// after a cell is the greatest zip whose entire ordered prefix belongs to
/// completed cells. Zips beyond the watermark that were already covered get
/// reprocessed on resume; the idempotent upsert absorbs that.
struct Watermark {
    pending: Vec<String>,
    done: HashSet<String>,
    cursor: usize,
}

impl Watermark {
    fn new(zips: impl IntoIterator<Item = String>) -> Self {
        let mut pending: Vec<String> = zips.into_iter().collect();
        pending.sort();
        Self {
            pending,
            done: HashSet::new(),
            cursor: 0,
        }
    }

    /// Marks a cell's zips complete. Returns the new watermark when the
    /// contiguous completed prefix advanced, at most one marker per cell.
    fn complete(&mut self, zips: &[String]) -> Option<&str> {
        for zip in zips {
            self.done.insert(zip.clone());
        }
        let before = self.cursor;
        while self.cursor < self.pending.len() && self.done.contains(&self.pending[self.cursor]) {
            self.cursor += 1;
        }
        if self.cursor > before {
            Some(self.pending[self.cursor - 1].as_str())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use rusqlite::params;
    use tokio::time::Instant;

    use super::*;
    use crate::db::bootstrap;
    use crate::errors::AppError;
    use crate::geo::BoundingBox;
    use crate::search::{Candidate, PoiRecord, SearchApi};

    fn test_config() -> AppConfig {
        AppConfig {
            search_term: "sushi restaurant".into(),
            places_api_key: secrecy::SecretString::from("test-key".to_string()),
            places_api_base: "http://unused.invalid".into(),
            database_path: "unused.db".into(),
            zip_batch_limit: 100,
            detail_batch_size: 50,
            pacing_delay: Duration::from_millis(500),
            backoff: Duration::from_secs(5),
            http_timeout: Duration::from_secs(5),
            population_density: 1000.0,
            min_radius_miles: 2.5,
            zip_seed_csv: None,
        }
    }

    fn test_db(zips: &[(&str, f64, f64, &str)]) -> (tempfile::TempDir, Arc<Mutex<Connection>>) {
        let dir = tempfile::tempdir().unwrap();
        let ctx = bootstrap(dir.path().join("pipeline.db")).unwrap();
        for (zip, lat, lon, population) in zips {
            ctx.connection
                .execute(
                    "INSERT INTO zip_codes (zip, latitude, longitude, population)
                    VALUES (?1, ?2, ?3, ?4)",
                    params![zip, lat, lon, population],
                )
                .unwrap();
        }
        (dir, Arc::new(Mutex::new(ctx.connection)))
    }

    fn record(name: &str, lat: f64, lon: f64) -> PoiRecord {
        PoiRecord {
            name: name.to_string(),
            housenumber: None,
            street: None,
            city: None,
            state: None,
            postcode: None,
            phone: None,
            website: None,
            opening_hours: None,
            latitude: lat,
            longitude: lon,
        }
    }

    /// Rate-limits the first search call, then serves one candidate per
    /// cell whose details resolve to a row at the cell's coordinates.
    struct FlakyApi {
        searches: AtomicUsize,
    }

    #[async_trait]
    impl SearchApi for FlakyApi {
        async fn search_candidates(
            &self,
            _term: &str,
            bbox: &BoundingBox,
        ) -> AppResult<Vec<Candidate>> {
            if self.searches.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(AppError::RateLimited);
            }
            let lat = (bbox.south + bbox.north) / 2.0;
            let lon = (bbox.west + bbox.east) / 2.0;
            Ok(vec![Candidate {
                id: format!("{lat:.4}:{lon:.4}"),
            }])
        }

        async fn place_details(&self, place_id: &str) -> AppResult<Option<PoiRecord>> {
            let (lat, lon) = place_id.split_once(':').unwrap();
            Ok(Some(record(
                &format!("Place at {place_id}"),
                lat.parse().unwrap(),
                lon.parse().unwrap(),
            )))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_cell_is_skipped_and_checkpointed() {
        let (_dir, db) = test_db(&[
            ("10001", 40.75, -73.99, "21000"),
            ("10002", 40.72, -73.98, "5000"),
        ]);
        let search = SearchService::from_api(Arc::new(FlakyApi {
            searches: AtomicUsize::new(0),
        }));
        let pipeline = Pipeline::new(Arc::clone(&db), search, &test_config());

        let started = Instant::now();
        let summary = pipeline.run(&AtomicBool::new(false)).await.unwrap();

        assert_eq!(summary.cells_processed, 2);
        assert_eq!(summary.newly_inserted, 1);
        assert_eq!(summary.total_stored, 1);
        // The throttled first cell cost one full backoff pause.
        assert!(started.elapsed() >= Duration::from_secs(5));

        let conn = db.lock();
        assert_eq!(
            store::last_processed(&conn).unwrap().as_deref(),
            Some("10002")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn resumes_strictly_after_the_marker() {
        let (_dir, db) = test_db(&[
            ("10001", 40.75, -73.99, "21000"),
            ("10002", 40.72, -73.98, "5000"),
            ("10003", 40.70, -73.97, "5000"),
        ]);
        {
            let conn = db.lock();
            store::advance(&conn, "10002").unwrap();
        }
        let api = Arc::new(FlakyApi {
            searches: AtomicUsize::new(1),
        });
        let search = SearchService::from_api(api.clone());
        let pipeline = Pipeline::new(Arc::clone(&db), search, &test_config());

        let summary = pipeline.run(&AtomicBool::new(false)).await.unwrap();

        // Only the zip after the marker forms a cell.
        assert_eq!(summary.cells_processed, 1);
        assert_eq!(api.searches.load(Ordering::SeqCst), 2);
        let conn = db.lock();
        assert_eq!(
            store::last_processed(&conn).unwrap().as_deref(),
            Some("10003")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stop_flag_halts_before_the_next_cell() {
        let (_dir, db) = test_db(&[("10001", 40.75, -73.99, "21000")]);
        let search = SearchService::from_api(Arc::new(FlakyApi {
            searches: AtomicUsize::new(1),
        }));
        let pipeline = Pipeline::new(Arc::clone(&db), search, &test_config());

        let stop = AtomicBool::new(true);
        let summary = pipeline.run(&stop).await.unwrap();
        assert_eq!(summary.cells_processed, 0);
        let conn = db.lock();
        assert_eq!(store::last_processed(&conn).unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_backlog_reports_existing_totals() {
        let (_dir, db) = test_db(&[]);
        {
            let conn = db.lock();
            store::upsert_pois(&conn, &[record("Existing", 1.0, 2.0)]).unwrap();
        }
        let search = SearchService::from_api(Arc::new(FlakyApi {
            searches: AtomicUsize::new(1),
        }));
        let pipeline = Pipeline::new(Arc::clone(&db), search, &test_config());

        let summary = pipeline.run(&AtomicBool::new(false)).await.unwrap();
        assert_eq!(summary.cells_processed, 0);
        assert_eq!(summary.newly_inserted, 0);
        assert_eq!(summary.total_stored, 1);
    }

    #[test]
    fn watermark_tracks_the_contiguous_completed_prefix() {
        let mut watermark = Watermark::new(
            ["10001", "10002", "10003", "10004"]
                .into_iter()
                .map(String::from),
        );

        // A cell holding non-adjacent zips only advances the prefix it
        // completes.
        assert_eq!(
            watermark.complete(&["10001".to_string(), "10003".to_string()]),
            Some("10001")
        );
        assert_eq!(watermark.complete(&["10004".to_string()]), None);
        assert_eq!(
            watermark.complete(&["10002".to_string()]),
            Some("10004")
        );
    }

    #[test]
    fn watermark_is_monotone_per_cell() {
        let mut watermark = Watermark::new(["10001", "10002"].into_iter().map(String::from));
        assert_eq!(watermark.complete(&["10002".to_string()]), None);
        assert_eq!(watermark.complete(&["10001".to_string()]), Some("10002"));
    }
}
