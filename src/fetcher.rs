use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::errors::AppError;
use crate::pacing::Pacer;
use crate::search::{Candidate, PoiRecord, SearchService};

/// Fetches detail records for coarse candidates in fixed-size batches. Each
/// batch runs its requests concurrently and is joined before the next batch
/// starts. Individual failures never fail the batch; a 429 inside a batch
/// pauses once before the next batch begins.
pub struct DetailFetcher<'a> {
    api: &'a SearchService,
    pacer: &'a Pacer,
    batch_size: usize,
}

impl<'a> DetailFetcher<'a> {
    pub fn new(api: &'a SearchService, pacer: &'a Pacer, batch_size: usize) -> Self {
        Self {
            api,
            pacer,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn fetch_all(&self, candidates: &[Candidate], cell: &str) -> Vec<PoiRecord> {
        let mut records = Vec::new();

        for batch in candidates.chunks(self.batch_size) {
            self.pacer.acquire().await;
            let results = join_all(
                batch
                    .iter()
                    .map(|candidate| self.api.place_details(&candidate.id)),
            )
            .await;

            let mut throttled = false;
            for (candidate, result) in batch.iter().zip(results) {
                match result {
                    Ok(Some(record)) => records.push(record),
                    Ok(None) => {
                        debug!(place_id = %candidate.id, cell, "detail response had no usable record");
                    }
                    Err(err) => {
                        warn!(place_id = %candidate.id, cell, error = %err, "detail fetch failed");
                        throttled |= matches!(err, AppError::RateLimited);
                    }
                }
            }

            if throttled {
                self.pacer.back_off().await;
            }
        }

        records
    }
}
