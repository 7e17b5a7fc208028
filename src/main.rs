use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Context;
use parking_lot::Mutex;
use tracing::{info, warn};

use poi_harvester::{bootstrap, init_tracing, seed_zip_codes, AppConfig, Pipeline, SearchService};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::from_env().context("loading configuration")?;
    let context = bootstrap(&config.database_path).context("opening database")?;
    let mut connection = context.connection;

    if let Some(seed_path) = &config.zip_seed_csv {
        seed_zip_codes(&mut connection, seed_path).context("seeding zip reference data")?;
    }

    let db = Arc::new(Mutex::new(connection));
    let search = SearchService::new(&config).context("building search client")?;
    let pipeline = Pipeline::new(Arc::clone(&db), search, &config);

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received; finishing the in-flight cell");
                stop.store(true, Ordering::SeqCst);
            }
        });
    }

    let summary = pipeline.run(&stop).await.context("running pipeline")?;
    info!(
        cells = summary.cells_processed,
        candidates = summary.candidates_found,
        newly_inserted = summary.newly_inserted,
        total_stored = summary.total_stored,
        "harvest complete"
    );
    Ok(())
}
