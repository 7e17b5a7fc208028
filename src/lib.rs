mod config;
mod db;
mod errors;
mod fetcher;
mod geo;
mod pacing;
mod pipeline;
mod search;
mod seed;
mod store;

use once_cell::sync::OnceCell;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::AppConfig;
pub use db::{bootstrap, DatabaseContext};
pub use errors::{AppError, AppResult};
pub use geo::{dedupe_cells, search_radius_miles, BoundingBox, SearchCell, ZipRecord};
pub use pipeline::{Pipeline, RunSummary};
pub use search::{Candidate, PoiRecord, SearchService};
pub use seed::seed_zip_codes;

pub fn init_tracing() {
    static INIT: OnceCell<()> = OnceCell::new();
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("info,poi_harvester=debug"));
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    });
}
