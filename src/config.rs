use std::path::PathBuf;
use std::time::Duration;
use std::{env, io};

use secrecy::SecretString;
use tracing::debug;

use crate::errors::{AppError, AppResult};

const DEFAULT_PLACES_API_BASE: &str = "https://places.googleapis.com/v1";
const DEFAULT_DATABASE_PATH: &str = "poi-harvester.db";
const DEFAULT_ZIP_BATCH_LIMIT: usize = 1000;
const DEFAULT_DETAIL_BATCH_SIZE: usize = 50;
const DEFAULT_PACING_DELAY_MS: u64 = 500;
const DEFAULT_BACKOFF_SECS: u64 = 5;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 5;
const DEFAULT_POPULATION_DENSITY: f64 = 1000.0;
const DEFAULT_MIN_RADIUS_MILES: f64 = 2.5;

/// Immutable per-run configuration, loaded from the environment once at
/// startup. Missing search term or API key is a fatal startup error.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub search_term: String,
    pub places_api_key: SecretString,
    pub places_api_base: String,
    pub database_path: PathBuf,
    pub zip_batch_limit: usize,
    pub detail_batch_size: usize,
    pub pacing_delay: Duration,
    pub backoff: Duration,
    pub http_timeout: Duration,
    pub population_density: f64,
    pub min_radius_miles: f64,
    pub zip_seed_csv: Option<PathBuf>,
}

impl AppConfig {
    pub fn from_env() -> AppResult<Self> {
        load_dotenv_if_present();
        let search_term = required("SEARCH_TERM")?;
        let places_api_key = SecretString::from(required("PLACES_API_KEY")?);

        Ok(Self {
            search_term,
            places_api_key,
            places_api_base: env::var("PLACES_API_BASE")
                .ok()
                .map(|base| base.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_PLACES_API_BASE.to_string()),
            database_path: env::var("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATABASE_PATH)),
            zip_batch_limit: parse_usize("ZIP_BATCH_LIMIT", DEFAULT_ZIP_BATCH_LIMIT).max(1),
            detail_batch_size: parse_usize("DETAIL_BATCH_SIZE", DEFAULT_DETAIL_BATCH_SIZE).max(1),
            pacing_delay: Duration::from_millis(parse_u64(
                "PACING_DELAY_MS",
                DEFAULT_PACING_DELAY_MS,
            )),
            backoff: Duration::from_secs(parse_u64("BACKOFF_SECS", DEFAULT_BACKOFF_SECS)),
            http_timeout: Duration::from_secs(parse_u64(
                "HTTP_TIMEOUT_SECS",
                DEFAULT_HTTP_TIMEOUT_SECS,
            )),
            population_density: parse_f64("POPULATION_DENSITY", DEFAULT_POPULATION_DENSITY),
            min_radius_miles: parse_f64("MIN_RADIUS_MILES", DEFAULT_MIN_RADIUS_MILES),
            zip_seed_csv: env::var("ZIP_SEED_CSV").ok().map(PathBuf::from),
        })
    }
}

fn load_dotenv_if_present() {
    if let Err(err) = dotenvy::dotenv() {
        match &err {
            dotenvy::Error::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {}
            _ => debug!(?err, "unable to load .env file"),
        }
    }
}

fn required(key: &str) -> AppResult<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| AppError::Config(format!("missing required environment variable {key}")))
}

fn parse_u64(key: &str, default: u64) -> u64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn parse_usize(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn parse_f64(key: &str, default: f64) -> f64 {
    env::var(key)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}
