// src/config/mod.rs
pub mod settings;

pub use settings::Config;

use crate::error::DashboardError;
use std::sync::Arc;

/// Loads `.env` (if present), reads the environment and validates it.
/// Call `Config::validate_and_log` once logging is up to print the summary.
pub fn load_config() -> Result<Arc<settings::Config>, DashboardError> {
    dotenv::dotenv().ok(); // Load .env file if present, ignore errors

    let config = settings::Config::from_env();
    config.validate()?;

    Ok(Arc::new(config))
}
