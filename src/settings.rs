use std::path::PathBuf;

use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use serde::Deserialize;

const DEFAULT_DB_PATH: &str = "data/cancer_codes.sqlite";
/// Footer printed on report exports that are "not for chart filing".
const DEFAULT_DISCLAIMER_MARKER: &str = "不得用於貼病歷";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub db_path: PathBuf,
    pub disclaimer_marker: String,
    pub csv_label_header: String,
    pub csv_count_header: String,
}

impl Settings {
    /// Defaults, then `cancer_stats.toml` if present, then `CANCER_STATS_*` env vars.
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_builder(
            Config::builder()
                .add_source(File::with_name("cancer_stats").required(false))
                .add_source(Environment::with_prefix("CANCER_STATS")),
        )
    }

    fn from_builder(builder: ConfigBuilder<DefaultState>) -> Result<Self, ConfigError> {
        builder
            .set_default("db_path", DEFAULT_DB_PATH)?
            .set_default("disclaimer_marker", DEFAULT_DISCLAIMER_MARKER)?
            .set_default("csv_label_header", "anatomy label")?
            .set_default("csv_count_header", "count")?
            .build()?
            .try_deserialize()
    }

    pub fn csv_header(&self) -> (&str, &str) {
        (&self.csv_label_header, &self.csv_count_header)
    }
}
