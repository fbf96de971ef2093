use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

use crate::geocode::{GeocodePolicy, LocationColumns, DEFAULT_ENDPOINT};
use crate::retry::RetryPolicy;
use crate::session::http::DEFAULT_USER_AGENT;
use crate::session::{PlanConfig, SessionTimeouts};

const ENV_PREFIX: &str = "HARVEST";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InputSettings {
    pub path: PathBuf,
    pub id_column: String,
    pub query_column: String,
}

impl Default for InputSettings {
    fn default() -> Self {
        Self {
            path: "tasks.csv".into(),
            id_column: "id".into(),
            query_column: "url".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SitemapSettings {
    pub url: Option<String>,
    /// Regex over `<loc>` URLs; group 1 is the item id.
    pub pattern: String,
}

impl Default for SitemapSettings {
    fn default() -> Self {
        Self {
            url: None,
            pattern: r"/([^/?#]+)/?$".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeocodeSettings {
    /// Enrich scraped records with a geocode lookup.
    pub enabled: bool,
    pub api_key: Option<String>,
    pub endpoint: String,
    pub region: Option<String>,
    pub policy: GeocodePolicy,
    pub timeout_ms: u64,
}

impl Default for GeocodeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: None,
            endpoint: DEFAULT_ENDPOINT.into(),
            region: None,
            policy: GeocodePolicy::default(),
            timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub pool_size: usize,
    pub chunk_size: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub load_timeout_ms: u64,
    pub locate_timeout_ms: u64,
    pub max_chunk_restarts: u32,
    /// Geocoding requests per second.
    pub rate_budget: u32,
    pub rate_burst: u32,
    pub rate_max_wait_ms: u64,
    /// Page fetches per second; unlimited when unset.
    pub fetch_rate_budget: Option<u32>,
    pub checkpoint_dir: PathBuf,
    pub output: PathBuf,
    /// Fields identifying the same real-world record across items.
    pub natural_key: Vec<String>,
    pub carry_context: bool,
    pub user_agent: String,
    pub input: InputSettings,
    pub sitemap: SitemapSettings,
    pub location: LocationColumns,
    pub geocode: GeocodeSettings,
    pub extraction: PlanConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pool_size: 4,
            chunk_size: 50,
            max_retries: 3,
            backoff_base_ms: 500,
            load_timeout_ms: 30_000,
            locate_timeout_ms: 10_000,
            max_chunk_restarts: 3,
            rate_budget: 50,
            rate_burst: 1,
            rate_max_wait_ms: 60_000,
            fetch_rate_budget: None,
            checkpoint_dir: "checkpoints".into(),
            output: "output.csv".into(),
            natural_key: Vec::new(),
            carry_context: true,
            user_agent: DEFAULT_USER_AGENT.into(),
            input: InputSettings::default(),
            sitemap: SitemapSettings::default(),
            location: LocationColumns::default(),
            geocode: GeocodeSettings::default(),
            extraction: PlanConfig::default(),
        }
    }
}

impl Settings {
    /// Defaults, then `file` if given, then `HARVEST_*` environment variables.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(file, None)
    }

    fn load_with_env(
        file: Option<&Path>,
        env: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(File::from(path).required(true));
        }
        let settings: Settings = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .source(env),
            )
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("pool_size", self.pool_size as u64),
            ("chunk_size", self.chunk_size as u64),
            ("rate_budget", self.rate_budget as u64),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(ConfigError::Message(format!("{} must be greater than zero", name)));
            }
        }
        if self.fetch_rate_budget == Some(0) {
            return Err(ConfigError::Message(
                "fetch_rate_budget must be greater than zero when set".into(),
            ));
        }
        Ok(())
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, Duration::from_millis(self.backoff_base_ms))
    }

    pub fn timeouts(&self) -> SessionTimeouts {
        SessionTimeouts {
            load: Duration::from_millis(self.load_timeout_ms),
            locate: Duration::from_millis(self.locate_timeout_ms),
        }
    }

    pub fn rate_max_wait(&self) -> Duration {
        Duration::from_millis(self.rate_max_wait_ms)
    }
}
