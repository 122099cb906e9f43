//! src/config.rs
//! ============================================================================
//! # Config: Runtime Configuration Loader and Saver
//!
//! Holds every tunable of the coordination runtime: the build fingerprint that
//! feeds the response cache, per-category TTL tables, registry and dispatcher
//! timeouts, and logging. Loaded and saved as TOML from the platform config
//! directory using the [`directories`](https://docs.rs/directories) crate.
//!
//! ## Example
//! ```rust,ignore
//! let config = Config::load().await?;
//! config.save().await?;
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use compact_str::CompactString;
use directories::ProjectDirs;
use serde::{Deserialize, Deserializer, Serialize};
use tokio::fs as TokioFs;
use tracing::info;

use crate::cache::response_cache::LookupCategory;
use crate::error::AppError;
use crate::logging::LoggerConfig;

/// Deployment environment tag, embedded in every cache fingerprint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,

    Staging,

    Production,
}

impl Environment {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Staging => "staging",
            Self::Production => "production",
        }
    }
}

impl std::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of the running build. Changing either field makes every
/// previously cached response unreachable.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildInfo {
    pub version: CompactString,

    pub environment: Environment,
}

impl BuildInfo {
    pub fn new(version: impl Into<CompactString>, environment: Environment) -> Self {
        Self {
            version: version.into(),
            environment,
        }
    }
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self::new(env!("CARGO_PKG_VERSION"), Environment::default())
    }
}

/// Per-category time-to-live table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TtlTable {
    #[serde(with = "humantime_serde")]
    pub place_details: Duration,

    #[serde(with = "humantime_serde")]
    pub geocoding: Duration,

    #[serde(with = "humantime_serde")]
    pub nearby_search: Duration,

    #[serde(with = "humantime_serde")]
    pub text_search: Duration,

    /// Inputs change on every keystroke
    #[serde(with = "humantime_serde")]
    pub autocomplete: Duration,

    /// The device moves
    #[serde(with = "humantime_serde")]
    pub device_location: Duration,
}

impl TtlTable {
    #[must_use]
    pub fn standard() -> Self {
        Self {
            place_details: Duration::from_secs(6 * 3600),
            geocoding: Duration::from_secs(3600),
            nearby_search: Duration::from_secs(30 * 60),
            text_search: Duration::from_secs(15 * 60),
            autocomplete: Duration::from_secs(5 * 60),
            device_location: Duration::from_secs(2 * 60),
        }
    }

    #[must_use]
    pub fn aggressive() -> Self {
        Self {
            place_details: Duration::from_secs(30 * 60),
            geocoding: Duration::from_secs(10 * 60),
            nearby_search: Duration::from_secs(5 * 60),
            text_search: Duration::from_secs(3 * 60),
            autocomplete: Duration::from_secs(60),
            device_location: Duration::from_secs(30),
        }
    }

    /// Deserialize a table, taking categories it omits from `base`
    fn deserialize_over<'de, D: Deserializer<'de>>(deserializer: D, base: Self) -> Result<Self, D::Error> {
        let partial = PartialTtlTable::deserialize(deserializer)?;
        Ok(Self {
            place_details: partial.place_details.unwrap_or(base.place_details),
            geocoding: partial.geocoding.unwrap_or(base.geocoding),
            nearby_search: partial.nearby_search.unwrap_or(base.nearby_search),
            text_search: partial.text_search.unwrap_or(base.text_search),
            autocomplete: partial.autocomplete.unwrap_or(base.autocomplete),
            device_location: partial.device_location.unwrap_or(base.device_location),
        })
    }

    fn deserialize_standard<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Self::deserialize_over(deserializer, Self::standard())
    }

    fn deserialize_aggressive<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Self::deserialize_over(deserializer, Self::aggressive())
    }

    #[must_use]
    pub const fn ttl(&self, category: LookupCategory) -> Duration {
        match category {
            LookupCategory::PlaceDetails => self.place_details,
            LookupCategory::Geocoding => self.geocoding,
            LookupCategory::NearbySearch => self.nearby_search,
            LookupCategory::TextSearch => self.text_search,
            LookupCategory::Autocomplete => self.autocomplete,
            LookupCategory::DeviceLocation => self.device_location,
        }
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct PartialTtlTable {
    #[serde(default, with = "humantime_serde")]
    place_details: Option<Duration>,

    #[serde(default, with = "humantime_serde")]
    geocoding: Option<Duration>,

    #[serde(default, with = "humantime_serde")]
    nearby_search: Option<Duration>,

    #[serde(default, with = "humantime_serde")]
    text_search: Option<Duration>,

    #[serde(default, with = "humantime_serde")]
    autocomplete: Option<Duration>,

    #[serde(default, with = "humantime_serde")]
    device_location: Option<Duration>,
}

/// Response cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Select the short TTL tier
    pub aggressive_cache_busting: bool,

    /// Drop every entry as soon as the cache is rebound to a new build
    pub force_bust: bool,

    #[serde(deserialize_with = "TtlTable::deserialize_standard")]
    pub standard_ttl: TtlTable,

    #[serde(deserialize_with = "TtlTable::deserialize_aggressive")]
    pub aggressive_ttl: TtlTable,

    /// Interval of the background expiry sweep
    #[serde(with = "humantime_serde")]
    pub sweep_interval: Duration,

    /// `set` triggers an inline sweep once the table holds more entries
    pub sweep_threshold: u64,

    /// Hard ceiling on entries; the oldest go first. Must exceed
    /// `sweep_threshold`.
    pub max_capacity: u64,

    /// Enable cache statistics
    pub enable_stats: bool,
}

impl CacheConfig {
    /// The TTL table selected by the aggressiveness flag
    #[must_use]
    pub const fn active_ttl(&self) -> &TtlTable {
        if self.aggressive_cache_busting {
            &self.aggressive_ttl
        } else {
            &self.standard_ttl
        }
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.sweep_threshold >= self.max_capacity {
            return Err(AppError::InvalidConfig(format!(
                "cache.sweep_threshold ({}) must be below cache.max_capacity ({})",
                self.sweep_threshold, self.max_capacity
            )));
        }
        if self.sweep_interval.is_zero() {
            return Err(AppError::InvalidConfig(
                "cache.sweep_interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            aggressive_cache_busting: false,
            force_bust: false,
            standard_ttl: TtlTable::standard(),
            aggressive_ttl: TtlTable::aggressive(),
            sweep_interval: Duration::from_secs(5 * 60),
            sweep_threshold: 500,
            max_capacity: 4_096,
            enable_stats: true,
        }
    }
}

/// Readiness registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Timeout used by `wait_for` callers that don't pass their own
    #[serde(with = "humantime_serde")]
    pub default_wait_timeout: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_wait_timeout: Duration::from_millis(5000),
        }
    }
}

/// Action dispatcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// How long wiring waits for collaborator components. Unset falls
    /// back to the registry's default wait timeout.
    #[serde(default, with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub dependency_timeout: Option<Duration>,

    /// Prompt shown before a record is deleted
    pub delete_confirmation: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dependency_timeout: None,
            delete_confirmation: "Delete this location? This cannot be undone.".to_string(),
        }
    }
}

/// Main configuration struct for the runtime.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub build: BuildInfo,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default)]
    pub logging: LoggerConfig,
}

impl Config {
    /// Loads config from the platform config dir, or writes and returns defaults.
    ///
    /// The config is expected at `$XDG_CONFIG_HOME/pinmap/config.toml`
    /// (Linux), or equivalent on Windows/macOS.
    pub async fn load() -> anyhow::Result<Self> {
        let path = Self::config_path()?;
        if path.exists() {
            Ok(Self::load_from(&path).await?)
        } else {
            info!(
                "No config file found at {}, using default configuration. Creating it now.",
                path.display()
            );

            let default_config = Self::default();
            default_config.save_to(&path).await?;

            Ok(default_config)
        }
    }

    /// Loads config from an explicit TOML file.
    pub async fn load_from(path: &Path) -> Result<Self, AppError> {
        info!("Loading config from {}", path.display());
        let text = TokioFs::read_to_string(path)
            .await
            .map_err(|source| AppError::ConfigIo {
                path: path.to_path_buf(),
                source,
            })?;
        let cfg: Self = toml::from_str(&text)?;
        cfg.cache.validate()?;

        Ok(cfg)
    }

    /// Saves config to the platform config dir.
    pub async fn save(&self) -> anyhow::Result<()> {
        let path = Self::config_path()?;
        self.save_to(&path).await
    }

    /// Saves config as TOML to an explicit path, creating parent directories.
    pub async fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        info!("Saving config to {}", path.display());

        if let Some(parent) = path.parent() {
            TokioFs::create_dir_all(parent).await?;
        }

        let toml_str = toml::to_string_pretty(self)?;
        TokioFs::write(path, toml_str).await?;

        Ok(())
    }

    /// Returns the canonical config file path using `directories::ProjectDirs`.
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    /// Returns the config directory (without filename).
    pub fn config_dir() -> anyhow::Result<PathBuf> {
        let proj_dirs = ProjectDirs::from("org", "pinmap", "pinmap")
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory."))?;
        Ok(proj_dirs.config_dir().to_path_buf())
    }
}
