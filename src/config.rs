use mirror_core::{SyncOptions, TenantToken};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Source of a configuration value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigSource {
    Default,
    File,
    Environment,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::Default => write!(f, "default"),
            ConfigSource::File => write!(f, "file"),
            ConfigSource::Environment => write!(f, "environment"),
        }
    }
}

/// A configuration value with its source
#[derive(Debug, Clone, Serialize)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

impl<T> ConfigValue<T> {
    pub fn new(value: T, source: ConfigSource) -> Self {
        Self { value, source }
    }
}

/// Upstream catalog API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Base URL of the catalog API (e.g., "https://catalog.example.com/api")
    pub base_url: Option<String>,
    /// Bearer token sent with every request
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    /// Per-request timeout
    pub timeout_secs: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_token: None,
            timeout_secs: 30,
        }
    }
}

/// Longest lock TTL representable as a `chrono` duration.
const MAX_LOCK_TTL_SECS: u64 = (i64::MAX / 1000) as u64;

/// Sync run tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub page_size: u32,
    pub page_delay_ms: u64,
    pub lock_ttl_secs: u64,
    /// Rewrite every record even when its fingerprint is unchanged
    pub force_update: bool,
    /// Attach case photos after the case stage
    pub sync_media: bool,
    /// Delete orphans at the end of a run instead of leaving them for review
    pub auto_delete_orphans: bool,
    pub stamp_retries: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        let defaults = SyncOptions::default();
        Self {
            page_size: defaults.page_size,
            page_delay_ms: defaults.page_delay.as_millis() as u64,
            lock_ttl_secs: defaults.lock_ttl.as_secs(),
            force_update: defaults.force_update,
            sync_media: defaults.sync_media,
            auto_delete_orphans: defaults.auto_delete_orphans,
            stamp_retries: defaults.stamp_retries,
        }
    }
}

impl SyncConfig {
    pub fn to_options(&self) -> SyncOptions {
        SyncOptions {
            page_size: self.page_size.max(1),
            page_delay: Duration::from_millis(self.page_delay_ms),
            lock_ttl: Duration::from_secs(self.lock_ttl_secs.clamp(1, MAX_LOCK_TTL_SECS)),
            force_update: self.force_update,
            sync_media: self.sync_media,
            auto_delete_orphans: self.auto_delete_orphans,
            stamp_retries: self.stamp_retries.max(1),
        }
    }
}

/// Application configuration with source tracking
#[derive(Debug, Clone, Serialize)]
pub struct Config {
    /// Path to the SQLite mirror database
    pub database_path: ConfigValue<PathBuf>,
    /// Tenant whose catalog is mirrored
    pub tenant: ConfigValue<String>,
    /// Config file path used (if any)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config_file: Option<PathBuf>,
    pub source: SourceConfig,
    pub sync: SyncConfig,
}

/// Internal struct for deserializing config file
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct ConfigFile {
    database_path: Option<PathBuf>,
    tenant: Option<String>,
    source: Option<SourceConfig>,
    sync: Option<SyncConfig>,
}

impl Config {
    /// Load configuration with priority: env vars > config file > defaults
    pub fn load(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let default_db_path = Self::default_data_dir().join("mirror.db");

        // Start with defaults
        let mut database_path = ConfigValue::new(default_db_path, ConfigSource::Default);
        let mut tenant = ConfigValue::new("default".to_string(), ConfigSource::Default);
        let mut config_file = None;
        let mut source = SourceConfig::default();
        let mut sync = SyncConfig::default();

        // Try to load from config file
        let path = config_path.unwrap_or_else(Self::default_config_path);
        if path.exists() {
            let contents = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadError(path.clone(), e))?;
            let file_config: ConfigFile = serde_yaml::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(path.clone(), e))?;

            config_file = Some(path.clone());

            if let Some(db_path) = file_config.database_path {
                // Resolve relative paths against config file's directory
                let resolved_path = if db_path.is_relative() {
                    path.parent().map(|p| p.join(&db_path)).unwrap_or(db_path)
                } else {
                    db_path
                };
                database_path = ConfigValue::new(resolved_path, ConfigSource::File);
            }
            if let Some(name) = file_config.tenant {
                tenant = ConfigValue::new(name, ConfigSource::File);
            }
            if let Some(source_config) = file_config.source {
                source = source_config;
            }
            if let Some(sync_config) = file_config.sync {
                sync = sync_config;
            }
        }

        // Apply environment variable overrides
        if let Ok(db_path) = std::env::var("CATALOG_MIRROR_DATABASE_PATH") {
            database_path = ConfigValue::new(PathBuf::from(db_path), ConfigSource::Environment);
        }
        if let Ok(name) = std::env::var("CATALOG_MIRROR_TENANT") {
            tenant = ConfigValue::new(name, ConfigSource::Environment);
        }
        if let Ok(url) = std::env::var("CATALOG_MIRROR_API_URL") {
            source.base_url = Some(url);
        }
        if let Ok(token) = std::env::var("CATALOG_MIRROR_API_TOKEN") {
            source.api_token = Some(token);
        }

        Ok(Self {
            database_path,
            tenant,
            config_file,
            source,
            sync,
        })
    }

    pub fn tenant_token(&self) -> TenantToken {
        TenantToken::new(self.tenant.value.clone())
    }

    /// Default config directory (platform-specific):
    /// - Linux: ~/.config/catalog-mirror/
    /// - macOS: ~/Library/Application Support/catalog-mirror/
    /// - Windows: %APPDATA%/catalog-mirror/
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("catalog-mirror")
    }

    /// Default data directory (platform-specific):
    /// - Linux: ~/.local/share/catalog-mirror/
    /// - macOS: ~/Library/Application Support/catalog-mirror/
    /// - Windows: %APPDATA%/catalog-mirror/
    pub fn default_data_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("catalog-mirror")
    }

    /// Default config file path (platform-specific config dir + config.yaml)
    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join("config.yaml")
    }
}

#[derive(Debug)]
pub enum ConfigError {
    ReadError(PathBuf, std::io::Error),
    ParseError(PathBuf, serde_yaml::Error),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, e) => {
                write!(f, "Failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "Failed to parse config file '{}': {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("nonexistent.yaml");

        let config = Config::load(Some(config_path)).unwrap();
        assert!(config
            .database_path
            .value
            .to_string_lossy()
            .contains("mirror.db"));
        assert_eq!(config.database_path.source, ConfigSource::Default);
        assert_eq!(config.tenant.value, "default");
        assert_eq!(config.sync.page_size, 20);
        assert_eq!(config.sync.page_delay_ms, 250);
        assert_eq!(config.sync.lock_ttl_secs, 3600);
        assert!(config.sync.auto_delete_orphans);
        assert_eq!(config.source.timeout_secs, 30);
        assert!(config.config_file.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "database_path: /custom/path/mirror.sqlite").unwrap();
        writeln!(file, "tenant: acme").unwrap();
        writeln!(file, "source:").unwrap();
        writeln!(file, "  base_url: https://catalog.example.com/api").unwrap();
        writeln!(file, "sync:").unwrap();
        writeln!(file, "  page_size: 50").unwrap();
        writeln!(file, "  auto_delete_orphans: false").unwrap();

        let config = Config::load(Some(config_path.clone())).unwrap();
        assert_eq!(
            config.database_path.value,
            PathBuf::from("/custom/path/mirror.sqlite")
        );
        assert_eq!(config.database_path.source, ConfigSource::File);
        assert_eq!(config.tenant.value, "acme");
        assert_eq!(config.tenant.source, ConfigSource::File);
        assert_eq!(
            config.source.base_url.as_deref(),
            Some("https://catalog.example.com/api")
        );
        assert_eq!(config.source.timeout_secs, 30);
        assert_eq!(config.sync.page_size, 50);
        assert_eq!(config.sync.stamp_retries, 3);
        assert!(!config.sync.auto_delete_orphans);
        assert_eq!(config.config_file, Some(config_path));
    }

    #[test]
    fn test_relative_database_path_resolves_against_config_dir() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "database_path: data/mirror.db").unwrap();

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(
            config.database_path.value,
            temp_dir.path().join("data/mirror.db")
        );
    }

    #[test]
    fn test_sync_options_from_config() {
        let sync = SyncConfig {
            page_size: 0,
            page_delay_ms: 10,
            stamp_retries: 0,
            ..SyncConfig::default()
        };
        let options = sync.to_options();
        assert_eq!(options.page_size, 1);
        assert_eq!(options.page_delay, Duration::from_millis(10));
        assert_eq!(options.stamp_retries, 1);
        assert_eq!(options.lock_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn test_lock_ttl_is_clamped() {
        let huge = SyncConfig {
            lock_ttl_secs: u64::MAX,
            ..SyncConfig::default()
        };
        assert_eq!(huge.to_options().lock_ttl.as_secs(), MAX_LOCK_TTL_SECS);

        let zero = SyncConfig {
            lock_ttl_secs: 0,
            ..SyncConfig::default()
        };
        assert_eq!(zero.to_options().lock_ttl, Duration::from_secs(1));
    }

    #[test]
    #[ignore] // Run with --ignored; env vars can pollute parallel tests
    fn test_env_var_overrides_file() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "tenant: fromfile").unwrap();

        std::env::set_var("CATALOG_MIRROR_TENANT", "fromenv");

        let config = Config::load(Some(config_path)).unwrap();
        assert_eq!(config.tenant.value, "fromenv");
        assert_eq!(config.tenant.source, ConfigSource::Environment);

        std::env::remove_var("CATALOG_MIRROR_TENANT");
    }

    #[test]
    fn test_invalid_yaml_error() {
        let temp_dir = tempdir().unwrap();
        let config_path = temp_dir.path().join("config.yaml");

        let mut file = std::fs::File::create(&config_path).unwrap();
        writeln!(file, "invalid: yaml: content: [").unwrap();

        let result = Config::load(Some(config_path));
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Failed to parse config file"));
    }
}
