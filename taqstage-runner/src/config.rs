//! TOML configuration for ingestion runs.
//!
//! ```toml
//! [store]
//! root = "data/taq"
//! partition_by_symbol = true
//! compression = "snappy"
//! existence_policy = "strict"
//! write_mode = "streaming"
//!
//! [extract]
//! timezone = "America/New_York"
//! chunk_size = 50
//! types = ["trades", "nbbo"]
//!
//! [http]
//! feed = "sip"
//!
//! [http.retry]
//! base_delay_ms = 1000
//! max_attempts = 120
//! ```

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use taqstage_core::domain::{parse_kinds, DomainError};
use taqstage_core::source::database::{PgConnectOptions, WRDS_DATABASE, WRDS_HOST, WRDS_PORT};
use taqstage_core::source::{
    CsvSourceConfig, DatabaseSourceConfig, HttpSourceConfig, RetryPolicy,
};
use taqstage_core::{Compression, DataKind, ExistencePolicy, PartitionStore, WriteMode};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IngestConfig {
    pub store: StoreConfig,
    pub extract: ExtractConfig,
    pub database: DatabaseConfig,
    pub http: HttpConfig,
    pub csv: CsvConfig,
    pub credentials: CredentialsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreConfig {
    pub root: PathBuf,
    pub partition_by_symbol: bool,
    /// `snappy`, `zstd`, `lz4`, `gzip` or `none`.
    pub compression: String,
    pub existence_policy: ExistencePolicy,
    pub write_mode: WriteMode,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("data/taq"),
            partition_by_symbol: true,
            compression: "snappy".to_string(),
            existence_policy: ExistencePolicy::Strict,
            write_mode: WriteMode::Streaming,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExtractConfig {
    /// IANA zone that provider-local times are expressed in.
    pub timezone: String,
    pub chunk_size: usize,
    pub types: Vec<String>,
    /// Used when neither the command line nor the source supplies symbols.
    pub symbols: Vec<String>,
    pub symbols_file: Option<PathBuf>,
    /// Existing store whose trades symbols serve as the universe of last resort.
    pub reference_root: Option<PathBuf>,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            timezone: "America/New_York".to_string(),
            chunk_size: 50,
            types: DataKind::ALL.iter().map(|k| k.to_string()).collect(),
            symbols: Vec::new(),
            symbols_file: None,
            reference_root: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub dbname: String,
    pub require_tls: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: WRDS_HOST.to_string(),
            port: WRDS_PORT,
            dbname: WRDS_DATABASE.to_string(),
            require_tls: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HttpConfig {
    pub base_url: String,
    pub feed: Option<String>,
    pub page_limit: u32,
    pub timeout_secs: u64,
    pub probe_symbol: String,
    pub retry: RetryConfig,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: "https://data.alpaca.markets".to_string(),
            feed: Some("sip".to_string()),
            page_limit: 10_000,
            timeout_secs: 60,
            probe_symbol: "SPY".to_string(),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry schedule for rate limits and dropped connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub jitter_pct: f64,
    /// Unset means no attempt limit.
    pub max_attempts: Option<u32>,
    pub max_elapsed_secs: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            multiplier: 1.0,
            max_delay_ms: 1_000,
            jitter_pct: 0.0,
            max_attempts: Some(120),
            max_elapsed_secs: None,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        let base = Duration::from_millis(self.base_delay_ms);
        RetryPolicy {
            max_attempts: self.max_attempts,
            max_elapsed: self.max_elapsed_secs.map(Duration::from_secs),
            base_delay: base,
            multiplier: self.multiplier.max(1.0),
            max_delay: Duration::from_millis(self.max_delay_ms).max(base),
            jitter_pct: self.jitter_pct.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CsvConfig {
    pub root: Option<PathBuf>,
    pub streaming_chunk_rows: usize,
}

impl Default for CsvConfig {
    fn default() -> Self {
        Self {
            root: None,
            streaming_chunk_rows: 1_000_000,
        }
    }
}

/// Lowest-precedence credentials, below the environment and the secrets file.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CredentialsConfig {
    pub wrds_username: Option<String>,
    pub wrds_password: Option<String>,
    pub alpaca_api_key: Option<String>,
    pub alpaca_secret_key: Option<String>,
}

impl IngestConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.timezone()?;
        self.compression()?;
        self.kinds()?;
        if self.extract.chunk_size == 0 {
            return Err(ConfigError::Invalid("extract.chunk_size must be at least 1".into()));
        }
        if self.csv.streaming_chunk_rows == 0 {
            return Err(ConfigError::Invalid(
                "csv.streaming_chunk_rows must be at least 1".into(),
            ));
        }
        if self.http.page_limit == 0 {
            return Err(ConfigError::Invalid("http.page_limit must be at least 1".into()));
        }
        if self.http.retry.max_attempts == Some(0) {
            return Err(ConfigError::Invalid("http.retry.max_attempts must be at least 1".into()));
        }
        if self.store.root.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("store.root is empty".into()));
        }
        Ok(())
    }

    pub fn timezone(&self) -> Result<Tz, ConfigError> {
        self.extract.timezone.parse::<Tz>().map_err(|_| {
            ConfigError::Invalid(format!("unknown timezone '{}'", self.extract.timezone))
        })
    }

    pub fn compression(&self) -> Result<Compression, ConfigError> {
        Ok(self.store.compression.parse()?)
    }

    pub fn kinds(&self) -> Result<Vec<DataKind>, ConfigError> {
        let kinds = parse_kinds(&self.extract.types)?;
        if kinds.is_empty() {
            return Err(ConfigError::Invalid("extract.types is empty".into()));
        }
        Ok(kinds)
    }

    pub fn partition_store(&self) -> PartitionStore {
        PartitionStore::new(
            &self.store.root,
            self.store.partition_by_symbol,
            self.store.existence_policy,
        )
    }

    pub fn database_source_config(&self) -> DatabaseSourceConfig {
        DatabaseSourceConfig {
            chunk_size: self.extract.chunk_size,
            ..Default::default()
        }
    }

    pub fn database_connect_options(&self, user: &str, password: Option<String>) -> PgConnectOptions {
        PgConnectOptions {
            host: self.database.host.clone(),
            port: self.database.port,
            dbname: self.database.dbname.clone(),
            user: user.to_string(),
            password,
            require_tls: self.database.require_tls,
        }
    }

    pub fn http_source_config(
        &self,
        api_key: String,
        secret_key: String,
    ) -> Result<HttpSourceConfig, ConfigError> {
        Ok(HttpSourceConfig {
            base_url: self.http.base_url.clone(),
            api_key,
            secret_key,
            feed: self.http.feed.clone().filter(|f| !f.trim().is_empty()),
            page_limit: self.http.page_limit,
            chunk_size: self.extract.chunk_size,
            timezone: self.timezone()?,
            probe_symbol: self.http.probe_symbol.clone(),
            timeout: Duration::from_secs(self.http.timeout_secs),
        })
    }

    /// CSV source rooted at `[csv].root`, or `None` when unset.
    pub fn csv_source_config(&self) -> Option<CsvSourceConfig> {
        self.csv.root.as_ref().map(|root| CsvSourceConfig {
            root: root.clone(),
            chunk_rows: self.csv.streaming_chunk_rows,
        })
    }
}
