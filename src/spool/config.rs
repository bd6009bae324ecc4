//! Configuration for the Spool Output
//!
//! All options are serde (de)serializable so a deployment can describe the
//! output in TOML. Durations are expressed in milliseconds.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_SIZE_ROTATE: u64 = 30 * 1024 * 1024; // 30MB
const DEFAULT_TIME_ROTATE: Duration = Duration::from_secs(15 * 60);
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(3);
const DEFAULT_ROTATE_CHECK_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_STALE_INTERVAL: Duration = Duration::from_secs(15 * 60);
const DEFAULT_MAX_CONNECTIONS: usize = 1024;

/// Configuration errors. All of them are fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("staging directory {path} is not writable: {source}")]
    StagingDirNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Which rotation policy to build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    /// Rotate when the file reaches `size_rotate` bytes
    Size,
    /// Rotate non-empty files older than `time_rotate`
    Time,
    /// Either of the above
    #[default]
    SizeAndTime,
}

/// Codec applied to staging files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    /// Bytes are written as delivered (`.data`)
    #[default]
    None,
    /// Gzip stream (`.gz`)
    Gzip,
}

impl Encoding {
    pub fn extension(&self) -> &'static str {
        match self {
            Encoding::None => "data",
            Encoding::Gzip => "gz",
        }
    }
}

/// Type of remote store backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// In-memory store (for tests)
    InMemory,
    /// Local filesystem, one directory per bucket
    #[default]
    LocalFs,
    /// Amazon S3 or compatible
    S3,
}

/// Remote store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub kind: StoreKind,
    /// Destination bucket
    pub bucket: String,
    /// Endpoint URL (S3-compatible services such as MinIO)
    pub endpoint: Option<String>,
    /// Region (S3 only)
    pub region: String,
    /// Falls back to AWS_ACCESS_KEY_ID when unset
    pub access_key_id: Option<String>,
    /// Falls back to AWS_SECRET_ACCESS_KEY when unset
    pub secret_access_key: Option<String>,
    /// Root directory for the local filesystem backend
    pub local_path: Option<PathBuf>,
    /// Server-side encryption algorithm requested per object, e.g. "AES256"
    pub server_side_encryption: Option<String>,
    /// Pooled connections kept per host by the S3 client
    pub max_connections: usize,
    /// Force HTTPS (true) or allow plain HTTP (false). When unset, plain
    /// HTTP is allowed only for an `http://` endpoint.
    pub secure_connection: Option<bool>,
}

impl StoreConfig {
    pub fn allow_http(&self) -> bool {
        match self.secure_connection {
            Some(secure) => !secure,
            None => self
                .endpoint
                .as_deref()
                .is_some_and(|endpoint| endpoint.starts_with("http://")),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            kind: StoreKind::LocalFs,
            bucket: "spool".to_string(),
            endpoint: None,
            region: "us-east-1".to_string(),
            access_key_id: None,
            secret_access_key: None,
            local_path: None,
            server_side_encryption: None,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            secure_connection: None,
        }
    }
}

/// Main configuration for the spool output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Root of the local staging tree
    pub staging_dir: PathBuf,
    /// Routing key template, e.g. "logs/%{type}/%{+%Y-%m-%d}"
    pub prefix: String,
    pub rotation_strategy: RotationStrategy,
    /// Size threshold in bytes
    pub size_rotate: u64,
    /// Age threshold for non-empty files
    #[serde(with = "duration_millis")]
    pub time_rotate: Duration,
    pub encoding: Encoding,
    /// Re-upload files left behind by a previous run
    pub recover: bool,
    pub upload_workers_count: usize,
    pub upload_queue_size: usize,
    /// Fixed delay between upload attempts
    #[serde(with = "duration_millis")]
    pub retry_delay: Duration,
    /// Stop retrying after this many attempts and leave the file for
    /// recovery. Unset means retry forever.
    pub max_upload_attempts: Option<u32>,
    /// Period of the timer-driven rotation check
    #[serde(with = "duration_millis")]
    pub rotate_check_interval: Duration,
    /// Period of the stale file sweep
    #[serde(with = "duration_millis")]
    pub stale_sweep_interval: Duration,
    /// Empty files older than this are evicted by the sweep
    #[serde(with = "duration_millis")]
    pub stale_file_age: Duration,
    pub store: StoreConfig,
}

impl Default for OutputConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        OutputConfig {
            staging_dir: std::env::temp_dir().join("object-spool"),
            prefix: String::new(),
            rotation_strategy: RotationStrategy::SizeAndTime,
            size_rotate: DEFAULT_SIZE_ROTATE,
            time_rotate: DEFAULT_TIME_ROTATE,
            encoding: Encoding::None,
            recover: true,
            upload_workers_count: cpus.div_ceil(2),
            upload_queue_size: 2 * cpus.div_ceil(4),
            retry_delay: DEFAULT_RETRY_DELAY,
            max_upload_attempts: None,
            rotate_check_interval: DEFAULT_ROTATE_CHECK_INTERVAL,
            stale_sweep_interval: DEFAULT_STALE_INTERVAL,
            stale_file_age: DEFAULT_STALE_INTERVAL,
            store: StoreConfig::default(),
        }
    }
}

impl OutputConfig {
    /// Configuration for tests: in-memory store, short intervals
    pub fn test(staging_dir: PathBuf) -> Self {
        OutputConfig {
            staging_dir,
            prefix: "%{type}".to_string(),
            size_rotate: 1024,
            time_rotate: Duration::from_secs(60),
            upload_workers_count: 2,
            upload_queue_size: 4,
            retry_delay: Duration::from_millis(10),
            rotate_check_interval: Duration::from_millis(50),
            stale_sweep_interval: Duration::from_secs(3600),
            store: StoreConfig {
                kind: StoreKind::InMemory,
                ..StoreConfig::default()
            },
            ..OutputConfig::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: OutputConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks every constraint that does not need the filesystem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upload_workers_count == 0 || self.upload_queue_size == 0 {
            return Err(ConfigError::Invalid(
                "upload_workers_count and upload_queue_size must both be positive".to_string(),
            ));
        }
        if self.size_rotate == 0 && self.time_rotate.is_zero() {
            return Err(ConfigError::Invalid(
                "at least one of size_rotate or time_rotate must be positive".to_string(),
            ));
        }
        if self.max_upload_attempts == Some(0) {
            return Err(ConfigError::Invalid(
                "max_upload_attempts must be positive when set".to_string(),
            ));
        }
        for (name, interval) in [
            ("rotate_check_interval", self.rotate_check_interval),
            ("stale_sweep_interval", self.stale_sweep_interval),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::Invalid(format!("{} must be positive", name)));
            }
        }
        if self.store.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "store.max_connections must be positive".to_string(),
            ));
        }
        if self.store.bucket.is_empty() {
            return Err(ConfigError::Invalid("store.bucket must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = OutputConfig::default();
        config.validate().unwrap();
        assert_eq!(config.rotation_strategy, RotationStrategy::SizeAndTime);
        assert_eq!(config.size_rotate, 30 * 1024 * 1024);
        assert_eq!(config.time_rotate, Duration::from_secs(900));
        assert!(config.recover);
        assert!(config.upload_workers_count >= 1);
        assert!(config.upload_queue_size >= 2);
    }

    #[test]
    fn test_rejects_non_positive_upload_parameters() {
        let mut config = OutputConfig::default();
        config.upload_workers_count = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let mut config = OutputConfig::default();
        config.upload_queue_size = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_all_zero_thresholds() {
        let mut config = OutputConfig::default();
        config.size_rotate = 0;
        config.time_rotate = Duration::ZERO;
        assert!(config.validate().is_err());

        config.time_rotate = Duration::from_secs(1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_parsing() {
        let config = OutputConfig::from_toml_str(
            r#"
            staging_dir = "/var/spool/out"
            prefix = "logs/%{type}"
            rotation_strategy = "size"
            size_rotate = 4096
            encoding = "gzip"
            retry_delay = 250

            [store]
            kind = "s3"
            bucket = "archive"
            server_side_encryption = "AES256"
            endpoint = "https://minio.local:9000"
            max_connections = 64
            secure_connection = false
            "#,
        )
        .unwrap();

        assert_eq!(config.staging_dir, PathBuf::from("/var/spool/out"));
        assert_eq!(config.rotation_strategy, RotationStrategy::Size);
        assert_eq!(config.size_rotate, 4096);
        assert_eq!(config.encoding, Encoding::Gzip);
        assert_eq!(config.retry_delay, Duration::from_millis(250));
        assert_eq!(config.store.kind, StoreKind::S3);
        assert_eq!(config.store.server_side_encryption.as_deref(), Some("AES256"));
        assert_eq!(config.store.max_connections, 64);
        assert_eq!(config.store.secure_connection, Some(false));
        assert!(config.store.allow_http());
        // Unset fields keep their defaults
        assert_eq!(config.time_rotate, Duration::from_secs(900));
    }

    #[test]
    fn test_toml_invalid_values_rejected() {
        let err = OutputConfig::from_toml_str("upload_queue_size = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = OutputConfig::from_toml_str("encoding = \"lz4\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));

        let err = OutputConfig::from_toml_str("[store]\nmax_connections = 0").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_allow_http_follows_endpoint_unless_forced() {
        let mut store = StoreConfig::default();
        assert_eq!(store.max_connections, 1024);
        assert!(!store.allow_http());

        store.endpoint = Some("http://127.0.0.1:9000".to_string());
        assert!(store.allow_http());
        store.secure_connection = Some(true);
        assert!(!store.allow_http());

        store.endpoint = Some("https://s3.example.com".to_string());
        store.secure_connection = Some(false);
        assert!(store.allow_http());
    }

    #[test]
    fn test_config_roundtrip_through_toml() {
        let config = OutputConfig::test(PathBuf::from("/tmp/spool-test"));
        let text = toml::to_string(&config).unwrap();
        let parsed = OutputConfig::from_toml_str(&text).unwrap();
        assert_eq!(config, parsed);
    }

    #[test]
    fn test_encoding_extension() {
        assert_eq!(Encoding::None.extension(), "data");
        assert_eq!(Encoding::Gzip.extension(), "gz");
    }
}
