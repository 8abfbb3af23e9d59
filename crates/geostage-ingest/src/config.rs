//! Global settings document
//!
//! One YAML document configures the whole run: retry behavior, worker and
//! per-host concurrency, bbox filtering, filesystem roots and cleanup
//! policy. Every section has defaults so a minimal document (or none at
//! all) still produces a usable configuration. A handful of environment
//! variables override the most commonly tuned knobs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use geostage_common::logging::LogConfig;
use geostage_common::{GeostageError, Result};
use serde::Deserialize;
use tracing::warn;

use crate::sources::BoundingBox;

/// WGS84 lon/lat CRS URI used when the global bbox omits one
pub const CRS84_URI: &str = "http://www.opengis.net/def/crs/OGC/1.3/CRS84";

/// Retry and circuit breaker settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    /// Base delay in seconds before the first retry
    pub base_delay: f64,
    pub backoff_factor: f64,
    /// Upper bound on any single delay, in seconds
    pub max_delay: f64,
    /// Per-request timeout in seconds
    pub timeout: u64,
    pub circuit_breaker_threshold: u32,
    /// Breaker cooldown in seconds
    pub circuit_breaker_timeout: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: 1.0,
            backoff_factor: 2.0,
            max_delay: 300.0,
            timeout: 30,
            circuit_breaker_threshold: 5,
            circuit_breaker_timeout: 60.0,
        }
    }
}

impl RetrySettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    fn validate(&self) -> Result<()> {
        if self.max_attempts < 1 {
            return Err(GeostageError::config(
                "retry.max_attempts must be at least 1",
                "set it to 1 to disable retries",
            ));
        }
        if self.base_delay < 0.0 {
            return Err(GeostageError::config(
                "retry.base_delay must be non-negative",
                "use 0 for immediate retries",
            ));
        }
        if self.backoff_factor < 1.0 {
            return Err(GeostageError::config(
                "retry.backoff_factor must be at least 1",
                "use 1 for constant delays",
            ));
        }
        if self.timeout < 1 {
            return Err(GeostageError::config(
                "retry.timeout must be at least 1 second",
                "raise the timeout",
            ));
        }
        Ok(())
    }
}

/// Worker pool and throughput settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProcessingSettings {
    pub parallel_workers: usize,
    pub memory_limit_mb: u64,
    /// Streaming chunk size in bytes
    pub chunk_size: usize,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            parallel_workers: 2,
            memory_limit_mb: 1024,
            chunk_size: 64 * 1024,
        }
    }
}

impl ProcessingSettings {
    fn validate(&self) -> Result<()> {
        if self.parallel_workers < 1 {
            return Err(GeostageError::config(
                "processing.parallel_workers must be at least 1",
                "use 1 for strictly sequential runs",
            ));
        }
        if self.chunk_size < 1 {
            return Err(GeostageError::config(
                "processing.chunk_size must be at least 1",
                "the default is 65536",
            ));
        }
        if self.memory_limit_mb < 128 {
            return Err(GeostageError::config(
                "processing.memory_limit_mb must be at least 128",
                "raise the limit",
            ));
        }
        Ok(())
    }
}

/// Filesystem roots for downloads and staging
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathSettings {
    pub downloads: PathBuf,
    pub staging: PathBuf,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            downloads: PathBuf::from("downloads"),
            staging: PathBuf::from("staging"),
        }
    }
}

/// TLS and host trust settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecuritySettings {
    pub enable_ssl_verification: bool,
    /// Hosts whose certificates are accepted without verification
    pub trusted_hosts: Vec<String>,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            enable_ssl_verification: true,
            trusted_hosts: Vec::new(),
        }
    }
}

/// Main configuration container for a run
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GlobalSettings {
    pub environment: String,
    pub logging: LogConfig,
    pub retry: RetrySettings,
    pub processing: ProcessingSettings,
    pub paths: PathSettings,
    pub security: SecuritySettings,

    /// Apply the global bbox to sources without their own
    pub use_bbox_filter: bool,
    /// Global bbox as "xmin,ymin,xmax,ymax"
    pub global_ogc_bbox_coords: Option<String>,
    /// CRS URI for the global bbox coordinates
    pub global_ogc_bbox_crs_uri: Option<String>,

    pub cleanup_downloads_before_run: bool,
    pub cleanup_staging_before_run: bool,
    /// Re-download even when the destination file already exists
    pub force_download: bool,

    /// Concurrent requests allowed per remote host
    pub per_host_concurrency: usize,
    /// Per-source deadline in seconds
    pub source_timeout: u64,
    /// Failed sources tolerated before the run is aborted
    pub max_pipeline_failures: u32,

    /// Authorities whose advertised projected CRS may be overridden when
    /// coordinates look geographic (see the collections handler)
    pub crs_override_authorities: Vec<String>,
}

impl Default for GlobalSettings {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
            logging: LogConfig::default(),
            retry: RetrySettings::default(),
            processing: ProcessingSettings::default(),
            paths: PathSettings::default(),
            security: SecuritySettings::default(),
            use_bbox_filter: false,
            global_ogc_bbox_coords: None,
            global_ogc_bbox_crs_uri: None,
            cleanup_downloads_before_run: false,
            cleanup_staging_before_run: false,
            force_download: false,
            per_host_concurrency: 4,
            source_timeout: 15 * 60,
            max_pipeline_failures: 5,
            crs_override_authorities: vec!["SGU".to_string()],
        }
    }
}

impl GlobalSettings {
    /// Load settings from a YAML document, apply environment overrides and
    /// validate. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let mut settings = if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|e| {
                GeostageError::config(
                    format!("cannot read {}: {}", path.display(), e),
                    "check the --config path",
                )
            })?;
            serde_yaml::from_str(&text).map_err(|e| {
                GeostageError::config(
                    format!("invalid YAML in {}: {}", path.display(), e),
                    "compare against config/config.yaml in the repository",
                )
            })?
        } else {
            warn!(path = %path.display(), "Settings file not found, using defaults");
            Self::default()
        };
        settings.apply_env_overrides();
        settings.validate()?;
        Ok(settings)
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GEOSTAGE_MAX_WORKERS") {
            match v.parse() {
                Ok(n) => self.processing.parallel_workers = n,
                Err(_) => warn!(value = %v, "Ignoring invalid GEOSTAGE_MAX_WORKERS"),
            }
        }
        if let Ok(v) = std::env::var("GEOSTAGE_DOWNLOAD_PATH") {
            self.paths.downloads = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GEOSTAGE_STAGING_PATH") {
            self.paths.staging = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GEOSTAGE_ENVIRONMENT") {
            self.environment = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        const ENVIRONMENTS: [&str; 3] = ["development", "staging", "production"];
        if !ENVIRONMENTS.contains(&self.environment.as_str()) {
            return Err(GeostageError::config(
                format!("invalid environment '{}'", self.environment),
                format!("must be one of {:?}", ENVIRONMENTS),
            ));
        }
        self.retry.validate()?;
        self.processing.validate()?;
        if self.per_host_concurrency < 1 {
            return Err(GeostageError::config(
                "per_host_concurrency must be at least 1",
                "the default is 4",
            ));
        }
        if self.source_timeout < 1 {
            return Err(GeostageError::config(
                "source_timeout must be at least 1 second",
                "the default is 900",
            ));
        }
        if self.use_bbox_filter {
            if let Some(coords) = &self.global_ogc_bbox_coords {
                BoundingBox::parse(coords, self.global_bbox_crs())?;
            }
        }
        Ok(())
    }

    /// CRS URI the global bbox coordinates are expressed in
    pub fn global_bbox_crs(&self) -> &str {
        self.global_ogc_bbox_crs_uri.as_deref().unwrap_or(CRS84_URI)
    }

    /// The process-global bbox, when filtering is enabled and configured
    pub fn global_bbox(&self) -> Option<BoundingBox> {
        if !self.use_bbox_filter {
            return None;
        }
        let coords = self.global_ogc_bbox_coords.as_deref()?;
        BoundingBox::parse(coords, self.global_bbox_crs()).ok()
    }

    pub fn source_deadline(&self) -> Duration {
        Duration::from_secs(self.source_timeout)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults() {
        let settings = GlobalSettings::default();
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.processing.parallel_workers, 2);
        assert_eq!(settings.per_host_concurrency, 4);
        assert_eq!(settings.max_pipeline_failures, 5);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_partial_document() {
        let file = write_config(
            r#"
environment: production
retry:
  max_attempts: 5
  base_delay: 0.5
use_bbox_filter: true
global_ogc_bbox_coords: "16.504,59.090,17.618,59.610"
paths:
  downloads: /data/downloads
  staging: /data/staging
"#,
        );
        let settings = GlobalSettings::load(file.path()).unwrap();
        assert_eq!(settings.environment, "production");
        assert_eq!(settings.retry.max_attempts, 5);
        // Unspecified fields keep their defaults.
        assert_eq!(settings.retry.backoff_factor, 2.0);
        let bbox = settings.global_bbox().unwrap();
        assert_eq!(bbox.crs, CRS84_URI);
    }

    #[test]
    fn test_invalid_environment_rejected() {
        let file = write_config("environment: circus\n");
        assert!(GlobalSettings::load(file.path()).is_err());
    }

    #[test]
    fn test_invalid_retry_rejected() {
        let file = write_config("retry:\n  max_attempts: 0\n");
        assert!(GlobalSettings::load(file.path()).is_err());
    }

    #[test]
    fn test_malformed_global_bbox_rejected() {
        let file = write_config(
            "use_bbox_filter: true\nglobal_ogc_bbox_coords: \"20,10,5\"\n",
        );
        assert!(GlobalSettings::load(file.path()).is_err());
    }
}
