//! Worker configuration.

use std::time::Duration;

/// Import worker configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    /// Maximum concurrent import jobs
    pub concurrency: usize,
    /// Process-wide temp directory for in-flight downloads
    pub temp_dir: String,
    /// Upload path prefix inside the storage zone (front-door concern,
    /// carried through to submissions from the pre-stager)
    pub upload_path_prefix: String,
    /// Global file size cap in bytes
    pub max_file_size: u64,
    /// Per-request download timeout
    pub download_timeout: Duration,
    /// Lease/job timeout
    pub job_timeout: Duration,
    /// Interval of the dispatcher maintenance tick
    pub cleanup_interval: Duration,
    /// Heartbeat interval for active jobs
    pub heartbeat_interval: Duration,
    /// Memory cap for the watchdog, in bytes
    pub max_memory: u64,
    /// Environment label (development/production)
    pub environment: String,
    /// Error tracker DSN, forwarded to the (external) tracker when set
    pub sentry_dsn: Option<String>,
    /// Listen port reserved for the HTTP front door
    pub port: u16,
    /// Graceful shutdown budget
    pub shutdown_timeout: Duration,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            temp_dir: "/tmp/vingest".to_string(),
            upload_path_prefix: "uploads".to_string(),
            max_file_size: 10 * 1024 * 1024 * 1024,
            download_timeout: Duration::from_secs(2 * 3600),
            job_timeout: Duration::from_secs(2 * 3600),
            cleanup_interval: Duration::from_secs(15),
            heartbeat_interval: Duration::from_secs(30),
            max_memory: 2048 * 1024 * 1024,
            environment: "development".to_string(),
            sentry_dsn: None,
            port: 3000,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ImportConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            concurrency: std::env::var("WORKER_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.concurrency),
            temp_dir: std::env::var("TEMP_DIR").unwrap_or(defaults.temp_dir),
            upload_path_prefix: std::env::var("UPLOAD_PATH_PREFIX")
                .unwrap_or(defaults.upload_path_prefix),
            max_file_size: std::env::var("MAX_FILE_SIZE_MB")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(|mb| mb * 1024 * 1024)
                .unwrap_or(defaults.max_file_size),
            download_timeout: Duration::from_millis(
                std::env::var("DOWNLOAD_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.download_timeout.as_millis() as u64),
            ),
            job_timeout: Duration::from_millis(
                std::env::var("JOB_TIMEOUT_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.job_timeout.as_millis() as u64),
            ),
            cleanup_interval: Duration::from_millis(
                std::env::var("CLEANUP_INTERVAL_MS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.cleanup_interval.as_millis() as u64),
            ),
            heartbeat_interval: Duration::from_secs(
                std::env::var("HEARTBEAT_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.heartbeat_interval.as_secs()),
            ),
            max_memory: std::env::var("MAX_MEMORY_MB")
                .ok()
                .and_then(|s| s.parse::<u64>().ok())
                .map(|mb| mb * 1024 * 1024)
                .unwrap_or(defaults.max_memory),
            environment: std::env::var("ENVIRONMENT").unwrap_or(defaults.environment),
            sentry_dsn: std::env::var("SENTRY_DSN").ok(),
            port: std::env::var("PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            shutdown_timeout: Duration::from_secs(
                std::env::var("SHUTDOWN_TIMEOUT_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(defaults.shutdown_timeout.as_secs()),
            ),
        }
    }

    /// Check if running in production mode.
    pub fn is_production(&self) -> bool {
        self.environment.to_lowercase() == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = ImportConfig::default();
        assert_eq!(config.concurrency, 5);
        assert_eq!(config.download_timeout, Duration::from_secs(7200));
        assert_eq!(config.heartbeat_interval, Duration::from_secs(30));
        assert!(!config.is_production());
    }
}
