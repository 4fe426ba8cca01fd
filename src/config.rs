use std::path::PathBuf;
use std::time::Duration;

use crate::capabilities::ValidatedUrl;
use crate::error::SyncError;
use crate::outbox::DEFAULT_MAX_ENTRIES;

pub const QUEUE_FILE_NAME: &str = "outbox.db";
pub const CACHE_FILE_NAME: &str = "trips.cache";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    /// A new reachability value must hold this long before it is published.
    pub debounce: Duration,
    /// Defaults to the backend root.
    pub probe_url: Option<String>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(3),
            debounce: Duration::from_secs(2),
            probe_url: None,
        }
    }
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.probe_interval.is_zero() {
            return Err(SyncError::Validation("probe_interval must be > 0".into()));
        }
        if self.probe_timeout.is_zero() {
            return Err(SyncError::Validation("probe_timeout must be > 0".into()));
        }
        if let Some(url) = &self.probe_url {
            ValidatedUrl::new(url.as_str())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    pub base_url: String,
    /// Holds the queue database and the trips snapshot.
    pub data_dir: PathBuf,
    pub request_timeout: Duration,
    pub upload_timeout: Duration,
    pub max_queue_entries: usize,
    /// Attempts after which a stuck head-of-queue action is reported as poison.
    pub poison_threshold: u32,
    pub monitor: MonitorConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            data_dir: PathBuf::from("trip-sync"),
            request_timeout: Duration::from_secs(30),
            upload_timeout: Duration::from_secs(120),
            max_queue_entries: DEFAULT_MAX_ENTRIES,
            poison_threshold: 5,
            monitor: MonitorConfig::default(),
        }
    }
}

impl SyncConfig {
    pub fn new(base_url: impl Into<String>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_url: base_url.into(),
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        ValidatedUrl::new(self.base_url.as_str())?;
        if self.data_dir.as_os_str().is_empty() {
            return Err(SyncError::Validation("data_dir must be set".into()));
        }
        if self.request_timeout.is_zero() || self.upload_timeout.is_zero() {
            return Err(SyncError::Validation("timeouts must be > 0".into()));
        }
        if self.max_queue_entries == 0 {
            return Err(SyncError::Validation("max_queue_entries must be > 0".into()));
        }
        if self.poison_threshold == 0 {
            return Err(SyncError::Validation("poison_threshold must be > 0".into()));
        }
        self.monitor.validate()
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join(QUEUE_FILE_NAME)
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join(CACHE_FILE_NAME)
    }

    /// URL the reachability probe hits.
    pub fn probe_url(&self) -> &str {
        self.monitor.probe_url.as_deref().unwrap_or(&self.base_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(SyncConfig::default().validate().is_ok());
    }

    #[test]
    fn paths_live_under_data_dir() {
        let config = SyncConfig::new("https://api.example.com", "/var/app");
        assert_eq!(config.queue_path(), PathBuf::from("/var/app/outbox.db"));
        assert_eq!(config.cache_path(), PathBuf::from("/var/app/trips.cache"));
        assert_eq!(config.probe_url(), "https://api.example.com");
    }

    #[test]
    fn rejects_bad_values() {
        let bad_url = SyncConfig::new("ftp://example.com", "/tmp/x");
        assert!(bad_url.validate().is_err());

        let no_capacity = SyncConfig {
            max_queue_entries: 0,
            ..Default::default()
        };
        assert!(matches!(
            no_capacity.validate(),
            Err(SyncError::Validation(_))
        ));

        let mut bad_probe = SyncConfig::default();
        bad_probe.monitor.probe_url = Some("not a url".into());
        assert!(bad_probe.validate().is_err());
    }
}
