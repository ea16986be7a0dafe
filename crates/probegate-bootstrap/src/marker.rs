//! Completion marker written once bootstrap has finished

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::BootstrapError;

/// Parsed marker contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarkerRecord {
    pub bootstrap_timestamp: Option<DateTime<Utc>>,
    pub proxy_port: Option<u16>,
}

impl MarkerRecord {
    fn parse(contents: &str) -> Self {
        let mut record = MarkerRecord {
            bootstrap_timestamp: None,
            proxy_port: None,
        };
        for line in contents.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            match key.trim() {
                "bootstrap_timestamp" => {
                    record.bootstrap_timestamp = DateTime::parse_from_rfc3339(value.trim())
                        .ok()
                        .map(|t| t.with_timezone(&Utc));
                }
                "proxy_port" => record.proxy_port = value.trim().parse().ok(),
                _ => {}
            }
        }
        record
    }

    fn render(&self) -> String {
        let mut out = String::new();
        if let Some(timestamp) = self.bootstrap_timestamp {
            out.push_str(&format!("bootstrap_timestamp={}\n", timestamp.to_rfc3339()));
        }
        if let Some(port) = self.proxy_port {
            out.push_str(&format!("proxy_port={}\n", port));
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct CompletionMarker {
    path: PathBuf,
}

impl CompletionMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The marker's presence alone means bootstrap is done, even if its
    /// contents are unreadable
    pub async fn is_present(&self) -> bool {
        tokio::fs::try_exists(&self.path).await.unwrap_or(false)
    }

    pub async fn read(&self) -> Option<MarkerRecord> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => Some(MarkerRecord::parse(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %self.path.display(), "Completion marker unreadable: {}", e);
                Some(MarkerRecord {
                    bootstrap_timestamp: None,
                    proxy_port: None,
                })
            }
        }
    }

    pub async fn write(&self, port: u16) -> Result<MarkerRecord, BootstrapError> {
        let record = MarkerRecord {
            bootstrap_timestamp: Some(Utc::now()),
            proxy_port: Some(port),
        };

        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| BootstrapError::Retryable(format!("Failed to create {}: {}", dir.display(), e)))?;
        }

        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, record.render())
            .await
            .map_err(|e| BootstrapError::Retryable(format!("Failed to write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(|e| {
            BootstrapError::Retryable(format!("Failed to write {}: {}", self.path.display(), e))
        })?;

        info!(path = %self.path.display(), port, "Bootstrap marked complete");
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let marker = CompletionMarker::new(dir.path().join("state/probe_bootstrap_complete"));
        assert!(!marker.is_present().await);
        assert_eq!(marker.read().await, None);

        let written = marker.write(10007).await.unwrap();
        assert!(marker.is_present().await);

        let contents = std::fs::read_to_string(marker.path()).unwrap();
        assert!(contents.starts_with("bootstrap_timestamp="));
        assert!(contents.contains("proxy_port=10007\n"));

        let record = marker.read().await.unwrap();
        assert_eq!(record.proxy_port, Some(10007));
        assert_eq!(
            record.bootstrap_timestamp.map(|t| t.timestamp()),
            written.bootstrap_timestamp.map(|t| t.timestamp())
        );
    }

    #[tokio::test]
    async fn test_foreign_marker_still_counts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("probe_bootstrap_complete");
        std::fs::write(&path, "done\n").unwrap();

        let marker = CompletionMarker::new(&path);
        assert!(marker.is_present().await);
        let record = marker.read().await.unwrap();
        assert_eq!(record.proxy_port, None);
        assert_eq!(record.bootstrap_timestamp, None);
    }
}
