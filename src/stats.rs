//! Atomic transfer counters and the end-of-run summary.

use serde::Serialize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::StatsFormat;

/// Process-wide transfer statistics. All counters are relaxed atomic adds;
/// the byte counter doubles as the quota cell (reserve, then test).
#[derive(Debug, Default)]
pub struct Stats {
    pub downloads: AtomicU64,
    pub chunks: AtomicU64,
    pub redirects: AtomicU64,
    pub not_modified: AtomicU64,
    pub errors: AtomicU64,
    total_bytes: AtomicU64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `n` body bytes against the quota; returns the counter value
    /// *before* the add so callers can test "was the quota already crossed".
    pub fn add_bytes(&self, n: u64) -> u64 {
        self.total_bytes.fetch_add(n, Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            downloads: self.downloads.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            redirects: self.redirects.load(Ordering::Relaxed),
            not_modified: self.not_modified.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            total_bytes: self.bytes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub downloads: u64,
    pub chunks: u64,
    pub redirects: u64,
    pub not_modified: u64,
    pub errors: u64,
    pub total_bytes: u64,
}

impl StatsSnapshot {
    pub fn render(&self, format: StatsFormat) -> String {
        match format {
            StatsFormat::Human => format!(
                "Downloaded: {} files, {} chunks, {} bytes, {} redirects, {} not-modified, {} errors",
                self.downloads,
                self.chunks,
                self.total_bytes,
                self.redirects,
                self.not_modified,
                self.errors
            ),
            StatsFormat::Json => {
                serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
            }
            StatsFormat::Csv => format!(
                "downloads,chunks,bytes,redirects,not_modified,errors\n{},{},{},{},{},{}",
                self.downloads,
                self.chunks,
                self.total_bytes,
                self.redirects,
                self.not_modified,
                self.errors
            ),
        }
    }

    pub fn write_to(&self, format: StatsFormat, path: Option<&Path>) {
        let rendered = self.render(format);
        match path {
            Some(p) => {
                if let Err(e) = std::fs::write(p, rendered + "\n") {
                    tracing::error!("failed to write stats to {}: {}", p.display(), e);
                }
            }
            None => tracing::info!("{}", rendered),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_then_test_ordering() {
        let stats = Stats::new();
        assert_eq!(stats.add_bytes(100), 0);
        assert_eq!(stats.add_bytes(50), 100);
        assert_eq!(stats.bytes(), 150);
    }

    #[test]
    fn test_render_csv() {
        let stats = Stats::new();
        stats.downloads.fetch_add(3, Ordering::Relaxed);
        stats.add_bytes(4096);
        let snap = stats.snapshot();
        let csv = snap.render(StatsFormat::Csv);
        assert!(csv.starts_with("downloads,chunks,bytes"));
        assert!(csv.contains("3,0,4096,0,0,0"));
    }

    #[test]
    fn test_render_json_roundtrip() {
        let stats = Stats::new();
        stats.chunks.fetch_add(2, Ordering::Relaxed);
        let json = stats.snapshot().render(StatsFormat::Json);
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["chunks"], 2);
    }
}
