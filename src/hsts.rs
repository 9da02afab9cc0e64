//! HSTS and HPKP protocol-state caches, shared across workers.
//!
//! Both caches are updated from response headers on HTTPS responses for
//! non-IP hosts, consulted during admission (HSTS upgrades http URLs before
//! any socket is opened), and persisted to simple line files at shutdown
//! when dirty.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

#[derive(Debug, Clone, Copy)]
struct HstsEntry {
    expires: u64,
    include_subdomains: bool,
}

/// HTTP Strict Transport Security cache (RFC 6797).
#[derive(Debug, Default)]
pub struct HstsCache {
    entries: DashMap<(String, u16), HstsEntry>,
    changed: AtomicBool,
}

impl HstsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a Strict-Transport-Security header for `host:port`.
    pub fn add(&self, host: &str, port: u16, max_age: u64, include_subdomains: bool) {
        let host = host.to_lowercase();
        if max_age == 0 {
            self.entries.remove(&(host, port));
        } else {
            self.entries.insert(
                (host, port),
                HstsEntry {
                    expires: now_epoch() + max_age,
                    include_subdomains,
                },
            );
        }
        self.changed.store(true, Ordering::Relaxed);
    }

    /// Whether `host:port` must be upgraded to https. Checks the exact host
    /// and every parent domain with include_subdomains.
    pub fn matches(&self, host: &str, port: u16) -> bool {
        let host = host.to_lowercase();
        let now = now_epoch();

        // http default port maps onto the https entry port.
        let lookup_port = if port == 80 { 443 } else { port };

        if let Some(entry) = self.entries.get(&(host.clone(), lookup_port)) {
            if entry.expires > now {
                return true;
            }
        }

        let mut rest = host.as_str();
        while let Some(pos) = rest.find('.') {
            rest = &rest[pos + 1..];
            if let Some(entry) = self.entries.get(&(rest.to_string(), lookup_port)) {
                if entry.include_subdomains && entry.expires > now {
                    return true;
                }
            }
        }
        false
    }

    pub fn changed(&self) -> bool {
        self.changed.load(Ordering::Relaxed)
    }

    /// Load the line file written by `save`; unknown lines are skipped.
    pub fn load(&self, path: &Path) -> std::io::Result<()> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        let now = now_epoch();
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(host), Some(port), Some(expires), Some(subs)) =
                (fields.next(), fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let (Ok(port), Ok(expires)) = (port.parse(), expires.parse::<u64>()) else {
                continue;
            };
            if expires <= now {
                continue;
            }
            self.entries.insert(
                (host.to_lowercase(), port),
                HstsEntry {
                    expires,
                    include_subdomains: subs == "1",
                },
            );
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let mut out = String::from("# HSTS cache. <host> <port> <expires> <include_subdomains>\n");
        let now = now_epoch();
        for entry in self.entries.iter() {
            let ((host, port), e) = (entry.key(), entry.value());
            if e.expires > now {
                out.push_str(&format!(
                    "{} {} {} {}\n",
                    host,
                    port,
                    e.expires,
                    u8::from(e.include_subdomains)
                ));
            }
        }
        std::fs::write(path, out)
    }
}

/// Parse a Strict-Transport-Security header value into
/// (max_age, include_subdomains).
pub fn parse_hsts_header(value: &str) -> Option<(u64, bool)> {
    let mut max_age = None;
    let mut include_subdomains = false;
    for directive in value.split(';') {
        let directive = directive.trim();
        if let Some(v) = directive
            .strip_prefix("max-age=")
            .or_else(|| directive.strip_prefix("Max-Age="))
        {
            max_age = v.trim_matches('"').parse().ok();
        } else if directive.eq_ignore_ascii_case("includesubdomains") {
            include_subdomains = true;
        }
    }
    max_age.map(|a| (a, include_subdomains))
}

#[derive(Debug, Clone)]
struct HpkpEntry {
    pins: Vec<String>,
    expires: u64,
    include_subdomains: bool,
}

/// HTTP Public Key Pinning store (RFC 7469). Pin enforcement itself lives
/// in the TLS stack; this cache records and persists the advertised pins.
#[derive(Debug, Default)]
pub struct HpkpCache {
    entries: DashMap<String, HpkpEntry>,
    changed: AtomicBool,
}

impl HpkpCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_from_header(&self, host: &str, value: &str) {
        let mut pins = Vec::new();
        let mut max_age = 0u64;
        let mut include_subdomains = false;

        for directive in value.split(';') {
            let directive = directive.trim();
            if let Some(v) = directive.strip_prefix("pin-sha256=") {
                pins.push(v.trim_matches('"').to_string());
            } else if let Some(v) = directive.strip_prefix("max-age=") {
                max_age = v.trim_matches('"').parse().unwrap_or(0);
            } else if directive.eq_ignore_ascii_case("includesubdomains") {
                include_subdomains = true;
            }
        }

        // RFC 7469 requires at least two pins (one backup).
        if pins.len() < 2 || max_age == 0 {
            if max_age == 0 && !pins.is_empty() {
                self.entries.remove(&host.to_lowercase());
                self.changed.store(true, Ordering::Relaxed);
            }
            return;
        }

        self.entries.insert(
            host.to_lowercase(),
            HpkpEntry {
                pins,
                expires: now_epoch() + max_age,
                include_subdomains,
            },
        );
        self.changed.store(true, Ordering::Relaxed);
    }

    pub fn pins_for(&self, host: &str) -> Option<Vec<String>> {
        self.entries
            .get(&host.to_lowercase())
            .filter(|e| e.expires > now_epoch())
            .map(|e| e.pins.clone())
    }

    pub fn changed(&self) -> bool {
        self.changed.load(Ordering::Relaxed)
    }

    pub fn load(&self, path: &Path) -> std::io::Result<()> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        let now = now_epoch();
        for line in data.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut fields = line.split_whitespace();
            let (Some(host), Some(expires), Some(subs)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let Ok(expires) = expires.parse::<u64>() else {
                continue;
            };
            let pins: Vec<String> = fields.map(str::to_string).collect();
            if expires <= now || pins.len() < 2 {
                continue;
            }
            self.entries.insert(
                host.to_lowercase(),
                HpkpEntry {
                    pins,
                    expires,
                    include_subdomains: subs == "1",
                },
            );
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> std::io::Result<()> {
        let mut out =
            String::from("# HPKP cache. <host> <expires> <include_subdomains> <pins...>\n");
        let now = now_epoch();
        for entry in self.entries.iter() {
            let e = entry.value();
            if e.expires > now {
                out.push_str(&format!(
                    "{} {} {} {}\n",
                    entry.key(),
                    e.expires,
                    u8::from(e.include_subdomains),
                    e.pins.join(" ")
                ));
            }
        }
        std::fs::write(path, out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hsts_header() {
        assert_eq!(
            parse_hsts_header("max-age=31536000; includeSubDomains"),
            Some((31536000, true))
        );
        assert_eq!(parse_hsts_header("max-age=0"), Some((0, false)));
        assert_eq!(parse_hsts_header("preload"), None);
    }

    #[test]
    fn test_hsts_match_and_subdomains() {
        let cache = HstsCache::new();
        cache.add("example.com", 443, 3600, true);

        assert!(cache.matches("example.com", 443));
        assert!(cache.matches("example.com", 80)); // http default port upgrade
        assert!(cache.matches("www.example.com", 443));
        assert!(!cache.matches("notexample.com", 443));

        let no_subs = HstsCache::new();
        no_subs.add("example.com", 443, 3600, false);
        assert!(!no_subs.matches("www.example.com", 443));
    }

    #[test]
    fn test_hsts_max_age_zero_removes() {
        let cache = HstsCache::new();
        cache.add("example.com", 443, 3600, false);
        assert!(cache.matches("example.com", 443));
        cache.add("example.com", 443, 0, false);
        assert!(!cache.matches("example.com", 443));
    }

    #[test]
    fn test_hsts_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hsts");

        let cache = HstsCache::new();
        cache.add("example.com", 443, 3600, true);
        cache.save(&path).unwrap();

        let restored = HstsCache::new();
        restored.load(&path).unwrap();
        assert!(restored.matches("sub.example.com", 443));
    }

    #[test]
    fn test_hpkp_requires_backup_pin() {
        let cache = HpkpCache::new();
        cache.add_from_header("example.com", "pin-sha256=\"abc\"; max-age=3600");
        assert!(cache.pins_for("example.com").is_none());

        cache.add_from_header(
            "example.com",
            "pin-sha256=\"abc\"; pin-sha256=\"def\"; max-age=3600",
        );
        assert_eq!(cache.pins_for("example.com").unwrap().len(), 2);
    }
}
