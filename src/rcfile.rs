//! Startup configuration files (`~/.webgrabrc`).
//!
//! `name = value` lines with `#` comments, single/double quoting, trailing
//! backslash continuation, and an `include FILE` directive. Include
//! recursion is capped at depth 20.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::Config;
use crate::error::GrabError;

const MAX_INCLUDE_DEPTH: usize = 20;

/// Resolve which rc file to read: --config-file, $WEBGRABRC, ~/.webgrabrc.
pub fn default_path(explicit: Option<&str>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(PathBuf::from(path));
    }
    if let Ok(path) = std::env::var("WEBGRABRC") {
        if !path.is_empty() {
            return Some(PathBuf::from(path));
        }
    }
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".webgrabrc"))
}

/// Read an rc file (a missing default file is fine) and apply its
/// directives onto the config.
pub fn load(config: &mut Config, path: &Path, required: bool) -> Result<(), GrabError> {
    let mut seen = Vec::new();
    match read_directives(path, 0, &mut seen) {
        Ok(directives) => {
            for (key, value) in directives {
                apply(config, &key, &value)?;
            }
            Ok(())
        }
        Err(GrabError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound && !required => Ok(()),
        Err(e) => Err(e),
    }
}

fn read_directives(
    path: &Path,
    depth: usize,
    seen: &mut Vec<PathBuf>,
) -> Result<Vec<(String, String)>, GrabError> {
    if depth >= MAX_INCLUDE_DEPTH {
        return Err(GrabError::Config(format!(
            "include recursion deeper than {} at {}",
            MAX_INCLUDE_DEPTH,
            path.display()
        )));
    }
    if seen.iter().any(|p| p == path) {
        return Err(GrabError::Config(format!(
            "config file loop through {}",
            path.display()
        )));
    }
    seen.push(path.to_path_buf());

    let data = std::fs::read_to_string(path)?;
    let mut directives = Vec::new();

    for raw in logical_lines(&data) {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if let Some(rest) = line.strip_prefix("include ") {
            let target = unquote(rest.trim());
            let target_path = if Path::new(&target).is_absolute() {
                PathBuf::from(&target)
            } else {
                path.parent().unwrap_or(Path::new(".")).join(&target)
            };
            directives.extend(read_directives(&target_path, depth + 1, seen)?);
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            return Err(GrabError::Config(format!(
                "malformed line in {}: '{}'",
                path.display(),
                line
            )));
        };
        directives.push((
            key.trim().to_lowercase().replace('_', "-"),
            unquote(value.trim()),
        ));
    }

    Ok(directives)
}

/// Join physical lines continued with a trailing backslash.
fn logical_lines(data: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();

    for line in data.lines() {
        if let Some(stripped) = line.strip_suffix('\\') {
            current.push_str(stripped);
        } else {
            current.push_str(line);
            out.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

fn unquote(value: &str) -> String {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return value[1..value.len() - 1].to_string();
        }
    }
    value.to_string()
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "on" | "yes" | "true" | "1")
}

fn parse_secs(value: &str) -> Option<Duration> {
    value.parse::<f64>().ok().map(Duration::from_secs_f64)
}

/// Apply one `key = value` directive. Unknown keys are an error, matching
/// the strictness of CLI parsing.
fn apply(config: &mut Config, key: &str, value: &str) -> Result<(), GrabError> {
    match key {
        "recursive" => config.recursive = parse_bool(value),
        "level" | "reclevel" => config.level = value.parse().unwrap_or(config.level),
        "page-requisites" => config.page_requisites = parse_bool(value),
        "no-parent" => config.parent = !parse_bool(value),
        "span-hosts" => config.span_hosts = parse_bool(value),
        "domains" => config.domains = split_list(value),
        "exclude-domains" => config.exclude_domains = split_list(value),
        "robots" => config.robots = parse_bool(value),
        "accept" => config.accept_patterns = split_list(value),
        "reject" => config.reject_patterns = split_list(value),
        "accept-regex" => config.accept_regex = Some(value.to_string()),
        "reject-regex" => config.reject_regex = Some(value.to_string()),
        "ignore-case" => config.ignore_case = parse_bool(value),
        "filter-urls" => config.filter_urls = parse_bool(value),
        "directory-prefix" => config.directory_prefix = PathBuf::from(value),
        "default-page" => config.default_page = value.to_string(),
        "cut-dirs" => config.cut_directories = value.parse().unwrap_or(0),
        "timestamping" => config.timestamping = parse_bool(value),
        "clobber" => config.clobber = parse_bool(value),
        "backups" => config.backups = value.parse().unwrap_or(0),
        "continue" => config.continue_download = parse_bool(value),
        "user-agent" => config.user_agent = value.to_string(),
        "wait" => config.wait = parse_secs(value),
        "random-wait" => config.random_wait = parse_bool(value),
        "waitretry" => {
            if let Some(d) = parse_secs(value) {
                config.waitretry = d;
            }
        }
        "tries" => config.tries = value.parse().unwrap_or(config.tries),
        "timeout" => {
            if let Some(d) = parse_secs(value) {
                config.timeout = d;
            }
        }
        "max-threads" => config.max_threads = value.parse().unwrap_or(config.max_threads),
        "max-redirect" => config.max_redirect = value.parse().unwrap_or(config.max_redirect),
        "quota" => config.quota = parse_bytes(value).unwrap_or(0),
        "chunk-size" => config.chunk_size = parse_bytes(value).unwrap_or(0),
        "max-memory" => config.max_memory = parse_bytes(value).unwrap_or(config.max_memory),
        "metalink" => config.metalink = parse_bool(value),
        "https-only" => config.https_only = parse_bool(value),
        "check-certificate" => config.check_certificate = parse_bool(value),
        "hsts" => config.hsts = parse_bool(value),
        "hsts-file" => config.hsts_file = Some(PathBuf::from(value)),
        "hpkp" => config.hpkp = parse_bool(value),
        "hpkp-file" => config.hpkp_file = Some(PathBuf::from(value)),
        "convert-links" => config.convert_links = parse_bool(value),
        "backup-converted" => config.backup_converted = parse_bool(value),
        "xattr" => config.xattr = parse_bool(value),
        "spider" => config.spider = parse_bool(value),
        _ => {
            return Err(GrabError::Config(format!("unknown option '{}'", key)));
        }
    }
    Ok(())
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// `1024`, `64k`, `10m`, `1g`.
pub fn parse_bytes(value: &str) -> Option<u64> {
    let value = value.trim().to_lowercase();
    let (digits, multiplier) = match value.chars().last()? {
        'k' => (&value[..value.len() - 1], 1024),
        'm' => (&value[..value.len() - 1], 1024 * 1024),
        'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value.as_str(), 1),
    };
    digits.trim().parse::<u64>().ok().map(|n| n * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_rc(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_basic_directives() {
        let dir = tempfile::tempdir().unwrap();
        let rc = write_rc(
            dir.path(),
            "rc",
            "# comment\n\
             recursive = on\n\
             level = 3\n\
             user_agent = \"quoted agent\"\n\
             tries=5\n",
        );

        let mut config = Config::default();
        load(&mut config, &rc, true).unwrap();
        assert!(config.recursive);
        assert_eq!(config.level, 3);
        assert_eq!(config.user_agent, "quoted agent");
        assert_eq!(config.tries, 5);
    }

    #[test]
    fn test_line_continuation() {
        let dir = tempfile::tempdir().unwrap();
        let rc = write_rc(dir.path(), "rc", "accept = *.html,\\\n*.css\n");

        let mut config = Config::default();
        load(&mut config, &rc, true).unwrap();
        assert_eq!(config.accept_patterns, vec!["*.html", "*.css"]);
    }

    #[test]
    fn test_include_directive() {
        let dir = tempfile::tempdir().unwrap();
        write_rc(dir.path(), "common", "wait = 2\n");
        let rc = write_rc(dir.path(), "rc", "include common\nlevel = 7\n");

        let mut config = Config::default();
        load(&mut config, &rc, true).unwrap();
        assert_eq!(config.wait, Some(Duration::from_secs(2)));
        assert_eq!(config.level, 7);
    }

    #[test]
    fn test_include_loop_detected() {
        let dir = tempfile::tempdir().unwrap();
        write_rc(dir.path(), "a", "include b\n");
        let rc = write_rc(dir.path(), "b", "include a\n");

        let mut config = Config::default();
        assert!(load(&mut config, &rc, true).is_err());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let rc = write_rc(dir.path(), "rc", "no-such-option = on\n");
        let mut config = Config::default();
        assert!(load(&mut config, &rc, true).is_err());
    }

    #[test]
    fn test_missing_default_file_ok() {
        let mut config = Config::default();
        assert!(load(&mut config, Path::new("/nonexistent/.webgrabrc"), false).is_ok());
    }

    #[test]
    fn test_parse_bytes() {
        assert_eq!(parse_bytes("1024"), Some(1024));
        assert_eq!(parse_bytes("64k"), Some(64 * 1024));
        assert_eq!(parse_bytes("10M"), Some(10 * 1024 * 1024));
        assert_eq!(parse_bytes("2g"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_bytes("junk"), None);
    }
}
