//! Runtime configuration.
//!
//! One plain struct built once at startup (CLI merged over rc file over
//! defaults) and passed by `Arc` to every subsystem. Nothing in here is
//! mutated after init; mutable global state lives in the engine instead.

use std::path::PathBuf;
use std::time::Duration;

/// How input files / seed documents are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForceMode {
    #[default]
    None,
    Html,
    Css,
    Sitemap,
    Atom,
    Rss,
    Metalink,
}

/// Filename sanitation modes (`--restrict-file-names`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestrictNames {
    pub windows: bool,
    pub nocontrol: bool,
    pub ascii: bool,
    pub lowercase: bool,
    pub uppercase: bool,
}

impl Default for RestrictNames {
    fn default() -> Self {
        Self {
            windows: cfg!(windows),
            nocontrol: false,
            ascii: false,
            lowercase: false,
            uppercase: false,
        }
    }
}

/// Which regex engine `--accept-regex`/`--reject-regex` were written for.
/// Both map onto the `regex` crate; the flag is kept for CLI compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegexType {
    #[default]
    Posix,
    Pcre,
}

/// Output format for `--stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatsFormat {
    #[default]
    Human,
    Json,
    Csv,
}

#[derive(Debug, Clone)]
pub struct Config {
    // Input
    pub urls: Vec<String>,
    pub input_file: Option<String>,
    pub force_mode: ForceMode,
    pub base: Option<String>,

    // Recursion
    pub recursive: bool,
    pub level: u32, // 0 = unlimited
    pub page_requisites: bool,
    pub parent: bool, // false => --no-parent
    pub span_hosts: bool,
    pub domains: Vec<String>,
    pub exclude_domains: Vec<String>,
    pub robots: bool,

    // Acceptance
    pub accept_patterns: Vec<String>,
    pub reject_patterns: Vec<String>,
    pub accept_regex: Option<String>,
    pub reject_regex: Option<String>,
    pub regex_type: RegexType,
    pub ignore_case: bool,
    pub filter_urls: bool, // apply patterns at admission instead of pre-save

    // Output layout
    pub output_document: Option<String>,
    pub directory_prefix: PathBuf,
    pub directories: bool,
    pub force_directories: bool,
    pub host_directories: bool,
    pub protocol_directories: bool,
    pub cut_directories: u32,
    pub cut_file_get_vars: bool,
    pub default_page: String,
    pub restrict_file_names: RestrictNames,

    // Save policy
    pub clobber: bool,
    pub backups: u32,
    pub timestamping: bool,
    pub continue_download: bool,
    pub delete_after: bool,
    pub adjust_extension: bool,
    pub content_disposition: bool,
    pub trust_server_names: bool,
    pub content_on_error: bool,
    pub save_headers: bool,
    pub use_server_timestamps: bool,
    pub xattr: bool,

    // Timing / retry
    pub wait: Option<Duration>,
    pub random_wait: bool,
    pub waitretry: Duration,
    pub tries: u32,
    pub timeout: Duration,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,

    // HTTP
    pub user_agent: String,
    pub headers: Vec<(String, String)>,
    pub referer: Option<String>,
    pub http_username: Option<String>,
    pub http_password: Option<String>,
    pub http_proxy_username: Option<String>,
    pub http_proxy_password: Option<String>,
    pub post_data: Option<String>,
    pub post_file: Option<String>,
    pub cookies: bool,
    pub load_cookies: Option<PathBuf>,
    pub keep_alive: bool,
    pub cache: bool,

    // HTTPS
    pub check_certificate: bool,
    pub https_only: bool,
    pub hsts: bool,
    pub hsts_file: Option<PathBuf>,
    pub hpkp: bool,
    pub hpkp_file: Option<PathBuf>,

    // Engine
    pub max_threads: usize,
    pub max_redirect: u32,
    pub http2_request_window: usize,
    pub quota: u64, // 0 = unlimited
    pub max_memory: u64,
    pub chunk_size: u64, // 0 = off
    pub metalink: bool,
    pub spider: bool,
    pub convert_links: bool,
    pub backup_converted: bool,

    // Stats
    pub stats: bool,
    pub stats_format: StatsFormat,
    pub stats_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            input_file: None,
            force_mode: ForceMode::None,
            base: None,

            recursive: false,
            level: 5,
            page_requisites: false,
            parent: true,
            span_hosts: false,
            domains: Vec::new(),
            exclude_domains: Vec::new(),
            robots: true,

            accept_patterns: Vec::new(),
            reject_patterns: Vec::new(),
            accept_regex: None,
            reject_regex: None,
            regex_type: RegexType::default(),
            ignore_case: false,
            filter_urls: false,

            output_document: None,
            directory_prefix: PathBuf::from("."),
            directories: true,
            force_directories: false,
            host_directories: true,
            protocol_directories: false,
            cut_directories: 0,
            cut_file_get_vars: false,
            default_page: "index.html".to_string(),
            restrict_file_names: RestrictNames::default(),

            clobber: true,
            backups: 0,
            timestamping: false,
            continue_download: false,
            delete_after: false,
            adjust_extension: false,
            content_disposition: false,
            trust_server_names: false,
            content_on_error: false,
            save_headers: false,
            use_server_timestamps: true,
            xattr: false,

            wait: None,
            random_wait: false,
            waitretry: Duration::from_secs(10),
            tries: 20,
            timeout: Duration::from_secs(900),
            connect_timeout: None,
            read_timeout: None,

            user_agent: concat!("webgrab/", env!("CARGO_PKG_VERSION")).to_string(),
            headers: Vec::new(),
            referer: None,
            http_username: None,
            http_password: None,
            http_proxy_username: None,
            http_proxy_password: None,
            post_data: None,
            post_file: None,
            cookies: true,
            load_cookies: None,
            keep_alive: true,
            cache: true,

            check_certificate: true,
            https_only: false,
            hsts: true,
            hsts_file: None,
            hpkp: true,
            hpkp_file: None,

            max_threads: 5,
            max_redirect: 20,
            http2_request_window: 30,
            quota: 0,
            max_memory: 10 * 1024 * 1024,
            chunk_size: 0,
            metalink: false,
            spider: false,
            convert_links: false,
            backup_converted: false,

            stats: false,
            stats_format: StatsFormat::default(),
            stats_file: None,
        }
    }
}

impl Config {
    /// Whether any accept/reject pattern or regex is configured.
    pub fn has_patterns(&self) -> bool {
        !self.accept_patterns.is_empty()
            || !self.reject_patterns.is_empty()
            || self.accept_regex.is_some()
            || self.reject_regex.is_some()
    }

    /// Whether children of a document at `level` may still be queued,
    /// honoring the page-requisites extra hop.
    pub fn depth_allows(&self, level: u32) -> bool {
        self.level == 0 || level < self.level + u32::from(self.page_requisites)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.max_threads, 5);
        assert_eq!(config.tries, 20);
        assert_eq!(config.max_redirect, 20);
        assert_eq!(config.level, 5);
        assert!(config.robots);
        assert!(config.clobber);
        assert_eq!(config.max_memory, 10 * 1024 * 1024);
    }

    #[test]
    fn test_depth_allows() {
        let mut config = Config::default();
        config.level = 2;
        assert!(config.depth_allows(0));
        assert!(config.depth_allows(1));
        assert!(!config.depth_allows(2));

        config.page_requisites = true;
        assert!(config.depth_allows(2));
        assert!(!config.depth_allows(3));

        config.level = 0;
        assert!(config.depth_allows(10_000));
    }
}
