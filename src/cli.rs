//! Command line surface.
//!
//! Options merge over the rc file, which merges over built-in defaults.
//! Multi-letter "short" options from the classic tool (`-np`, `-nd`, `-nH`)
//! are carried as long aliases.

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{Config, ForceMode, RegexType, RestrictNames, StatsFormat};
use crate::error::GrabError;
use crate::rcfile;

#[derive(Parser, Debug)]
#[command(name = "webgrab")]
#[command(about = "Recursive, concurrent web retriever")]
#[command(version)]
pub struct Cli {
    /// Seed URLs
    #[arg(value_name = "URL")]
    pub urls: Vec<String>,

    /// Read URLs from FILE ('-' for stdin)
    #[arg(short = 'i', long, value_name = "FILE")]
    pub input_file: Option<String>,

    /// Base URL for relative input URLs
    #[arg(short = 'B', long, value_name = "URL")]
    pub base: Option<String>,

    /// Treat input file as HTML
    #[arg(long)]
    pub force_html: bool,

    /// Treat input file as CSS
    #[arg(long)]
    pub force_css: bool,

    /// Treat input file as a sitemap
    #[arg(long)]
    pub force_sitemap: bool,

    /// Treat input file as an Atom feed
    #[arg(long)]
    pub force_atom: bool,

    /// Treat input file as an RSS feed
    #[arg(long)]
    pub force_rss: bool,

    /// Treat input file as a Metalink description
    #[arg(long)]
    pub force_metalink: bool,

    // Recursion
    /// Recursive retrieval
    #[arg(short = 'r', long)]
    pub recursive: bool,

    /// Maximum recursion depth (0 = unlimited)
    #[arg(short = 'l', long, value_name = "N")]
    pub level: Option<u32>,

    /// Also fetch inline page requisites (images, CSS, scripts)
    #[arg(short = 'p', long)]
    pub page_requisites: bool,

    /// Never ascend above the seed directory
    #[arg(long, alias = "np")]
    pub no_parent: bool,

    /// Follow links onto other hosts
    #[arg(short = 'H', long)]
    pub span_hosts: bool,

    /// Comma-separated list of accepted domains
    #[arg(short = 'D', long, value_name = "LIST", value_delimiter = ',')]
    pub domains: Vec<String>,

    /// Comma-separated list of rejected domains
    #[arg(long, value_name = "LIST", value_delimiter = ',')]
    pub exclude_domains: Vec<String>,

    /// Ignore robots.txt and robots meta tags
    #[arg(long)]
    pub no_robots: bool,

    /// Shortcut for -r -N -l0: mirror the site
    #[arg(short = 'm', long)]
    pub mirror: bool,

    // Acceptance
    /// Comma-separated accepted name patterns
    #[arg(short = 'A', long, value_name = "LIST", value_delimiter = ',')]
    pub accept: Vec<String>,

    /// Comma-separated rejected name patterns
    #[arg(short = 'R', long, value_name = "LIST", value_delimiter = ',')]
    pub reject: Vec<String>,

    /// Regex for accepted URLs
    #[arg(long, value_name = "REGEX")]
    pub accept_regex: Option<String>,

    /// Regex for rejected URLs
    #[arg(long, value_name = "REGEX")]
    pub reject_regex: Option<String>,

    /// Regex flavor the patterns were written for (posix|pcre)
    #[arg(long, value_name = "TYPE")]
    pub regex_type: Option<String>,

    /// Case-insensitive pattern matching
    #[arg(long)]
    pub ignore_case: bool,

    /// Apply accept/reject filters at admission instead of before saving
    #[arg(long)]
    pub filter_urls: bool,

    // Output
    /// Write all documents to FILE ('-' for stdout)
    #[arg(short = 'O', long, value_name = "FILE")]
    pub output_document: Option<String>,

    /// Directory prefix for saved files
    #[arg(short = 'P', long, value_name = "DIR")]
    pub directory_prefix: Option<PathBuf>,

    /// Do not create directories
    #[arg(long, alias = "nd")]
    pub no_directories: bool,

    /// Force directory creation even for single downloads
    #[arg(short = 'x', long)]
    pub force_directories: bool,

    /// Do not create host directories
    #[arg(long, alias = "nH")]
    pub no_host_directories: bool,

    /// Prepend protocol directories (http/, https/)
    #[arg(long)]
    pub protocol_directories: bool,

    /// Ignore N leading directory components of the remote path
    #[arg(long, value_name = "N")]
    pub cut_dirs: Option<u32>,

    /// Drop ?query from generated filenames
    #[arg(long)]
    pub cut_file_get_vars: bool,

    /// Filename for directory URLs
    #[arg(long, value_name = "NAME")]
    pub default_page: Option<String>,

    /// Filename sanitation: unix,windows,nocontrol,ascii,lowercase,uppercase
    #[arg(long, value_name = "MODES", value_delimiter = ',')]
    pub restrict_file_names: Vec<String>,

    // Save policy
    /// Refuse to overwrite existing files
    #[arg(long, alias = "nc")]
    pub no_clobber: bool,

    /// Keep N rotated backups (file.1 .. file.N)
    #[arg(long, value_name = "N")]
    pub backups: Option<u32>,

    /// Only fetch files newer than the local copy
    #[arg(short = 'N', long)]
    pub timestamping: bool,

    /// Resume partially downloaded files
    #[arg(short = 'c', long = "continue")]
    pub continue_download: bool,

    /// Delete every file after download (link scan only)
    #[arg(long)]
    pub delete_after: bool,

    /// Append .html/.css to matching content types
    #[arg(short = 'E', long)]
    pub adjust_extension: bool,

    /// Honor Content-Disposition filenames
    #[arg(long)]
    pub content_disposition: bool,

    /// On redirect, name the file after the final URL
    #[arg(long)]
    pub trust_server_names: bool,

    /// Save bodies of error responses too
    #[arg(long)]
    pub content_on_error: bool,

    /// Prepend the response header block to saved files
    #[arg(long)]
    pub save_headers: bool,

    /// Do not set file mtimes from Last-Modified
    #[arg(long)]
    pub no_use_server_timestamps: bool,

    /// Store origin metadata in extended attributes
    #[arg(long)]
    pub xattr: bool,

    // Timing
    /// Seconds to wait between requests to one host
    #[arg(short = 'w', long, value_name = "SECS")]
    pub wait: Option<f64>,

    /// Randomize the wait to 0.5-1.5x
    #[arg(long)]
    pub random_wait: bool,

    /// Cap on the retry backoff, seconds
    #[arg(long, value_name = "SECS")]
    pub waitretry: Option<f64>,

    /// Retries per host before giving up
    #[arg(short = 't', long, value_name = "N")]
    pub tries: Option<u32>,

    /// Overall request timeout, seconds
    #[arg(short = 'T', long, value_name = "SECS")]
    pub timeout: Option<f64>,

    /// Connect timeout, seconds
    #[arg(long, value_name = "SECS")]
    pub connect_timeout: Option<f64>,

    /// Read timeout, seconds
    #[arg(long, value_name = "SECS")]
    pub read_timeout: Option<f64>,

    // HTTP
    /// Extra request header (NAME: VALUE), repeatable
    #[arg(long, value_name = "HEADER")]
    pub header: Vec<String>,

    /// User-Agent string
    #[arg(short = 'U', long, value_name = "AGENT")]
    pub user_agent: Option<String>,

    /// Username for HTTP authentication
    #[arg(long, value_name = "USER")]
    pub http_user: Option<String>,

    /// Password for HTTP authentication
    #[arg(long, value_name = "PASS")]
    pub http_password: Option<String>,

    /// Username for proxy authentication
    #[arg(long, value_name = "USER")]
    pub proxy_user: Option<String>,

    /// Password for proxy authentication
    #[arg(long, value_name = "PASS")]
    pub proxy_password: Option<String>,

    /// POST this string instead of GET
    #[arg(long, value_name = "DATA")]
    pub post_data: Option<String>,

    /// POST the contents of FILE
    #[arg(long, value_name = "FILE")]
    pub post_file: Option<String>,

    /// Referer header value
    #[arg(long, value_name = "URL")]
    pub referer: Option<String>,

    /// Disable cookies
    #[arg(long)]
    pub no_cookies: bool,

    /// Preload cookies from a Netscape-format file
    #[arg(long, value_name = "FILE")]
    pub load_cookies: Option<PathBuf>,

    /// Disable HTTP keep-alive
    #[arg(long)]
    pub no_keep_alive: bool,

    /// Send Pragma: no-cache
    #[arg(long)]
    pub no_cache: bool,

    // HTTPS
    /// Skip server certificate verification
    #[arg(long)]
    pub no_check_certificate: bool,

    /// Follow only https URLs
    #[arg(long)]
    pub https_only: bool,

    /// Disable the HSTS cache
    #[arg(long)]
    pub no_hsts: bool,

    /// HSTS cache file
    #[arg(long, value_name = "FILE")]
    pub hsts_file: Option<PathBuf>,

    /// Disable the HPKP cache
    #[arg(long)]
    pub no_hpkp: bool,

    /// HPKP cache file
    #[arg(long, value_name = "FILE")]
    pub hpkp_file: Option<PathBuf>,

    // Engine
    /// Maximum number of download workers
    #[arg(long, value_name = "N")]
    pub max_threads: Option<usize>,

    /// Maximum redirect chain length
    #[arg(long, value_name = "N")]
    pub max_redirect: Option<u32>,

    /// Requests multiplexed per HTTP/2 connection
    #[arg(long, value_name = "N")]
    pub http2_request_window: Option<usize>,

    /// Stop queuing once this many bytes were fetched (accepts k/m/g)
    #[arg(short = 'Q', long, value_name = "BYTES")]
    pub quota: Option<String>,

    /// In-memory body cap handed to parsers (accepts k/m/g)
    #[arg(long, value_name = "BYTES")]
    pub max_memory: Option<String>,

    /// Split large files into ranged chunks of this size (accepts k/m/g)
    #[arg(long, value_name = "BYTES")]
    pub chunk_size: Option<String>,

    /// Process Metalink descriptions (headers and bodies)
    #[arg(long)]
    pub metalink: bool,

    /// Check links without saving anything
    #[arg(long)]
    pub spider: bool,

    /// Rewrite saved documents to reference local files
    #[arg(short = 'k', long)]
    pub convert_links: bool,

    /// Keep .orig copies of rewritten documents
    #[arg(short = 'K', long)]
    pub backup_converted: bool,

    // Stats / config
    /// Print transfer statistics at exit
    #[arg(long)]
    pub stats: bool,

    /// Statistics format: human|json|csv
    #[arg(long, value_name = "FORMAT")]
    pub stats_format: Option<String>,

    /// Write statistics to FILE instead of the log
    #[arg(long, value_name = "FILE")]
    pub stats_file: Option<PathBuf>,

    /// Use this config file instead of ~/.webgrabrc
    #[arg(long, value_name = "FILE")]
    pub config_file: Option<String>,

    /// Skip config files entirely
    #[arg(long)]
    pub no_config: bool,

    /// Errors only
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Chattier progress output
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Debug output
    #[arg(short = 'd', long)]
    pub debug: bool,
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn verbosity(&self) -> crate::logging::Verbosity {
        if self.debug {
            crate::logging::Verbosity::Debug
        } else if self.verbose {
            crate::logging::Verbosity::Verbose
        } else if self.quiet {
            crate::logging::Verbosity::Quiet
        } else {
            crate::logging::Verbosity::Normal
        }
    }

    /// Merge defaults <- rc file <- CLI into the final Config.
    pub fn into_config(self) -> Result<Config, GrabError> {
        let mut config = Config::default();

        if !self.no_config {
            if let Some(path) = rcfile::default_path(self.config_file.as_deref()) {
                rcfile::load(&mut config, &path, self.config_file.is_some())?;
            }
        }

        config.force_mode = self.force_mode()?;
        config.urls = self.urls;
        config.input_file = self.input_file;
        config.base = self.base;

        if self.recursive {
            config.recursive = true;
        }
        if let Some(level) = self.level {
            config.level = level;
        }
        if self.page_requisites {
            config.page_requisites = true;
        }
        if self.no_parent {
            config.parent = false;
        }
        if self.span_hosts {
            config.span_hosts = true;
        }
        if !self.domains.is_empty() {
            config.domains = self.domains;
        }
        if !self.exclude_domains.is_empty() {
            config.exclude_domains = self.exclude_domains;
        }
        if self.no_robots {
            config.robots = false;
        }

        if !self.accept.is_empty() {
            config.accept_patterns = self.accept;
        }
        if !self.reject.is_empty() {
            config.reject_patterns = self.reject;
        }
        if self.accept_regex.is_some() {
            config.accept_regex = self.accept_regex;
        }
        if self.reject_regex.is_some() {
            config.reject_regex = self.reject_regex;
        }
        if let Some(kind) = self.regex_type.as_deref() {
            config.regex_type = match kind {
                "posix" => RegexType::Posix,
                "pcre" => RegexType::Pcre,
                other => {
                    return Err(GrabError::Init(format!("unknown regex type '{}'", other)))
                }
            };
        }
        if self.ignore_case {
            config.ignore_case = true;
        }
        if self.filter_urls {
            config.filter_urls = true;
        }

        config.output_document = self.output_document;
        if let Some(prefix) = self.directory_prefix {
            config.directory_prefix = prefix;
        }
        if self.no_directories {
            config.directories = false;
        }
        if self.force_directories {
            config.force_directories = true;
        }
        if self.no_host_directories {
            config.host_directories = false;
        }
        if self.protocol_directories {
            config.protocol_directories = true;
        }
        if let Some(n) = self.cut_dirs {
            config.cut_directories = n;
        }
        if self.cut_file_get_vars {
            config.cut_file_get_vars = true;
        }
        if let Some(page) = self.default_page {
            config.default_page = page;
        }
        if !self.restrict_file_names.is_empty() {
            config.restrict_file_names = parse_restrict(&self.restrict_file_names)?;
        }

        if self.no_clobber {
            config.clobber = false;
        }
        if let Some(n) = self.backups {
            config.backups = n;
        }
        if self.timestamping {
            config.timestamping = true;
        }
        if self.continue_download {
            config.continue_download = true;
        }
        if self.delete_after {
            config.delete_after = true;
        }
        if self.adjust_extension {
            config.adjust_extension = true;
        }
        if self.content_disposition {
            config.content_disposition = true;
        }
        if self.trust_server_names {
            config.trust_server_names = true;
        }
        if self.content_on_error {
            config.content_on_error = true;
        }
        if self.save_headers {
            config.save_headers = true;
        }
        if self.no_use_server_timestamps {
            config.use_server_timestamps = false;
        }
        if self.xattr {
            config.xattr = true;
        }

        if let Some(secs) = self.wait {
            config.wait = Some(Duration::from_secs_f64(secs));
        }
        if self.random_wait {
            config.random_wait = true;
        }
        if let Some(secs) = self.waitretry {
            config.waitretry = Duration::from_secs_f64(secs);
        }
        if let Some(tries) = self.tries {
            config.tries = tries;
        }
        if let Some(secs) = self.timeout {
            config.timeout = Duration::from_secs_f64(secs);
        }
        if let Some(secs) = self.connect_timeout {
            config.connect_timeout = Some(Duration::from_secs_f64(secs));
        }
        if let Some(secs) = self.read_timeout {
            config.read_timeout = Some(Duration::from_secs_f64(secs));
        }

        for header in self.header {
            let Some((name, value)) = header.split_once(':') else {
                return Err(GrabError::Init(format!("malformed header '{}'", header)));
            };
            config
                .headers
                .push((name.trim().to_string(), value.trim().to_string()));
        }
        if let Some(agent) = self.user_agent {
            config.user_agent = agent;
        }
        config.http_username = self.http_user.or(config.http_username.take());
        config.http_password = self.http_password.or(config.http_password.take());
        config.http_proxy_username = self.proxy_user.or(config.http_proxy_username.take());
        config.http_proxy_password = self.proxy_password.or(config.http_proxy_password.take());
        config.post_data = self.post_data;
        config.post_file = self.post_file;
        config.referer = self.referer;
        if self.no_cookies {
            config.cookies = false;
        }
        if self.load_cookies.is_some() {
            config.load_cookies = self.load_cookies;
        }
        if self.no_keep_alive {
            config.keep_alive = false;
        }
        if self.no_cache {
            config.cache = false;
        }

        if self.no_check_certificate {
            config.check_certificate = false;
        }
        if self.https_only {
            config.https_only = true;
        }
        if self.no_hsts {
            config.hsts = false;
        }
        if self.hsts_file.is_some() {
            config.hsts_file = self.hsts_file;
        }
        if self.no_hpkp {
            config.hpkp = false;
        }
        if self.hpkp_file.is_some() {
            config.hpkp_file = self.hpkp_file;
        }

        if let Some(n) = self.max_threads {
            config.max_threads = n.max(1);
        }
        if let Some(n) = self.max_redirect {
            config.max_redirect = n;
        }
        if let Some(n) = self.http2_request_window {
            config.http2_request_window = n.max(1);
        }
        if let Some(quota) = self.quota.as_deref() {
            config.quota = rcfile::parse_bytes(quota)
                .ok_or_else(|| GrabError::Init(format!("invalid quota '{}'", quota)))?;
        }
        if let Some(cap) = self.max_memory.as_deref() {
            config.max_memory = rcfile::parse_bytes(cap)
                .ok_or_else(|| GrabError::Init(format!("invalid max-memory '{}'", cap)))?;
        }
        if let Some(size) = self.chunk_size.as_deref() {
            config.chunk_size = rcfile::parse_bytes(size)
                .ok_or_else(|| GrabError::Init(format!("invalid chunk size '{}'", size)))?;
        }
        if self.metalink {
            config.metalink = true;
        }
        if self.spider {
            config.spider = true;
        }
        if self.convert_links {
            config.convert_links = true;
        }
        if self.backup_converted {
            config.backup_converted = true;
            config.convert_links = true;
        }

        if self.stats || self.stats_format.is_some() || self.stats_file.is_some() {
            config.stats = true;
        }
        if let Some(format) = self.stats_format.as_deref() {
            config.stats_format = match format {
                "human" => StatsFormat::Human,
                "json" => StatsFormat::Json,
                "csv" => StatsFormat::Csv,
                other => {
                    return Err(GrabError::Init(format!("unknown stats format '{}'", other)))
                }
            };
        }
        config.stats_file = self.stats_file;

        // --mirror expands to recursion without depth plus timestamping.
        if self.mirror {
            config.recursive = true;
            config.level = 0;
            config.timestamping = true;
        }

        Ok(config)
    }

    fn force_mode(&self) -> Result<ForceMode, GrabError> {
        let modes = [
            (self.force_html, ForceMode::Html),
            (self.force_css, ForceMode::Css),
            (self.force_sitemap, ForceMode::Sitemap),
            (self.force_atom, ForceMode::Atom),
            (self.force_rss, ForceMode::Rss),
            (self.force_metalink, ForceMode::Metalink),
        ];
        let mut selected = ForceMode::None;
        for (flag, mode) in modes {
            if flag {
                if selected != ForceMode::None {
                    return Err(GrabError::Init(
                        "only one --force-* mode may be given".to_string(),
                    ));
                }
                selected = mode;
            }
        }
        Ok(selected)
    }
}

fn parse_restrict(modes: &[String]) -> Result<RestrictNames, GrabError> {
    let mut out = RestrictNames {
        windows: false,
        nocontrol: false,
        ascii: false,
        lowercase: false,
        uppercase: false,
    };
    for mode in modes {
        match mode.as_str() {
            "unix" => out.windows = false,
            "windows" => out.windows = true,
            "nocontrol" => out.nocontrol = true,
            "ascii" => out.ascii = true,
            "lowercase" => out.lowercase = true,
            "uppercase" => out.uppercase = true,
            other => {
                return Err(GrabError::Init(format!(
                    "unknown restrict-file-names mode '{}'",
                    other
                )))
            }
        }
    }
    Ok(out)
}
