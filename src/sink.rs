//! Response body sink: one header-time decision, then chunk writes, then a
//! finalizer.
//!
//! The sink owns the disk writer and the bounded in-memory copy handed to
//! the parsers. Opening applies the whole save policy: spider/quota/pattern
//! suppression, backups, clobber rules, unique suffixes, directory
//! creation. Part jobs bypass most of it and write straight to their byte
//! offset in the shared output file.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;

use crate::config::Config;
use crate::error::{ExitCode, ExitStatus};
use crate::filters::Filters;
use crate::fname;
use crate::job::Job;
use crate::stats::Stats;

/// Response facts the sink needs at open time.
#[derive(Debug, Clone, Default)]
pub struct ResponseMeta {
    pub status: u16,
    pub content_type: Option<String>,
    pub content_length: Option<u64>,
    /// Filename from Content-Disposition, when the server sent one.
    pub disposition_filename: Option<String>,
    pub last_modified: Option<SystemTime>,
    /// Raw header block, only kept when --save-headers is on.
    pub header_text: Option<String>,
}

/// Why the sink declined to open a file. The body is still buffered in
/// memory (subject to the cap) so parsing can proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoSave {
    Spider,
    NoFilename,
    Quota,
    Pattern,
    Status,
    AlreadyThere,
    IsDirectory,
}

enum Output {
    File { file: std::fs::File, path: PathBuf },
    Stdout,
    Discard(NoSave),
}

pub struct BodySink {
    output: Output,
    memory: Vec<u8>,
    max_memory: u64,
    length: u64,
    last_modified: Option<SystemTime>,
    content_type: Option<String>,
    stats: Arc<Stats>,
    exit_status: Arc<ExitStatus>,
}

/// Everything `open` consults beyond the response itself.
pub struct SinkContext<'a> {
    pub config: &'a Config,
    pub filters: &'a Filters,
    pub stats: &'a Arc<Stats>,
    pub exit_status: &'a Arc<ExitStatus>,
    /// Serializes the check-rotate-open section across workers.
    pub save_lock: &'a Mutex<()>,
}

impl BodySink {
    /// Header-time decision: where (and whether) the body goes.
    pub fn open(ctx: &SinkContext<'_>, job: &Job, meta: &ResponseMeta) -> std::io::Result<Self> {
        let max_memory = if job.is_part() { 0 } else { ctx.config.max_memory };

        let mut sink = Self {
            output: Output::Discard(NoSave::NoFilename),
            memory: Vec::new(),
            max_memory,
            length: 0,
            last_modified: meta.last_modified,
            content_type: meta.content_type.clone(),
            stats: Arc::clone(ctx.stats),
            exit_status: Arc::clone(ctx.exit_status),
        };

        // Part jobs write into the shared output at their offset.
        if let Some(part) = job.part() {
            let parts = job.parts.as_ref().expect("part job has part set");
            let _guard = ctx.save_lock.lock();
            fname::mkdir_path(&parts.output)?;
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .open(&parts.output)?;
            file.seek(SeekFrom::Start(part.position))?;
            sink.output = Output::File {
                file,
                path: parts.output.clone(),
            };
            return Ok(sink);
        }

        if job.head_first {
            return Ok(sink);
        }

        // Metalink descriptions are parsed, never saved.
        if ctx.config.metalink {
            if let Some(ct) = meta.content_type.as_deref() {
                if crate::parsers::classify(ct, false) == crate::parsers::ContentKind::Metalink {
                    return Ok(sink);
                }
            }
        }

        if ctx.config.spider {
            sink.output = Output::Discard(NoSave::Spider);
            return Ok(sink);
        }

        let save_worthy =
            meta.status == 200 || meta.status == 206 || ctx.config.content_on_error;
        if !save_worthy {
            sink.output = Output::Discard(NoSave::Status);
            return Ok(sink);
        }

        // Destination: -O, Content-Disposition, or the derived filename.
        let to_output_doc = ctx.config.output_document.is_some();
        let dest: Option<PathBuf> = if let Some(out) = &ctx.config.output_document {
            if out == "-" {
                sink.output = Output::Stdout;
                return Ok(sink);
            }
            Some(PathBuf::from(out))
        } else if ctx.config.content_disposition {
            meta.disposition_filename
                .as_deref()
                .map(|n| {
                    ctx.config.directory_prefix.join(fname::restrict_file_name(
                        n,
                        &ctx.config.restrict_file_names,
                    ))
                })
                .or_else(|| job.local_path.clone())
        } else {
            job.local_path.clone()
        };

        let Some(mut dest) = dest else {
            sink.output = Output::Discard(NoSave::NoFilename);
            return Ok(sink);
        };

        if dest.to_string_lossy().ends_with('/') {
            sink.output = Output::Discard(NoSave::IsDirectory);
            return Ok(sink);
        }

        // Optimistic quota check; in-flight bytes may still push past it.
        if ctx.config.quota > 0 && ctx.stats.bytes() >= ctx.config.quota {
            tracing::debug!("not saving '{}' (quota reached)", dest.display());
            sink.output = Output::Discard(NoSave::Quota);
            return Ok(sink);
        }

        if ctx.config.adjust_extension {
            if let Some(ext) = extension_for(meta.content_type.as_deref()) {
                if !dest
                    .to_string_lossy()
                    .to_lowercase()
                    .ends_with(ext)
                {
                    let mut os = dest.into_os_string();
                    os.push(ext);
                    dest = PathBuf::from(os);
                }
            }
        }

        // Pre-save pattern filters (unless a plugin force-accepted the URL).
        if !job.ignore_patterns && !ctx.filters.is_empty() {
            let name = dest.to_string_lossy();
            if ctx.filters.rejects(&name) {
                tracing::debug!("not saving '{}' (pattern filter)", name);
                sink.output = Output::Discard(NoSave::Pattern);
                return Ok(sink);
            }
        }

        // Serialized section: rotate backups, create directories, open.
        let _guard = ctx.save_lock.lock();

        let append = meta.status == 206 || to_output_doc;
        let mut opts = OpenOptions::new();
        opts.write(true).create(true);
        let mut multiple = false;

        if append {
            // -O concatenates every document into the one file.
            opts.append(true);
        } else if ctx.config.timestamping {
            opts.truncate(true);
        } else if !ctx.config.clobber
            || (ctx.config.recursive && ctx.config.directories)
        {
            if ctx.config.recursive && ctx.config.directories {
                opts.truncate(true);
            } else {
                opts.create_new(true); // refuse to overwrite
            }
        } else {
            // Default single-file mode: keep existing files, write name.N.
            opts.create_new(true);
            multiple = true;
            if ctx.config.backups > 0 {
                fname::rotate_backups(&dest, ctx.config.backups);
            }
        }

        fname::mkdir_path(&dest)?;

        match fname::open_unique(&dest, &opts, multiple) {
            Ok((mut file, path)) => {
                tracing::info!("saving '{}'", path.display());
                if ctx.config.save_headers {
                    if let Some(header) = &meta.header_text {
                        file.write_all(header.as_bytes())?;
                    }
                }
                sink.output = Output::File { file, path };
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::info!("file '{}' already there; not retrieving", dest.display());
                sink.output = Output::Discard(NoSave::AlreadyThere);
            }
            Err(e) if e.kind() == std::io::ErrorKind::IsADirectory => {
                tracing::info!(
                    "directory / file name clash - not saving '{}'",
                    dest.display()
                );
                sink.output = Output::Discard(NoSave::IsDirectory);
            }
            Err(e) => {
                ctx.exit_status.report(ExitCode::Io);
                return Err(e);
            }
        }

        Ok(sink)
    }

    /// Append one body chunk: disk first, then the capped memory copy.
    pub fn write_chunk(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.length += data.len() as u64;
        self.stats.add_bytes(data.len() as u64);

        match &mut self.output {
            Output::File { file, .. } => {
                if let Err(e) = write_all_retry(file, data) {
                    self.exit_status.report(ExitCode::Io);
                    return Err(e);
                }
            }
            Output::Stdout => {
                if let Err(e) = std::io::stdout().lock().write_all(data) {
                    self.exit_status.report(ExitCode::Io);
                    return Err(e);
                }
            }
            Output::Discard(_) => {}
        }

        // Cap 0 disables buffering entirely (part jobs).
        if self.max_memory > 0 && (self.memory.len() as u64) < self.max_memory {
            let room = (self.max_memory as usize).saturating_sub(self.memory.len());
            self.memory.extend_from_slice(&data[..data.len().min(room)]);
        }

        Ok(())
    }

    pub fn saved_path(&self) -> Option<&Path> {
        match &self.output {
            Output::File { path, .. } => Some(path),
            Output::Stdout | Output::Discard(_) => None,
        }
    }

    pub fn no_save_reason(&self) -> Option<NoSave> {
        match &self.output {
            Output::File { .. } | Output::Stdout => None,
            Output::Discard(reason) => Some(*reason),
        }
    }

    /// Close the sink: flush, stamp the server mtime, write xattrs.
    pub fn finish(self, config: &Config, job: &Job) -> FinishedBody {
        let mut saved_path = None;

        if let Output::Stdout = &self.output {
            let _ = std::io::stdout().lock().flush();
        }

        if let Output::File { mut file, path } = self.output {
            if let Err(e) = file.flush() {
                tracing::error!("flush failed for {}: {}", path.display(), e);
                self.exit_status.report(ExitCode::Io);
            }

            if config.use_server_timestamps {
                if let Some(mtime) = self.last_modified {
                    if let Err(e) = file.set_modified(mtime) {
                        tracing::debug!("failed to set mtime on {}: {}", path.display(), e);
                    }
                }
            }

            #[cfg(unix)]
            if config.xattr {
                write_xattrs(&path, job, self.content_type.as_deref());
            }

            saved_path = Some(path);
        }

        FinishedBody {
            path: saved_path,
            body: self.memory,
            length: self.length,
        }
    }
}

/// The sink's final product: where the body landed and the in-memory copy
/// for the parsers (possibly truncated at the cap).
#[derive(Debug)]
pub struct FinishedBody {
    pub path: Option<PathBuf>,
    pub body: Vec<u8>,
    pub length: u64,
}

/// Write with a bounded retry on EAGAIN-style errors: wait up to one second
/// for writability, then give up.
fn write_all_retry(file: &mut std::fs::File, data: &[u8]) -> std::io::Result<()> {
    match file.write_all(data) {
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
            std::thread::sleep(Duration::from_millis(1000));
            file.write_all(data)
        }
        other => other,
    }
}

fn extension_for(content_type: Option<&str>) -> Option<&'static str> {
    match content_type.map(crate::parsers::normalize_content_type)?.as_str() {
        "text/html" | "application/xhtml+xml" => Some(".html"),
        "text/css" => Some(".css"),
        "application/atom+xml" => Some(".atom"),
        "application/rss+xml" => Some(".rss"),
        _ => None,
    }
}

#[cfg(unix)]
fn write_xattrs(path: &Path, job: &Job, content_type: Option<&str>) {
    let set = |name: &str, value: Option<&str>| {
        if let Some(value) = value {
            if let Err(e) = xattr::set(path, name, value.as_bytes()) {
                tracing::debug!("failed to set xattr {} on {}: {}", name, path.display(), e);
            }
        }
    };

    let mime = content_type.map(crate::parsers::normalize_content_type);
    let charset = content_type.and_then(|ct| {
        ct.split(';').find_map(|p| {
            p.trim()
                .strip_prefix("charset=")
                .map(|c| c.trim_matches('"').to_string())
        })
    });

    set("user.xdg.origin.url", Some(job.url.as_str()));
    set(
        "user.xdg.referrer.url",
        job.referer.as_ref().map(|u| u.as_str()),
    );
    set("user.mime_type", mime.as_deref());
    set("user.charset", charset.as_deref());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostKey;
    use url::Url;

    fn context_in(dir: &Path) -> (Config, Filters, Arc<Stats>, Arc<ExitStatus>, Mutex<()>) {
        let mut config = Config::default();
        config.recursive = true;
        config.directory_prefix = dir.to_path_buf();
        let filters = Filters::from_config(&config).unwrap();
        (
            config,
            filters,
            Arc::new(Stats::new()),
            Arc::new(ExitStatus::new()),
            Mutex::new(()),
        )
    }

    fn job_with_path(dir: &Path, url: &str) -> Job {
        let url = Url::parse(url).unwrap();
        let host = HostKey::from_url(&url).unwrap();
        let mut job = Job::new(url.clone(), host);
        let mut config = Config::default();
        config.recursive = true;
        config.directory_prefix = dir.to_path_buf();
        job.local_path = fname::local_filename(&config, &url);
        job
    }

    fn meta_200() -> ResponseMeta {
        ResponseMeta {
            status: 200,
            ..ResponseMeta::default()
        }
    }

    #[test]
    fn test_writes_body_and_buffers_memory() {
        let dir = tempfile::tempdir().unwrap();
        let (config, filters, stats, exit_status, lock) = context_in(dir.path());
        let ctx = SinkContext {
            config: &config,
            filters: &filters,
            stats: &stats,
            exit_status: &exit_status,
            save_lock: &lock,
        };
        let job = job_with_path(dir.path(), "http://test.local/file.txt");

        let mut sink = BodySink::open(&ctx, &job, &meta_200()).unwrap();
        sink.write_chunk(b"hello ").unwrap();
        sink.write_chunk(b"world").unwrap();
        let finished = sink.finish(&config, &job);

        assert_eq!(finished.length, 11);
        assert_eq!(finished.body, b"hello world");
        let path = finished.path.unwrap();
        assert_eq!(std::fs::read(path).unwrap(), b"hello world");
        assert_eq!(stats.bytes(), 11);
    }

    #[test]
    fn test_memory_cap_truncates_buffer_not_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut config, filters, stats, exit_status, lock) = context_in(dir.path());
        config.max_memory = 4;
        let ctx = SinkContext {
            config: &config,
            filters: &filters,
            stats: &stats,
            exit_status: &exit_status,
            save_lock: &lock,
        };
        let job = job_with_path(dir.path(), "http://test.local/big.bin");

        let mut sink = BodySink::open(&ctx, &job, &meta_200()).unwrap();
        sink.write_chunk(b"0123456789").unwrap();
        let finished = sink.finish(&config, &job);

        assert_eq!(finished.body, b"0123");
        assert_eq!(finished.length, 10);
        assert_eq!(std::fs::read(finished.path.unwrap()).unwrap(), b"0123456789");
    }

    #[test]
    fn test_spider_discards() {
        let dir = tempfile::tempdir().unwrap();
        let (mut config, filters, stats, exit_status, lock) = context_in(dir.path());
        config.spider = true;
        let ctx = SinkContext {
            config: &config,
            filters: &filters,
            stats: &stats,
            exit_status: &exit_status,
            save_lock: &lock,
        };
        let job = job_with_path(dir.path(), "http://test.local/x");

        let sink = BodySink::open(&ctx, &job, &meta_200()).unwrap();
        assert_eq!(sink.no_save_reason(), Some(NoSave::Spider));
    }

    #[test]
    fn test_no_clobber_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let (mut config, filters, stats, exit_status, lock) = context_in(dir.path());
        config.recursive = false;
        config.clobber = false;
        let ctx = SinkContext {
            config: &config,
            filters: &filters,
            stats: &stats,
            exit_status: &exit_status,
            save_lock: &lock,
        };

        let mut job = job_with_path(dir.path(), "http://test.local/f.txt");
        let dest = dir.path().join("f.txt");
        job.local_path = Some(dest.clone());
        std::fs::write(&dest, b"keep me").unwrap();

        let sink = BodySink::open(&ctx, &job, &meta_200()).unwrap();
        assert_eq!(sink.no_save_reason(), Some(NoSave::AlreadyThere));
        assert_eq!(std::fs::read(&dest).unwrap(), b"keep me");
    }

    #[test]
    fn test_part_writes_at_offset() {
        let dir = tempfile::tempdir().unwrap();
        let (config, filters, stats, exit_status, lock) = context_in(dir.path());
        let ctx = SinkContext {
            config: &config,
            filters: &filters,
            stats: &stats,
            exit_status: &exit_status,
            save_lock: &lock,
        };

        let url = Url::parse("http://test.local/big").unwrap();
        let host = HostKey::from_url(&url).unwrap();
        let mut job = Job::new(url.clone(), host);
        let metalink = crate::metalink::Metalink::synthetic(url, "big", 8, 4);
        let output = dir.path().join("big");
        job.parts = Some(Arc::new(crate::job::PartSet::new(
            metalink,
            output.clone(),
            &[],
        )));
        job.part_id = Some(1);

        let mut sink = BodySink::open(&ctx, &job, &meta_200()).unwrap();
        sink.write_chunk(b"WXYZ").unwrap();
        let finished = sink.finish(&config, &job);

        // Memory stays empty for parts; bytes land at offset 4.
        assert!(finished.body.is_empty());
        let data = std::fs::read(&output).unwrap();
        assert_eq!(&data[4..8], b"WXYZ");
    }

    #[test]
    fn test_pattern_discard_still_buffers() {
        let dir = tempfile::tempdir().unwrap();
        let (mut config, _, stats, exit_status, lock) = context_in(dir.path());
        config.reject_patterns = vec!["*.txt".to_string()];
        let filters = Filters::from_config(&config).unwrap();
        let ctx = SinkContext {
            config: &config,
            filters: &filters,
            stats: &stats,
            exit_status: &exit_status,
            save_lock: &lock,
        };
        let job = job_with_path(dir.path(), "http://test.local/f.txt");

        let mut sink = BodySink::open(&ctx, &job, &meta_200()).unwrap();
        assert_eq!(sink.no_save_reason(), Some(NoSave::Pattern));
        sink.write_chunk(b"parse me anyway").unwrap();
        let finished = sink.finish(&config, &job);
        assert!(finished.path.is_none());
        assert_eq!(finished.body, b"parse me anyway");
    }
}
