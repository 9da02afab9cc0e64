//! Response pipeline: status accounting, protocol-state updates, auth and
//! redirect follow-up, HEAD/part/full dispatch, and the parser fan-out that
//! feeds discovered URLs back into admission.

use std::path::PathBuf;
use std::sync::Arc;

use url::Url;

use crate::admission::{self, AdmitFlags};
use crate::auth;
use crate::convert::ConversionEntry;
use crate::downloader::Engine;
use crate::error::ExitCode;
use crate::fname;
use crate::job::{Job, PartSet};
use crate::metalink;
use crate::parsers::{self, ContentKind};
use crate::sink::{FinishedBody, ResponseMeta};
use crate::url_utils;

/// Headers the pipeline consumes beyond what the sink needed.
#[derive(Debug, Clone, Default)]
pub struct ResponseHeaders {
    pub location: Option<String>,
    pub www_authenticate: Vec<String>,
    pub proxy_authenticate: Vec<String>,
    /// Raw Link header values (RFC 6249 Metalink/HTTP discovery).
    pub links: Vec<String>,
    pub etag: Option<String>,
    pub hsts: Option<String>,
    pub hpkp: Option<String>,
}

/// One completed exchange, ready for pipeline processing.
#[derive(Debug)]
pub struct Fetched {
    pub meta: ResponseMeta,
    pub headers: ResponseHeaders,
    pub finished: FinishedBody,
}

/// Process one response end to end. Consumes the job; every path either
/// finishes it (accounting via `job_finished`), requeues it, or releases
/// its part claim.
pub fn process(engine: &Engine, mut job: Job, fetched: Fetched) {
    let status = fetched.meta.status;

    record_stats(engine, &job, status);
    update_transport_state(engine, &job, &fetched.headers);

    if job.is_robots {
        finish_robots(engine, job, fetched);
        return;
    }

    // Ranged part responses never follow redirects or auth dances; anything
    // but a clean 200/206 just releases the part back into rotation.
    if job.is_part() {
        process_part(engine, job, fetched);
        return;
    }

    if status == 401 {
        job.auth_failure_count += 1;
        let challenges = auth::parse_challenges(&fetched.headers.www_authenticate);
        if job.auth_failure_count > 1
            || challenges.is_empty()
            || engine.config.http_username.is_none()
        {
            tracing::error!("authentication failed for '{}'", job.url);
            engine.exit_status.report(ExitCode::Auth);
            engine.job_finished();
            return;
        }
        // Retry once, now answering the challenge.
        job.challenges = challenges;
        job.head_first = false;
        requeue(engine, job);
        return;
    }

    if status == 407 {
        let challenges = auth::parse_challenges(&fetched.headers.proxy_authenticate);
        if !job.proxy_challenges.is_empty()
            || challenges.is_empty()
            || engine.config.http_proxy_username.is_none()
        {
            // Already tried with credentials, or the proxy sent no
            // challenge. Don't try again.
            tracing::error!("proxy authentication failed for '{}'", job.url);
            engine.exit_status.report(ExitCode::Auth);
            engine.job_finished();
            return;
        }
        // Retry once, now answering the proxy challenge.
        job.proxy_challenges = challenges;
        job.head_first = false;
        requeue(engine, job);
        return;
    }

    // RFC 6249: a Link-described Metalink supersedes the plain response.
    if engine.config.metalink {
        if let Some(target) = metalink_link_target(&fetched.headers.links) {
            tracing::info!("following metalink description '{}'", target);
            let absolute = job
                .url
                .join(&target)
                .map(|u| u.to_string())
                .unwrap_or(target);
            admission::admit(engine, Some(&job), &absolute, AdmitFlags::default());
            engine.job_finished();
            return;
        }
    }

    if matches!(status, 301 | 302 | 303 | 307 | 308) {
        if let Some(location) = &fetched.headers.location {
            match job.url.join(location) {
                Ok(target) => admission::admit(
                    engine,
                    Some(&job),
                    target.as_str(),
                    AdmitFlags {
                        redirect: true,
                        sitemap: job.is_sitemap,
                    },
                ),
                Err(_) => tracing::error!("cannot resolve redirect location '{}'", location),
            }
        }
        engine.job_finished();
        return;
    }

    if job.head_first {
        process_head(engine, job, fetched);
    } else {
        process_full(engine, job, fetched);
    }
}

/// Statistics recording plus the remote-failure exit rank for 4xx.
fn record_stats(engine: &Engine, job: &Job, status: u16) {
    use std::sync::atomic::Ordering;

    match status {
        200 | 206 => {
            if job.is_part() {
                engine.stats.chunks.fetch_add(1, Ordering::Relaxed);
            } else {
                engine.stats.downloads.fetch_add(1, Ordering::Relaxed);
            }
        }
        301 | 302 | 303 | 307 | 308 => {
            engine.stats.redirects.fetch_add(1, Ordering::Relaxed);
        }
        304 => {
            engine.stats.not_modified.fetch_add(1, Ordering::Relaxed);
        }
        _ => {
            engine.stats.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    if (400..500).contains(&status) && status != 416 {
        if job.head_first || (status == 404 && !job.is_robots) {
            engine.exit_status.report(ExitCode::Remote);
        }
    }
}

/// Cookie storage is the jar's business; HSTS and HPKP updates happen here,
/// HTTPS responses for non-IP hosts only.
fn update_transport_state(engine: &Engine, job: &Job, headers: &ResponseHeaders) {
    if job.url.scheme() != "https" || url_utils::host_is_ip(&job.url) {
        return;
    }
    let Some(host) = job.url.host_str() else {
        return;
    };

    if engine.config.hsts {
        if let Some(value) = &headers.hsts {
            if let Some((max_age, subdomains)) = crate::hsts::parse_hsts_header(value) {
                engine
                    .hsts
                    .add(host, url_utils::effective_port(&job.url), max_age, subdomains);
            }
        }
    }

    if engine.config.hpkp {
        if let Some(value) = &headers.hpkp {
            engine.hpkp.add_from_header(host, value);
        }
    }
}

fn finish_robots(engine: &Engine, job: Job, fetched: Fetched) {
    let policy = if fetched.meta.status == 200 && !fetched.finished.body.is_empty() {
        let body = String::from_utf8_lossy(&fetched.finished.body);
        Some(parsers::robots::parse(&body))
    } else {
        None
    };

    let sitemaps: Vec<String> = policy
        .as_ref()
        .map(|p| p.sitemaps.clone())
        .unwrap_or_default();

    engine.registry.lock().robots_done(&job.host, policy);
    // Jobs queued behind the gate are dispatchable now.
    engine.worker_notify.notify_waiters();

    // Sitemaps are not page requisites.
    if !engine.config.page_requisites {
        for sitemap in sitemaps {
            tracing::info!("adding sitemap '{}'", sitemap);
            admission::admit(
                engine,
                Some(&job),
                &sitemap,
                AdmitFlags {
                    sitemap: true,
                    ..AdmitFlags::default()
                },
            );
        }
    }

    engine.job_finished();
}

/// HEAD probe results: decide between skipping, a plain GET retry, or
/// chunked dispatch.
fn process_head(engine: &Engine, mut job: Job, fetched: Fetched) {
    let config = &engine.config;
    job.head_first = false;

    if config.spider || config.chunk_size == 0 {
        let Some(content_type) = fetched.meta.content_type.as_deref() else {
            engine.job_finished();
            return;
        };
        if fetched.meta.status != 200 || !parsers::is_parseable(content_type, job.is_sitemap) {
            engine.job_finished();
            return;
        }

        // A body we already scanned under another URL is not worth a GET.
        if let Some(etag) = fetched.headers.etag.clone() {
            if !engine.etags.lock().insert(etag) {
                tracing::info!("not scanning '{}' (known ETag)", job.url);
                engine.job_finished();
                return;
            }
        }

        if config.spider && !config.recursive {
            engine.job_finished();
            return;
        }

        requeue(engine, job);
        return;
    }

    // Chunked retrieval: split into ranged parts when worthwhile.
    match fetched.meta.content_length {
        Some(total) if total > config.chunk_size => {
            let output = chunk_output_path(config, &job);
            let descriptor =
                metalink::Metalink::synthetic(job.url.clone(), &output.to_string_lossy(), total, config.chunk_size);

            let done = descriptor.validate_file(&output);
            if done.len() == descriptor.pieces.len() {
                tracing::info!("'{}' already complete", output.display());
                engine.job_finished();
                return;
            }

            job.parts = Some(Arc::new(PartSet::new(descriptor, output, &done)));
            requeue(engine, job);
        }
        _ => {
            // No usable length: fall back to a plain GET.
            requeue(engine, job);
        }
    }
}

fn chunk_output_path(config: &crate::config::Config, job: &Job) -> PathBuf {
    if let Some(out) = &config.output_document {
        return PathBuf::from(out);
    }
    job.local_path.clone().unwrap_or_else(|| {
        let name = job
            .url
            .path_segments()
            .and_then(|mut s| s.next_back())
            .filter(|s| !s.is_empty())
            .unwrap_or("index.html");
        config.directory_prefix.join(name)
    })
}

/// One ranged part of a multi-part job came back.
fn process_part(engine: &Engine, job: Job, fetched: Fetched) {
    let part = job.part().expect("part job carries its range");
    let parts = Arc::clone(job.parts.as_ref().expect("part job carries its set"));
    let status = fetched.meta.status;

    let ok = matches!(status, 200 | 206) && fetched.finished.length == part.length;
    if !ok {
        tracing::debug!(
            "part {} of '{}' failed (status {}, {} of {} bytes)",
            part.id,
            parts.metalink.name,
            status,
            fetched.finished.length,
            part.length
        );
        parts.release(part.id);
        engine.worker_notify.notify_one();
        return;
    }

    tracing::debug!("part {} of '{}' downloaded", part.id, parts.metalink.name);
    if !parts.complete(part.id) {
        return; // other parts still open
    }

    // Last part in: validate the assembled file. The multi job may already
    // have been drained by a host failure; only its remover closes it.
    tracing::info!("'{}' checking...", parts.output.display());
    let valid = parts.metalink.verify_complete(&parts.output);
    let removed = engine.registry.lock().remove_job(&job.host, job.id).is_some();

    if valid {
        tracing::debug!("checksum ok");
    } else {
        tracing::error!(
            "checksum failed for '{}', discarding",
            parts.output.display()
        );
        let _ = std::fs::remove_file(&parts.output);
        engine
            .stats
            .errors
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        engine.exit_status.report(ExitCode::Generic);
    }
    if removed {
        engine.job_finished();
    }
}

/// Final responses: Metalink body dispatch, plugin forward, parser fan-out,
/// and the 304/416 local reparse path.
fn process_full(engine: &Engine, mut job: Job, fetched: Fetched) {
    let config = &engine.config;
    let status = fetched.meta.status;
    let content_type = fetched.meta.content_type.as_deref().unwrap_or("");

    if config.metalink
        && parsers::classify(content_type, false) == ContentKind::Metalink
        && !fetched.finished.body.is_empty()
    {
        let body = String::from_utf8_lossy(&fetched.finished.body);
        match metalink::parse(&body) {
            Some(mut descriptor) => {
                descriptor.sort_mirrors();
                let output = metalink_output_path(config, &descriptor);
                let done = descriptor.validate_file(&output);
                if done.len() == descriptor.pieces.len() {
                    tracing::info!("'{}' already complete", output.display());
                    engine.job_finished();
                    return;
                }
                job.parts = Some(Arc::new(PartSet::new(descriptor, output, &done)));
                requeue(engine, job);
            }
            None => {
                tracing::error!("invalid metalink description from '{}'", job.url);
                engine.job_finished();
            }
        }
        return;
    }

    let process = job.local_path.is_some() || !fetched.finished.body.is_empty();
    let recurse = process && config.recursive && config.depth_allows(job.level);

    engine.plugins.downloaded_file(
        &job.url,
        fetched.finished.path.as_deref(),
        fetched.finished.length,
    );

    if matches!(status, 200 | 206) {
        if recurse && !fetched.finished.body.is_empty() {
            fan_out(engine, &job, content_type, &fetched);
        }
    } else if (status == 304 && config.timestamping) || status == 416 {
        // Local copy is current; reparse it to keep recursion going.
        if recurse {
            reparse_local(engine, &job);
        }
    }

    engine.job_finished();
}

fn metalink_output_path(config: &crate::config::Config, descriptor: &metalink::Metalink) -> PathBuf {
    if let Some(out) = &config.output_document {
        return PathBuf::from(out);
    }
    let name = std::path::Path::new(&descriptor.name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    config
        .directory_prefix
        .join(fname::restrict_file_name(&name, &config.restrict_file_names))
}

/// Dispatch the body to the parser matching its content kind and admit
/// every discovered URL.
fn fan_out(engine: &Engine, job: &Job, content_type: &str, fetched: &Fetched) {
    match parsers::classify(content_type, job.is_sitemap) {
        ContentKind::Html => {
            let body = String::from_utf8_lossy(&fetched.finished.body);
            parse_html_and_admit(engine, job, &body, fetched.finished.path.clone());
        }
        ContentKind::Css => {
            let body = String::from_utf8_lossy(&fetched.finished.body);
            let parsed = parsers::css::parse(&body);
            for url in &parsed.urls {
                if let Ok(absolute) = job.url.join(&url.literal) {
                    admission::admit(engine, Some(job), absolute.as_str(), AdmitFlags::default());
                }
            }
            maybe_remember_conversion(
                engine,
                job,
                fetched.finished.path.clone(),
                job.url.clone(),
                parsed.urls.into_iter().map(|u| u.literal).collect(),
            );
        }
        ContentKind::Atom => {
            let body = String::from_utf8_lossy(&fetched.finished.body);
            admit_all(engine, job, parsers::feed::parse_atom(&body));
        }
        ContentKind::Rss => {
            let body = String::from_utf8_lossy(&fetched.finished.body);
            admit_all(engine, job, parsers::feed::parse_rss(&body));
        }
        ContentKind::SitemapXml => {
            let urls = parsers::sitemap::parse_xml(&fetched.finished.body, Some(&job.url));
            admit_sitemap_urls(engine, job, urls);
        }
        ContentKind::SitemapGz => {
            let urls = parsers::sitemap::parse_xml_gz(&fetched.finished.body, Some(&job.url));
            admit_sitemap_urls(engine, job, urls);
        }
        ContentKind::SitemapText => {
            let body = String::from_utf8_lossy(&fetched.finished.body);
            let urls = parsers::sitemap::parse_text(&body, Some(&job.url));
            admit_sitemap_urls(engine, job, urls);
        }
        ContentKind::Metalink | ContentKind::Other => {}
    }
}

fn parse_html_and_admit(engine: &Engine, job: &Job, body: &str, saved: Option<PathBuf>) {
    let parsed = parsers::html::parse(body);

    if engine.config.robots && !parsed.follow {
        tracing::debug!("not following links in '{}' (robots nofollow)", job.url);
        return;
    }

    // A <base href> rebases every link in the document.
    let base = parsed
        .base
        .as_deref()
        .and_then(|b| job.url.join(b).ok())
        .unwrap_or_else(|| job.url.clone());

    let config = &engine.config;
    let child_level = job.level + 1;
    let nav_allowed = config.level == 0 || child_level <= config.level;
    let inline_allowed =
        config.level == 0 || child_level <= config.level + u32::from(config.page_requisites);

    let mut literals = Vec::with_capacity(parsed.urls.len());
    for html_url in &parsed.urls {
        literals.push(html_url.literal.clone());

        let allowed = if html_url.inline { inline_allowed } else { nav_allowed };
        if !allowed {
            tracing::debug!(
                "URL '{}' not followed (depth limit)",
                html_url.literal
            );
            continue;
        }

        if let Ok(absolute) = base.join(&html_url.literal) {
            admission::admit(engine, Some(job), absolute.as_str(), AdmitFlags::default());
        }
    }

    maybe_remember_conversion(engine, job, saved, base, literals);
}

fn maybe_remember_conversion(
    engine: &Engine,
    _job: &Job,
    saved: Option<PathBuf>,
    base: Url,
    urls: Vec<String>,
) {
    if !engine.config.convert_links || engine.config.delete_after {
        return;
    }
    let Some(filename) = saved else { return };
    if urls.is_empty() {
        return;
    }
    engine.conversions.remember(ConversionEntry {
        filename,
        base,
        urls,
    });
}

fn admit_all(engine: &Engine, job: &Job, urls: Vec<String>) {
    for url in urls {
        let absolute = match job.url.join(&url) {
            Ok(u) => u.to_string(),
            Err(_) => url,
        };
        admission::admit(engine, Some(job), &absolute, AdmitFlags::default());
    }
}

fn admit_sitemap_urls(engine: &Engine, job: &Job, urls: parsers::sitemap::SitemapUrls) {
    tracing::info!(
        "found {} url(s), {} sitemap url(s) in '{}'",
        urls.pages.len(),
        urls.sitemaps.len(),
        job.url
    );
    for url in urls.pages {
        admission::admit(engine, Some(job), &url, AdmitFlags::default());
    }
    for url in urls.sitemaps {
        admission::admit(
            engine,
            Some(job),
            &url,
            AdmitFlags {
                sitemap: true,
                ..AdmitFlags::default()
            },
        );
    }
}

/// 304/416 with recursion: the interesting content is already on disk.
fn reparse_local(engine: &Engine, job: &Job) {
    let Some(path) = &job.local_path else { return };
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    let Ok(body) = std::fs::read_to_string(path) else {
        return;
    };

    match ext.as_str() {
        "html" | "htm" => parse_html_and_admit(engine, job, &body, Some(path.clone())),
        "css" => {
            let parsed = parsers::css::parse(&body);
            for url in parsed.urls {
                if let Ok(absolute) = job.url.join(&url.literal) {
                    admission::admit(engine, Some(job), absolute.as_str(), AdmitFlags::default());
                }
            }
        }
        _ => {}
    }
}

fn requeue(engine: &Engine, job: Job) {
    let key = job.host.clone();
    engine.registry.lock().release_jobs(&key, vec![job]);
    engine.worker_notify.notify_one();
}

/// Pick the Metalink description from Link headers: rel=describedby with a
/// metalink type wins; otherwise the highest-priority rel=duplicate.
fn metalink_link_target(links: &[String]) -> Option<String> {
    let mut top_duplicate: Option<(u32, String)> = None;

    for value in links {
        for link in parse_link_header(value) {
            if link.rel.as_deref() == Some("describedby") {
                if matches!(
                    link.media_type.as_deref(),
                    Some("application/metalink4+xml") | Some("application/metalink+xml")
                ) {
                    return Some(link.url);
                }
            } else if link.rel.as_deref() == Some("duplicate") {
                let pri = link.pri.unwrap_or(999_999);
                if top_duplicate.as_ref().map(|(p, _)| pri < *p).unwrap_or(true) {
                    top_duplicate = Some((pri, link.url));
                }
            }
        }
    }

    top_duplicate.map(|(_, url)| url)
}

#[derive(Debug, Default)]
struct LinkValue {
    url: String,
    rel: Option<String>,
    media_type: Option<String>,
    pri: Option<u32>,
}

/// Minimal RFC 8288 Link header parse, enough for rel/type/pri.
fn parse_link_header(value: &str) -> Vec<LinkValue> {
    let mut out = Vec::new();

    for entry in split_link_entries(value) {
        let mut parts = entry.split(';');
        let Some(url_part) = parts.next() else { continue };
        let url = url_part.trim().trim_start_matches('<').trim_end_matches('>');
        if url.is_empty() {
            continue;
        }

        let mut link = LinkValue {
            url: url.to_string(),
            ..LinkValue::default()
        };
        for param in parts {
            let Some((key, val)) = param.split_once('=') else {
                continue;
            };
            let val = val.trim().trim_matches('"').to_ascii_lowercase();
            match key.trim().to_ascii_lowercase().as_str() {
                "rel" => link.rel = Some(val),
                "type" => link.media_type = Some(val),
                "pri" => link.pri = val.parse().ok(),
                _ => {}
            }
        }
        out.push(link);
    }

    out
}

/// Split a Link header on commas that separate entries, not those inside
/// <...> or quotes.
fn split_link_entries(value: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_angle = false;
    let mut in_quotes = false;

    for c in value.chars() {
        match c {
            '<' if !in_quotes => {
                in_angle = true;
                current.push(c);
            }
            '>' if !in_quotes => {
                in_angle = false;
                current.push(c);
            }
            '"' => {
                in_quotes = !in_quotes;
                current.push(c);
            }
            ',' if !in_angle && !in_quotes => {
                if !current.trim().is_empty() {
                    out.push(current.trim().to_string());
                }
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        out.push(current.trim().to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_link_header() {
        let links = parse_link_header(
            "<http://m.local/f.meta4>; rel=describedby; type=\"application/metalink4+xml\", \
             <http://m1.local/f>; rel=duplicate; pri=2",
        );
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].rel.as_deref(), Some("describedby"));
        assert_eq!(links[1].pri, Some(2));
    }

    #[test]
    fn test_metalink_link_describedby_wins() {
        let values = vec![
            "<http://m1.local/f>; rel=duplicate; pri=1".to_string(),
            "<http://m.local/f.meta4>; rel=describedby; type=\"application/metalink4+xml\""
                .to_string(),
        ];
        assert_eq!(
            metalink_link_target(&values).as_deref(),
            Some("http://m.local/f.meta4")
        );
    }

    #[test]
    fn test_metalink_link_duplicate_priority() {
        let values = vec![
            "<http://m2.local/f>; rel=duplicate; pri=2".to_string(),
            "<http://m1.local/f>; rel=duplicate; pri=1".to_string(),
        ];
        assert_eq!(
            metalink_link_target(&values).as_deref(),
            Some("http://m1.local/f")
        );
    }

    #[test]
    fn test_describedby_wrong_type_ignored() {
        let values =
            vec!["<http://m.local/f.torrent>; rel=describedby; type=\"application/x-bittorrent\""
                .to_string()];
        assert_eq!(metalink_link_target(&values), None);
    }
}
