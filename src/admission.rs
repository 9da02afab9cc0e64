//! URL admission: the single path through which every candidate URL —
//! seed, parsed, or redirect target — becomes a queued Job or is dropped.
//!
//! Order matters and is load-bearing: plugin verdict, scheme policy, HSTS
//! upgrade, fingerprint de-dup, host/parent policy, robots deny, pattern
//! filters, then job construction. The fingerprint insert grants exclusive
//! enqueue rights; everything after it must either enqueue or drop silently.

use url::Url;

use crate::downloader::Engine;
use crate::error::ExitCode;
use crate::fname;
use crate::host::HostKey;
use crate::job::Job;
use crate::url_utils;

#[derive(Debug, Clone, Copy, Default)]
pub struct AdmitFlags {
    /// This admission is a redirect follow-up: inherit referer/original URL
    /// and count against max_redirect.
    pub redirect: bool,
    /// Tag the job as a sitemap retrieval.
    pub sitemap: bool,
}

/// Admit a user-supplied URL (command line, input file, stdin).
pub fn queue_seed(engine: &Engine, raw: &str) {
    let config = &engine.config;

    let base = config
        .base
        .as_deref()
        .and_then(|b| Url::parse(b).ok());
    let Some(url) = url_utils::parse_with_base(base.as_ref(), raw) else {
        tracing::error!("cannot resolve URI '{}'", raw);
        engine.exit_status.report(ExitCode::ParseInit);
        return;
    };

    let Some((mut url, _verdict)) = apply_plugins_and_scheme(engine, url) else {
        return;
    };
    maybe_upgrade_hsts(engine, &mut url);
    let url = url_utils::normalize(url);
    let Some(key) = HostKey::from_url(&url) else {
        return;
    };

    let mut registry = engine.registry.lock();

    if !engine.fingerprints.insert_if_absent(url.as_str()) {
        return;
    }

    if crate::filters::in_host_pattern_list(&config.exclude_domains, &key.host) {
        tracing::info!("URL '{}' not followed (domain explicitly excluded)", url);
        return;
    }

    create_host_with_robots(engine, &mut registry, &key, &url);

    if config.recursive {
        // Seeds widen the allowed domain set and anchor the parent rule.
        if !config.span_hosts {
            let mut domains = engine.seed_domains.lock();
            if !domains.iter().any(|d| d == &key.host) {
                domains.push(key.host.clone());
            }
        }
        if !config.parent {
            engine
                .parents
                .lock()
                .push((key.host.clone(), url.path().to_string()));
        }
    }

    let mut job = Job::new(url.clone(), key);
    job.local_path = fname::local_filename(config, &url);
    job.head_first = decide_head_first(engine, false);

    engine.job_opened();
    registry.add_job(job);
    drop(registry);
    engine.worker_notify.notify_one();
}

/// Admit a URL discovered during the run: parsed from a document, or the
/// Location of a redirect. `parent` is the job the URL came from.
pub fn admit(engine: &Engine, parent: Option<&Job>, url_str: &str, flags: AdmitFlags) {
    let config = &engine.config;

    if flags.redirect {
        if let Some(p) = parent {
            if config.max_redirect > 0 && p.redirection_level >= config.max_redirect {
                tracing::info!(
                    "URL '{}' not followed (redirect limit of {} reached)",
                    url_str,
                    config.max_redirect
                );
                engine.exit_status.report(ExitCode::Remote);
                return;
            }
        }
    }

    let Some(url) = url_utils::parse_with_base(None, url_str) else {
        tracing::error!("cannot resolve URI '{}'", url_str);
        return;
    };

    let Some((mut url, verdict)) = apply_plugins_and_scheme(engine, url) else {
        return;
    };
    maybe_upgrade_hsts(engine, &mut url);
    let url = url_utils::normalize(url);
    let Some(key) = HostKey::from_url(&url) else {
        return;
    };

    let mut registry = engine.registry.lock();

    if !engine.fingerprints.insert_if_absent(url.as_str()) {
        return;
    }

    // Host scope rules apply to recursive retrieval only.
    if config.recursive {
        let reason = if !config.span_hosts && !host_in_seed_scope(engine, &key.host) {
            Some("no host-spanning requested")
        } else if crate::filters::in_host_pattern_list(&config.exclude_domains, &key.host) {
            Some("domain explicitly excluded")
        } else {
            None
        };

        if let Some(reason) = reason {
            tracing::info!("URL '{}' not followed ({})", url, reason);
            if flags.redirect {
                // A dropped redirect leaves the original resource unfetched.
                engine.exit_status.report(ExitCode::Remote);
            }
            return;
        }
    }

    if config.recursive && !config.parent && !parent_allows(engine, &key.host, url.path()) {
        tracing::info!("URL '{}' not followed (parent ascending not allowed)", url);
        return;
    }

    let created = create_host_with_robots(engine, &mut registry, &key, &url);

    // Robots deny list: substring prefix match via the stored policy.
    if !created && config.recursive && !flags.redirect {
        if let Some(policy) = registry.robots_policy(&key) {
            if !policy.allows(&config.user_agent, url.as_str()) {
                tracing::debug!("URL '{}' not followed (disallowed by robots.txt)", url);
                return;
            }
        }
    }

    // Admission-time pattern filter (--filter-urls); otherwise patterns run
    // again at save time.
    if config.recursive && config.filter_urls && !verdict.accept && engine.filters.rejects(url.as_str())
    {
        tracing::debug!("not requesting '{}' (pattern filter)", url);
        return;
    }

    let mut job = Job::new(url.clone(), key);

    job.local_path = if let Some(alt) = verdict.alt_local_filename {
        Some(alt)
    } else if flags.redirect && !config.trust_server_names {
        // Redirected content keeps the name the user asked for.
        parent.and_then(|p| p.local_path.clone())
    } else {
        fname::local_filename(config, &url)
    };

    if let Some(p) = parent {
        if flags.redirect {
            job.redirection_level = p.redirection_level + 1;
            job.referer = p.referer.clone();
            job.original_url = Some(p.original_url.clone().unwrap_or_else(|| p.url.clone()));
            job.challenges = p.challenges.clone();
            job.proxy_challenges = p.proxy_challenges.clone();
        } else {
            job.level = p.level + 1;
            job.referer = Some(p.url.clone());
        }
    }

    job.ignore_patterns = verdict.accept;
    job.is_sitemap = flags.sitemap;
    job.head_first = decide_head_first(engine, verdict.accept);

    engine.job_opened();
    registry.add_job(job);
    drop(registry);
    engine.worker_notify.notify_one();
}

/// Queue a Metalink description read from a local file: the job attaches
/// to the first mirror's host and dispatches as ranged parts.
pub fn queue_metalink(engine: &Engine, mut descriptor: crate::metalink::Metalink) {
    use crate::job::PartSet;
    use std::sync::Arc;

    if descriptor.size == 0 || descriptor.mirrors.is_empty() {
        tracing::error!("invalid metalink description (no size or mirrors)");
        engine.exit_status.report(ExitCode::ParseInit);
        return;
    }
    descriptor.sort_mirrors();

    let mirror_url = descriptor.mirrors[0].url.clone();
    let Some(key) = HostKey::from_url(&mirror_url) else {
        return;
    };

    let name = std::path::Path::new(&descriptor.name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "download".to_string());
    let output = engine.config.directory_prefix.join(fname::restrict_file_name(
        &name,
        &engine.config.restrict_file_names,
    ));

    let done = descriptor.validate_file(&output);
    if done.len() == descriptor.pieces.len() {
        tracing::info!("'{}' already complete", output.display());
        return;
    }

    let mut registry = engine.registry.lock();
    registry.get_or_create(&key);

    let mut job = Job::new(mirror_url, key);
    job.parts = Some(Arc::new(PartSet::new(descriptor, output, &done)));

    engine.job_opened();
    registry.add_job(job);
    drop(registry);
    engine.worker_notify.notify_waiters();
}

/// Plugin verdict plus scheme policy. Returns the (possibly substituted)
/// URL and the verdict, or None when the URL is dropped.
fn apply_plugins_and_scheme(
    engine: &Engine,
    mut url: Url,
) -> Option<(Url, crate::plugin::UrlVerdict)> {
    let mut verdict = engine.plugins.forward_url(&url);
    if verdict.reject {
        return None;
    }
    if let Some(alt) = verdict.alt_url.take() {
        url = alt;
    }

    match url.scheme() {
        "http" => {
            if engine.config.https_only {
                tracing::info!("URL '{}' not followed (https-only requested)", url);
                return None;
            }
        }
        "https" => {}
        other => {
            tracing::info!("URL '{}' not followed (unsupported scheme '{}')", url, other);
            return None;
        }
    }

    Some((url, verdict))
}

/// Upgrade http URLs whose host has an HSTS entry, before any host lookup
/// or socket use.
fn maybe_upgrade_hsts(engine: &Engine, url: &mut Url) {
    if !engine.config.hsts || url.scheme() != "http" || url_utils::host_is_ip(url) {
        return;
    }
    let Some(host) = url.host_str() else { return };
    let port = url_utils::effective_port(url);

    if engine.hsts.matches(host, port) {
        tracing::info!("HSTS in effect for {}:{}", host, port);
        let _ = url.set_scheme("https");
        // Explicit :80 maps onto the https default.
        if url.port() == Some(80) {
            let _ = url.set_port(None);
        }
    }
}

/// Create the host entry on first sight; under recursive robots enforcement
/// the synthetic robots.txt job is installed before anything else can run.
fn create_host_with_robots(
    engine: &Engine,
    registry: &mut crate::host::HostRegistry,
    key: &HostKey,
    url: &Url,
) -> bool {
    let created = registry.get_or_create(key);
    if created && engine.config.recursive && engine.config.robots {
        if let Some(robots_url) = url_utils::robots_url(url) {
            if engine.fingerprints.insert_if_absent(robots_url.as_str()) {
                let mut job = Job::new(robots_url, key.clone());
                job.is_robots = true;
                engine.job_opened();
                registry.set_robots_job(key, job);
            }
        }
    }
    created
}

fn host_in_seed_scope(engine: &Engine, host: &str) -> bool {
    if crate::filters::in_host_pattern_list(&engine.config.domains, host) {
        return true;
    }
    let domains = engine.seed_domains.lock();
    crate::filters::in_host_pattern_list(&domains, host)
}

/// The no-parent rule: at least one seed on the same host whose directory
/// prefix contains the URL's path.
fn parent_allows(engine: &Engine, host: &str, path: &str) -> bool {
    let parents = engine.parents.lock();
    parents
        .iter()
        .any(|(seed_host, seed_path)| seed_host == host && url_utils::path_within_parent(seed_path, path))
}

/// HEAD precedes GET when content-type probing is required to evaluate
/// policy: spider mode, chunk probing, or pattern filters in recursive mode.
fn decide_head_first(engine: &Engine, plugin_accepted: bool) -> bool {
    let config = &engine.config;
    if config.spider || config.chunk_size > 0 {
        return true;
    }
    if plugin_accepted {
        return false;
    }
    config.recursive && config.has_patterns()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::host::NextJob;
    use std::time::Instant;

    fn engine_with(mutate: impl FnOnce(&mut Config)) -> std::sync::Arc<Engine> {
        let mut config = Config::default();
        config.directory_prefix = std::env::temp_dir();
        mutate(&mut config);
        Engine::new(config).unwrap()
    }

    fn drain_jobs(engine: &Engine) -> Vec<Job> {
        let mut registry = engine.registry.lock();
        let mut jobs = Vec::new();
        loop {
            match registry.next_job(None, Instant::now()) {
                NextJob::Job(job) => jobs.push(*job),
                _ => break,
            }
        }
        jobs
    }

    #[test]
    fn test_seed_admitted_once() {
        let engine = engine_with(|_| {});
        queue_seed(&engine, "http://test.local/page");
        queue_seed(&engine, "http://test.local/page");
        assert_eq!(drain_jobs(&engine).len(), 1);
    }

    #[test]
    fn test_unsupported_scheme_dropped() {
        let engine = engine_with(|_| {});
        queue_seed(&engine, "ftp://test.local/file");
        assert!(drain_jobs(&engine).is_empty());
    }

    #[test]
    fn test_https_only_drops_http() {
        let engine = engine_with(|c| c.https_only = true);
        admit(&engine, None, "http://test.local/x", AdmitFlags::default());
        assert!(drain_jobs(&engine).is_empty());
    }

    #[test]
    fn test_recursive_creates_robots_job_first() {
        let engine = engine_with(|c| c.recursive = true);
        queue_seed(&engine, "http://test.local/deep/page.html");

        let jobs = drain_jobs(&engine);
        // Robots gate blocks the page job until robots completes, so only
        // the robots job comes out.
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].is_robots);
        assert_eq!(jobs[0].url.path(), "/robots.txt");
    }

    #[test]
    fn test_span_hosts_off_limits_to_seed_domain() {
        let engine = engine_with(|c| {
            c.recursive = true;
            c.robots = false;
        });
        queue_seed(&engine, "http://a.local/");
        admit(&engine, None, "http://a.local/next", AdmitFlags::default());
        admit(&engine, None, "http://b.local/other", AdmitFlags::default());

        let jobs = drain_jobs(&engine);
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|j| j.host.host == "a.local"));
    }

    #[test]
    fn test_redirect_to_foreign_host_reports_remote() {
        let engine = engine_with(|c| {
            c.recursive = true;
            c.robots = false;
        });
        queue_seed(&engine, "http://a.local/");
        let parent = drain_jobs(&engine).pop().unwrap();

        admit(
            &engine,
            Some(&parent),
            "http://b.local/elsewhere",
            AdmitFlags {
                redirect: true,
                ..AdmitFlags::default()
            },
        );
        assert!(drain_jobs(&engine).is_empty());
        assert_eq!(engine.exit_status.get(), ExitCode::Remote as u8);
    }

    #[test]
    fn test_max_redirect_bound() {
        let engine = engine_with(|c| c.max_redirect = 2);
        queue_seed(&engine, "http://test.local/start");
        let mut parent = drain_jobs(&engine).pop().unwrap();
        parent.redirection_level = 2;

        admit(
            &engine,
            Some(&parent),
            "http://test.local/hop3",
            AdmitFlags {
                redirect: true,
                ..AdmitFlags::default()
            },
        );
        assert!(drain_jobs(&engine).is_empty());
    }

    #[test]
    fn test_no_parent_rule() {
        let engine = engine_with(|c| {
            c.recursive = true;
            c.parent = false;
            c.robots = false;
        });
        queue_seed(&engine, "http://test.local/docs/index.html");
        let seed = drain_jobs(&engine).pop().unwrap();

        admit(
            &engine,
            Some(&seed),
            "http://test.local/docs/sub/page.html",
            AdmitFlags::default(),
        );
        admit(
            &engine,
            Some(&seed),
            "http://test.local/outside/page.html",
            AdmitFlags::default(),
        );

        let jobs = drain_jobs(&engine);
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].url.path().starts_with("/docs/"));
    }

    #[test]
    fn test_hsts_upgrade_before_host_lookup() {
        let engine = engine_with(|_| {});
        engine.hsts.add("secure.local", 443, 3600, false);

        queue_seed(&engine, "http://secure.local/page");
        let jobs = drain_jobs(&engine);
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].url.scheme(), "https");
        assert_eq!(jobs[0].host.scheme, "https");
    }

    #[test]
    fn test_redirect_inherits_original_url_and_referer() {
        let engine = engine_with(|_| {});
        queue_seed(&engine, "http://test.local/orig");
        let mut parent = drain_jobs(&engine).pop().unwrap();
        parent.referer = Some(Url::parse("http://test.local/from").unwrap());

        admit(
            &engine,
            Some(&parent),
            "http://test.local/moved",
            AdmitFlags {
                redirect: true,
                ..AdmitFlags::default()
            },
        );
        let job = drain_jobs(&engine).pop().unwrap();
        assert_eq!(job.redirection_level, 1);
        assert_eq!(
            job.original_url.unwrap().as_str(),
            "http://test.local/orig"
        );
        assert_eq!(job.referer.unwrap().as_str(), "http://test.local/from");
    }

    #[test]
    fn test_level_and_referer_for_parsed_urls() {
        let engine = engine_with(|_| {});
        queue_seed(&engine, "http://test.local/");
        let parent = drain_jobs(&engine).pop().unwrap();

        admit(
            &engine,
            Some(&parent),
            "http://test.local/child",
            AdmitFlags::default(),
        );
        let job = drain_jobs(&engine).pop().unwrap();
        assert_eq!(job.level, 1);
        assert_eq!(job.referer.unwrap().as_str(), "http://test.local/");
    }

    #[test]
    fn test_spider_mode_sets_head_first() {
        let engine = engine_with(|c| c.spider = true);
        queue_seed(&engine, "http://test.local/x");
        assert!(drain_jobs(&engine).pop().unwrap().head_first);
    }

    #[test]
    fn test_filter_urls_rejects_at_admission() {
        let engine = engine_with(|c| {
            c.recursive = true;
            c.robots = false;
            c.filter_urls = true;
            c.reject_patterns = vec!["*.zip".to_string()];
        });
        queue_seed(&engine, "http://test.local/");
        let parent = drain_jobs(&engine).pop().unwrap();

        admit(
            &engine,
            Some(&parent),
            "http://test.local/archive.zip",
            AdmitFlags::default(),
        );
        assert!(drain_jobs(&engine).is_empty());
    }
}
