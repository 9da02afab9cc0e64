//! The download engine: shared context, the worker state machine, and the
//! coordinator that detects quiescence.
//!
//! Workers cycle through three states. GetJob: bind to a host and pull its
//! next job (sending up to `max_pending` requests on an HTTP/2 connection
//! before reading responses). GetResponse: receive one response and run the
//! pipeline. Error: return in-flight work to the host, count the failure,
//! unbind. The coordinator owns no I/O; it wakes on job completions and
//! stops the run when every host is idle and no input source remains.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::config::Config;
use crate::convert::ConversionRecorder;
use crate::cookies;
use crate::error::{ExitStatus, GrabError};
use crate::filters::Filters;
use crate::fingerprint::FingerprintSet;
use crate::host::{HostKey, HostRegistry, NextJob};
use crate::hsts::{HpkpCache, HstsCache};
use crate::job::Job;
use crate::network::{FetchError, HttpClient};
use crate::plugin::PluginRegistry;
use crate::response::{self, Fetched, ResponseHeaders};
use crate::sink::{BodySink, ResponseMeta, SinkContext};
use crate::stats::Stats;

/// Shared engine context: configuration plus every piece of cross-worker
/// mutable state, each with its own locking discipline.
pub struct Engine {
    pub config: Arc<Config>,
    pub client: HttpClient,
    /// The scheduling mutex. Held only around queue manipulation, never
    /// across network or disk I/O.
    pub registry: Mutex<HostRegistry>,
    pub fingerprints: FingerprintSet,
    pub filters: Filters,
    pub stats: Arc<Stats>,
    pub exit_status: Arc<ExitStatus>,
    pub hsts: HstsCache,
    pub hpkp: HpkpCache,
    pub etags: Mutex<HashSet<String>>,
    pub conversions: ConversionRecorder,
    pub plugins: PluginRegistry,
    /// Serializes the backup-rotate-open section of file saving.
    pub save_lock: Mutex<()>,
    /// Signaled on new jobs and on termination; idle workers wait here.
    pub worker_notify: Notify,
    /// Signaled on every job completion; the coordinator waits here.
    pub main_notify: Notify,
    /// Graceful stop: take no new jobs (quota, quiescence, first SIGINT).
    pub stop: CancellationToken,
    /// Soft abort: cancel in-flight reads (SIGINT only).
    pub abort: CancellationToken,
    /// Jobs admitted but not yet finished or dropped.
    open_jobs: AtomicUsize,
    /// An input source (async stdin) may still produce seeds.
    pub input_active: AtomicBool,
    /// (host, path) anchors for the no-parent rule.
    pub parents: Mutex<Vec<(String, String)>>,
    /// Hosts seeded on the command line, for the span-hosts filter.
    pub seed_domains: Mutex<Vec<String>>,
}

impl Engine {
    pub fn new(config: Config) -> Result<Arc<Self>, GrabError> {
        let filters = Filters::from_config(&config)?;
        let client = HttpClient::new(&config)
            .map_err(|e| GrabError::Init(format!("HTTP client: {}", e)))?;

        let hsts = HstsCache::new();
        if config.hsts {
            if let Some(path) = &config.hsts_file {
                hsts.load(path)?;
            }
        }
        let hpkp = HpkpCache::new();
        if config.hpkp {
            if let Some(path) = &config.hpkp_file {
                hpkp.load(path)?;
            }
        }
        if let Some(path) = &config.load_cookies {
            let n = cookies::load_cookie_file(&client.jar, path)?;
            tracing::debug!("loaded {} cookie(s) from {}", n, path.display());
        }

        Ok(Arc::new(Self {
            config: Arc::new(config),
            client,
            registry: Mutex::new(HostRegistry::new()),
            fingerprints: FingerprintSet::new(),
            filters,
            stats: Arc::new(Stats::new()),
            exit_status: Arc::new(ExitStatus::new()),
            hsts,
            hpkp,
            etags: Mutex::new(HashSet::new()),
            conversions: ConversionRecorder::new(),
            plugins: PluginRegistry::new(),
            save_lock: Mutex::new(()),
            worker_notify: Notify::new(),
            main_notify: Notify::new(),
            stop: CancellationToken::new(),
            abort: CancellationToken::new(),
            open_jobs: AtomicUsize::new(0),
            input_active: AtomicBool::new(false),
            parents: Mutex::new(Vec::new()),
            seed_domains: Mutex::new(Vec::new()),
        }))
    }

    pub fn job_opened(&self) {
        self.open_jobs.fetch_add(1, Ordering::SeqCst);
    }

    pub fn job_finished(&self) {
        let _ = self
            .open_jobs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1));
        self.main_notify.notify_one();
    }

    pub fn open_jobs(&self) -> usize {
        self.open_jobs.load(Ordering::SeqCst)
    }

    pub fn quota_reached(&self) -> bool {
        self.config.quota > 0 && self.stats.bytes() >= self.config.quota
    }
}

/// Run the engine to quiescence. Assumes seeds have been queued (or an
/// input source marked active). Returns when every admitted job has been
/// finished or dropped, the quota tripped, or a signal stopped the run.
pub async fn run(engine: Arc<Engine>) {
    spawn_signal_handlers(Arc::clone(&engine));

    let mut workers: JoinSet<()> = JoinSet::new();
    let mut nworkers = 0usize;

    loop {
        // Spawn workers lazily, up to min(max_threads, pending work).
        let open = engine.open_jobs();
        let want = open.min(engine.config.max_threads).max(1);
        while nworkers < want {
            let engine = Arc::clone(&engine);
            let id = nworkers;
            workers.spawn(worker_loop(engine, id));
            nworkers += 1;
        }

        if engine.quota_reached() {
            tracing::info!(
                "quota of {} bytes reached - stopping",
                engine.config.quota
            );
            break;
        }

        if engine.stop.is_cancelled() {
            break;
        }

        if open == 0 && !engine.input_active.load(Ordering::SeqCst) {
            let registry = engine.registry.lock();
            if registry.all_idle() {
                break;
            }
        }

        tokio::select! {
            _ = engine.main_notify.notified() => {}
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            _ = engine.stop.cancelled() => break,
        }
    }

    engine.stop.cancel();
    engine.worker_notify.notify_waiters();
    while workers.join_next().await.is_some() {}
}

fn spawn_signal_handlers(engine: Arc<Engine>) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping (press Ctrl+C again to abort)");
            engine.stop.cancel();
            engine.abort.cancel();
            engine.worker_notify.notify_waiters();
            engine.main_notify.notify_one();

            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::error!("second interrupt, aborting");
                std::process::exit(1);
            }
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{signal, SignalKind};
        if let Ok(mut term) = signal(SignalKind::terminate()) {
            term.recv().await;
            std::process::exit(1);
        }
    });
}

/// The worker state machine.
async fn worker_loop(engine: Arc<Engine>, id: usize) {
    let mut bound: Option<HostKey> = None;
    let mut pending: JoinSet<(Job, Result<Fetched, FetchError>, bool)> = JoinSet::new();
    let mut max_pending = 1usize;
    let mut last_host: Option<HostKey> = None;

    loop {
        if engine.stop.is_cancelled() && pending.is_empty() {
            break;
        }

        // GetJob: fill the request window while there is room. A crossed
        // quota stops dispatch but never aborts what is in flight.
        let next = if !engine.stop.is_cancelled()
            && !engine.quota_reached()
            && pending.len() < max_pending
        {
            Some(
                engine
                    .registry
                    .lock()
                    .next_job(bound.as_ref(), Instant::now()),
            )
        } else {
            None
        };

        match next {
            Some(NextJob::Job(job)) => {
                let job = *job;
                bound = Some(job.host.clone());

                // Pacing between consecutive requests to the same host.
                if let Some(wait) = engine.config.wait {
                    if last_host.as_ref() == Some(&job.host) {
                        tokio::time::sleep(jittered(wait, engine.config.random_wait)).await;
                    }
                }
                last_host = Some(job.host.clone());

                let engine_task = Arc::clone(&engine);
                pending.spawn(async move { fetch_job(engine_task, job, id).await });
                continue;
            }
            Some(NextJob::Wait(delay)) if pending.is_empty() => {
                tokio::select! {
                    _ = engine.worker_notify.notified() => {}
                    _ = tokio::time::sleep(delay) => {}
                    _ = engine.stop.cancelled() => {}
                }
                continue;
            }
            Some(NextJob::None) if pending.is_empty() => {
                if bound.take().is_some() {
                    // Bound host drained: rescan all hosts before idling.
                    max_pending = 1;
                    continue;
                }
                tokio::select! {
                    _ = engine.worker_notify.notified() => {}
                    _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    _ = engine.stop.cancelled() => {}
                }
                continue;
            }
            // Window full, host waiting, or stopping: drain a response.
            _ => {}
        }

        if pending.is_empty() {
            // Nothing in flight and nothing dispatchable (quota reached or
            // stop pending): idle until the coordinator decides.
            tokio::select! {
                _ = engine.worker_notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                _ = engine.stop.cancelled() => {}
            }
            continue;
        }

        // GetResponse: receive one response and dispatch the pipeline.
        let Some(joined) = pending.join_next().await else {
            continue;
        };
        match joined {
            Ok((job, Ok(fetched), http2)) => {
                engine.registry.lock().reset_failure(&job.host);

                // Request window for the next round on this connection.
                max_pending = if http2 && engine.config.wait.is_none() && !job.is_part() {
                    engine.config.http2_request_window.max(1)
                } else {
                    1
                };

                response::process(&engine, job, fetched);
                engine.main_notify.notify_one();
            }
            Ok((job, Err(error), _)) => {
                handle_fetch_error(&engine, job, &error);
                bound = None;
                max_pending = 1;
                engine.main_notify.notify_one();
            }
            Err(join_error) => {
                tracing::error!("worker {} task failed: {}", id, join_error);
            }
        }
    }
}

fn jittered(wait: Duration, random: bool) -> Duration {
    if !random {
        return wait;
    }
    // [0.5, 1.5) of the configured wait.
    let ms = wait.as_millis() as u64;
    let jitter = rand::thread_rng().gen_range(0..ms.max(1));
    Duration::from_millis(ms / 2 + jitter)
}

/// Error state: report severity, return work to the host, count the
/// failure (TLS kills the host outright).
fn handle_fetch_error(engine: &Engine, job: Job, error: &FetchError) {
    engine.exit_status.report(error.exit_code());
    engine
        .stats
        .errors
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    tracing::error!("failed to fetch '{}': {}", job.url, error);

    if !error.is_connection_level() {
        // A part assignment is not an open job of its own; put the part
        // back into rotation instead of closing the multi job.
        if let (Some(parts), Some(part_id)) = (&job.parts, job.part_id) {
            parts.release(part_id);
            engine.worker_notify.notify_one();
        } else {
            engine.job_finished();
        }
        return;
    }

    let key = job.host.clone();
    let mut registry = engine.registry.lock();
    registry.release_jobs(&key, vec![job]);

    let dropped = if matches!(error, FetchError::Tls) {
        registry.final_failure(&key)
    } else {
        registry.increase_failure(
            &key,
            engine.config.waitretry,
            engine.config.tries,
            Instant::now(),
        )
    };
    drop(registry);

    // Dropped jobs leave the accounting; released ones will be retried.
    for job in &dropped {
        tracing::debug!("dropping '{}' (host failed)", job.url);
        engine.job_finished();
    }
}

/// Fetch one job. Part jobs rotate through the mirror list, every mirror
/// up to `tries` attempts with waitretry-capped sleeps between rounds.
async fn fetch_job(
    engine: Arc<Engine>,
    job: Job,
    worker_id: usize,
) -> (Job, Result<Fetched, FetchError>, bool) {
    if let (Some(parts), Some(_)) = (&job.parts, job.part_id) {
        let mirrors = parts.metalink.mirrors.clone();
        if mirrors.is_empty() {
            return (
                job,
                Err(FetchError::Network("no download mirrors".into())),
                false,
            );
        }

        let mut index = worker_id % mirrors.len();
        let mut last_error = FetchError::Network("no mirrors tried".into());
        let tries = engine.config.tries.max(1);

        for attempt in 0..tries {
            if attempt > 0 {
                let backoff =
                    Duration::from_secs(u64::from(attempt)).min(engine.config.waitretry);
                tokio::time::sleep(backoff).await;
            }
            if engine.stop.is_cancelled() {
                break;
            }

            for _ in 0..mirrors.len() {
                let mirror = mirrors[index].url.clone();
                index = (index + 1) % mirrors.len();

                match fetch(&engine, &job, &mirror).await {
                    Ok((fetched, http2)) => return (job, Ok(fetched), http2),
                    Err(e) => {
                        tracing::debug!("mirror '{}' failed: {}", mirror, e);
                        last_error = e;
                    }
                }
            }
        }
        (job, Err(last_error), false)
    } else {
        let url = job.url.clone();
        match fetch(&engine, &job, &url).await {
            Ok((fetched, http2)) => (job, Ok(fetched), http2),
            Err(e) => (job, Err(e), false),
        }
    }
}

/// One request/response exchange: send, open the sink at header time,
/// stream the body through it, finalize.
async fn fetch(engine: &Engine, job: &Job, url: &Url) -> Result<(Fetched, bool), FetchError> {
    if job.head_first {
        tracing::info!("checking '{}' ...", url);
    } else if let Some(part) = job.part() {
        tracing::info!(
            "downloading part {}/{} ({}-{}) of '{}' from {}",
            part.id + 1,
            job.parts.as_ref().map(|p| p.part_count()).unwrap_or(0),
            part.position,
            part.position + part.length - 1,
            job.parts.as_ref().map(|p| p.metalink.name.clone()).unwrap_or_default(),
            url.host_str().unwrap_or("?")
        );
    } else {
        tracing::info!("downloading '{}' ...", url);
    }

    let request = engine.client.build_request(&engine.config, job, url);
    let response = tokio::select! {
        r = engine.client.send(request) => r?,
        _ = engine.abort.cancelled() => {
            return Err(FetchError::Network("aborted by signal".into()));
        }
    };

    let http2 = response.version() == reqwest::Version::HTTP_2;
    let meta = build_meta(&response, engine.config.save_headers);
    let headers = build_headers(&response);

    tracing::debug!("HTTP response {} [{}]", meta.status, url);

    let ctx = SinkContext {
        config: &engine.config,
        filters: &engine.filters,
        stats: &engine.stats,
        exit_status: &engine.exit_status,
        save_lock: &engine.save_lock,
    };
    let mut sink = BodySink::open(&ctx, job, &meta)?;

    let mut response = response;
    loop {
        let chunk = tokio::select! {
            c = response.chunk() => c.map_err(FetchError::from_reqwest)?,
            _ = engine.abort.cancelled() => {
                return Err(FetchError::Network("aborted by signal".into()));
            }
        };
        match chunk {
            Some(data) => sink.write_chunk(&data)?,
            None => break,
        }
    }

    let finished = sink.finish(&engine.config, job);
    Ok((
        Fetched {
            meta,
            headers,
            finished,
        },
        http2,
    ))
}

fn build_meta(response: &reqwest::Response, keep_header_text: bool) -> ResponseMeta {
    let headers = response.headers();

    let header_text = keep_header_text.then(|| {
        let mut text = format!("HTTP/1.1 {}\r\n", response.status());
        for (name, value) in headers {
            if let Ok(v) = value.to_str() {
                text.push_str(&format!("{}: {}\r\n", name, v));
            }
        }
        text.push_str("\r\n");
        text
    });

    ResponseMeta {
        status: response.status().as_u16(),
        content_type: header_str(headers, "content-type"),
        content_length: header_str(headers, "content-length").and_then(|v| v.parse().ok()),
        disposition_filename: header_str(headers, "content-disposition")
            .and_then(|v| parse_disposition_filename(&v)),
        last_modified: header_str(headers, "last-modified").and_then(|v| parse_http_date(&v)),
        header_text,
    }
}

fn build_headers(response: &reqwest::Response) -> ResponseHeaders {
    let headers = response.headers();
    ResponseHeaders {
        location: header_str(headers, "location"),
        www_authenticate: header_all(headers, "www-authenticate"),
        proxy_authenticate: header_all(headers, "proxy-authenticate"),
        links: header_all(headers, "link"),
        etag: header_str(headers, "etag"),
        hsts: header_str(headers, "strict-transport-security"),
        hpkp: header_str(headers, "public-key-pins"),
    }
}

fn header_str(headers: &reqwest::header::HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn header_all(headers: &reqwest::header::HeaderMap, name: &str) -> Vec<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok().map(str::to_string))
        .collect()
}

/// `attachment; filename="x.bin"` or the RFC 5987 `filename*=` form.
fn parse_disposition_filename(value: &str) -> Option<String> {
    for param in value.split(';') {
        let param = param.trim();
        if let Some(v) = param.strip_prefix("filename=") {
            let name = v.trim_matches('"').trim();
            if !name.is_empty() {
                // Strip any path the server smuggled in.
                let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
                return Some(base.to_string());
            }
        }
        if let Some(v) = param.strip_prefix("filename*=") {
            let v = v.trim();
            // UTF-8''name form; percent-decoding is the caller's concern.
            if let Some(pos) = v.rfind("''") {
                let name = &v[pos + 2..];
                if !name.is_empty() {
                    return Some(name.to_string());
                }
            }
        }
    }
    None
}

fn parse_http_date(value: &str) -> Option<SystemTime> {
    chrono::DateTime::parse_from_rfc2822(value)
        .ok()
        .map(|dt| SystemTime::from(dt))
}
