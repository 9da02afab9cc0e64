use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::AsyncBufReadExt;

use webgrab::admission::{self, AdmitFlags};
use webgrab::cli::Cli;
use webgrab::config::ForceMode;
use webgrab::convert;
use webgrab::downloader::{self, Engine};
use webgrab::error::ExitCode;
use webgrab::{logging, metalink, parsers, url_utils};

fn main() {
    let cli = Cli::parse_args();
    logging::init(cli.verbosity());

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(ExitCode::ParseInit as i32);
        }
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!("failed to start runtime: {}", e);
            std::process::exit(ExitCode::ParseInit as i32);
        }
    };

    let code = runtime.block_on(run(config));
    std::process::exit(i32::from(code));
}

async fn run(config: webgrab::Config) -> u8 {
    let engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("{}", e);
            return e.exit_code() as u8;
        }
    };

    seed(&engine).await;

    if engine.open_jobs() == 0 && !engine.input_active.load(Ordering::SeqCst) {
        tracing::error!("nothing to do - goodbye");
        return engine.exit_status.get();
    }

    downloader::run(Arc::clone(&engine)).await;

    teardown(&engine);
    engine.exit_status.get()
}

/// Feed the queue from positional URLs, the input file (respecting the
/// force-content modes), or asynchronously from stdin.
async fn seed(engine: &Arc<Engine>) {
    let config = Arc::clone(&engine.config);

    for url in &config.urls {
        admission::queue_seed(engine, &url_utils::normalize_url_for_cli(url));
    }

    let Some(input) = &config.input_file else {
        return;
    };

    if input == "-" && config.force_mode == ForceMode::None {
        // Read URLs asynchronously, admitting each as it arrives.
        engine.input_active.store(true, Ordering::SeqCst);
        let engine = Arc::clone(engine);
        tokio::spawn(async move {
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            let mut lines = stdin.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                admission::queue_seed(&engine, &url_utils::normalize_url_for_cli(line));
            }
            tracing::debug!("input closed");
            engine.input_active.store(false, Ordering::SeqCst);
            engine.main_notify.notify_one();
        });
        return;
    }

    let data = if input == "-" {
        let mut buf = String::new();
        use tokio::io::AsyncReadExt;
        if tokio::io::stdin().read_to_string(&mut buf).await.is_err() {
            tracing::error!("failed to read stdin");
            engine.exit_status.report(ExitCode::Io);
            return;
        }
        buf
    } else {
        match std::fs::read_to_string(input) {
            Ok(data) => data,
            Err(e) => {
                tracing::error!("failed to open input file {}: {}", input, e);
                engine.exit_status.report(ExitCode::Io);
                return;
            }
        }
    };

    seed_from_document(engine, &data);
}

/// Interpret an input document per the force-content mode. The default is
/// one URL per line.
fn seed_from_document(engine: &Arc<Engine>, data: &str) {
    let config = &engine.config;
    let base = config
        .base
        .as_deref()
        .and_then(|b| url::Url::parse(b).ok());

    let admit_literal = |literal: &str| {
        let resolved = match &base {
            Some(base) => base
                .join(literal)
                .map(|u| u.to_string())
                .unwrap_or_else(|_| literal.to_string()),
            None => literal.to_string(),
        };
        admission::admit(engine, None, &resolved, AdmitFlags::default());
    };

    match config.force_mode {
        ForceMode::Html => {
            let parsed = parsers::html::parse(data);
            for url in &parsed.urls {
                admit_literal(&url.literal);
            }
        }
        ForceMode::Css => {
            for url in parsers::css::parse(data).urls {
                admit_literal(&url.literal);
            }
        }
        ForceMode::Sitemap => {
            let urls = parsers::sitemap::parse_xml(data.as_bytes(), base.as_ref());
            for url in urls.pages {
                admission::admit(engine, None, &url, AdmitFlags::default());
            }
            for url in urls.sitemaps {
                admission::admit(
                    engine,
                    None,
                    &url,
                    AdmitFlags {
                        sitemap: true,
                        ..AdmitFlags::default()
                    },
                );
            }
        }
        ForceMode::Atom => {
            for url in parsers::feed::parse_atom(data) {
                admit_literal(&url);
            }
        }
        ForceMode::Rss => {
            for url in parsers::feed::parse_rss(data) {
                admit_literal(&url);
            }
        }
        ForceMode::Metalink => match metalink::parse(data) {
            Some(descriptor) => admission::queue_metalink(engine, descriptor),
            None => {
                tracing::error!("invalid metalink input");
                engine.exit_status.report(ExitCode::ParseInit);
            }
        },
        ForceMode::None => {
            for line in data.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                admission::queue_seed(engine, &url_utils::normalize_url_for_cli(line));
            }
        }
    }
}

/// End of run: persist dirty protocol caches, run link conversion, report
/// statistics.
fn teardown(engine: &Arc<Engine>) {
    let config = &engine.config;

    if config.hsts && engine.hsts.changed() {
        if let Some(path) = &config.hsts_file {
            if let Err(e) = engine.hsts.save(path) {
                tracing::error!("failed to save HSTS cache: {}", e);
            }
        }
    }
    if config.hpkp && engine.hpkp.changed() {
        if let Some(path) = &config.hpkp_file {
            if let Err(e) = engine.hpkp.save(path) {
                tracing::error!("failed to save HPKP cache: {}", e);
            }
        }
    }

    if config.delete_after {
        if let Some(out) = &config.output_document {
            if out != "-" {
                let _ = std::fs::remove_file(out);
            }
        }
    }

    if config.convert_links && !config.delete_after {
        convert::convert_all(config, &engine.conversions);
    }

    let snapshot = engine.stats.snapshot();
    if config.stats {
        snapshot.write_to(config.stats_format, config.stats_file.as_deref());
    } else if config.recursive || config.input_file.is_some() {
        tracing::info!(
            "downloaded: {} files, {} bytes, {} redirects, {} errors",
            snapshot.downloads,
            snapshot.total_bytes,
            snapshot.redirects,
            snapshot.errors
        );
    }
}
