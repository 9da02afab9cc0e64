//! HTTP client construction and per-job request building.
//!
//! One shared `reqwest` client carries the connection pool, TLS state and
//! cookie jar for every worker. Redirect following is disabled: the engine
//! re-admits Location targets itself so redirect policy stays in one place.

use std::sync::Arc;
use std::time::Duration;

use reqwest::cookie::Jar;
use reqwest::{Client, Method, RequestBuilder, Response};
use url::Url;

use crate::auth;
use crate::config::Config;
use crate::error::ExitCode;
use crate::job::Job;

#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    pub jar: Arc<Jar>,
}

impl HttpClient {
    pub fn new(config: &Config) -> Result<Self, FetchError> {
        let jar = Arc::new(Jar::default());

        let mut builder = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .tcp_nodelay(true)
            .http2_adaptive_window(true)
            // The engine decides how redirects are followed.
            .redirect(reqwest::redirect::Policy::none());

        if let Some(t) = config.connect_timeout {
            builder = builder.connect_timeout(t);
        }
        if let Some(t) = config.read_timeout {
            builder = builder.read_timeout(t);
        }
        if config.cookies {
            builder = builder.cookie_provider(Arc::clone(&jar));
        }
        if !config.check_certificate {
            builder = builder.danger_accept_invalid_certs(true);
        }
        if !config.keep_alive {
            builder = builder.pool_max_idle_per_host(0);
        }

        let client = builder
            .build()
            .map_err(|e| FetchError::ClientBuild(e.to_string()))?;

        Ok(Self { client, jar })
    }

    /// Build the request for a job: method, conditional headers, ranges,
    /// authorization, and the user's extra headers.
    pub fn build_request(&self, config: &Config, job: &Job, url: &Url) -> RequestBuilder {
        let method = if job.head_first {
            Method::HEAD
        } else if config.post_data.is_some() || config.post_file.is_some() {
            Method::POST
        } else {
            Method::GET
        };

        let mut req = self
            .client
            .request(method.clone(), url.clone())
            .header(
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            );

        if !config.cache {
            req = req.header("Pragma", "no-cache");
        }

        // Continuation and timestamping both key off the local file.
        if (config.continue_download || config.timestamping) && !job.is_part() {
            if let Some(path) = &job.local_path {
                if config.continue_download {
                    if let Ok(meta) = std::fs::metadata(path) {
                        if meta.len() > 0 {
                            req = req.header("Range", format!("bytes={}-", meta.len()));
                        }
                    }
                }
                if config.timestamping {
                    if let Ok(modified) = std::fs::metadata(path).and_then(|m| m.modified()) {
                        let when: chrono::DateTime<chrono::Utc> = modified.into();
                        req = req.header("If-Modified-Since", when.to_rfc2822());
                    }
                }
            }
        }

        if let Some(part) = job.part() {
            req = req.header(
                "Range",
                format!("bytes={}-{}", part.position, part.position + part.length - 1),
            );
        }

        if let Some(referer) = config.referer.as_deref() {
            req = req.header("Referer", referer);
        } else if let Some(referer) = &job.referer {
            req = req.header("Referer", referer.as_str());
        }

        if let Some(challenge) = auth::select_challenge(&job.challenges) {
            let user = config.http_username.as_deref().unwrap_or("");
            let pass = config.http_password.as_deref().unwrap_or("");
            if let Some(value) =
                auth::authorization_value(challenge, user, pass, method.as_str(), url.path())
            {
                req = req.header("Authorization", value);
            }
        } else if let Some(challenge) = auth::select_challenge(&job.proxy_challenges) {
            let user = config.http_proxy_username.as_deref().unwrap_or("");
            let pass = config.http_proxy_password.as_deref().unwrap_or("");
            if let Some(value) =
                auth::authorization_value(challenge, user, pass, method.as_str(), url.path())
            {
                req = req.header("Proxy-Authorization", value);
            }
        }

        for (name, value) in &config.headers {
            req = req.header(name.as_str(), value.as_str());
        }

        if let Some(data) = &config.post_data {
            req = req
                .header("Content-Type", "application/x-www-form-urlencoded")
                .body(data.clone());
        } else if let Some(path) = &config.post_file {
            if let Ok(data) = std::fs::read(path) {
                req = req
                    .header("Content-Type", "application/x-www-form-urlencoded")
                    .body(data);
            }
        }

        req
    }

    pub async fn send(&self, req: RequestBuilder) -> Result<Response, FetchError> {
        req.send().await.map_err(FetchError::from_reqwest)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),

    #[error("connection refused")]
    ConnectionRefused,

    #[error("DNS resolution failed")]
    Dns,

    #[error("request timeout")]
    Timeout,

    #[error("TLS handshake or certificate failure")]
    Tls,

    #[error("failed to read response body: {0}")]
    Body(String),

    #[error("failed to build HTTP client: {0}")]
    ClientBuild(String),

    #[error("local I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl FetchError {
    pub fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return FetchError::Timeout;
        }

        let msg = error.to_string().to_lowercase();

        if msg.contains("certificate") || msg.contains("ssl") || msg.contains("tls") {
            return FetchError::Tls;
        }

        if error.is_connect() {
            if msg.contains("connection refused") {
                return FetchError::ConnectionRefused;
            }
            if msg.contains("dns") || msg.contains("name resolution") || msg.contains("no such host")
            {
                return FetchError::Dns;
            }
        }

        if error.is_body() || error.is_decode() {
            return FetchError::Body(error.to_string());
        }

        FetchError::Network(error.to_string())
    }

    /// Exit rank this failure reports into the shared status cell.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            FetchError::Tls => ExitCode::Tls,
            FetchError::Io(_) => ExitCode::Io,
            FetchError::ClientBuild(_) => ExitCode::ParseInit,
            _ => ExitCode::Network,
        }
    }

    /// Connection-level failures abort the worker's host binding and return
    /// its jobs to the queue; response-level failures only fail the one job.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            FetchError::Network(_)
                | FetchError::ConnectionRefused
                | FetchError::Dns
                | FetchError::Timeout
                | FetchError::Tls
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::HostKey;

    fn client_and_config() -> (HttpClient, Config) {
        let config = Config::default();
        (HttpClient::new(&config).unwrap(), config)
    }

    fn job_for(url: &str) -> Job {
        let url = Url::parse(url).unwrap();
        let host = HostKey::from_url(&url).unwrap();
        Job::new(url, host)
    }

    #[test]
    fn test_head_first_builds_head_request() {
        let (client, config) = client_and_config();
        let mut job = job_for("http://test.local/x");
        job.head_first = true;
        let req = client
            .build_request(&config, &job, &job.url.clone())
            .build()
            .unwrap();
        assert_eq!(req.method(), Method::HEAD);
    }

    #[test]
    fn test_part_job_gets_range_header() {
        let (client, config) = client_and_config();
        let mut job = job_for("http://test.local/big");
        let metalink = crate::metalink::Metalink::synthetic(
            job.url.clone(),
            "big",
            3000,
            1024,
        );
        job.parts = Some(std::sync::Arc::new(crate::job::PartSet::new(
            metalink,
            "big".into(),
            &[],
        )));
        job.part_id = Some(1);

        let req = client
            .build_request(&config, &job, &job.url.clone())
            .build()
            .unwrap();
        assert_eq!(
            req.headers().get("Range").unwrap().to_str().unwrap(),
            "bytes=1024-2047"
        );
    }

    #[test]
    fn test_referer_from_job() {
        let (client, config) = client_and_config();
        let mut job = job_for("http://test.local/page");
        job.referer = Some(Url::parse("http://test.local/").unwrap());
        let req = client
            .build_request(&config, &job, &job.url.clone())
            .build()
            .unwrap();
        assert_eq!(
            req.headers().get("Referer").unwrap().to_str().unwrap(),
            "http://test.local/"
        );
    }

    #[test]
    fn test_proxy_challenge_builds_proxy_authorization() {
        let (client, mut config) = client_and_config();
        config.http_proxy_username = Some("puser".to_string());
        config.http_proxy_password = Some("ppass".to_string());

        let mut job = job_for("http://test.local/behind-proxy");
        job.proxy_challenges = auth::parse_challenges(&["Basic realm=\"proxy\"".to_string()]);

        let req = client
            .build_request(&config, &job, &job.url.clone())
            .build()
            .unwrap();
        // base64("puser:ppass")
        assert_eq!(
            req.headers().get("Proxy-Authorization").unwrap().to_str().unwrap(),
            "Basic cHVzZXI6cHBhc3M="
        );
        assert!(req.headers().get("Authorization").is_none());
    }

    #[test]
    fn test_server_challenge_takes_precedence_over_proxy() {
        let (client, mut config) = client_and_config();
        config.http_username = Some("user".to_string());
        config.http_password = Some("pass".to_string());
        config.http_proxy_username = Some("puser".to_string());
        config.http_proxy_password = Some("ppass".to_string());

        let mut job = job_for("http://test.local/x");
        job.challenges = auth::parse_challenges(&["Basic realm=\"r\"".to_string()]);
        job.proxy_challenges = auth::parse_challenges(&["Basic realm=\"proxy\"".to_string()]);

        let req = client
            .build_request(&config, &job, &job.url.clone())
            .build()
            .unwrap();
        assert!(req.headers().get("Authorization").is_some());
        assert!(req.headers().get("Proxy-Authorization").is_none());
    }

    #[test]
    fn test_user_headers_applied() {
        let (client, mut config) = client_and_config();
        config.headers.push(("X-Custom".to_string(), "1".to_string()));
        let job = job_for("http://test.local/");
        let req = client
            .build_request(&config, &job, &job.url.clone())
            .build()
            .unwrap();
        assert_eq!(req.headers().get("X-Custom").unwrap(), "1");
    }

    #[test]
    fn test_connection_level_classification() {
        assert!(FetchError::Timeout.is_connection_level());
        assert!(FetchError::Tls.is_connection_level());
        assert!(!FetchError::Body("short read".into()).is_connection_level());
        assert_eq!(FetchError::Tls.exit_code(), ExitCode::Tls);
        assert_eq!(FetchError::Dns.exit_code(), ExitCode::Network);
    }
}
