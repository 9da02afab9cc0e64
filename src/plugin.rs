//! URL interception hooks.
//!
//! Admission forwards every candidate URL through the registered plugins
//! before any filtering; a plugin may wave it through, veto it, substitute
//! an alternate URL or local filename, or force-accept it past the pattern
//! filters. Downloaded files are forwarded after retrieval completes.

use std::path::{Path, PathBuf};

use url::Url;

/// A plugin's decision about one candidate URL.
#[derive(Debug, Default)]
pub struct UrlVerdict {
    /// Drop the URL entirely.
    pub reject: bool,
    /// Skip accept/reject pattern checks for this URL.
    pub accept: bool,
    /// Continue admission with this URL instead.
    pub alt_url: Option<Url>,
    /// Save to this path instead of the derived filename.
    pub alt_local_filename: Option<PathBuf>,
}

pub trait UrlPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Inspect a URL before admission. Default: no opinion.
    fn forward_url(&self, _url: &Url) -> UrlVerdict {
        UrlVerdict::default()
    }

    /// Observe a completed download. Default: ignore.
    fn downloaded_file(&self, _url: &Url, _path: Option<&Path>, _size: u64) {}
}

/// The registered plugin chain. Verdicts compose left to right; the first
/// rejection wins, later substitutions override earlier ones.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn UrlPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Box<dyn UrlPlugin>) {
        tracing::debug!("registered plugin '{}'", plugin.name());
        self.plugins.push(plugin);
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn forward_url(&self, url: &Url) -> UrlVerdict {
        let mut combined = UrlVerdict::default();
        for plugin in &self.plugins {
            let verdict = plugin.forward_url(combined.alt_url.as_ref().unwrap_or(url));
            if verdict.reject {
                combined.reject = true;
                return combined;
            }
            combined.accept |= verdict.accept;
            if verdict.alt_url.is_some() {
                combined.alt_url = verdict.alt_url;
            }
            if verdict.alt_local_filename.is_some() {
                combined.alt_local_filename = verdict.alt_local_filename;
            }
        }
        combined
    }

    pub fn downloaded_file(&self, url: &Url, path: Option<&Path>, size: u64) {
        for plugin in &self.plugins {
            plugin.downloaded_file(url, path, size);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RejectPrivate;

    impl UrlPlugin for RejectPrivate {
        fn name(&self) -> &str {
            "reject-private"
        }

        fn forward_url(&self, url: &Url) -> UrlVerdict {
            UrlVerdict {
                reject: url.path().starts_with("/private/"),
                ..UrlVerdict::default()
            }
        }
    }

    struct RewriteHost;

    impl UrlPlugin for RewriteHost {
        fn name(&self) -> &str {
            "rewrite-host"
        }

        fn forward_url(&self, url: &Url) -> UrlVerdict {
            let mut verdict = UrlVerdict::default();
            if url.host_str() == Some("old.local") {
                let mut alt = url.clone();
                alt.set_host(Some("new.local")).unwrap();
                verdict.alt_url = Some(alt);
            }
            verdict
        }
    }

    #[test]
    fn test_reject_wins() {
        let mut registry = PluginRegistry::new();
        registry.register(Box::new(RejectPrivate));

        let verdict = registry.forward_url(&Url::parse("http://a.local/private/x").unwrap());
        assert!(verdict.reject);
        let verdict = registry.forward_url(&Url::parse("http://a.local/public/x").unwrap());
        assert!(!verdict.reject);
    }

    #[test]
    fn test_alt_url_threads_through_chain() {
        let mut registry = PluginRegistry::new();
        registry.register(Box::new(RewriteHost));
        registry.register(Box::new(RejectPrivate));

        let verdict = registry.forward_url(&Url::parse("http://old.local/page").unwrap());
        assert_eq!(verdict.alt_url.unwrap().host_str(), Some("new.local"));
    }
}
