//! URL helper functions used throughout the retriever.

use url::Url;

/// Parse a URL string, resolving it against an optional base.
/// Only absolute http(s) results are meaningful to the engine; scheme
/// filtering happens in admission, not here.
pub fn parse_with_base(base: Option<&Url>, url: &str) -> Option<Url> {
    let trimmed = url.trim();
    if trimmed.is_empty() {
        return None;
    }

    match base {
        Some(b) => b.join(trimmed).ok(),
        None => Url::parse(trimmed).ok(),
    }
}

/// Remove the fragment portion and normalize the string form.
pub fn normalize(mut url: Url) -> Url {
    url.set_fragment(None);
    url
}

/// Effective port of a URL (scheme default when not given).
pub fn effective_port(url: &Url) -> u16 {
    url.port_or_known_default().unwrap_or(0)
}

/// Length of the directory part of `path`, including the trailing slash.
/// `/a/b/c.html` -> 5 (`/a/b/`); `/x` -> 1; no slash -> 0.
pub fn dir_prefix_len(path: &str) -> usize {
    match path.rfind('/') {
        Some(pos) => pos + 1,
        None => 0,
    }
}

/// Whether `path` lies inside the directory identified by `parent_path`'s
/// directory prefix (the no-parent rule).
pub fn path_within_parent(parent_path: &str, path: &str) -> bool {
    let dirlen = dir_prefix_len(parent_path);
    dirlen == 0 || path.len() >= dirlen && path[..dirlen] == parent_path[..dirlen]
}

/// Build the robots.txt URL for a host, keeping scheme and port.
pub fn robots_url(url: &Url) -> Option<Url> {
    let mut robots = url.clone();
    robots.set_path("/robots.txt");
    robots.set_query(None);
    robots.set_fragment(None);
    Some(robots)
}

/// Whether the URL host is a literal IP address (HSTS/HPKP never apply).
pub fn host_is_ip(url: &Url) -> bool {
    matches!(
        url.host(),
        Some(url::Host::Ipv4(_)) | Some(url::Host::Ipv6(_))
    )
}

/// Directory-prefix string of a URL: scheme://host[:port]/dir/.
/// Used to scope sitemap URLs to their own location.
pub fn location_prefix(url: &Url) -> String {
    let s = url.as_str();
    match s.rfind('/') {
        Some(pos) if pos >= url.scheme().len() + 3 => s[..pos + 1].to_string(),
        _ => s.to_string(),
    }
}

/// Normalize CLI input by adding http:// when no scheme is provided.
pub fn normalize_url_for_cli(url: &str) -> String {
    let trimmed = url.trim();

    if trimmed.contains("://") {
        return trimmed.to_string();
    }

    format!("http://{}", trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_with_base() {
        let base = Url::parse("https://test.local/dir/page.html").unwrap();
        assert_eq!(
            parse_with_base(Some(&base), "/x").unwrap().as_str(),
            "https://test.local/x"
        );
        assert_eq!(
            parse_with_base(Some(&base), "y").unwrap().as_str(),
            "https://test.local/dir/y"
        );
        assert_eq!(
            parse_with_base(None, "http://other.local/z").unwrap().as_str(),
            "http://other.local/z"
        );
        assert!(parse_with_base(None, "no-scheme").is_none());
    }

    #[test]
    fn test_normalize_strips_fragment() {
        let url = Url::parse("https://test.local/page#frag").unwrap();
        assert_eq!(normalize(url).as_str(), "https://test.local/page");
    }

    #[test]
    fn test_dir_prefix_len() {
        assert_eq!(dir_prefix_len("/a/b/c.html"), 5);
        assert_eq!(dir_prefix_len("/x"), 1);
        assert_eq!(dir_prefix_len("nope"), 0);
    }

    #[test]
    fn test_path_within_parent() {
        assert!(path_within_parent("/docs/index.html", "/docs/sub/page.html"));
        assert!(!path_within_parent("/docs/index.html", "/other/page.html"));
        assert!(path_within_parent("noslash", "/anything"));
    }

    #[test]
    fn test_robots_url() {
        let url = Url::parse("https://test.local:8443/some/path?q=1").unwrap();
        assert_eq!(
            robots_url(&url).unwrap().as_str(),
            "https://test.local:8443/robots.txt"
        );
    }

    #[test]
    fn test_host_is_ip() {
        assert!(host_is_ip(&Url::parse("http://127.0.0.1/").unwrap()));
        assert!(host_is_ip(&Url::parse("http://[::1]/").unwrap()));
        assert!(!host_is_ip(&Url::parse("http://test.local/").unwrap()));
    }

    #[test]
    fn test_location_prefix() {
        let url = Url::parse("https://test.local/catalog/sitemap.xml").unwrap();
        assert_eq!(location_prefix(&url), "https://test.local/catalog/");
    }

    #[test]
    fn test_normalize_url_for_cli() {
        assert_eq!(normalize_url_for_cli("test.local"), "http://test.local");
        assert_eq!(
            normalize_url_for_cli("https://test.local"),
            "https://test.local"
        );
    }
}
