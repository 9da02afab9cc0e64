//! Cookie file preloading.
//!
//! Live cookie handling (store on response, attach on request) is the
//! client's cookie jar; this module only translates a Netscape-format
//! cookies.txt into jar entries at startup.

use std::path::Path;
use std::sync::Arc;

use reqwest::cookie::Jar;
use url::Url;

/// Load a Netscape-format cookie file into the jar. Malformed lines are
/// skipped with a debug line; a missing file is not an error.
pub fn load_cookie_file(jar: &Arc<Jar>, path: &Path) -> std::io::Result<usize> {
    let data = match std::fs::read_to_string(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut loaded = 0;
    for line in data.lines() {
        let line = line.trim();
        // `#HttpOnly_` prefixed entries are real cookies, plain # is comment.
        let (http_only, line) = match line.strip_prefix("#HttpOnly_") {
            Some(rest) => (true, rest),
            None => (false, line),
        };
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // domain \t include_subdomains \t path \t secure \t expires \t name \t value
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() != 7 {
            tracing::debug!("skipping malformed cookie line: {}", line);
            continue;
        }
        let domain = fields[0].trim_start_matches('.');
        let path = fields[2];
        let secure = fields[3].eq_ignore_ascii_case("TRUE");
        let name = fields[5];
        let value = fields[6];

        let scheme = if secure { "https" } else { "http" };
        let Ok(url) = Url::parse(&format!("{}://{}/", scheme, domain)) else {
            tracing::debug!("skipping cookie with bad domain: {}", domain);
            continue;
        };

        let mut cookie = format!("{}={}; Domain={}; Path={}", name, value, domain, path);
        if secure {
            cookie.push_str("; Secure");
        }
        if http_only {
            cookie.push_str("; HttpOnly");
        }
        jar.add_cookie_str(&cookie, &url);
        loaded += 1;
    }

    Ok(loaded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_netscape_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.txt");
        std::fs::write(
            &path,
            "# Netscape HTTP Cookie File\n\
             .test.local\tTRUE\t/\tFALSE\t0\tsession\tabc123\n\
             #HttpOnly_.test.local\tTRUE\t/\tFALSE\t0\ttoken\txyz\n\
             malformed line without tabs\n",
        )
        .unwrap();

        let jar = Arc::new(Jar::default());
        let loaded = load_cookie_file(&jar, &path).unwrap();
        assert_eq!(loaded, 2);
    }

    #[test]
    fn test_missing_file_is_ok() {
        let jar = Arc::new(Jar::default());
        assert_eq!(
            load_cookie_file(&jar, Path::new("/nonexistent/cookies.txt")).unwrap(),
            0
        );
    }
}
