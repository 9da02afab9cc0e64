//! Accept/reject pattern and regex filters.
//!
//! A pattern containing any of `*?[]` is matched as a shell glob against the
//! whole string; any other pattern is a tail (suffix) match. Both behaviors
//! are intentional and long-standing, so both are kept: `-A "*.html"` globs,
//! `-A .html` tail-matches.

use regex::{Regex, RegexBuilder};

use crate::config::Config;
use crate::error::GrabError;

/// Compiled accept/reject state, built once from the config.
#[derive(Debug, Default)]
pub struct Filters {
    accept_patterns: Vec<String>,
    reject_patterns: Vec<String>,
    accept_regex: Option<Regex>,
    reject_regex: Option<Regex>,
    ignore_case: bool,
}

impl Filters {
    pub fn from_config(config: &Config) -> Result<Self, GrabError> {
        let compile = |pattern: &str| -> Result<Regex, GrabError> {
            RegexBuilder::new(pattern)
                .case_insensitive(config.ignore_case)
                .build()
                .map_err(|e| GrabError::Init(format!("invalid regex '{}': {}", pattern, e)))
        };

        Ok(Self {
            accept_patterns: config.accept_patterns.clone(),
            reject_patterns: config.reject_patterns.clone(),
            accept_regex: config.accept_regex.as_deref().map(compile).transpose()?,
            reject_regex: config.reject_regex.as_deref().map(compile).transpose()?,
            ignore_case: config.ignore_case,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.accept_patterns.is_empty()
            && self.reject_patterns.is_empty()
            && self.accept_regex.is_none()
            && self.reject_regex.is_none()
    }

    /// True when `name` fails an accept rule or matches a reject rule.
    /// Short-circuits on the first decisive list.
    pub fn rejects(&self, name: &str) -> bool {
        if !self.accept_patterns.is_empty()
            && !in_pattern_list(&self.accept_patterns, name, self.ignore_case)
        {
            return true;
        }
        if let Some(re) = &self.accept_regex {
            if !re.is_match(name) {
                return true;
            }
        }
        if !self.reject_patterns.is_empty()
            && in_pattern_list(&self.reject_patterns, name, self.ignore_case)
        {
            return true;
        }
        if let Some(re) = &self.reject_regex {
            if re.is_match(name) {
                return true;
            }
        }
        false
    }
}

/// First-match scan over a pattern list. Glob patterns match the whole
/// string, plain patterns tail-match.
pub fn in_pattern_list(patterns: &[String], name: &str, ignore_case: bool) -> bool {
    patterns.iter().any(|pattern| {
        if pattern.bytes().any(|b| matches!(b, b'*' | b'?' | b'[' | b']')) {
            glob_match(pattern, name, ignore_case)
        } else if ignore_case {
            name.to_lowercase().ends_with(&pattern.to_lowercase())
        } else {
            name.ends_with(pattern.as_str())
        }
    })
}

/// Hostname pattern list: same glob-or-tail rule, never case-folded
/// (hostnames are already lowercase).
pub fn in_host_pattern_list(patterns: &[String], hostname: &str) -> bool {
    patterns.iter().any(|pattern| {
        if pattern.bytes().any(|b| matches!(b, b'*' | b'?' | b'[' | b']')) {
            glob_match(pattern, hostname, false)
        } else {
            // `example.com` matches itself and any subdomain of it.
            hostname == pattern || hostname.ends_with(&format!(".{}", pattern))
        }
    })
}

/// Minimal fnmatch-style glob: `*` any run, `?` one char, `[...]` classes
/// with leading `!` negation and `a-z` ranges.
pub fn glob_match(pattern: &str, name: &str, ignore_case: bool) -> bool {
    let (p, n): (Vec<char>, Vec<char>) = if ignore_case {
        (
            pattern.to_lowercase().chars().collect(),
            name.to_lowercase().chars().collect(),
        )
    } else {
        (pattern.chars().collect(), name.chars().collect())
    };
    glob_inner(&p, &n)
}

fn glob_inner(pattern: &[char], name: &[char]) -> bool {
    if pattern.is_empty() {
        return name.is_empty();
    }

    match pattern[0] {
        '*' => {
            // Try every possible span for the star, shortest first.
            for skip in 0..=name.len() {
                if glob_inner(&pattern[1..], &name[skip..]) {
                    return true;
                }
            }
            false
        }
        '?' => !name.is_empty() && glob_inner(&pattern[1..], &name[1..]),
        '[' => {
            let Some(close) = pattern.iter().position(|&c| c == ']') else {
                // Unterminated class: treat '[' literally.
                return !name.is_empty()
                    && name[0] == '['
                    && glob_inner(&pattern[1..], &name[1..]);
            };
            if name.is_empty() {
                return false;
            }
            let class = &pattern[1..close];
            let (negated, class) = match class.first() {
                Some('!') | Some('^') => (true, &class[1..]),
                _ => (false, class),
            };
            if class_matches(class, name[0]) != negated {
                glob_inner(&pattern[close + 1..], &name[1..])
            } else {
                false
            }
        }
        c => !name.is_empty() && name[0] == c && glob_inner(&pattern[1..], &name[1..]),
    }
}

fn class_matches(class: &[char], c: char) -> bool {
    let mut i = 0;
    while i < class.len() {
        if i + 2 < class.len() && class[i + 1] == '-' {
            if class[i] <= c && c <= class[i + 2] {
                return true;
            }
            i += 3;
        } else {
            if class[i] == c {
                return true;
            }
            i += 1;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn patterns(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*.html", "index.html", false));
        assert!(glob_match("*.html", "/deep/dir/page.html", false));
        assert!(!glob_match("*.html", "style.css", false));
        assert!(glob_match("file-?.txt", "file-1.txt", false));
        assert!(!glob_match("file-?.txt", "file-10.txt", false));
        assert!(glob_match("img[0-9].png", "img7.png", false));
        assert!(!glob_match("img[!0-9].png", "img7.png", false));
        assert!(glob_match("*.HTML", "page.html", true));
    }

    #[test]
    fn test_tail_match_when_no_metachars() {
        let list = patterns(&[".jpg", ".png"]);
        assert!(in_pattern_list(&list, "http://test.local/a/photo.jpg", false));
        assert!(!in_pattern_list(&list, "http://test.local/a/page.html", false));
    }

    #[test]
    fn test_host_pattern_list() {
        let list = patterns(&["example.com", "*.cdn.net"]);
        assert!(in_host_pattern_list(&list, "example.com"));
        assert!(in_host_pattern_list(&list, "www.example.com"));
        assert!(!in_host_pattern_list(&list, "notexample.com"));
        assert!(in_host_pattern_list(&list, "img.cdn.net"));
        assert!(!in_host_pattern_list(&list, "cdn.net"));
    }

    #[test]
    fn test_filters_accept_reject() {
        let mut config = Config::default();
        config.accept_patterns = patterns(&["*.html", "*.css"]);
        config.reject_patterns = patterns(&["*private*"]);
        let filters = Filters::from_config(&config).unwrap();

        assert!(!filters.rejects("site/index.html"));
        assert!(!filters.rejects("site/style.css"));
        assert!(filters.rejects("site/archive.zip"));
        assert!(filters.rejects("site/private/data.html"));
    }

    #[test]
    fn test_filters_regex() {
        let mut config = Config::default();
        config.reject_regex = Some(r"/tmp/|\.bak$".to_string());
        let filters = Filters::from_config(&config).unwrap();

        assert!(filters.rejects("host/tmp/file.html"));
        assert!(filters.rejects("host/old.bak"));
        assert!(!filters.rejects("host/index.html"));
    }

    #[test]
    fn test_bad_regex_is_init_error() {
        let mut config = Config::default();
        config.accept_regex = Some("[unclosed".to_string());
        assert!(Filters::from_config(&config).is_err());
    }
}
