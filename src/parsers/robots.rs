//! robots.txt body parsing into a host policy.
//!
//! Allow/deny matching is delegated to the `robotstxt` matcher against the
//! stored body; sitemap declarations are extracted here since the matcher
//! does not surface them.

use crate::host::RobotsPolicy;

pub fn parse(body: &str) -> RobotsPolicy {
    let sitemaps = body
        .lines()
        .filter_map(|line| {
            let line = line.trim();
            let (key, value) = line.split_once(':')?;
            if key.trim().eq_ignore_ascii_case("sitemap") {
                let value = value.trim();
                (!value.is_empty()).then(|| value.to_string())
            } else {
                None
            }
        })
        .collect();

    RobotsPolicy {
        body: body.to_string(),
        sitemaps,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sitemap_extraction() {
        let body = "User-agent: *\n\
                    Disallow: /secret/\n\
                    Sitemap: http://test.local/sitemap.xml\n\
                    sitemap: http://test.local/sitemap2.xml\n";
        let policy = parse(body);
        assert_eq!(
            policy.sitemaps,
            vec![
                "http://test.local/sitemap.xml",
                "http://test.local/sitemap2.xml"
            ]
        );
    }

    #[test]
    fn test_policy_matching_through_body() {
        let policy = parse("User-agent: *\nDisallow: /secret/\n");
        assert!(!policy.allows("webgrab", "http://test.local/secret/x"));
        assert!(policy.allows("webgrab", "http://test.local/open"));
    }

    #[test]
    fn test_empty_body() {
        let policy = parse("");
        assert!(policy.sitemaps.is_empty());
        assert!(policy.allows("webgrab", "http://test.local/anything"));
    }
}
