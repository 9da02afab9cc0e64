//! Content parsers and the content-kind classification they hang off.

pub mod css;
pub mod feed;
pub mod html;
pub mod robots;
pub mod sitemap;

/// Closed set of content kinds the response pipeline can fan out to.
/// Content-type strings are normalized once, here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Html,
    Css,
    Atom,
    Rss,
    SitemapXml,
    SitemapGz,
    SitemapText,
    Metalink,
    Other,
}

/// Strip parameters and whitespace from a Content-Type header value.
pub fn normalize_content_type(value: &str) -> String {
    value
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase()
}

/// Map a normalized content type onto a parser. Sitemap kinds apply only to
/// sitemap jobs (`is_sitemap`), mirroring how the queue tagged them.
pub fn classify(content_type: &str, is_sitemap: bool) -> ContentKind {
    let ct = normalize_content_type(content_type);
    match ct.as_str() {
        "text/html" | "application/xhtml+xml" => ContentKind::Html,
        "text/css" => ContentKind::Css,
        "application/atom+xml" => ContentKind::Atom,
        "application/rss+xml" => ContentKind::Rss,
        "application/metalink4+xml" | "application/metalink+xml" => ContentKind::Metalink,
        "application/xml" | "text/xml" if is_sitemap => ContentKind::SitemapXml,
        "application/x-gzip" | "application/gzip" if is_sitemap => ContentKind::SitemapGz,
        "text/plain" if is_sitemap => ContentKind::SitemapText,
        _ => ContentKind::Other,
    }
}

/// Whether a HEAD probe of this type warrants a follow-up GET for parsing.
pub fn is_parseable(content_type: &str, is_sitemap: bool) -> bool {
    classify(content_type, is_sitemap) != ContentKind::Other
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_content_type() {
        assert_eq!(normalize_content_type("Text/HTML; charset=utf-8"), "text/html");
        assert_eq!(normalize_content_type("  application/xml "), "application/xml");
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify("text/html; charset=utf-8", false), ContentKind::Html);
        assert_eq!(classify("application/xhtml+xml", false), ContentKind::Html);
        assert_eq!(classify("text/css", false), ContentKind::Css);
        assert_eq!(classify("application/metalink4+xml", false), ContentKind::Metalink);
        assert_eq!(classify("image/png", false), ContentKind::Other);
    }

    #[test]
    fn test_sitemap_kinds_require_sitemap_job() {
        assert_eq!(classify("application/xml", true), ContentKind::SitemapXml);
        assert_eq!(classify("application/xml", false), ContentKind::Other);
        assert_eq!(classify("application/x-gzip", true), ContentKind::SitemapGz);
        assert_eq!(classify("text/plain", true), ContentKind::SitemapText);
        assert_eq!(classify("text/plain", false), ContentKind::Other);
    }
}
