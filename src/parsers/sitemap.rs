//! Sitemap parsing: XML (plain or gzipped) and line-oriented text.
//!
//! Per the sitemaps protocol, a sitemap at `.../catalog/sitemap.xml` may
//! only name URLs under `.../catalog/`; entries outside that location are
//! dropped here.

use std::io::Cursor;
use std::io::Read;

use flate2::read::MultiGzDecoder;
use sitemap::reader::{SiteMapEntity, SiteMapReader};
use url::Url;

use crate::url_utils;

/// URLs extracted from a sitemap, split into page entries and nested
/// sitemap index entries (the latter are re-fetched as sitemap jobs).
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SitemapUrls {
    pub pages: Vec<String>,
    pub sitemaps: Vec<String>,
}

pub fn parse_xml(data: &[u8], base: Option<&Url>) -> SitemapUrls {
    let mut out = SitemapUrls::default();
    let prefix = base.map(url_utils::location_prefix);

    for entity in SiteMapReader::new(Cursor::new(data)) {
        match entity {
            SiteMapEntity::Url(entry) => {
                if let Some(url) = entry.loc.get_url() {
                    push_scoped(&mut out.pages, url.to_string(), prefix.as_deref());
                }
            }
            SiteMapEntity::SiteMap(entry) => {
                if let Some(url) = entry.loc.get_url() {
                    out.sitemaps.push(url.to_string());
                }
            }
            SiteMapEntity::Err(_) => {}
        }
    }

    out
}

/// Gunzip then parse; a corrupt stream yields whatever decompressed.
pub fn parse_xml_gz(data: &[u8], base: Option<&Url>) -> SitemapUrls {
    let mut plain = Vec::new();
    let mut decoder = MultiGzDecoder::new(data);
    if decoder.read_to_end(&mut plain).is_err() && plain.is_empty() {
        return SitemapUrls::default();
    }
    parse_xml(&plain, base)
}

/// One URL per line, blank lines and whitespace trimmed.
pub fn parse_text(data: &str, base: Option<&Url>) -> SitemapUrls {
    let mut out = SitemapUrls::default();
    let prefix = base.map(url_utils::location_prefix);

    for line in data.lines() {
        let line = line.trim();
        if !line.is_empty() {
            push_scoped(&mut out.pages, line.to_string(), prefix.as_deref());
        }
    }

    out
}

fn push_scoped(pages: &mut Vec<String>, url: String, prefix: Option<&str>) {
    if let Some(prefix) = prefix {
        if url.len() <= prefix.len() || !url[..prefix.len()].eq_ignore_ascii_case(prefix) {
            tracing::debug!("sitemap URL '{}' outside its location, skipped", url);
            return;
        }
    }
    pages.push(url);
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const XML: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>http://test.local/catalog/a</loc></url>
  <url><loc>http://test.local/catalog/b</loc></url>
  <url><loc>http://test.local/outside</loc></url>
</urlset>"#;

    #[test]
    fn test_parse_xml_scoped_to_location() {
        let base = Url::parse("http://test.local/catalog/sitemap.xml").unwrap();
        let urls = parse_xml(XML.as_bytes(), Some(&base));
        assert_eq!(
            urls.pages,
            vec!["http://test.local/catalog/a", "http://test.local/catalog/b"]
        );
    }

    #[test]
    fn test_parse_xml_unscoped() {
        let urls = parse_xml(XML.as_bytes(), None);
        assert_eq!(urls.pages.len(), 3);
    }

    #[test]
    fn test_parse_index() {
        let xml = r#"<?xml version="1.0"?>
<sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <sitemap><loc>http://test.local/sitemap1.xml</loc></sitemap>
  <sitemap><loc>http://test.local/sitemap2.xml</loc></sitemap>
</sitemapindex>"#;
        let urls = parse_xml(xml.as_bytes(), None);
        assert!(urls.pages.is_empty());
        assert_eq!(urls.sitemaps.len(), 2);
    }

    #[test]
    fn test_parse_gz_roundtrip() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(XML.as_bytes()).unwrap();
        let gz = encoder.finish().unwrap();

        let urls = parse_xml_gz(&gz, None);
        assert_eq!(urls.pages.len(), 3);
    }

    #[test]
    fn test_parse_text() {
        let base = Url::parse("http://test.local/catalog/sitemap.txt").unwrap();
        let text = "http://test.local/catalog/x\n\n  http://test.local/catalog/y  \nhttp://other.local/z\n";
        let urls = parse_text(text, Some(&base));
        assert_eq!(
            urls.pages,
            vec!["http://test.local/catalog/x", "http://test.local/catalog/y"]
        );
    }
}
