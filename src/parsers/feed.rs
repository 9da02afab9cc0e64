//! Atom and RSS feed link extraction.

use quick_xml::events::Event;
use quick_xml::reader::Reader;

/// Extract linked URLs from an Atom feed: `<link href="...">` everywhere.
pub fn parse_atom(xml: &str) -> Vec<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut urls = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                if local_name(e.name().as_ref()) == "link" {
                    for a in e.attributes().flatten() {
                        if local_name(a.key.as_ref()) == "href" {
                            if let Ok(value) = a.unescape_value() {
                                push(&mut urls, value.to_string());
                            }
                        }
                    }
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }

    urls
}

/// Extract linked URLs from an RSS channel: `<link>` text, enclosure and
/// comments URLs.
pub fn parse_rss(xml: &str) -> Vec<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut urls = Vec::new();
    let mut capture_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let tag = local_name(e.name().as_ref());
                capture_text = matches!(tag.as_str(), "link" | "comments" | "url");
            }
            Ok(Event::Empty(e)) => {
                if local_name(e.name().as_ref()) == "enclosure" {
                    for a in e.attributes().flatten() {
                        if local_name(a.key.as_ref()) == "url" {
                            if let Ok(value) = a.unescape_value() {
                                push(&mut urls, value.to_string());
                            }
                        }
                    }
                }
            }
            Ok(Event::Text(t)) if capture_text => {
                if let Ok(text) = t.unescape() {
                    push(&mut urls, text.to_string());
                }
                capture_text = false;
            }
            Ok(Event::End(_)) => capture_text = false,
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }

    urls
}

fn push(urls: &mut Vec<String>, value: String) {
    let value = value.trim().to_string();
    if !value.is_empty() {
        urls.push(value);
    }
}

fn local_name(qname: &[u8]) -> String {
    let name = match qname.iter().rposition(|&b| b == b':') {
        Some(pos) => &qname[pos + 1..],
        None => qname,
    };
    String::from_utf8_lossy(name).to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_atom() {
        let xml = r#"<?xml version="1.0"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <link href="http://test.local/" rel="alternate"/>
  <entry>
    <link href="http://test.local/post/1"/>
    <link href="http://test.local/post/1.mp3" rel="enclosure"/>
  </entry>
</feed>"#;
        let urls = parse_atom(xml);
        assert_eq!(
            urls,
            vec![
                "http://test.local/",
                "http://test.local/post/1",
                "http://test.local/post/1.mp3",
            ]
        );
    }

    #[test]
    fn test_parse_rss() {
        let xml = r#"<?xml version="1.0"?>
<rss version="2.0"><channel>
  <link>http://test.local/</link>
  <item>
    <link>http://test.local/item/1</link>
    <enclosure url="http://test.local/item/1.ogg" length="1" type="audio/ogg"/>
  </item>
</channel></rss>"#;
        let urls = parse_rss(xml);
        assert!(urls.contains(&"http://test.local/".to_string()));
        assert!(urls.contains(&"http://test.local/item/1".to_string()));
        assert!(urls.contains(&"http://test.local/item/1.ogg".to_string()));
    }

    #[test]
    fn test_garbage_input() {
        assert!(parse_atom("definitely not xml").is_empty());
        assert!(parse_rss("<rss><unclosed").is_empty());
    }
}
