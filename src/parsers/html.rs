//! HTML link extraction.
//!
//! Pulls every URL-bearing attribute out of a document, keeps the literal
//! attribute text for the link-conversion pass, and distinguishes inline
//! page requisites (images, stylesheets, scripts) from navigation links.

use scraper::{Html, Selector};

/// One URL found in a document, with enough context for policy decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtmlUrl {
    /// The attribute value exactly as written in the document.
    pub literal: String,
    pub tag: String,
    pub attr: String,
    /// Inline resource needed to render the page (page requisite).
    pub inline: bool,
}

#[derive(Debug, Default)]
pub struct ParsedHtml {
    /// href of a <base> element, when present and non-empty.
    pub base: Option<String>,
    pub urls: Vec<HtmlUrl>,
    /// A robots meta tag said nofollow.
    pub follow: bool,
}

/// (tag, attribute, inline) triples the extractor walks.
const URL_ATTRS: &[(&str, &str, bool)] = &[
    ("a", "href", false),
    ("area", "href", false),
    ("link", "href", true),
    ("img", "src", true),
    ("script", "src", true),
    ("iframe", "src", true),
    ("frame", "src", true),
    ("embed", "src", false),
    ("source", "src", true),
    ("audio", "src", true),
    ("video", "src", true),
    ("input", "src", true),
    ("object", "data", true),
];

pub fn parse(html: &str) -> ParsedHtml {
    let document = Html::parse_document(html);
    let mut parsed = ParsedHtml {
        follow: true,
        ..ParsedHtml::default()
    };

    // <meta name=robots content=nofollow> stops link following entirely.
    if let Ok(selector) = Selector::parse("meta[name]") {
        for el in document.select(&selector) {
            let name = el.value().attr("name").unwrap_or("");
            if name.eq_ignore_ascii_case("robots") {
                if let Some(content) = el.value().attr("content") {
                    if content.to_ascii_lowercase().contains("nofollow") {
                        parsed.follow = false;
                    }
                }
            }
        }
    }

    if let Ok(selector) = Selector::parse("base[href]") {
        parsed.base = document
            .select(&selector)
            .next()
            .and_then(|el| el.value().attr("href"))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
    }

    for (tag, attr, inline) in URL_ATTRS {
        let Ok(selector) = Selector::parse(&format!("{}[{}]", tag, attr)) else {
            continue;
        };
        for el in document.select(&selector) {
            let Some(value) = el.value().attr(attr) else {
                continue;
            };
            let literal = value.trim();
            if literal.is_empty()
                || literal.starts_with('#')
                || literal.starts_with("javascript:")
                || literal.starts_with("mailto:")
                || literal.starts_with("tel:")
                || literal.starts_with("data:")
            {
                continue;
            }
            parsed.urls.push(HtmlUrl {
                literal: literal.to_string(),
                tag: tag.to_string(),
                attr: attr.to_string(),
                inline: *inline,
            });
        }
    }

    parsed
}
