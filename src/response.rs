//! Interpretation of fetched response bodies.
//!
//! Bodies are parsed as strict JSON first. When that fails they are treated
//! as HTML and parsed into a tree on demand, so profiles never have to say
//! which format a source speaks. Only a body that is neither (empty, or
//! binary with NUL bytes) is an error. HTML that is not valid UTF-8 is read
//! as Latin-1.

use std::collections::BTreeMap;

use scraper::{Html, Selector};
use serde::Serialize;
use serde_json::Value;

use crate::error::ExtractionError;

/// A fetched page handed to parsers and extractors.
#[derive(Debug, Clone)]
pub struct Page {
    /// Final URL the body was fetched from. Relative links resolve against it.
    pub url: String,
    pub parsed: ParsedResponse,
}

/// Structured view of a response body.
#[derive(Debug, Clone)]
pub enum ParsedResponse {
    Json(Value),
    Html(HtmlDocument),
}

impl ParsedResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            ParsedResponse::Json(_) => "json",
            ParsedResponse::Html(_) => "html",
        }
    }

    pub fn as_json(&self) -> Option<&Value> {
        match self {
            ParsedResponse::Json(v) => Some(v),
            ParsedResponse::Html(_) => None,
        }
    }

    pub fn as_html(&self) -> Option<&HtmlDocument> {
        match self {
            ParsedResponse::Json(_) => None,
            ParsedResponse::Html(doc) => Some(doc),
        }
    }
}

/// Parse a response body: JSON first, HTML as the fallback.
pub fn interpret(url: &str, body: &[u8]) -> Result<Page, ExtractionError> {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        return Ok(Page {
            url: url.to_string(),
            parsed: ParsedResponse::Json(value),
        });
    }

    let text = decode_text(body);
    if text.trim().is_empty() || text.contains('\0') {
        return Err(ExtractionError::UnparseableResponse {
            url: url.to_string(),
        });
    }

    Ok(Page {
        url: url.to_string(),
        parsed: ParsedResponse::Html(HtmlDocument::new(text)),
    })
}

/// UTF-8 when valid, otherwise one char per byte (ISO-8859-1).
fn decode_text(body: &[u8]) -> String {
    match std::str::from_utf8(body) {
        Ok(text) => text.to_string(),
        Err(_) => body.iter().map(|&b| char::from(b)).collect(),
    }
}

/// An HTML body. The tree is built per query because `scraper::Html` is
/// not `Send` and pages travel across await points.
#[derive(Debug, Clone)]
pub struct HtmlDocument {
    source: String,
}

/// One element matched by a CSS selector.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HtmlNode {
    pub text: String,
    pub html: String,
    pub attrs: BTreeMap<String, String>,
}

impl HtmlDocument {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Return every element matching `css`, in document order.
    pub fn select(&self, css: &str) -> Result<Vec<HtmlNode>, String> {
        let selector =
            Selector::parse(css).map_err(|e| format!("invalid selector '{}': {:?}", css, e))?;
        let tree = Html::parse_document(&self.source);
        Ok(tree
            .select(&selector)
            .map(|el| HtmlNode {
                text: el.text().collect::<String>().trim().to_string(),
                html: el.html(),
                attrs: el
                    .value()
                    .attrs()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            })
            .collect())
    }

    /// Text of the `<title>` element.
    pub fn title(&self) -> Option<String> {
        self.select("title")
            .ok()
            .and_then(|nodes| nodes.into_iter().next())
            .map(|n| n.text)
            .filter(|t| !t.is_empty())
    }

    /// `content` of `<meta name=..>` or `<meta property=..>`.
    pub fn meta(&self, name: &str) -> Option<String> {
        let css = format!("meta[name=\"{0}\"], meta[property=\"{0}\"]", name);
        self.select(&css)
            .ok()?
            .into_iter()
            .find_map(|n| n.attrs.get("content").cloned())
    }
}

/// Resolve `href` against `base`. Absolute URLs pass through unchanged.
pub fn resolve_url(base: &str, href: &str) -> String {
    match url::Url::parse(base).and_then(|b| b.join(href)) {
        Ok(joined) => joined.to_string(),
        Err(_) => href.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_json_body_is_parsed_strictly() {
        let page = interpret("https://example.test/f", br#"{"items": [1, 2]}"#).unwrap();
        assert_eq!(page.parsed.kind(), "json");
        assert_eq!(page.parsed.as_json().unwrap()["items"][1], 2);
    }

    #[test]
    fn test_html_fallback_when_json_fails() {
        let body = b"<html><head><title>Feed</title></head><body><a href='/c1'>one</a></body></html>";
        let page = interpret("https://example.test/f", body).unwrap();
        let doc = page.parsed.as_html().expect("html fallback");
        assert_eq!(doc.title().as_deref(), Some("Feed"));
        let links = doc.select("a").unwrap();
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].attrs["href"], "/c1");
        assert_eq!(links[0].text, "one");
    }

    #[test]
    fn test_truncated_json_falls_back_to_html() {
        let page = interpret("https://example.test/f", br#"{"items": ["#).unwrap();
        assert_eq!(page.parsed.kind(), "html");
    }

    #[test]
    fn test_empty_or_binary_body_is_an_error() {
        assert!(matches!(
            interpret("https://example.test/f", b"   \n"),
            Err(ExtractionError::UnparseableResponse { .. })
        ));
        assert!(matches!(
            interpret("https://example.test/f", &[0xff, 0xfe, 0x00, 0x81]),
            Err(ExtractionError::UnparseableResponse { .. })
        ));
    }

    #[test]
    fn test_latin1_html_is_parsed() {
        let body = b"<html><head><title>Caf\xe9 news</title></head><body></body></html>";
        let page = interpret("https://example.test/f", body).unwrap();
        let doc = page.parsed.as_html().unwrap();
        assert_eq!(doc.title().as_deref(), Some("Caf\u{e9} news"));
    }

    #[test]
    fn test_meta_lookup() {
        let doc = HtmlDocument::new(
            r#"<html><head><meta property="og:title" content="Hello"></head></html>"#,
        );
        assert_eq!(doc.meta("og:title").as_deref(), Some("Hello"));
        assert_eq!(doc.meta("description"), None);
    }

    #[test]
    fn test_invalid_selector_reports_error() {
        let doc = HtmlDocument::new("<p>x</p>");
        assert!(doc.select("a[").is_err());
    }

    #[test]
    fn test_resolve_url() {
        assert_eq!(
            resolve_url("https://example.test/feeds/a", "../c/1"),
            "https://example.test/c/1"
        );
        assert_eq!(
            resolve_url("https://example.test/feeds/a", "https://other.test/x"),
            "https://other.test/x"
        );
    }
}
