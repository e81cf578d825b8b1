//! HTML parsing for titles, links and block pages

use chrono::{DateTime, Utc};
use scraper::{Html, Selector};
use url::Url;

use crate::crawl::structured::{self, Listing};

/// Markers of captcha and maintenance pages served instead of content
pub const DEFAULT_BLOCK_MARKERS: &[&str] = &[
    "g-recaptcha",
    "captcha-form",
    "are you a robot",
    "unusual traffic from your computer",
    "temporarily unavailable",
    "under maintenance",
];

/// First block marker found in the raw page (case-insensitive).
///
/// Matched against the markup, so captcha widget class names and ids count as
/// well as visible text.
pub fn find_block_marker<'a>(body: &str, markers: &'a [String]) -> Option<&'a str> {
    let lowered = body.to_lowercase();
    markers
        .iter()
        .find(|marker| !marker.is_empty() && lowered.contains(&marker.to_lowercase()))
        .map(String::as_str)
}

/// Everything the crawler uses from a fetched page
#[derive(Debug, Clone, Default)]
pub struct PageContent {
    pub title: Option<String>,
    pub links: Vec<Url>,
    pub listings: Vec<Listing>,
}

impl PageContent {
    /// Parse `body` fetched from `url`. Listings are attributed to the page's host.
    pub fn parse(url: &Url, body: &str, fetched_at: DateTime<Utc>) -> Self {
        let document = Html::parse_document(body);
        let source = url.host_str().unwrap_or_default();

        Self {
            title: extract_title(&document),
            links: extract_links(&document, url),
            listings: structured::extract_listings(&document, source, fetched_at),
        }
    }
}

/// Text of the first `<title>` element, whitespace collapsed
pub fn extract_title(document: &Html) -> Option<String> {
    let selector = Selector::parse("title").ok()?;
    let element = document.select(&selector).next()?;

    let title = element.text().collect::<Vec<_>>().join(" ");
    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    if title.is_empty() {
        None
    } else {
        Some(title)
    }
}

/// Absolute http(s) targets of `<a href>` elements, fragments removed
pub fn extract_links(document: &Html, base: &Url) -> Vec<Url> {
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    document
        .select(&selector)
        .filter_map(|anchor| anchor.value().attr("href"))
        .map(str::trim)
        .filter(|href| !href.is_empty() && !href.starts_with('#'))
        .filter_map(|href| base.join(href).ok())
        .filter(|url| matches!(url.scheme(), "http" | "https"))
        .map(|mut url| {
            url.set_fragment(None);
            url
        })
        .collect()
}
