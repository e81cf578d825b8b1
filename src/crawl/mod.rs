//! Built-in page crawler
//!
//! `FetchPage` fetches one URL through the task's proxy, emits a page record and
//! the facility listings the page describes, and expands same-host links into
//! child tasks until the depth limit is reached.

pub mod html;
pub mod structured;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;
use url::Url;

use crate::engine::{TaskBody, TaskContext, TaskOutcome};
use crate::error::{CrawlError, Result};
use crate::models::PageRecord;

pub use html::{PageContent, DEFAULT_BLOCK_MARKERS};
pub use structured::Listing;

/// Page crawler settings
#[derive(Debug, Clone)]
pub struct CrawlSettings {
    /// Links are followed while a page's depth is below this
    pub max_depth: u32,
    /// Only follow links to the host of the page they were found on
    pub same_host_only: bool,
    /// Cap on child tasks spawned per page
    pub max_links_per_page: usize,
    /// A page containing any of these is treated as a block page
    pub block_markers: Vec<String>,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            max_depth: 1,
            same_host_only: true,
            max_links_per_page: 100,
            block_markers: DEFAULT_BLOCK_MARKERS.iter().map(|m| m.to_string()).collect(),
        }
    }
}

struct CrawlState {
    settings: CrawlSettings,
    visited: Mutex<HashSet<String>>,
}

impl CrawlState {
    /// Returns `true` the first time `url` is seen
    fn visit(&self, url: &Url) -> bool {
        self.visited.lock().insert(url.as_str().to_string())
    }
}

/// Creates seed tasks that share one visited set
#[derive(Clone)]
pub struct PageCrawler {
    state: Arc<CrawlState>,
}

impl PageCrawler {
    pub fn new(settings: CrawlSettings) -> Self {
        Self {
            state: Arc::new(CrawlState {
                settings,
                visited: Mutex::new(HashSet::new()),
            }),
        }
    }

    /// Task for a seed URL, or `None` if it was already seeded
    pub fn seed(&self, url: &str) -> Result<Option<FetchPage>> {
        let mut url = Url::parse(url)?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(CrawlError::InvalidUrl(format!("{}: not an http(s) URL", url)));
        }
        url.set_fragment(None);

        if !self.state.visit(&url) {
            return Ok(None);
        }
        Ok(Some(FetchPage {
            url,
            depth: 0,
            state: self.state.clone(),
        }))
    }

    pub fn visited(&self) -> usize {
        self.state.visited.lock().len()
    }
}

/// Fetch one page and expand its links
pub struct FetchPage {
    url: Url,
    depth: u32,
    state: Arc<CrawlState>,
}

impl FetchPage {
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    fn expand(&self, ctx: &TaskContext<'_>, links: Vec<Url>) -> usize {
        let settings = &self.state.settings;
        if self.depth >= settings.max_depth {
            return 0;
        }

        let mut spawned = 0;
        for link in links {
            if spawned >= settings.max_links_per_page {
                break;
            }
            if settings.same_host_only && link.host_str() != self.url.host_str() {
                continue;
            }
            if !self.state.visit(&link) {
                continue;
            }

            ctx.spawn(FetchPage {
                url: link,
                depth: self.depth + 1,
                state: self.state.clone(),
            });
            spawned += 1;
        }
        spawned
    }
}

#[async_trait]
impl TaskBody for FetchPage {
    async fn execute(&self, ctx: &TaskContext<'_>) -> Result<TaskOutcome> {
        let page = ctx.session.get(self.url.as_str(), ctx.proxy).await?;
        if page.body.is_empty() {
            debug!(url = %self.url, "Empty page, nothing to extract");
            return Ok(TaskOutcome::Skipped);
        }

        let body = page.text();
        if let Some(marker) = html::find_block_marker(&body, &self.state.settings.block_markers) {
            return Err(CrawlError::Blocked(format!(
                "{} served a block page ({:?})",
                self.url, marker
            )));
        }

        let fetched_at = Utc::now();
        let content = PageContent::parse(&self.url, &body, fetched_at);

        ctx.emit(PageRecord {
            url: self.url.to_string(),
            status: page.status.as_u16(),
            content_length: page.body.len(),
            title: content.title,
            depth: self.depth,
            proxy: ctx.proxy.to_string(),
            fetched_at,
        });

        let listings = content.listings.len();
        for listing in content.listings {
            for record in listing.into_records() {
                ctx.emit(record);
            }
        }

        let children = self.expand(ctx, content.links);
        debug!(url = %self.url, depth = self.depth, listings, children, "Page crawled");
        Ok(TaskOutcome::Completed)
    }

    fn describe(&self) -> String {
        format!("fetch {} (depth {})", self.url, self.depth)
    }
}
