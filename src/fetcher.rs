use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::models::SourcePage;

const USER_AGENT: &str = "Mozilla/5.0 (Linux; Android 7.0; SM-G930V Build/NRD90M) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/59.0.3071.125 Mobile Safari/537.36";

/// One (faculty, semester) section of the source and how many group pages it has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceSection {
    pub faculty: u32,
    pub semester: u32,
    pub groups: u32,
}

impl SourceSection {
    pub const fn new(faculty: u32, semester: u32, groups: u32) -> Self {
        Self {
            faculty,
            semester,
            groups,
        }
    }

    /// Page URLs for group indices `1..=groups`.
    pub fn urls<'a>(&'a self, base_url: &'a str) -> impl Iterator<Item = String> + 'a {
        let base = base_url.trim_end_matches('/');
        (1..=self.groups)
            .map(move |group| format!("{}/{}/{}/{}.htm", base, self.faculty, self.semester, group))
    }
}

impl FromStr for SourceSection {
    type Err = anyhow::Error;

    /// Format: `faculty/semester:groups`, e.g. `3/1:10`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (coords, groups) = s
            .split_once(':')
            .with_context(|| format!("Invalid source '{}': expected faculty/semester:groups", s))?;
        let (faculty, semester) = coords
            .split_once('/')
            .with_context(|| format!("Invalid source '{}': expected faculty/semester:groups", s))?;

        let parse = |value: &str, what: &str| {
            value
                .trim()
                .parse::<u32>()
                .with_context(|| format!("Invalid {} in source '{}'", what, s))
        };
        let section = Self::new(
            parse(faculty, "faculty")?,
            parse(semester, "semester")?,
            parse(groups, "group count")?,
        );

        if section.groups == 0 {
            bail!("Invalid source '{}': group count must be at least 1", s);
        }
        Ok(section)
    }
}

/// Sections published by the faculty timetable site.
pub const DEFAULT_SOURCES: [SourceSection; 14] = [
    SourceSection::new(1, 1, 6),
    SourceSection::new(1, 2, 6),
    SourceSection::new(1, 3, 6),
    SourceSection::new(2, 1, 6),
    SourceSection::new(2, 2, 6),
    SourceSection::new(2, 3, 6),
    SourceSection::new(3, 1, 10),
    SourceSection::new(3, 2, 8),
    SourceSection::new(4, 1, 10),
    SourceSection::new(4, 2, 10),
    SourceSection::new(5, 1, 13),
    SourceSection::new(5, 2, 11),
    SourceSection::new(6, 1, 11),
    SourceSection::new(6, 2, 10),
];

#[derive(Debug, Default)]
pub struct FetchOutcome {
    /// Successfully fetched pages, in request order.
    pub pages: Vec<SourcePage>,
    pub requested: usize,
    pub failed: usize,
    pub cancelled: bool,
}

#[async_trait]
pub trait PageSource: Send + Sync {
    /// Get the name of this source for logging
    fn name(&self) -> &'static str;

    /// Fetch every page; failed pages are dropped, never fatal.
    async fn fetch_pages(&self, cancel: &CancellationToken) -> FetchOutcome;
}

pub struct HttpFetcher {
    client: reqwest::Client,
    base_url: String,
    sources: Vec<SourceSection>,
    concurrency: usize,
}

impl HttpFetcher {
    pub fn new(
        base_url: String,
        sources: Vec<SourceSection>,
        concurrency: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            base_url,
            sources,
            concurrency: concurrency.max(1),
        })
    }

    fn urls(&self) -> Vec<String> {
        self.sources
            .iter()
            .flat_map(|source| source.urls(&self.base_url))
            .collect()
    }

    async fn fetch_page(&self, url: &str) -> Result<String> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to fetch URL")?;

        let status = response.status();
        if !status.is_success() {
            bail!("HTTP error: {}", status);
        }

        let html = response.text().await.context("Failed to read response body")?;
        debug!(url = %url, bytes = html.len(), "Received page");
        Ok(html)
    }
}

#[async_trait]
impl PageSource for HttpFetcher {
    fn name(&self) -> &'static str {
        "http"
    }

    #[instrument(skip(self, cancel), fields(source = "http", concurrency = self.concurrency))]
    async fn fetch_pages(&self, cancel: &CancellationToken) -> FetchOutcome {
        let start = Instant::now();
        let urls = self.urls();
        let mut outcome = FetchOutcome {
            requested: urls.len(),
            ..FetchOutcome::default()
        };

        let mut fetched: Vec<(usize, SourcePage)> = Vec::new();
        let mut responses = stream::iter(urls.into_iter().enumerate())
            .map(|(index, url)| async move {
                let result = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    result = self.fetch_page(&url) => Some(result),
                };
                (index, url, result)
            })
            .buffer_unordered(self.concurrency);

        while let Some((index, url, result)) = responses.next().await {
            match result {
                Some(Ok(html)) => fetched.push((index, SourcePage::new(url, html))),
                Some(Err(e)) => {
                    outcome.failed += 1;
                    warn!(url = %url, error = %e, "Page fetch failed, dropping");
                }
                None => debug!(url = %url, "Fetch cancelled"),
            }
        }

        fetched.sort_by_key(|(index, _)| *index);
        outcome.pages = fetched.into_iter().map(|(_, page)| page).collect();
        outcome.cancelled = cancel.is_cancelled();

        info!(
            requested = outcome.requested,
            fetched = outcome.pages.len(),
            failed = outcome.failed,
            cancelled = outcome.cancelled,
            duration_ms = start.elapsed().as_millis(),
            "Fetched schedule pages"
        );

        outcome
    }
}

/// Fixed in-memory pages, for tests.
#[cfg(test)]
pub struct StaticPages {
    pub pages: Vec<SourcePage>,
    pub failed: usize,
}

#[cfg(test)]
impl StaticPages {
    pub fn new(pages: Vec<SourcePage>) -> Self {
        Self { pages, failed: 0 }
    }
}

#[cfg(test)]
#[async_trait]
impl PageSource for StaticPages {
    fn name(&self) -> &'static str {
        "static"
    }

    async fn fetch_pages(&self, cancel: &CancellationToken) -> FetchOutcome {
        FetchOutcome {
            pages: if cancel.is_cancelled() {
                Vec::new()
            } else {
                self.pages.clone()
            },
            requested: self.pages.len() + self.failed,
            failed: self.failed,
            cancelled: cancel.is_cancelled(),
        }
    }
}
