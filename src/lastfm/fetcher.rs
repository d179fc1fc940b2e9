//! Paginated history download with bounded parallelism and pacing.
//!
//! Page 1 is fetched alone (its metadata gives the page count), then the remaining pages
//! go out in groups of `parallelism` concurrent requests with a fixed pause between groups.
//! A page that fails or times out is counted and treated as empty; only page 1 is fatal.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use serde_json::Value;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::lastfm::client::{HistoryPage, HistorySource, PageRequest};
use crate::normalization::RawPlay;
use crate::progress::{emit, Progress, ProgressFn, Stage};

pub const MAX_PARALLELISM: usize = 10;
pub const MAX_PAGE_LIMIT: u32 = 1000;

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub page_limit: u32,
    pub parallelism: usize,
    pub group_delay: Duration,
    pub page_timeout: Duration,
    pub first_page_attempts: u32,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            page_limit: 200,
            parallelism: 3,
            group_delay: Duration::from_millis(200),
            page_timeout: Duration::from_secs(20),
            first_page_attempts: 3,
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct FetchReport {
    pub pages_total: u32,
    pub pages_failed: u32,
    /// Raw entries received, before any filtering.
    pub records_seen: usize,
    /// Records kept and returned.
    pub records_fetched: usize,
    pub now_playing_skipped: usize,
    pub malformed_records: usize,
    pub before_cutoff_skipped: usize,
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub records: Vec<RawPlay>,
    pub report: FetchReport,
}

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("first history page failed after {attempts} attempt(s): {error:#}")]
    FirstPage { attempts: u32, error: anyhow::Error },
    #[error("fetch cancelled after {pages_done} page(s)")]
    Cancelled { pages_done: u32, report: FetchReport },
}

pub struct RateLimitedFetcher {
    source: Arc<dyn HistorySource>,
    options: FetchOptions,
}

/// Records of one run, filtered as pages arrive.
struct Collector {
    cutoff: Option<i64>,
    records: Vec<RawPlay>,
    report: FetchReport,
}

impl Collector {
    fn absorb(&mut self, records: Vec<Value>) {
        for value in records {
            self.report.records_seen += 1;
            if !value.is_object() {
                self.report.malformed_records += 1;
                continue;
            }
            let raw: RawPlay = match serde_json::from_value(value) {
                Ok(raw) => raw,
                Err(_) => {
                    self.report.malformed_records += 1;
                    continue;
                }
            };
            if raw.is_now_playing() {
                self.report.now_playing_skipped += 1;
                continue;
            }
            if let (Some(cutoff), Some(ts)) = (self.cutoff, raw.timestamp()) {
                if ts <= cutoff {
                    self.report.before_cutoff_skipped += 1;
                    continue;
                }
            }
            self.records.push(raw);
        }
    }
}

impl RateLimitedFetcher {
    pub fn new(source: Arc<dyn HistorySource>, options: FetchOptions) -> Self {
        Self { source, options }
    }

    fn request(&self, page: u32, from: Option<i64>) -> PageRequest {
        PageRequest {
            page,
            limit: self.options.page_limit.clamp(1, MAX_PAGE_LIMIT),
            from,
        }
    }

    async fn fetch_one(&self, req: PageRequest) -> anyhow::Result<HistoryPage> {
        match timeout(self.options.page_timeout, self.source.fetch_page(req)).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!(
                "page {} timed out after {:?}",
                req.page,
                self.options.page_timeout
            )),
        }
    }

    async fn first_page(&self, from: Option<i64>) -> Result<HistoryPage, FetchError> {
        let attempts = self.options.first_page_attempts.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.fetch_one(self.request(1, from)).await {
                Ok(page) => return Ok(page),
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "first history page failed");
                    last_err = Some(e);
                    if attempt < attempts {
                        sleep(self.options.group_delay * attempt).await;
                    }
                }
            }
        }
        Err(FetchError::FirstPage {
            attempts,
            error: last_err.unwrap_or_else(|| anyhow::anyhow!("no attempts made")),
        })
    }

    /// Every play strictly newer than `cutoff`, oldest first.
    #[instrument(skip(self, progress, cancel))]
    pub async fn fetch(
        &self,
        cutoff: Option<DateTime<Utc>>,
        progress: Option<&ProgressFn>,
        cancel: &CancellationToken,
    ) -> Result<FetchOutcome, FetchError> {
        let cutoff_ts = cutoff.map(|c| c.timestamp());
        let from = cutoff_ts.map(|ts| ts + 1);
        let mut collector = Collector {
            cutoff: cutoff_ts,
            records: Vec::new(),
            report: FetchReport::default(),
        };

        if cancel.is_cancelled() {
            return Err(FetchError::Cancelled {
                pages_done: 0,
                report: collector.report,
            });
        }

        let first = self.first_page(from).await?;
        let total_pages = first.total_pages.max(1);
        collector.report.pages_total = if first.total_pages == 0 { 0 } else { total_pages };
        collector.absorb(first.records);
        let mut pages_done = 1u32;
        let report_progress = |done: u32, collected: usize| {
            emit(
                progress,
                Progress {
                    stage: Stage::Fetch,
                    done: done as usize,
                    total: total_pages as usize,
                    accumulated: collected,
                },
            )
        };
        report_progress(pages_done, collector.records.len());
        info!(
            total_pages,
            total_records = first.total_records,
            "history page count known"
        );

        let remaining: Vec<u32> = (2..=total_pages).collect();
        let parallelism = self.options.parallelism.clamp(1, MAX_PARALLELISM);
        let groups: Vec<&[u32]> = remaining.chunks(parallelism).collect();
        for (i, group) in groups.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(pages_done, total_pages, "fetch cancelled");
                return Err(FetchError::Cancelled {
                    pages_done,
                    report: collector.report,
                });
            }

            let requests = group.iter().map(|&page| async move {
                (page, self.fetch_one(self.request(page, from)).await)
            });
            for (page, result) in join_all(requests).await {
                match result {
                    Ok(body) => collector.absorb(body.records),
                    Err(e) => {
                        warn!(page, error = %e, "history page failed; treating as empty");
                        collector.report.pages_failed += 1;
                    }
                }
            }
            pages_done += group.len() as u32;
            report_progress(pages_done, collector.records.len());

            if i + 1 < groups.len() && !self.options.group_delay.is_zero() {
                sleep(self.options.group_delay).await;
            }
        }

        let Collector {
            mut records,
            mut report,
            ..
        } = collector;
        // Stable: plays sharing a second keep source order.
        records.sort_by_key(|r| r.timestamp().unwrap_or(i64::MIN));
        report.records_fetched = records.len();
        info!(
            pages = report.pages_total,
            pages_failed = report.pages_failed,
            records = report.records_fetched,
            now_playing = report.now_playing_skipped,
            malformed = report.malformed_records,
            "fetch complete"
        );
        Ok(FetchOutcome { records, report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{record, ScriptedSource};
    use chrono::TimeZone;
    use serde_json::json;
    use std::sync::Mutex;

    fn quick() -> FetchOptions {
        FetchOptions {
            page_limit: 2,
            parallelism: 2,
            group_delay: Duration::from_millis(1),
            page_timeout: Duration::from_millis(200),
            first_page_attempts: 2,
        }
    }

    #[tokio::test]
    async fn collects_all_pages_sorted_and_skips_now_playing() {
        let source = ScriptedSource::new(vec![
            vec![
                json!({"artist": "A", "name": "Now", "@attr": {"nowplaying": "true"}}),
                record("A", None, "T5", 500),
                record("A", None, "T4", 400),
            ],
            vec![record("A", None, "T3", 300), record("A", None, "T2", 200)],
            vec![record("A", None, "T1", 100), json!("garbage")],
        ]);
        let fetcher = RateLimitedFetcher::new(Arc::new(source), quick());
        let out = fetcher
            .fetch(None, None, &CancellationToken::new())
            .await
            .unwrap();

        let times: Vec<i64> = out.records.iter().filter_map(|r| r.timestamp()).collect();
        assert_eq!(times, vec![100, 200, 300, 400, 500]);
        assert_eq!(out.report.pages_total, 3);
        assert_eq!(out.report.now_playing_skipped, 1);
        assert_eq!(out.report.malformed_records, 1);
        assert_eq!(out.report.records_fetched, 5);
    }

    #[tokio::test]
    async fn failed_and_slow_pages_count_as_empty() {
        let source = ScriptedSource::new(vec![
            vec![record("A", None, "T4", 400)],
            vec![record("A", None, "T3", 300)],
            vec![record("A", None, "T2", 200)],
        ])
        .fail_page(2)
        .delay_page(3, Duration::from_secs(5));
        let fetcher = RateLimitedFetcher::new(Arc::new(source), quick());
        let out = fetcher
            .fetch(None, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.report.pages_failed, 2);
        assert_eq!(out.records.len(), 1);
    }

    #[tokio::test]
    async fn first_page_failure_is_fatal_after_retries() {
        let source = Arc::new(ScriptedSource::new(vec![vec![]]).fail_page(1));
        let fetcher = RateLimitedFetcher::new(source.clone(), quick());
        let err = fetcher
            .fetch(None, None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::FirstPage { attempts: 2, .. }));
        assert_eq!(source.calls(1), 2);
    }

    #[tokio::test]
    async fn cutoff_is_sent_and_enforced() {
        let source = Arc::new(ScriptedSource::new(vec![vec![
            record("A", None, "new", 200),
            record("A", None, "edge", 150),
            record("A", None, "old", 100),
        ]]));
        let fetcher = RateLimitedFetcher::new(source.clone(), quick());
        let cutoff = Utc.timestamp_opt(150, 0).unwrap();
        let out = fetcher
            .fetch(Some(cutoff), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.records.len(), 1);
        assert_eq!(out.records[0].timestamp(), Some(200));
        assert_eq!(out.report.before_cutoff_skipped, 2);
        assert_eq!(source.last_from(), Some(151));
    }

    #[tokio::test]
    async fn progress_after_each_group_and_cancel_between_groups() {
        let pages: Vec<Vec<Value>> = (0..5)
            .map(|p| vec![record("A", None, &format!("T{p}"), 1_000 - p)])
            .collect();
        let seen: Arc<Mutex<Vec<(usize, usize, usize)>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let progress: ProgressFn =
            Arc::new(move |p| sink.lock().unwrap().push((p.done, p.total, p.accumulated)));

        let fetcher = RateLimitedFetcher::new(Arc::new(ScriptedSource::new(pages.clone())), quick());
        fetcher
            .fetch(None, Some(&progress), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(1, 5, 1), (3, 5, 3), (5, 5, 5)]
        );

        let cancel = CancellationToken::new();
        let trip = cancel.clone();
        let cancel_after_first: ProgressFn = Arc::new(move |_| trip.cancel());
        let fetcher = RateLimitedFetcher::new(Arc::new(ScriptedSource::new(pages)), quick());
        let err = fetcher
            .fetch(None, Some(&cancel_after_first), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Cancelled { pages_done: 1, .. }));
    }
}
