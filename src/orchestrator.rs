use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::database_ops::identity_cache::IdentityCache;
use crate::database_ops::loader::{
    BulkLoader, LoadError, LoadReport, LoadStrategy, DEFAULT_BATCH_SIZE, DEFAULT_ROW_ATTEMPTS,
};
use crate::database_ops::resolver::{resolve, ResolveReport};
use crate::database_ops::store::CatalogStore;
use crate::lastfm::client::HistorySource;
use crate::lastfm::fetcher::{FetchError, FetchOptions, FetchReport, RateLimitedFetcher};
use crate::normalization::{normalize_all, NormalizeReport};
use crate::progress::ProgressFn;
use crate::util::env::{env_opt, env_parse};

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub fetch: FetchOptions,
    pub incremental_strategy: LoadStrategy,
    pub backfill_strategy: LoadStrategy,
    pub row_attempts: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            fetch: FetchOptions::default(),
            incremental_strategy: LoadStrategy::batched(),
            backfill_strategy: LoadStrategy::BulkCopy,
            row_attempts: DEFAULT_ROW_ATTEMPTS,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = FetchOptions::default();
        let batch_size: usize = env_parse("LOAD_BATCH_SIZE", DEFAULT_BATCH_SIZE);
        let strategy = |key: &str, fallback: LoadStrategy| -> Result<LoadStrategy> {
            let parsed = match env_opt(key) {
                Some(raw) => raw.parse()?,
                None => fallback,
            };
            Ok(parsed.with_batch_size(batch_size))
        };
        Ok(Self {
            fetch: FetchOptions {
                page_limit: env_parse("LASTFM_PAGE_LIMIT", defaults.page_limit),
                parallelism: env_parse("FETCH_PARALLELISM", defaults.parallelism),
                group_delay: Duration::from_millis(env_parse("FETCH_GROUP_DELAY_MS", 200u64)),
                page_timeout: Duration::from_secs(env_parse("FETCH_PAGE_TIMEOUT_SECS", 20u64)),
                first_page_attempts: env_parse(
                    "FETCH_FIRST_PAGE_ATTEMPTS",
                    defaults.first_page_attempts,
                ),
            },
            incremental_strategy: strategy("INCREMENTAL_STRATEGY", LoadStrategy::batched())?,
            backfill_strategy: strategy("BACKFILL_STRATEGY", LoadStrategy::BulkCopy)?,
            row_attempts: env_parse("LOAD_ROW_ATTEMPTS", DEFAULT_ROW_ATTEMPTS),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    Incremental,
    Backfill,
}

/// Everything a run learned, complete or not.
#[derive(Debug, Clone, Serialize)]
pub struct SyncSummary {
    pub mode: SyncMode,
    pub strategy: LoadStrategy,
    pub fetch: Option<FetchReport>,
    pub normalize: Option<NormalizeReport>,
    pub resolve: Option<ResolveReport>,
    pub load: Option<LoadReport>,
    /// True when a failed or cancelled load was rolled back entirely.
    pub rolled_back: bool,
    pub previous_watermark: Option<DateTime<Utc>>,
    pub new_watermark: Option<DateTime<Utc>>,
    pub elapsed_ms: u64,
}

impl SyncSummary {
    fn new(mode: SyncMode, strategy: LoadStrategy) -> Self {
        Self {
            mode,
            strategy,
            fetch: None,
            normalize: None,
            resolve: None,
            load: None,
            rolled_back: false,
            previous_watermark: None,
            new_watermark: None,
            elapsed_ms: 0,
        }
    }

    pub fn plays_inserted(&self) -> usize {
        self.load.as_ref().map_or(0, LoadReport::plays_inserted)
    }

    fn log(&self, outcome: &str) {
        let fetch = self.fetch.clone().unwrap_or_default();
        let norm = self.normalize.clone().unwrap_or_default();
        let res = self.resolve.clone().unwrap_or_default();
        let load = self.load.clone().unwrap_or_default();
        let watermark = self.new_watermark.map(|w| w.to_rfc3339());
        if outcome == "ok" {
            info!(
                mode = ?self.mode,
                strategy = %self.strategy,
                fetched = fetch.records_fetched,
                pages_failed = fetch.pages_failed,
                now_playing = fetch.now_playing_skipped,
                malformed = fetch.malformed_records,
                normalized = norm.normalized,
                dropped = norm.dropped(),
                duplicate_plays = res.duplicate_plays,
                artists_inserted = load.artists.inserted,
                albums_inserted = load.albums.inserted,
                tracks_inserted = load.tracks.inserted,
                plays_inserted = load.plays.inserted,
                plays_existing = load.plays.existing,
                unmapped_plays = load.unmapped_plays(),
                album_unresolved = load.album_unresolved,
                failed_rows = load.failures.len(),
                watermark = ?watermark,
                elapsed_ms = self.elapsed_ms,
                "sync finished"
            );
        } else {
            error!(
                mode = ?self.mode,
                strategy = %self.strategy,
                outcome,
                fetched = fetch.records_fetched,
                pages_failed = fetch.pages_failed,
                normalized = norm.normalized,
                plays_inserted = load.plays.inserted,
                failed_rows = load.failures.len(),
                rolled_back = self.rolled_back,
                elapsed_ms = self.elapsed_ms,
                "sync did not complete"
            );
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("a sync is already running")]
    AlreadyRunning,
    #[error("fetch failed: {error:#}")]
    Fetch {
        summary: Box<SyncSummary>,
        error: anyhow::Error,
    },
    #[error("store access failed: {error:#}")]
    Store {
        summary: Box<SyncSummary>,
        error: anyhow::Error,
    },
    #[error("load failed: {error}")]
    Load {
        summary: Box<SyncSummary>,
        #[source]
        error: LoadError,
    },
    #[error("sync cancelled")]
    Cancelled { summary: Box<SyncSummary> },
}

impl SyncError {
    pub fn summary(&self) -> Option<&SyncSummary> {
        match self {
            SyncError::AlreadyRunning => None,
            SyncError::Fetch { summary, .. }
            | SyncError::Store { summary, .. }
            | SyncError::Load { summary, .. }
            | SyncError::Cancelled { summary } => Some(summary),
        }
    }
}

/// Owns the collaborators of a sync. One run at a time per store, across orchestrators.
pub struct SyncOrchestrator {
    store: Arc<dyn CatalogStore>,
    source: Arc<dyn HistorySource>,
    config: SyncConfig,
    run_lock: Mutex<()>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        source: Arc<dyn HistorySource>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            source,
            config,
            run_lock: Mutex::new(()),
        }
    }

    /// Catch up from the latest stored play.
    pub async fn incremental(
        &self,
        progress: Option<ProgressFn>,
        cancel: CancellationToken,
    ) -> Result<SyncSummary, SyncError> {
        let strategy = self.config.incremental_strategy;
        self.run(SyncMode::Incremental, strategy, progress, cancel)
            .await
    }

    /// Fetch and load the whole history; `strategy` overrides the configured one.
    pub async fn backfill(
        &self,
        strategy: Option<LoadStrategy>,
        progress: Option<ProgressFn>,
        cancel: CancellationToken,
    ) -> Result<SyncSummary, SyncError> {
        let strategy = strategy.unwrap_or(self.config.backfill_strategy);
        self.run(SyncMode::Backfill, strategy, progress, cancel).await
    }

    #[instrument(skip(self, progress, cancel))]
    async fn run(
        &self,
        mode: SyncMode,
        strategy: LoadStrategy,
        progress: Option<ProgressFn>,
        cancel: CancellationToken,
    ) -> Result<SyncSummary, SyncError> {
        let _running = self
            .run_lock
            .try_lock()
            .map_err(|_| SyncError::AlreadyRunning)?;
        let started = Instant::now();
        let mut summary = SyncSummary::new(mode, strategy);

        // Other orchestrators, in this process or another, share the store's lock.
        let _store_lock = match self.store.try_lock_run().await {
            Ok(Some(lock)) => lock,
            Ok(None) => {
                warn!(?mode, "another sync holds the store");
                return Err(SyncError::AlreadyRunning);
            }
            Err(error) => {
                return Err(finish_err(summary, started, |summary| SyncError::Store {
                    summary,
                    error,
                }))
            }
        };

        let previous = match self.store.latest_played_at().await {
            Ok(w) => w,
            Err(error) => {
                return Err(finish_err(summary, started, |summary| SyncError::Store {
                    summary,
                    error,
                }))
            }
        };
        summary.previous_watermark = previous;
        let cutoff = match mode {
            SyncMode::Incremental => previous,
            SyncMode::Backfill => None,
        };
        info!(?mode, %strategy, watermark = ?cutoff.map(|c| c.to_rfc3339()), "sync starting");

        let fetcher =
            RateLimitedFetcher::new(Arc::clone(&self.source), self.config.fetch.clone());
        let fetched = match fetcher.fetch(cutoff, progress.as_ref(), &cancel).await {
            Ok(out) => out,
            Err(FetchError::Cancelled { report, .. }) => {
                summary.fetch = Some(report);
                return Err(finish_err(summary, started, |summary| {
                    SyncError::Cancelled { summary }
                }));
            }
            Err(e) => {
                return Err(finish_err(summary, started, |summary| SyncError::Fetch {
                    summary,
                    error: anyhow::Error::new(e),
                }));
            }
        };
        summary.fetch = Some(fetched.report);

        let (plays, norm_report) = normalize_all(&fetched.records);
        summary.normalize = Some(norm_report);
        if cancel.is_cancelled() {
            return Err(finish_err(summary, started, |summary| {
                SyncError::Cancelled { summary }
            }));
        }

        let mut cache = match IdentityCache::seed(self.store.as_ref()).await {
            Ok(cache) => cache,
            Err(error) => {
                return Err(finish_err(summary, started, |summary| SyncError::Store {
                    summary,
                    error,
                }))
            }
        };
        let (batch, resolve_report) = resolve(&plays, &cache);
        summary.resolve = Some(resolve_report);

        if batch.is_empty() {
            info!("nothing new to load");
            summary.load = Some(LoadReport::default());
            summary.new_watermark = previous;
            summary.elapsed_ms = started.elapsed().as_millis() as u64;
            summary.log("ok");
            return Ok(summary);
        }

        let loader = BulkLoader::new(self.store.as_ref(), strategy)
            .row_attempts(self.config.row_attempts)
            .with_cancel(cancel.clone())
            .with_progress(progress.clone());
        match loader.load(&batch, &mut cache).await {
            Ok(report) => summary.load = Some(report),
            Err(LoadError::Cancelled {
                partial,
                rolled_back,
                ..
            }) => {
                summary.load = Some(*partial);
                summary.rolled_back = rolled_back;
                return Err(finish_err(summary, started, |summary| {
                    SyncError::Cancelled { summary }
                }));
            }
            Err(error) => {
                summary.load = Some(error.partial().clone());
                summary.rolled_back = error.rolled_back();
                return Err(finish_err(summary, started, |summary| {
                    SyncError::Load { summary, error }
                }));
            }
        }

        summary.new_watermark = match self.store.latest_played_at().await {
            Ok(w) => w,
            Err(e) => {
                warn!(error = %e, "could not re-read watermark after load");
                None
            }
        };
        summary.elapsed_ms = started.elapsed().as_millis() as u64;
        summary.log("ok");
        Ok(summary)
    }
}

fn finish_err(
    mut summary: SyncSummary,
    started: Instant,
    build: impl FnOnce(Box<SyncSummary>) -> SyncError,
) -> SyncError {
    summary.elapsed_ms = started.elapsed().as_millis() as u64;
    let outcome = match summary.load {
        Some(_) if summary.rolled_back => "rolled_back",
        _ => "failed",
    };
    summary.log(outcome);
    build(Box::new(summary))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory_store::MemoryStore;
    use crate::database_ops::store::{ArtistRow, PlayRow, TrackRow};
    use crate::test_support::{record, ScriptedSource};
    use chrono::TimeZone;
    use serde_json::json;
    use std::time::Duration;

    fn abc_pages() -> Vec<Vec<serde_json::Value>> {
        // Newest first, as the source serves them.
        vec![vec![
            json!({"artist": {"name": "X"}, "name": "Song2", "@attr": {"nowplaying": "true"}}),
            record("X", Some("Y"), "Song2", 200),
            record("X", None, "Song1", 100),
            record("X", None, "Song1", 100),
        ]]
    }

    fn quick_config(strategy: LoadStrategy) -> SyncConfig {
        SyncConfig {
            fetch: FetchOptions {
                group_delay: Duration::from_millis(1),
                page_timeout: Duration::from_secs(2),
                ..FetchOptions::default()
            },
            incremental_strategy: strategy,
            backfill_strategy: strategy,
            row_attempts: 2,
        }
    }

    fn orchestrator(
        store: &MemoryStore,
        source: ScriptedSource,
        strategy: LoadStrategy,
    ) -> SyncOrchestrator {
        SyncOrchestrator::new(
            Arc::new(store.clone()),
            Arc::new(source),
            quick_config(strategy),
        )
    }

    #[tokio::test]
    async fn backfill_materializes_the_scenario() {
        for strategy in [LoadStrategy::PerRecord, LoadStrategy::batched(), LoadStrategy::BulkCopy] {
            let store = MemoryStore::new();
            let sync = orchestrator(&store, ScriptedSource::new(abc_pages()), strategy);
            let summary = sync
                .backfill(None, None, CancellationToken::new())
                .await
                .unwrap();

            let counts = store.counts().await.unwrap();
            assert_eq!(
                (counts.artists, counts.albums, counts.tracks, counts.plays),
                (1, 1, 2, 2),
                "{strategy}"
            );
            assert_eq!(summary.fetch.as_ref().unwrap().now_playing_skipped, 1);
            assert_eq!(summary.resolve.as_ref().unwrap().duplicate_plays, 1);
            assert_eq!(summary.plays_inserted(), 2);
            assert_eq!(summary.new_watermark.map(|w| w.timestamp()), Some(200));
        }
    }

    #[tokio::test]
    async fn incremental_from_watermark_persists_only_newer_plays() {
        let store = MemoryStore::new();
        store
            .insert_artists(&[ArtistRow {
                name: "W".into(),
                external_id: None,
                image_url: None,
                external_url: None,
            }])
            .await
            .unwrap();
        let (artist_id, _) = store.lookup_artists(&["W".into()]).await.unwrap()[0].clone();
        store
            .insert_tracks(&[TrackRow {
                artist_id,
                album_id: None,
                name: "Earlier".into(),
                external_id: None,
                duration_secs: None,
                external_url: None,
            }])
            .await
            .unwrap();
        let (track_id, _, _) = store
            .lookup_tracks(&[(artist_id, "Earlier".into())])
            .await
            .unwrap()[0]
            .clone();
        store
            .insert_plays(&[PlayRow {
                track_id,
                played_at: Utc.timestamp_opt(150, 0).unwrap(),
                device_source: None,
            }])
            .await
            .unwrap();

        let sync = orchestrator(&store, ScriptedSource::new(abc_pages()), LoadStrategy::batched());
        let summary = sync
            .incremental(None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.previous_watermark.map(|w| w.timestamp()), Some(150));
        assert_eq!(summary.new_watermark.map(|w| w.timestamp()), Some(200));
        assert_eq!(summary.plays_inserted(), 1);
        assert_eq!(summary.fetch.as_ref().unwrap().before_cutoff_skipped, 2);
        let counts = store.counts().await.unwrap();
        assert_eq!((counts.tracks, counts.plays), (2, 2));

        // Nothing new upstream: the second run writes nothing.
        let again = sync
            .incremental(None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.plays_inserted(), 0);
        assert_eq!(again.load, Some(LoadReport::default()));
        assert_eq!(again.new_watermark.map(|w| w.timestamp()), Some(200));
        assert_eq!(store.counts().await.unwrap().plays, 2);
    }

    #[tokio::test]
    async fn overlapping_pages_store_each_key_once() {
        // History shifted between page requests: page 2 repeats the tail of page 1.
        let pages = vec![
            vec![
                record("A", Some("L"), "t4", 400),
                record("A", Some("L"), "t3", 300),
            ],
            vec![
                record("A", Some("L"), "t3", 300),
                record("B", None, "t2", 200),
            ],
            vec![record("B", None, "t2", 200), record("A", Some("L"), "t1", 100)],
        ];
        let store = MemoryStore::new();
        let sync = orchestrator(&store, ScriptedSource::new(pages), LoadStrategy::batched());
        sync.backfill(None, None, CancellationToken::new())
            .await
            .unwrap();

        let counts = store.counts().await.unwrap();
        assert_eq!(
            (counts.artists, counts.albums, counts.tracks, counts.plays),
            (2, 1, 4, 4)
        );
        assert_eq!(counts.duplicate_play_keys, 0);
        assert_eq!(counts.plays_without_track, 0);
    }

    #[tokio::test]
    async fn second_concurrent_run_is_rejected() {
        let store = MemoryStore::new();
        let source = ScriptedSource::new(abc_pages()).delay_page(1, Duration::from_millis(100));
        let sync = orchestrator(&store, source, LoadStrategy::batched());

        let (first, second) = tokio::join!(
            sync.incremental(None, CancellationToken::new()),
            sync.incremental(None, CancellationToken::new()),
        );
        assert!(first.is_ok());
        assert!(matches!(second, Err(SyncError::AlreadyRunning)));

        // The lock is released once the first run finishes.
        assert!(sync.incremental(None, CancellationToken::new()).await.is_ok());
    }

    #[tokio::test]
    async fn orchestrators_sharing_a_store_run_one_at_a_time() {
        let store = MemoryStore::new();
        let slow = ScriptedSource::new(abc_pages()).delay_page(1, Duration::from_millis(100));
        let first = orchestrator(&store, slow, LoadStrategy::batched());
        let second = orchestrator(&store, ScriptedSource::new(abc_pages()), LoadStrategy::BulkCopy);

        let (a, b) = tokio::join!(
            first.backfill(None, None, CancellationToken::new()),
            second.backfill(None, None, CancellationToken::new()),
        );
        assert!(a.is_ok());
        assert!(matches!(b, Err(SyncError::AlreadyRunning)));
        assert_eq!(store.counts().await.unwrap().plays, 2);

        // Released when the first run ends.
        let again = second
            .incremental(None, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.plays_inserted(), 0);
    }

    #[tokio::test]
    async fn cancelled_run_writes_nothing_and_reports() {
        let store = MemoryStore::new();
        let sync = orchestrator(&store, ScriptedSource::new(abc_pages()), LoadStrategy::BulkCopy);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = sync.backfill(None, None, cancel).await.unwrap_err();
        assert!(matches!(err, SyncError::Cancelled { .. }));
        assert!(err.summary().is_some());
        assert_eq!(store.counts().await.unwrap().plays, 0);
    }

    #[tokio::test]
    async fn first_page_failure_fails_the_run() {
        let store = MemoryStore::new();
        let source = ScriptedSource::new(abc_pages()).fail_page(1);
        let sync = orchestrator(&store, source, LoadStrategy::batched());
        let err = sync
            .incremental(None, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Fetch { .. }));
    }
}
