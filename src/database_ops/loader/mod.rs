//! Persists a resolved batch in dependency order: artists, albums, tracks, plays.
//!
//! Three strategies share the same row building and report shape:
//! - `PerRecord`: lookup, single-row insert-or-ignore, lookup, per entity.
//! - `Batched`: multi-row insert-or-ignore with a row-by-row fallback for failing batches.
//! - `BulkCopy`: one transaction, COPY into staging tables, all-or-nothing.
//!
//! Child rows are only built from ids found in the identity cache, and the cache only
//! learns ids re-read from the store, so a child can never point at a row that does not
//! exist.

mod bulk_copy;
mod rowwise;

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::database_ops::identity_cache::IdentityCache;
use crate::database_ops::resolver::ResolvedBatch;
use crate::database_ops::store::{
    AlbumRow, ArtistRow, CatalogStore, EntityKind, OwnedKey, PlayRow, TrackRow,
};
use crate::progress::{emit, Progress, ProgressFn, Stage};

pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const DEFAULT_ROW_ATTEMPTS: usize = 2;
/// Keys per scoped re-read query.
pub(crate) const LOOKUP_CHUNK: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum LoadStrategy {
    PerRecord,
    Batched { batch_size: usize },
    BulkCopy,
}

impl LoadStrategy {
    pub fn batched() -> Self {
        LoadStrategy::Batched {
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn batch_size(&self) -> Option<usize> {
        match self {
            LoadStrategy::Batched { batch_size } => Some(*batch_size),
            _ => None,
        }
    }

    /// Replace the batch size of a batched strategy; other strategies are unchanged.
    pub fn with_batch_size(self, size: usize) -> Self {
        match self {
            LoadStrategy::Batched { .. } => LoadStrategy::Batched {
                batch_size: size.max(1),
            },
            other => other,
        }
    }
}

impl fmt::Display for LoadStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadStrategy::PerRecord => f.write_str("per-record"),
            LoadStrategy::Batched { batch_size } => write!(f, "batched({batch_size})"),
            LoadStrategy::BulkCopy => f.write_str("copy"),
        }
    }
}

impl FromStr for LoadStrategy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per-record" | "per_record" | "record" => Ok(LoadStrategy::PerRecord),
            "batched" | "batch" => Ok(LoadStrategy::batched()),
            "copy" | "bulk-copy" | "bulk_copy" => Ok(LoadStrategy::BulkCopy),
            other => Err(anyhow!(
                "unknown load strategy '{other}' (expected per-record, batched or copy)"
            )),
        }
    }
}

/// Per-entity outcome. For plays `existing` counts duplicates of stored plays and
/// `orphaned` counts plays whose track could not be resolved.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct EntityCounts {
    pub attempted: usize,
    pub inserted: usize,
    pub existing: usize,
    pub failed: usize,
    pub orphaned: usize,
}

/// A row that could not be written even after the per-row retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RowFailure {
    pub entity: EntityKind,
    pub key: String,
    pub error: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct LoadReport {
    pub artists: EntityCounts,
    pub albums: EntityCounts,
    pub tracks: EntityCounts,
    pub plays: EntityCounts,
    /// Tracks written without their album because the album id did not resolve.
    pub album_unresolved: usize,
    pub failures: Vec<RowFailure>,
}

impl LoadReport {
    pub fn counts(&self, kind: EntityKind) -> &EntityCounts {
        match kind {
            EntityKind::Artist => &self.artists,
            EntityKind::Album => &self.albums,
            EntityKind::Track => &self.tracks,
            EntityKind::Play => &self.plays,
        }
    }

    fn counts_mut(&mut self, kind: EntityKind) -> &mut EntityCounts {
        match kind {
            EntityKind::Artist => &mut self.artists,
            EntityKind::Album => &mut self.albums,
            EntityKind::Track => &mut self.tracks,
            EntityKind::Play => &mut self.plays,
        }
    }

    pub fn unmapped_plays(&self) -> usize {
        self.plays.orphaned
    }

    pub fn plays_inserted(&self) -> usize {
        self.plays.inserted
    }

    pub(crate) fn record_failure(&mut self, entity: EntityKind, key: String, error: &anyhow::Error) {
        self.counts_mut(entity).failed += 1;
        self.failures.push(RowFailure {
            entity,
            key,
            error: format!("{error:#}"),
        });
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("{phase} phase failed (rolled_back={rolled_back}): {error:#}")]
    Phase {
        phase: EntityKind,
        partial: Box<LoadReport>,
        rolled_back: bool,
        error: anyhow::Error,
    },
    #[error("load cancelled during {phase} phase (rolled_back={rolled_back})")]
    Cancelled {
        phase: EntityKind,
        partial: Box<LoadReport>,
        rolled_back: bool,
    },
}

impl LoadError {
    /// Counts gathered before the failure. When `rolled_back` is true none of it persisted.
    pub fn partial(&self) -> &LoadReport {
        match self {
            LoadError::Phase { partial, .. } | LoadError::Cancelled { partial, .. } => partial,
        }
    }

    pub fn rolled_back(&self) -> bool {
        match self {
            LoadError::Phase { rolled_back, .. } | LoadError::Cancelled { rolled_back, .. } => {
                *rolled_back
            }
        }
    }
}

/// Rows for one phase, built against the cache as it stands when the phase starts.
#[derive(Debug)]
pub(crate) struct PhaseRows<R> {
    pub rows: Vec<R>,
    pub orphaned: usize,
    pub album_unresolved: usize,
}

// Derived Default would demand `R: Default`, which row types don't have.
impl<R> Default for PhaseRows<R> {
    fn default() -> Self {
        Self {
            rows: Vec::new(),
            orphaned: 0,
            album_unresolved: 0,
        }
    }
}

pub(crate) fn artist_rows(batch: &ResolvedBatch) -> PhaseRows<ArtistRow> {
    PhaseRows {
        rows: batch
            .artists
            .iter()
            .map(|a| ArtistRow {
                name: a.name.clone(),
                external_id: a.external_id.clone(),
                image_url: a.image_url.clone(),
                external_url: a.external_url.clone(),
            })
            .collect(),
        ..Default::default()
    }
}

pub(crate) fn album_rows(batch: &ResolvedBatch, cache: &IdentityCache) -> PhaseRows<AlbumRow> {
    let mut out = PhaseRows::default();
    for album in &batch.albums {
        match cache.artist_id(&album.artist_name) {
            Some(artist_id) => out.rows.push(AlbumRow {
                artist_id,
                name: album.name.clone(),
                external_id: album.external_id.clone(),
                image_url: album.image_url.clone(),
            }),
            None => out.orphaned += 1,
        }
    }
    out
}

pub(crate) fn track_rows(batch: &ResolvedBatch, cache: &IdentityCache) -> PhaseRows<TrackRow> {
    let mut out = PhaseRows::default();
    for track in &batch.tracks {
        let Some(artist_id) = cache.artist_id(&track.artist_name) else {
            out.orphaned += 1;
            continue;
        };
        let album_id = track
            .album_name
            .as_deref()
            .and_then(|album| cache.album_id(artist_id, album));
        if track.album_name.is_some() && album_id.is_none() {
            out.album_unresolved += 1;
        }
        out.rows.push(TrackRow {
            artist_id,
            album_id,
            name: track.name.clone(),
            external_id: track.external_id.clone(),
            duration_secs: track.duration_secs,
            external_url: track.external_url.clone(),
        });
    }
    out
}

pub(crate) fn play_rows(batch: &ResolvedBatch, cache: &IdentityCache) -> PhaseRows<PlayRow> {
    let mut out = PhaseRows::default();
    for play in &batch.plays {
        match cache.track_id_by_name(&play.artist_name, &play.track_name) {
            Some(track_id) => out.rows.push(PlayRow {
                track_id,
                played_at: play.played_at,
                device_source: None,
            }),
            None => out.orphaned += 1,
        }
    }
    out
}

pub(crate) fn owned_keys<'a>(rows: impl IntoIterator<Item = (i64, &'a str)>) -> Vec<OwnedKey> {
    rows.into_iter()
        .map(|(artist_id, name)| (artist_id, name.to_string()))
        .collect()
}

pub(crate) fn artist_key(row: &ArtistRow) -> String {
    row.name.clone()
}

pub(crate) fn album_key(row: &AlbumRow) -> String {
    format!("{}/{}", row.artist_id, row.name)
}

pub(crate) fn track_key(row: &TrackRow) -> String {
    format!("{}/{}", row.artist_id, row.name)
}

pub(crate) fn play_key(row: &PlayRow) -> String {
    format!("{}@{}", row.track_id, row.played_at.to_rfc3339())
}

/// Loads resolved batches into a `CatalogStore` with one strategy.
pub struct BulkLoader<'a> {
    store: &'a dyn CatalogStore,
    strategy: LoadStrategy,
    row_attempts: usize,
    cancel: CancellationToken,
    progress: Option<ProgressFn>,
}

impl<'a> BulkLoader<'a> {
    pub fn new(store: &'a dyn CatalogStore, strategy: LoadStrategy) -> Self {
        Self {
            store,
            strategy,
            row_attempts: DEFAULT_ROW_ATTEMPTS,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    pub fn row_attempts(mut self, attempts: usize) -> Self {
        self.row_attempts = attempts.max(1);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_progress(mut self, progress: Option<ProgressFn>) -> Self {
        self.progress = progress;
        self
    }

    #[instrument(skip_all, fields(strategy = %self.strategy))]
    pub async fn load(
        &self,
        batch: &ResolvedBatch,
        cache: &mut IdentityCache,
    ) -> Result<LoadReport, LoadError> {
        let report = match self.strategy {
            LoadStrategy::PerRecord => rowwise::load(self, batch, cache, 1, true).await?,
            LoadStrategy::Batched { batch_size } => {
                rowwise::load(self, batch, cache, batch_size.max(1), false).await?
            }
            LoadStrategy::BulkCopy => bulk_copy::load(self, batch, cache).await?,
        };
        info!(
            artists_inserted = report.artists.inserted,
            albums_inserted = report.albums.inserted,
            tracks_inserted = report.tracks.inserted,
            plays_inserted = report.plays.inserted,
            plays_duplicate = report.plays.existing,
            unmapped_plays = report.unmapped_plays(),
            failed_rows = report.failures.len(),
            "load complete"
        );
        Ok(report)
    }

    pub(crate) fn emit(&self, phase: EntityKind, done: usize, total: usize, accumulated: usize) {
        emit(
            self.progress.as_ref(),
            Progress {
                stage: Stage::Load(phase),
                done,
                total,
                accumulated,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database_ops::memory_store::MemoryStore;
    use crate::database_ops::resolver::resolve;
    use crate::test_support::play;
    use std::sync::{Arc, Mutex};

    const ALL: [LoadStrategy; 3] = [
        LoadStrategy::PerRecord,
        LoadStrategy::Batched { batch_size: 2 },
        LoadStrategy::BulkCopy,
    ];

    fn scenario() -> Vec<crate::normalization::NormalizedPlay> {
        vec![
            play("Artist", Some("Album"), "Track 1", 100),
            play("Artist", Some("Album"), "Track 2", 150),
            play("Artist", Some("Album"), "Track 1", 200),
        ]
    }

    async fn run(
        store: &MemoryStore,
        strategy: LoadStrategy,
        plays: &[crate::normalization::NormalizedPlay],
    ) -> (LoadReport, IdentityCache) {
        let mut cache = IdentityCache::seed(store).await.unwrap();
        let (batch, _) = resolve(plays, &cache);
        let report = BulkLoader::new(store, strategy)
            .load(&batch, &mut cache)
            .await
            .unwrap();
        (report, cache)
    }

    #[test]
    fn strategy_names_parse() {
        assert_eq!("per-record".parse::<LoadStrategy>().unwrap(), LoadStrategy::PerRecord);
        assert_eq!(
            "Batched".parse::<LoadStrategy>().unwrap(),
            LoadStrategy::Batched { batch_size: 500 }
        );
        assert_eq!("copy".parse::<LoadStrategy>().unwrap(), LoadStrategy::BulkCopy);
        assert!("fastest".parse::<LoadStrategy>().is_err());
        assert_eq!(
            LoadStrategy::batched().with_batch_size(50),
            LoadStrategy::Batched { batch_size: 50 }
        );
        assert_eq!(LoadStrategy::batched().with_batch_size(50).batch_size(), Some(50));
        assert_eq!(LoadStrategy::BulkCopy.with_batch_size(50).batch_size(), None);
    }

    #[tokio::test]
    async fn every_strategy_writes_the_scenario_once() {
        for strategy in ALL {
            let store = MemoryStore::new();
            let (report, cache) = run(&store, strategy, &scenario()).await;

            let counts = store.counts().await.unwrap();
            assert_eq!(
                (counts.artists, counts.albums, counts.tracks, counts.plays),
                (1, 1, 2, 3),
                "{strategy}"
            );
            assert_eq!(report.plays.inserted, 3, "{strategy}");
            assert_eq!(report.tracks.inserted, 2, "{strategy}");
            assert!(report.failures.is_empty(), "{strategy}");
            assert_eq!(cache.track_count(), 2, "{strategy}");

            let album_id = cache.album_id_by_name("Artist", "Album").unwrap();
            let artist_id = cache.artist_id("Artist").unwrap();
            let (_, track) = store.track(artist_id, "Track 2").unwrap().unwrap();
            assert_eq!(track.album_id, Some(album_id), "{strategy}");
        }
    }

    #[tokio::test]
    async fn reloading_is_idempotent() {
        for strategy in ALL {
            let store = MemoryStore::new();
            run(&store, strategy, &scenario()).await;

            // A fresh cache sees everything as known; only plays go through the store again.
            let (report, _) = run(&store, strategy, &scenario()).await;
            assert_eq!(report.plays.inserted, 0, "{strategy}");
            assert_eq!(report.plays.existing, 3, "{strategy}");
            assert_eq!(report.artists.attempted, 0, "{strategy}");

            // A stale, empty cache makes every entity look new; conflicts count as existing.
            let mut cache = IdentityCache::new();
            let (batch, _) = resolve(&scenario(), &cache);
            let report = BulkLoader::new(&store, strategy)
                .load(&batch, &mut cache)
                .await
                .unwrap();
            assert_eq!(report.artists.existing, 1, "{strategy}");
            assert_eq!(report.tracks.existing, 2, "{strategy}");
            assert_eq!(report.plays.existing, 3, "{strategy}");
            assert_eq!(store.counts().await.unwrap().plays, 3, "{strategy}");
        }
    }

    #[tokio::test]
    async fn poisoned_row_falls_back_to_single_rows() {
        let store = MemoryStore::new();
        let plays: Vec<_> = (0..500)
            .map(|i| {
                let track = if i == 250 {
                    "bad\0track".to_string()
                } else {
                    format!("Track {i}")
                };
                play("Artist", None, &track, 1_000 + i)
            })
            .collect();

        let mut cache = IdentityCache::new();
        let (batch, _) = resolve(&plays, &cache);
        let report = BulkLoader::new(&store, LoadStrategy::batched())
            .load(&batch, &mut cache)
            .await
            .unwrap();

        assert_eq!(report.tracks.inserted, 499);
        assert_eq!(report.tracks.failed, 1);
        assert_eq!(report.plays.inserted, 499);
        assert_eq!(report.unmapped_plays(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].entity, EntityKind::Track);
        assert!(report.failures[0].key.ends_with("bad\0track"));

        let counts = store.counts().await.unwrap();
        assert_eq!((counts.tracks, counts.plays), (499, 499));
    }

    #[tokio::test]
    async fn per_record_isolates_failures() {
        let store = MemoryStore::new();
        let plays = vec![
            play("Good", None, "Song", 1),
            play("Bad\0", None, "Song", 2),
        ];
        let (report, cache) = run(&store, LoadStrategy::PerRecord, &plays).await;
        assert_eq!(report.artists.inserted, 1);
        assert_eq!(report.artists.failed, 1);
        assert_eq!(report.tracks.orphaned, 1);
        assert_eq!(report.unmapped_plays(), 1);
        assert_eq!(report.plays.inserted, 1);
        assert!(cache.artist_id("Bad\0").is_none());
    }

    #[tokio::test]
    async fn failed_bulk_copy_leaves_store_and_cache_untouched() {
        let store = MemoryStore::new();
        run(&store, LoadStrategy::BulkCopy, &scenario()).await;
        let before = store.counts().await.unwrap();

        let mut cache = IdentityCache::seed(&store).await.unwrap();
        let cache_before = cache.clone();
        let plays = vec![
            play("Other", Some("LP"), "Fine", 300),
            play("Other", Some("LP"), "Broken\0", 301),
        ];
        let (batch, _) = resolve(&plays, &cache);
        let err = BulkLoader::new(&store, LoadStrategy::BulkCopy)
            .load(&batch, &mut cache)
            .await
            .unwrap_err();

        match &err {
            LoadError::Phase {
                phase, rolled_back, ..
            } => {
                assert_eq!(*phase, EntityKind::Track);
                assert!(*rolled_back);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.partial().artists.inserted, 1);
        assert_eq!(store.counts().await.unwrap(), before);
        assert_eq!(cache, cache_before);
    }

    #[tokio::test]
    async fn tracks_without_album_and_orphans_are_reported() {
        let store = MemoryStore::new();
        let mut cache = IdentityCache::new();
        let (mut batch, _) = resolve(&[play("A", Some("LP"), "T", 1)], &cache);
        // Album row lost before load: the track is kept without it.
        batch.albums.clear();
        let report = BulkLoader::new(&store, LoadStrategy::batched())
            .load(&batch, &mut cache)
            .await
            .unwrap();
        assert_eq!(report.album_unresolved, 1);
        assert_eq!(report.tracks.inserted, 1);
        let artist_id = cache.artist_id("A").unwrap();
        let (_, track) = store.track(artist_id, "T").unwrap().unwrap();
        assert_eq!(track.album_id, None);
    }

    #[tokio::test]
    async fn cancellation_stops_between_batches() {
        let store = MemoryStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut cache = IdentityCache::new();
        let (batch, _) = resolve(&scenario(), &cache);

        for strategy in ALL {
            let err = BulkLoader::new(&store, strategy)
                .with_cancel(cancel.clone())
                .load(&batch, &mut cache)
                .await
                .unwrap_err();
            assert!(matches!(err, LoadError::Cancelled { phase: EntityKind::Artist, .. }));
            assert_eq!(err.rolled_back(), strategy == LoadStrategy::BulkCopy);
        }
        assert_eq!(store.counts().await.unwrap().artists, 0);
    }

    #[tokio::test]
    async fn progress_reports_every_phase() {
        let store = MemoryStore::new();
        let seen: Arc<Mutex<Vec<Progress>>> = Arc::default();
        let sink = Arc::clone(&seen);
        let progress: ProgressFn = Arc::new(move |p| sink.lock().unwrap().push(p));

        let mut cache = IdentityCache::new();
        let (batch, _) = resolve(&scenario(), &cache);
        BulkLoader::new(&store, LoadStrategy::Batched { batch_size: 2 })
            .with_progress(Some(progress))
            .load(&batch, &mut cache)
            .await
            .unwrap();

        let seen = seen.lock().unwrap();
        let last_play = seen
            .iter()
            .filter(|p| p.stage == Stage::Load(EntityKind::Play))
            .last()
            .unwrap();
        assert_eq!((last_play.done, last_play.total, last_play.accumulated), (3, 3, 3));
        assert!(seen.iter().any(|p| p.stage == Stage::Load(EntityKind::Artist)));
    }

    #[test]
    fn child_rows_without_cached_parents_are_orphaned() {
        let (batch, _) = resolve(&scenario(), &IdentityCache::new());
        let cache = IdentityCache::new();

        let artists = artist_rows(&batch);
        assert_eq!((artists.rows.len(), artists.orphaned), (1, 0));
        let albums = album_rows(&batch, &cache);
        assert_eq!((albums.rows.len(), albums.orphaned), (0, 1));
        let tracks = track_rows(&batch, &cache);
        assert_eq!((tracks.rows.len(), tracks.orphaned), (0, 2));
        let plays = play_rows(&batch, &cache);
        assert_eq!((plays.rows.len(), plays.orphaned), (0, 3));
    }
}
