use std::slice;

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use tracing::{debug, warn};

use super::{
    album_key, album_rows, artist_key, artist_rows, owned_keys, play_key, play_rows, track_key,
    track_rows, BulkLoader, LoadError, LoadReport, PhaseRows, LOOKUP_CHUNK,
};
use crate::database_ops::identity_cache::IdentityCache;
use crate::database_ops::resolver::ResolvedBatch;
use crate::database_ops::store::{AlbumRow, ArtistRow, CatalogStore, EntityKind, PlayRow, TrackRow};

const PER_RECORD_PROGRESS_EVERY: usize = 100;

/// Per-kind store access used by the generic phase runner.
trait StoreRow: Clone + Send + Sync + Sized {
    const KIND: EntityKind;

    fn key(&self) -> String;

    fn insert<'a>(store: &'a dyn CatalogStore, rows: &'a [Self]) -> BoxFuture<'a, Result<u64>>;

    /// Look the rows up by natural key and record the ids found; returns how many were found.
    fn reread<'a>(
        store: &'a dyn CatalogStore,
        rows: &'a [Self],
        cache: &'a mut IdentityCache,
    ) -> BoxFuture<'a, Result<usize>>;
}

impl StoreRow for ArtistRow {
    const KIND: EntityKind = EntityKind::Artist;

    fn key(&self) -> String {
        artist_key(self)
    }

    fn insert<'a>(store: &'a dyn CatalogStore, rows: &'a [Self]) -> BoxFuture<'a, Result<u64>> {
        store.insert_artists(rows)
    }

    fn reread<'a>(
        store: &'a dyn CatalogStore,
        rows: &'a [Self],
        cache: &'a mut IdentityCache,
    ) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let mut found = 0;
            for chunk in rows.chunks(LOOKUP_CHUNK) {
                let names: Vec<String> = chunk.iter().map(|r| r.name.clone()).collect();
                let ids = store.lookup_artists(&names).await?;
                found += ids.len();
                cache.record_artists(ids);
            }
            Ok(found)
        })
    }
}

impl StoreRow for AlbumRow {
    const KIND: EntityKind = EntityKind::Album;

    fn key(&self) -> String {
        album_key(self)
    }

    fn insert<'a>(store: &'a dyn CatalogStore, rows: &'a [Self]) -> BoxFuture<'a, Result<u64>> {
        store.insert_albums(rows)
    }

    fn reread<'a>(
        store: &'a dyn CatalogStore,
        rows: &'a [Self],
        cache: &'a mut IdentityCache,
    ) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let mut found = 0;
            for chunk in rows.chunks(LOOKUP_CHUNK) {
                let keys = owned_keys(chunk.iter().map(|r| (r.artist_id, r.name.as_str())));
                let ids = store.lookup_albums(&keys).await?;
                found += ids.len();
                cache.record_albums(ids);
            }
            Ok(found)
        })
    }
}

impl StoreRow for TrackRow {
    const KIND: EntityKind = EntityKind::Track;

    fn key(&self) -> String {
        track_key(self)
    }

    fn insert<'a>(store: &'a dyn CatalogStore, rows: &'a [Self]) -> BoxFuture<'a, Result<u64>> {
        store.insert_tracks(rows)
    }

    fn reread<'a>(
        store: &'a dyn CatalogStore,
        rows: &'a [Self],
        cache: &'a mut IdentityCache,
    ) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async move {
            let mut found = 0;
            for chunk in rows.chunks(LOOKUP_CHUNK) {
                let keys = owned_keys(chunk.iter().map(|r| (r.artist_id, r.name.as_str())));
                let ids = store.lookup_tracks(&keys).await?;
                found += ids.len();
                cache.record_tracks(ids);
            }
            Ok(found)
        })
    }
}

impl StoreRow for PlayRow {
    const KIND: EntityKind = EntityKind::Play;

    fn key(&self) -> String {
        play_key(self)
    }

    fn insert<'a>(store: &'a dyn CatalogStore, rows: &'a [Self]) -> BoxFuture<'a, Result<u64>> {
        store.insert_plays(rows)
    }

    // Nothing references play ids.
    fn reread<'a>(
        _store: &'a dyn CatalogStore,
        _rows: &'a [Self],
        _cache: &'a mut IdentityCache,
    ) -> BoxFuture<'a, Result<usize>> {
        Box::pin(async { Ok(0) })
    }
}

pub(super) async fn load(
    loader: &BulkLoader<'_>,
    batch: &ResolvedBatch,
    cache: &mut IdentityCache,
    chunk_size: usize,
    per_record: bool,
) -> Result<LoadReport, LoadError> {
    let mut report = LoadReport::default();

    run_phase(loader, artist_rows(batch), cache, &mut report, chunk_size, per_record).await?;

    let albums = album_rows(batch, cache);
    run_phase(loader, albums, cache, &mut report, chunk_size, per_record).await?;

    let tracks = track_rows(batch, cache);
    report.album_unresolved = tracks.album_unresolved;
    run_phase(loader, tracks, cache, &mut report, chunk_size, per_record).await?;

    let plays = play_rows(batch, cache);
    run_phase(loader, plays, cache, &mut report, chunk_size, per_record).await?;

    Ok(report)
}

fn cancelled(phase: EntityKind, report: &LoadReport) -> LoadError {
    LoadError::Cancelled {
        phase,
        partial: Box::new(report.clone()),
        rolled_back: false,
    }
}

async fn run_phase<R: StoreRow>(
    loader: &BulkLoader<'_>,
    phase: PhaseRows<R>,
    cache: &mut IdentityCache,
    report: &mut LoadReport,
    chunk_size: usize,
    per_record: bool,
) -> Result<(), LoadError> {
    let PhaseRows { rows, orphaned, .. } = phase;
    let kind = R::KIND;
    {
        let counts = report.counts_mut(R::KIND);
        counts.attempted = rows.len();
        counts.orphaned = orphaned;
    }
    if orphaned > 0 {
        warn!(phase = %kind, orphaned, "rows skipped: parent id did not resolve");
    }
    if loader.cancel.is_cancelled() {
        return Err(cancelled(R::KIND, report));
    }

    let total = rows.len();
    let mut inserted = 0usize;
    let mut failed = 0usize;

    if per_record {
        for (i, row) in rows.iter().enumerate() {
            if loader.cancel.is_cancelled() {
                report.counts_mut(R::KIND).inserted = inserted;
                return Err(cancelled(R::KIND, report));
            }
            match write_record(loader, row, cache).await {
                Ok(true) => inserted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(phase = %kind, key = %row.key(), error = %e, "row failed");
                    report.record_failure(R::KIND, row.key(), &e);
                    failed += 1;
                }
            }
            let done = i + 1;
            if done % PER_RECORD_PROGRESS_EVERY == 0 || done == total {
                loader.emit(R::KIND, done, total, inserted);
            }
        }
    } else {
        let mut done = 0usize;
        for (batch_no, chunk) in rows.chunks(chunk_size).enumerate() {
            if loader.cancel.is_cancelled() {
                report.counts_mut(R::KIND).inserted = inserted;
                return Err(cancelled(R::KIND, report));
            }
            match R::insert(loader.store, chunk).await {
                Ok(n) => inserted += n as usize,
                Err(e) => {
                    warn!(
                        phase = %kind,
                        batch = batch_no,
                        rows = chunk.len(),
                        error = %e,
                        "batch insert failed; retrying row by row"
                    );
                    for row in chunk {
                        match insert_row(loader, row).await {
                            Ok(n) => inserted += n as usize,
                            Err(e) => {
                                warn!(phase = %kind, key = %row.key(), error = %e, "row failed after retries");
                                report.record_failure(R::KIND, row.key(), &e);
                                failed += 1;
                            }
                        }
                    }
                }
            }
            done += chunk.len();
            loader.emit(R::KIND, done, total, inserted);
        }

        if let Err(error) = R::reread(loader.store, &rows, cache).await {
            report.counts_mut(R::KIND).inserted = inserted;
            return Err(LoadError::Phase {
                phase: R::KIND,
                partial: Box::new(report.clone()),
                rolled_back: false,
                error: error.context("re-reading persisted rows"),
            });
        }
    }

    let counts = report.counts_mut(R::KIND);
    counts.inserted = inserted;
    counts.existing = total.saturating_sub(inserted + failed);
    debug!(phase = %kind, total, inserted, failed, "phase done");
    Ok(())
}

/// Single-row insert with bounded retries.
async fn insert_row<R: StoreRow>(loader: &BulkLoader<'_>, row: &R) -> Result<u64> {
    let mut last = None;
    let kind = R::KIND;
    for attempt in 1..=loader.row_attempts {
        match R::insert(loader.store, slice::from_ref(row)).await {
            Ok(n) => return Ok(n),
            Err(e) => {
                debug!(phase = %kind, attempt, error = %e, "row insert attempt failed");
                last = Some(e);
            }
        }
    }
    Err(last.unwrap_or_else(|| anyhow!("no insert attempts made")))
}

/// Lookup, insert-or-ignore, lookup. Returns whether the row was newly inserted.
async fn write_record<R: StoreRow>(
    loader: &BulkLoader<'_>,
    row: &R,
    cache: &mut IdentityCache,
) -> Result<bool> {
    let one = slice::from_ref(row);
    if R::reread(loader.store, one, cache).await? > 0 {
        return Ok(false);
    }
    let inserted = insert_row(loader, row).await?;
    R::reread(loader.store, one, cache).await?;
    Ok(inserted > 0)
}
