use anyhow::Context;
use tracing::{error, info, warn};

use super::{
    album_rows, artist_rows, owned_keys, play_rows, track_rows, BulkLoader, LoadError, LoadReport,
    LOOKUP_CHUNK,
};
use crate::database_ops::identity_cache::IdentityCache;
use crate::database_ops::resolver::ResolvedBatch;
use crate::database_ops::store::{BulkSession, EntityKind};

pub(super) async fn load(
    loader: &BulkLoader<'_>,
    batch: &ResolvedBatch,
    cache: &mut IdentityCache,
) -> Result<LoadReport, LoadError> {
    let mut report = LoadReport::default();
    let mut session = loader
        .store
        .begin_bulk()
        .await
        .map_err(|error| LoadError::Phase {
            phase: EntityKind::Artist,
            partial: Box::new(report.clone()),
            rolled_back: true,
            error: error.context("opening bulk session"),
        })?;
    let mut working = cache.clone();

    match run_phases(loader, session.as_mut(), batch, &mut working, &mut report).await {
        Ok(()) => {}
        Err(Halt::Cancelled(phase)) => {
            rollback(session).await;
            warn!(%phase, "bulk load cancelled; transaction rolled back");
            return Err(LoadError::Cancelled {
                phase,
                partial: Box::new(report),
                rolled_back: true,
            });
        }
        Err(Halt::Failed(phase, err)) => {
            rollback(session).await;
            error!(%phase, error = %format!("{err:#}"), "bulk load failed; transaction rolled back");
            return Err(LoadError::Phase {
                phase,
                partial: Box::new(report),
                rolled_back: true,
                error: err,
            });
        }
    }

    if let Err(err) = session.commit().await {
        return Err(LoadError::Phase {
            phase: EntityKind::Play,
            partial: Box::new(report),
            rolled_back: true,
            error: err.context("committing bulk transaction"),
        });
    }
    *cache = working;
    info!(plays = report.plays.inserted, "bulk transaction committed");
    Ok(report)
}

enum Halt {
    Cancelled(EntityKind),
    Failed(EntityKind, anyhow::Error),
}

async fn rollback(session: Box<dyn BulkSession>) {
    if let Err(err) = session.rollback().await {
        // The transaction dies with its connection either way.
        warn!(error = %err, "explicit rollback failed");
    }
}

async fn run_phases(
    loader: &BulkLoader<'_>,
    session: &mut dyn BulkSession,
    batch: &ResolvedBatch,
    cache: &mut IdentityCache,
    report: &mut LoadReport,
) -> Result<(), Halt> {
    let check = |phase: EntityKind| {
        if loader.cancel.is_cancelled() {
            Err(Halt::Cancelled(phase))
        } else {
            Ok(())
        }
    };

    // artists
    let phase = EntityKind::Artist;
    check(phase)?;
    let rows = artist_rows(batch).rows;
    let inserted = session
        .copy_artists(&rows)
        .await
        .context("copying artists")
        .map_err(|e| Halt::Failed(phase, e))?;
    tally(report, phase, rows.len(), 0, inserted);
    for chunk in rows.chunks(LOOKUP_CHUNK) {
        let names: Vec<String> = chunk.iter().map(|r| r.name.clone()).collect();
        let ids = session
            .lookup_artists(&names)
            .await
            .map_err(|e| Halt::Failed(phase, e))?;
        cache.record_artists(ids);
    }
    loader.emit(phase, rows.len(), rows.len(), inserted as usize);

    // albums
    let phase = EntityKind::Album;
    check(phase)?;
    let albums = album_rows(batch, cache);
    let inserted = session
        .copy_albums(&albums.rows)
        .await
        .context("copying albums")
        .map_err(|e| Halt::Failed(phase, e))?;
    tally(report, phase, albums.rows.len(), albums.orphaned, inserted);
    for chunk in albums.rows.chunks(LOOKUP_CHUNK) {
        let keys = owned_keys(chunk.iter().map(|r| (r.artist_id, r.name.as_str())));
        let ids = session
            .lookup_albums(&keys)
            .await
            .map_err(|e| Halt::Failed(phase, e))?;
        cache.record_albums(ids);
    }
    loader.emit(phase, albums.rows.len(), albums.rows.len(), inserted as usize);

    // tracks
    let phase = EntityKind::Track;
    check(phase)?;
    let tracks = track_rows(batch, cache);
    report.album_unresolved = tracks.album_unresolved;
    let inserted = session
        .copy_tracks(&tracks.rows)
        .await
        .context("copying tracks")
        .map_err(|e| Halt::Failed(phase, e))?;
    tally(report, phase, tracks.rows.len(), tracks.orphaned, inserted);
    for chunk in tracks.rows.chunks(LOOKUP_CHUNK) {
        let keys = owned_keys(chunk.iter().map(|r| (r.artist_id, r.name.as_str())));
        let ids = session
            .lookup_tracks(&keys)
            .await
            .map_err(|e| Halt::Failed(phase, e))?;
        cache.record_tracks(ids);
    }
    loader.emit(phase, tracks.rows.len(), tracks.rows.len(), inserted as usize);

    // plays
    let phase = EntityKind::Play;
    check(phase)?;
    let plays = play_rows(batch, cache);
    if plays.orphaned > 0 {
        warn!(unmapped = plays.orphaned, "plays skipped: track id did not resolve");
    }
    let inserted = session
        .copy_plays(&plays.rows)
        .await
        .context("copying plays")
        .map_err(|e| Halt::Failed(phase, e))?;
    tally(report, phase, plays.rows.len(), plays.orphaned, inserted);
    loader.emit(phase, plays.rows.len(), plays.rows.len(), inserted as usize);

    Ok(())
}

fn tally(report: &mut LoadReport, phase: EntityKind, attempted: usize, orphaned: usize, inserted: u64) {
    let counts = report.counts_mut(phase);
    counts.attempted = attempted;
    counts.orphaned = orphaned;
    counts.inserted = inserted as usize;
    counts.existing = attempted.saturating_sub(inserted as usize);
}
