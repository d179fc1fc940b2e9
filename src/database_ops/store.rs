use std::fmt;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Artist,
    Album,
    Track,
    Play,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EntityKind::Artist => "artist",
            EntityKind::Album => "album",
            EntityKind::Track => "track",
            EntityKind::Play => "play",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtistRow {
    pub name: String,
    pub external_id: Option<String>,
    pub image_url: Option<String>,
    pub external_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumRow {
    pub artist_id: i64,
    pub name: String,
    pub external_id: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackRow {
    pub artist_id: i64,
    pub album_id: Option<i64>,
    pub name: String,
    pub external_id: Option<String>,
    pub duration_secs: Option<i32>,
    pub external_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayRow {
    pub track_id: i64,
    pub played_at: DateTime<Utc>,
    pub device_source: Option<String>,
}

/// `(artist_id, name)`: natural key of albums and tracks once the artist id is known.
pub type OwnedKey = (i64, String);

/// `(id, name)` for artists, `(id, artist_id, name)` for albums and tracks.
pub type ArtistIdRow = (i64, String);
pub type OwnedIdRow = (i64, i64, String);

/// Every natural key currently stored, used to seed a run's identity cache.
#[derive(Debug, Default, Clone)]
pub struct IdentitySnapshot {
    pub artists: Vec<ArtistIdRow>,
    pub albums: Vec<OwnedIdRow>,
    pub tracks: Vec<OwnedIdRow>,
}

/// Row counts plus integrity counters; every counter other than the four totals should be 0.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TableCounts {
    pub artists: u64,
    pub albums: u64,
    pub tracks: u64,
    pub plays: u64,
    pub duplicate_artist_names: u64,
    pub duplicate_album_keys: u64,
    pub duplicate_track_keys: u64,
    pub duplicate_play_keys: u64,
    pub plays_without_track: u64,
}

/// ORM-style access used by the per-record and batched strategies, plus the entry point
/// into a transactional bulk session.
///
/// Writes are insert-or-ignore on the natural keys. Ids are never taken from the write path;
/// callers re-read them with the `lookup_*` methods.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Latest stored `played_at`, the incremental watermark.
    async fn latest_played_at(&self) -> Result<Option<DateTime<Utc>>>;

    async fn load_identities(&self) -> Result<IdentitySnapshot>;

    async fn lookup_artists(&self, names: &[String]) -> Result<Vec<ArtistIdRow>>;
    async fn lookup_albums(&self, keys: &[OwnedKey]) -> Result<Vec<OwnedIdRow>>;
    async fn lookup_tracks(&self, keys: &[OwnedKey]) -> Result<Vec<OwnedIdRow>>;

    /// Insert-or-ignore; the returned count covers only rows actually inserted.
    /// A failing statement writes nothing.
    async fn insert_artists(&self, rows: &[ArtistRow]) -> Result<u64>;
    async fn insert_albums(&self, rows: &[AlbumRow]) -> Result<u64>;
    async fn insert_tracks(&self, rows: &[TrackRow]) -> Result<u64>;
    async fn insert_plays(&self, rows: &[PlayRow]) -> Result<u64>;

    async fn counts(&self) -> Result<TableCounts>;

    /// Open one all-or-nothing bulk session.
    async fn begin_bulk(&self) -> Result<Box<dyn BulkSession>>;

    /// Claim the store for one sync run. `None` means another run, possibly in another
    /// process, holds it. Dropping the returned lock releases the claim.
    async fn try_lock_run(&self) -> Result<Option<Box<dyn RunLock>>>;
}

/// Exclusive claim on a store for the length of a sync run; released on drop.
pub trait RunLock: Send + Sync {}

/// A single open transaction streaming whole collections into the store.
///
/// Dropping a session without `commit` must leave the store unchanged.
#[async_trait]
pub trait BulkSession: Send {
    async fn copy_artists(&mut self, rows: &[ArtistRow]) -> Result<u64>;
    async fn copy_albums(&mut self, rows: &[AlbumRow]) -> Result<u64>;
    async fn copy_tracks(&mut self, rows: &[TrackRow]) -> Result<u64>;
    async fn copy_plays(&mut self, rows: &[PlayRow]) -> Result<u64>;

    /// Lookups see the session's own uncommitted writes.
    async fn lookup_artists(&mut self, names: &[String]) -> Result<Vec<ArtistIdRow>>;
    async fn lookup_albums(&mut self, keys: &[OwnedKey]) -> Result<Vec<OwnedIdRow>>;
    async fn lookup_tracks(&mut self, keys: &[OwnedKey]) -> Result<Vec<OwnedIdRow>>;

    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}
