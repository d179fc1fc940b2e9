use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;

use crate::database_ops::store::{
    AlbumRow, ArtistIdRow, ArtistRow, BulkSession, CatalogStore, IdentitySnapshot, OwnedIdRow,
    OwnedKey, PlayRow, RunLock, TableCounts, TrackRow,
};

#[derive(Debug, Clone, Default)]
struct Tables {
    last_id: i64,
    artists: IndexMap<String, (i64, ArtistRow)>,
    albums: IndexMap<OwnedKey, (i64, AlbumRow)>,
    tracks: IndexMap<OwnedKey, (i64, TrackRow)>,
    plays: IndexMap<(i64, DateTime<Utc>), (i64, PlayRow)>,
    artist_ids: HashSet<i64>,
    album_ids: HashSet<i64>,
    track_ids: HashSet<i64>,
}

fn check_text<'a>(values: impl IntoIterator<Item = Option<&'a str>>) -> Result<()> {
    if values.into_iter().flatten().any(|v| v.contains('\0')) {
        bail!("invalid byte sequence for encoding \"UTF8\": 0x00");
    }
    Ok(())
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn insert_artists(&mut self, rows: &[ArtistRow]) -> Result<u64> {
        for r in rows {
            check_text([
                Some(r.name.as_str()),
                r.external_id.as_deref(),
                r.image_url.as_deref(),
                r.external_url.as_deref(),
            ])?;
        }
        let mut inserted = 0;
        for r in rows {
            if !self.artists.contains_key(&r.name) {
                let id = self.next_id();
                self.artists.insert(r.name.clone(), (id, r.clone()));
                self.artist_ids.insert(id);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn insert_albums(&mut self, rows: &[AlbumRow]) -> Result<u64> {
        for r in rows {
            check_text([
                Some(r.name.as_str()),
                r.external_id.as_deref(),
                r.image_url.as_deref(),
            ])?;
            if !self.artist_ids.contains(&r.artist_id) {
                bail!(
                    "insert or update on table \"albums\" violates foreign key constraint (artist_id={})",
                    r.artist_id
                );
            }
        }
        let mut inserted = 0;
        for r in rows {
            let key = (r.artist_id, r.name.clone());
            if !self.albums.contains_key(&key) {
                let id = self.next_id();
                self.albums.insert(key, (id, r.clone()));
                self.album_ids.insert(id);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn insert_tracks(&mut self, rows: &[TrackRow]) -> Result<u64> {
        for r in rows {
            check_text([
                Some(r.name.as_str()),
                r.external_id.as_deref(),
                r.external_url.as_deref(),
            ])?;
            if !self.artist_ids.contains(&r.artist_id) {
                bail!(
                    "insert or update on table \"tracks\" violates foreign key constraint (artist_id={})",
                    r.artist_id
                );
            }
            if let Some(album_id) = r.album_id {
                if !self.album_ids.contains(&album_id) {
                    bail!(
                        "insert or update on table \"tracks\" violates foreign key constraint (album_id={})",
                        album_id
                    );
                }
            }
        }
        let mut inserted = 0;
        for r in rows {
            let key = (r.artist_id, r.name.clone());
            if !self.tracks.contains_key(&key) {
                let id = self.next_id();
                self.tracks.insert(key, (id, r.clone()));
                self.track_ids.insert(id);
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn insert_plays(&mut self, rows: &[PlayRow]) -> Result<u64> {
        for r in rows {
            check_text([r.device_source.as_deref()])?;
            if !self.track_ids.contains(&r.track_id) {
                bail!(
                    "insert or update on table \"plays\" violates foreign key constraint (track_id={})",
                    r.track_id
                );
            }
        }
        let mut inserted = 0;
        for r in rows {
            let key = (r.track_id, r.played_at);
            if !self.plays.contains_key(&key) {
                let id = self.next_id();
                self.plays.insert(key, (id, r.clone()));
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    fn lookup_artists(&self, names: &[String]) -> Vec<ArtistIdRow> {
        names
            .iter()
            .filter_map(|n| self.artists.get(n).map(|(id, _)| (*id, n.clone())))
            .collect()
    }

    fn lookup_albums(&self, keys: &[OwnedKey]) -> Vec<OwnedIdRow> {
        keys.iter()
            .filter_map(|k| self.albums.get(k).map(|(id, _)| (*id, k.0, k.1.clone())))
            .collect()
    }

    fn lookup_tracks(&self, keys: &[OwnedKey]) -> Vec<OwnedIdRow> {
        keys.iter()
            .filter_map(|k| self.tracks.get(k).map(|(id, _)| (*id, k.0, k.1.clone())))
            .collect()
    }
}

/// Thread-safe in-memory catalog. Enforces unique natural keys, foreign keys on every child
/// row and statement-level atomicity, and rejects NUL bytes in text like Postgres does.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    /// Shared by every clone, like an advisory lock shared by every connection.
    running: Arc<AtomicBool>,
}

struct MemoryRunLock(Arc<AtomicBool>);

impl RunLock for MemoryRunLock {}

impl Drop for MemoryRunLock {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))
    }

    /// Artist names in insertion order.
    pub fn artist_names(&self) -> Result<Vec<String>> {
        Ok(self.tables()?.artists.keys().cloned().collect())
    }

    pub fn track(&self, artist_id: i64, name: &str) -> Result<Option<(i64, TrackRow)>> {
        Ok(self
            .tables()?
            .tracks
            .get(&(artist_id, name.to_string()))
            .cloned())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn latest_played_at(&self) -> Result<Option<DateTime<Utc>>> {
        Ok(self.tables()?.plays.keys().map(|(_, at)| *at).max())
    }

    async fn load_identities(&self) -> Result<IdentitySnapshot> {
        let t = self.tables()?;
        Ok(IdentitySnapshot {
            artists: t
                .artists
                .iter()
                .map(|(name, (id, _))| (*id, name.clone()))
                .collect(),
            albums: t
                .albums
                .iter()
                .map(|((artist_id, name), (id, _))| (*id, *artist_id, name.clone()))
                .collect(),
            tracks: t
                .tracks
                .iter()
                .map(|((artist_id, name), (id, _))| (*id, *artist_id, name.clone()))
                .collect(),
        })
    }

    async fn lookup_artists(&self, names: &[String]) -> Result<Vec<ArtistIdRow>> {
        Ok(self.tables()?.lookup_artists(names))
    }

    async fn lookup_albums(&self, keys: &[OwnedKey]) -> Result<Vec<OwnedIdRow>> {
        Ok(self.tables()?.lookup_albums(keys))
    }

    async fn lookup_tracks(&self, keys: &[OwnedKey]) -> Result<Vec<OwnedIdRow>> {
        Ok(self.tables()?.lookup_tracks(keys))
    }

    async fn insert_artists(&self, rows: &[ArtistRow]) -> Result<u64> {
        self.tables()?.insert_artists(rows)
    }

    async fn insert_albums(&self, rows: &[AlbumRow]) -> Result<u64> {
        self.tables()?.insert_albums(rows)
    }

    async fn insert_tracks(&self, rows: &[TrackRow]) -> Result<u64> {
        self.tables()?.insert_tracks(rows)
    }

    async fn insert_plays(&self, rows: &[PlayRow]) -> Result<u64> {
        self.tables()?.insert_plays(rows)
    }

    async fn counts(&self) -> Result<TableCounts> {
        let t = self.tables()?;
        let plays_without_track = t
            .plays
            .values()
            .filter(|(_, p)| !t.track_ids.contains(&p.track_id))
            .count() as u64;
        Ok(TableCounts {
            artists: t.artists.len() as u64,
            albums: t.albums.len() as u64,
            tracks: t.tracks.len() as u64,
            plays: t.plays.len() as u64,
            plays_without_track,
            ..Default::default()
        })
    }

    async fn begin_bulk(&self) -> Result<Box<dyn BulkSession>> {
        let working = self.tables()?.clone();
        Ok(Box::new(MemoryBulkSession {
            target: Arc::clone(&self.tables),
            working,
        }))
    }

    async fn try_lock_run(&self) -> Result<Option<Box<dyn RunLock>>> {
        let claimed = self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        Ok(claimed.then(|| Box::new(MemoryRunLock(Arc::clone(&self.running))) as Box<dyn RunLock>))
    }
}

/// Works on a private copy of the tables, published on commit.
///
/// Writes made to the store by others while a session is open are overwritten by its commit.
struct MemoryBulkSession {
    target: Arc<Mutex<Tables>>,
    working: Tables,
}

#[async_trait]
impl BulkSession for MemoryBulkSession {
    async fn copy_artists(&mut self, rows: &[ArtistRow]) -> Result<u64> {
        self.working.insert_artists(rows)
    }

    async fn copy_albums(&mut self, rows: &[AlbumRow]) -> Result<u64> {
        self.working.insert_albums(rows)
    }

    async fn copy_tracks(&mut self, rows: &[TrackRow]) -> Result<u64> {
        self.working.insert_tracks(rows)
    }

    async fn copy_plays(&mut self, rows: &[PlayRow]) -> Result<u64> {
        self.working.insert_plays(rows)
    }

    async fn lookup_artists(&mut self, names: &[String]) -> Result<Vec<ArtistIdRow>> {
        Ok(self.working.lookup_artists(names))
    }

    async fn lookup_albums(&mut self, keys: &[OwnedKey]) -> Result<Vec<OwnedIdRow>> {
        Ok(self.working.lookup_albums(keys))
    }

    async fn lookup_tracks(&mut self, keys: &[OwnedKey]) -> Result<Vec<OwnedIdRow>> {
        Ok(self.working.lookup_tracks(keys))
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let MemoryBulkSession { target, working } = *self;
        let mut guard = target
            .lock()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        *guard = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn artist(name: &str) -> ArtistRow {
        ArtistRow {
            name: name.to_string(),
            external_id: None,
            image_url: None,
            external_url: None,
        }
    }

    #[tokio::test]
    async fn insert_or_ignore_counts_only_new_rows() {
        let store = MemoryStore::new();
        assert_eq!(store.insert_artists(&[artist("A"), artist("A")]).await.unwrap(), 1);
        assert_eq!(store.insert_artists(&[artist("A"), artist("B")]).await.unwrap(), 1);
        assert_eq!(store.artist_names().unwrap(), vec!["A", "B"]);
    }

    #[tokio::test]
    async fn failing_statement_writes_nothing() {
        let store = MemoryStore::new();
        let err = store
            .insert_artists(&[artist("ok"), artist("bad\0name")])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("0x00"));
        assert_eq!(store.counts().await.unwrap().artists, 0);
    }

    #[tokio::test]
    async fn foreign_keys_are_enforced() {
        let store = MemoryStore::new();
        let err = store
            .insert_plays(&[PlayRow {
                track_id: 42,
                played_at: Utc.timestamp_opt(1, 0).unwrap(),
                device_source: None,
            }])
            .await
            .unwrap_err();
        assert!(err.to_string().contains("foreign key"));
    }

    #[tokio::test]
    async fn bulk_session_publishes_only_on_commit() {
        let store = MemoryStore::new();

        let mut session = store.begin_bulk().await.unwrap();
        session.copy_artists(&[artist("A")]).await.unwrap();
        assert_eq!(session.lookup_artists(&["A".into()]).await.unwrap().len(), 1);
        assert!(store.lookup_artists(&["A".into()]).await.unwrap().is_empty());
        session.rollback().await.unwrap();
        assert_eq!(store.counts().await.unwrap().artists, 0);

        let mut session = store.begin_bulk().await.unwrap();
        session.copy_artists(&[artist("B")]).await.unwrap();
        session.commit().await.unwrap();
        assert_eq!(store.artist_names().unwrap(), vec!["B"]);
    }

    #[tokio::test]
    async fn run_lock_is_shared_by_clones_and_released_on_drop() {
        let store = MemoryStore::new();
        let other = store.clone();

        let held = store.try_lock_run().await.unwrap();
        assert!(held.is_some());
        assert!(other.try_lock_run().await.unwrap().is_none());
        drop(held);
        assert!(other.try_lock_run().await.unwrap().is_some());
    }
}
