use std::collections::HashMap;

use anyhow::Result;
use tracing::{debug, instrument};

use crate::database_ops::store::{ArtistIdRow, CatalogStore, IdentitySnapshot, OwnedIdRow};

/// Run-scoped natural key -> surrogate id map.
///
/// Entries are only ever added from rows re-read from the store (or from a committed bulk
/// transaction), so every id here is a real primary key.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct IdentityCache {
    artists: HashMap<String, i64>,
    albums: HashMap<(i64, String), i64>,
    tracks: HashMap<(i64, String), i64>,
}

impl IdentityCache {
    pub fn new() -> Self {
        Self::default()
    }

    #[instrument(skip(store))]
    pub async fn seed(store: &dyn CatalogStore) -> Result<Self> {
        let snapshot = store.load_identities().await?;
        let cache = Self::from_snapshot(snapshot);
        debug!(
            artists = cache.artists.len(),
            albums = cache.albums.len(),
            tracks = cache.tracks.len(),
            "identity cache seeded"
        );
        Ok(cache)
    }

    pub fn from_snapshot(snapshot: IdentitySnapshot) -> Self {
        let mut cache = Self::new();
        cache.record_artists(snapshot.artists);
        cache.record_albums(snapshot.albums);
        cache.record_tracks(snapshot.tracks);
        cache
    }

    pub fn artist_id(&self, name: &str) -> Option<i64> {
        self.artists.get(name).copied()
    }

    pub fn album_id(&self, artist_id: i64, name: &str) -> Option<i64> {
        self.albums.get(&(artist_id, name.to_string())).copied()
    }

    pub fn track_id(&self, artist_id: i64, name: &str) -> Option<i64> {
        self.tracks.get(&(artist_id, name.to_string())).copied()
    }

    /// Album id by artist name, for callers still holding natural keys only.
    pub fn album_id_by_name(&self, artist_name: &str, album_name: &str) -> Option<i64> {
        self.artist_id(artist_name)
            .and_then(|artist_id| self.album_id(artist_id, album_name))
    }

    pub fn track_id_by_name(&self, artist_name: &str, track_name: &str) -> Option<i64> {
        self.artist_id(artist_name)
            .and_then(|artist_id| self.track_id(artist_id, track_name))
    }

    pub fn record_artists(&mut self, rows: impl IntoIterator<Item = ArtistIdRow>) {
        for (id, name) in rows {
            self.artists.insert(name, id);
        }
    }

    pub fn record_albums(&mut self, rows: impl IntoIterator<Item = OwnedIdRow>) {
        for (id, artist_id, name) in rows {
            self.albums.insert((artist_id, name), id);
        }
    }

    pub fn record_tracks(&mut self, rows: impl IntoIterator<Item = OwnedIdRow>) {
        for (id, artist_id, name) in rows {
            self.tracks.insert((artist_id, name), id);
        }
    }

    pub fn artist_count(&self) -> usize {
        self.artists.len()
    }

    pub fn album_count(&self) -> usize {
        self.albums.len()
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_go_through_artist_id() {
        let mut cache = IdentityCache::new();
        cache.record_artists([(1, "Radiohead".to_string())]);
        cache.record_albums([(10, 1, "OK Computer".to_string())]);
        cache.record_tracks([(100, 1, "Airbag".to_string())]);

        assert_eq!(cache.album_id_by_name("Radiohead", "OK Computer"), Some(10));
        assert_eq!(cache.track_id_by_name("Radiohead", "Airbag"), Some(100));
        assert_eq!(cache.track_id_by_name("radiohead", "Airbag"), None);
        assert_eq!(cache.track_id(2, "Airbag"), None);
    }

    #[test]
    fn snapshot_seeds_all_kinds() {
        let cache = IdentityCache::from_snapshot(IdentitySnapshot {
            artists: vec![(1, "A".into()), (2, "B".into())],
            albums: vec![(5, 1, "X".into())],
            tracks: vec![(7, 2, "Y".into())],
        });
        assert_eq!(cache.artist_count(), 2);
        assert_eq!(cache.album_count(), 1);
        assert_eq!(cache.track_id_by_name("B", "Y"), Some(7));
    }
}
