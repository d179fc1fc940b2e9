use std::collections::HashSet;

use chrono::{DateTime, Utc};
use indexmap::map::Entry;
use indexmap::IndexMap;
use serde::Serialize;

use crate::database_ops::identity_cache::IdentityCache;
use crate::normalization::NormalizedPlay;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewArtist {
    pub name: String,
    pub external_id: Option<String>,
    pub image_url: Option<String>,
    pub external_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAlbum {
    pub artist_name: String,
    pub name: String,
    pub external_id: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTrack {
    pub artist_name: String,
    pub name: String,
    pub album_name: Option<String>,
    pub external_id: Option<String>,
    pub duration_secs: Option<i32>,
    pub external_url: Option<String>,
}

/// A play still addressed by natural keys; the track id is resolved at load time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PendingPlay {
    pub artist_name: String,
    pub track_name: String,
    pub played_at: DateTime<Utc>,
}

/// Rows to write, in first-seen order. Entities already in the identity cache are absent.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ResolvedBatch {
    pub artists: Vec<NewArtist>,
    pub albums: Vec<NewAlbum>,
    pub tracks: Vec<NewTrack>,
    pub plays: Vec<PendingPlay>,
}

impl ResolvedBatch {
    pub fn is_empty(&self) -> bool {
        self.artists.is_empty()
            && self.albums.is_empty()
            && self.tracks.is_empty()
            && self.plays.is_empty()
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ResolveReport {
    pub artists_new: usize,
    pub artists_known: usize,
    pub albums_new: usize,
    pub albums_known: usize,
    pub tracks_new: usize,
    pub tracks_known: usize,
    pub plays: usize,
    pub duplicate_plays: usize,
}

pub fn resolve(plays: &[NormalizedPlay], cache: &IdentityCache) -> (ResolvedBatch, ResolveReport) {
    let mut artists: IndexMap<&str, NewArtist> = IndexMap::new();
    let mut albums: IndexMap<(&str, &str), NewAlbum> = IndexMap::new();
    let mut tracks: IndexMap<(&str, &str), NewTrack> = IndexMap::new();
    let mut known_artists: HashSet<&str> = HashSet::new();
    let mut known_albums: HashSet<(&str, &str)> = HashSet::new();
    let mut known_tracks: HashSet<(&str, &str)> = HashSet::new();
    let mut seen_plays: HashSet<(&str, &str, DateTime<Utc>)> = HashSet::new();
    let mut pending = Vec::with_capacity(plays.len());
    let mut duplicate_plays = 0usize;

    for play in plays {
        let artist = play.artist_name.as_str();
        if cache.artist_id(artist).is_some() {
            known_artists.insert(artist);
        } else if let Entry::Vacant(slot) = artists.entry(artist) {
            slot.insert(NewArtist {
                name: play.artist_name.clone(),
                external_id: play.artist_external_id.clone(),
                image_url: play.artist_image_url.clone(),
                external_url: play.artist_url.clone(),
            });
        }

        if let Some(album) = play.album_name.as_deref() {
            if cache.album_id_by_name(artist, album).is_some() {
                known_albums.insert((artist, album));
            } else if let Entry::Vacant(slot) = albums.entry((artist, album)) {
                slot.insert(NewAlbum {
                    artist_name: play.artist_name.clone(),
                    name: album.to_string(),
                    external_id: play.album_external_id.clone(),
                    image_url: play.album_image_url.clone(),
                });
            }
        }

        let track = play.track_name.as_str();
        if cache.track_id_by_name(artist, track).is_some() {
            known_tracks.insert((artist, track));
        } else if let Entry::Vacant(slot) = tracks.entry((artist, track)) {
            slot.insert(NewTrack {
                artist_name: play.artist_name.clone(),
                name: play.track_name.clone(),
                album_name: play.album_name.clone(),
                external_id: play.track_external_id.clone(),
                duration_secs: play.track_duration_secs,
                external_url: play.track_url.clone(),
            });
        }

        if seen_plays.insert((artist, track, play.played_at)) {
            pending.push(PendingPlay {
                artist_name: play.artist_name.clone(),
                track_name: play.track_name.clone(),
                played_at: play.played_at,
            });
        } else {
            duplicate_plays += 1;
        }
    }

    let report = ResolveReport {
        artists_new: artists.len(),
        artists_known: known_artists.len(),
        albums_new: albums.len(),
        albums_known: known_albums.len(),
        tracks_new: tracks.len(),
        tracks_known: known_tracks.len(),
        plays: pending.len(),
        duplicate_plays,
    };
    let batch = ResolvedBatch {
        artists: artists.into_values().collect(),
        albums: albums.into_values().collect(),
        tracks: tracks.into_values().collect(),
        plays: pending,
    };
    (batch, report)
}
