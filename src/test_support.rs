use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};

use crate::lastfm::client::{HistoryPage, HistorySource, PageRequest};
use crate::normalization::NormalizedPlay;

pub fn play(artist: &str, album: Option<&str>, track: &str, uts: i64) -> NormalizedPlay {
    NormalizedPlay {
        artist_name: artist.to_string(),
        artist_external_id: None,
        artist_image_url: None,
        artist_url: None,
        album_name: album.map(str::to_string),
        album_external_id: None,
        album_image_url: None,
        track_name: track.to_string(),
        track_external_id: None,
        track_duration_secs: None,
        track_url: None,
        played_at: Utc.timestamp_opt(uts, 0).unwrap(),
    }
}

/// An extended-format `recenttracks` entry.
pub fn record(artist: &str, album: Option<&str>, track: &str, uts: i64) -> Value {
    json!({
        "artist": {"name": artist, "mbid": "", "url": format!("https://www.last.fm/music/{artist}")},
        "name": track,
        "mbid": "",
        "album": {"#text": album.unwrap_or(""), "mbid": ""},
        "image": [],
        "date": {"uts": uts.to_string()}
    })
}

/// Serves fixed pages; page `n` is `pages[n - 1]`.
#[derive(Default)]
pub struct ScriptedSource {
    pages: Vec<Vec<Value>>,
    failing: HashSet<u32>,
    delays: HashMap<u32, Duration>,
    calls: Mutex<HashMap<u32, usize>>,
    last_from: Mutex<Option<i64>>,
}

impl ScriptedSource {
    pub fn new(pages: Vec<Vec<Value>>) -> Self {
        Self {
            pages,
            ..Default::default()
        }
    }

    pub fn fail_page(mut self, page: u32) -> Self {
        self.failing.insert(page);
        self
    }

    pub fn delay_page(mut self, page: u32, delay: Duration) -> Self {
        self.delays.insert(page, delay);
        self
    }

    pub fn calls(&self, page: u32) -> usize {
        self.calls.lock().unwrap().get(&page).copied().unwrap_or(0)
    }

    pub fn last_from(&self) -> Option<i64> {
        *self.last_from.lock().unwrap()
    }
}

#[async_trait]
impl HistorySource for ScriptedSource {
    async fn fetch_page(&self, req: PageRequest) -> Result<HistoryPage> {
        *self.calls.lock().unwrap().entry(req.page).or_default() += 1;
        *self.last_from.lock().unwrap() = req.from;
        if let Some(delay) = self.delays.get(&req.page) {
            tokio::time::sleep(*delay).await;
        }
        if self.failing.contains(&req.page) {
            bail!("scripted failure for page {}", req.page);
        }
        let records = self
            .pages
            .get(req.page as usize - 1)
            .cloned()
            .unwrap_or_default();
        Ok(HistoryPage {
            total_pages: self.pages.len() as u32,
            total_records: self.pages.iter().map(Vec::len).sum::<usize>() as u64,
            records,
        })
    }
}
