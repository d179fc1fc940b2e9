use chrono::{DateTime, TimeZone, Utc};
use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Decode into `T`, or `None` when the value has an unexpected shape.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

fn lenient_vec<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(match value {
        Value::Array(items) => items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect(),
        _ => Vec::new(),
    })
}

/// `artist` as sent by the source.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum ArtistField {
    Text(String),
    Object(ArtistObject),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ArtistObject {
    #[serde(rename = "#text", default, deserialize_with = "lenient")]
    pub text: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub mbid: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub image: Vec<ImageEntry>,
}

/// `album` is usually `{"#text", "mbid"}`; a bare string is accepted too.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AlbumField {
    Text(String),
    Object(AlbumObject),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AlbumObject {
    #[serde(rename = "#text", default, deserialize_with = "lenient")]
    pub text: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub mbid: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ImageEntry {
    #[serde(default, deserialize_with = "lenient")]
    pub size: Option<String>,
    #[serde(rename = "#text", default, deserialize_with = "lenient")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PlayDate {
    #[serde(default)]
    pub uts: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RecordAttr {
    #[serde(default, deserialize_with = "lenient")]
    pub nowplaying: Option<String>,
}

/// One raw history record, decoded leniently.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawPlay {
    #[serde(default, deserialize_with = "lenient")]
    pub artist: Option<ArtistField>,
    #[serde(default, deserialize_with = "lenient")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub mbid: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub url: Option<String>,
    #[serde(default, deserialize_with = "lenient")]
    pub album: Option<AlbumField>,
    #[serde(default, deserialize_with = "lenient_vec")]
    pub image: Vec<ImageEntry>,
    #[serde(default, deserialize_with = "lenient")]
    pub date: Option<PlayDate>,
    #[serde(default)]
    pub duration: Option<Value>,
    #[serde(rename = "@attr", default, deserialize_with = "lenient")]
    pub attr: Option<RecordAttr>,
}

impl RawPlay {
    /// Currently-playing pseudo record: flagged, or carrying no `date` at all.
    pub fn is_now_playing(&self) -> bool {
        let flagged = self
            .attr
            .as_ref()
            .and_then(|a| a.nowplaying.as_deref())
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));
        flagged || self.date.is_none()
    }

    /// Play time in Unix seconds, if present and parseable.
    pub fn timestamp(&self) -> Option<i64> {
        self.date.as_ref()?.uts.as_ref().and_then(value_as_i64)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizedPlay {
    pub artist_name: String,
    pub artist_external_id: Option<String>,
    pub artist_image_url: Option<String>,
    pub artist_url: Option<String>,
    pub album_name: Option<String>,
    pub album_external_id: Option<String>,
    pub album_image_url: Option<String>,
    pub track_name: String,
    pub track_external_id: Option<String>,
    pub track_duration_secs: Option<i32>,
    pub track_url: Option<String>,
    pub played_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum NormalizeFailure {
    #[error("record has no resolvable artist name")]
    MissingArtist,
    #[error("record has no track name")]
    MissingTrack,
    #[error("record has no usable play timestamp")]
    MissingTimestamp,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct NormalizeReport {
    pub input: usize,
    pub normalized: usize,
    pub missing_artist: usize,
    pub missing_track: usize,
    pub missing_timestamp: usize,
}

impl NormalizeReport {
    pub fn dropped(&self) -> usize {
        self.missing_artist + self.missing_track + self.missing_timestamp
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn value_as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Leading-integer parse: `"215"` and `"215.0"` both give 215.
fn leading_int(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    let end = raw
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && c == '-')))
        .map_or(raw.len(), |(i, _)| i);
    raw[..end].parse().ok()
}

fn duration_secs(value: Option<&Value>) -> Option<i32> {
    let secs = match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => leading_int(s),
        _ => None,
    }?;
    i32::try_from(secs).ok().filter(|&s| s > 0)
}

fn artist_name(field: &ArtistField) -> Option<String> {
    match field {
        ArtistField::Text(s) => non_blank(Some(s.as_str())),
        ArtistField::Object(obj) => {
            non_blank(obj.text.as_deref()).or_else(|| non_blank(obj.name.as_deref()))
        }
    }
}

fn size_rank(size: Option<&str>, position: usize) -> usize {
    match size.map(str::trim) {
        Some("small") => 0,
        Some("medium") => 1,
        Some("large") => 2,
        Some("extralarge") => 3,
        Some("mega") => 4,
        _ => position,
    }
}

/// The `extralarge` image, else the largest non-empty one.
pub fn pick_image(images: &[ImageEntry]) -> Option<String> {
    let candidates: Vec<(usize, String)> = images
        .iter()
        .enumerate()
        .filter_map(|(i, img)| {
            non_blank(img.url.as_deref()).map(|url| (size_rank(img.size.as_deref(), i), url))
        })
        .collect();
    if let Some((_, url)) = candidates.iter().find(|(rank, _)| *rank == 3) {
        return Some(url.clone());
    }
    candidates
        .into_iter()
        .max_by_key(|(rank, _)| *rank)
        .map(|(_, url)| url)
}

pub fn normalize(raw: &RawPlay) -> Result<NormalizedPlay, NormalizeFailure> {
    let artist_name = raw
        .artist
        .as_ref()
        .and_then(artist_name)
        .ok_or(NormalizeFailure::MissingArtist)?;
    let track_name = non_blank(raw.name.as_deref()).ok_or(NormalizeFailure::MissingTrack)?;
    let played_at = raw
        .timestamp()
        .and_then(|uts| Utc.timestamp_opt(uts, 0).single())
        .ok_or(NormalizeFailure::MissingTimestamp)?;

    let (artist_external_id, artist_url, artist_images) = match raw.artist.as_ref() {
        Some(ArtistField::Object(obj)) => (
            non_blank(obj.mbid.as_deref()),
            non_blank(obj.url.as_deref()),
            obj.image.as_slice(),
        ),
        _ => (None, None, &[][..]),
    };

    let (album_name, album_external_id) = match raw.album.as_ref() {
        Some(AlbumField::Text(s)) => (non_blank(Some(s.as_str())), None),
        Some(AlbumField::Object(obj)) => (
            non_blank(obj.text.as_deref()).or_else(|| non_blank(obj.name.as_deref())),
            non_blank(obj.mbid.as_deref()),
        ),
        None => (None, None),
    };
    // An album mbid without an album name has nothing to attach to.
    let album_external_id = album_name.as_ref().and(album_external_id);

    let image = pick_image(&raw.image).or_else(|| pick_image(artist_images));

    Ok(NormalizedPlay {
        artist_name,
        artist_external_id,
        artist_image_url: image.clone(),
        artist_url,
        album_image_url: album_name.as_ref().and(image),
        album_name,
        album_external_id,
        track_name,
        track_external_id: non_blank(raw.mbid.as_deref()),
        track_duration_secs: duration_secs(raw.duration.as_ref()),
        track_url: non_blank(raw.url.as_deref()),
        played_at,
    })
}

/// Normalize every record, dropping and counting failures by kind.
pub fn normalize_all(raws: &[RawPlay]) -> (Vec<NormalizedPlay>, NormalizeReport) {
    let mut report = NormalizeReport {
        input: raws.len(),
        ..Default::default()
    };
    let mut out = Vec::with_capacity(raws.len());
    for raw in raws {
        match normalize(raw) {
            Ok(play) => out.push(play),
            Err(NormalizeFailure::MissingArtist) => report.missing_artist += 1,
            Err(NormalizeFailure::MissingTrack) => report.missing_track += 1,
            Err(NormalizeFailure::MissingTimestamp) => report.missing_timestamp += 1,
        }
    }
    report.normalized = out.len();
    if report.dropped() > 0 {
        tracing::warn!(
            missing_artist = report.missing_artist,
            missing_track = report.missing_track,
            missing_timestamp = report.missing_timestamp,
            "dropped records during normalization"
        );
    }
    (out, report)
}
