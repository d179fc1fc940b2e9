use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::SinkExt;
use sqlx::{Postgres, QueryBuilder};
use tokio_postgres::Client;
use tracing::{debug, info, instrument};

use crate::database_ops::store::{
    AlbumRow, ArtistIdRow, ArtistRow, BulkSession, CatalogStore, IdentitySnapshot, OwnedIdRow,
    OwnedKey, PlayRow, RunLock, TableCounts, TrackRow,
};
use crate::util::db::Db;
use crate::util::env::{env_flag, env_parse, prefer_session_mode};
use crate::util::pg::{apply_fast_ingest_session, connect_postgres_auto};

/// Advisory lock key held for the length of a sync run ("scrobble" in ASCII).
pub const RUN_LOCK_KEY: i64 = 0x7363_726f_6262_6c65;

/// Postgres caps a statement at 65535 bind parameters.
const MAX_BIND_PARAMS: usize = 65_535;

const LOOKUP_ARTISTS_SQL: &str = "SELECT id, name FROM artists WHERE name = ANY($1)";
const LOOKUP_ALBUMS_SQL: &str = r#"
SELECT a.id, a.artist_id, a.name
FROM albums a
JOIN UNNEST($1::bigint[], $2::text[]) AS k(artist_id, name)
  ON a.artist_id = k.artist_id AND a.name = k.name
"#;
const LOOKUP_TRACKS_SQL: &str = r#"
SELECT t.id, t.artist_id, t.name
FROM tracks t
JOIN UNNEST($1::bigint[], $2::text[]) AS k(artist_id, name)
  ON t.artist_id = k.artist_id AND t.name = k.name
"#;

const COUNTS_SQL: &str = r#"
SELECT
  (SELECT COUNT(*) FROM artists),
  (SELECT COUNT(*) FROM albums),
  (SELECT COUNT(*) FROM tracks),
  (SELECT COUNT(*) FROM plays),
  (SELECT COUNT(*) FROM (SELECT 1 FROM artists GROUP BY name HAVING COUNT(*) > 1) d),
  (SELECT COUNT(*) FROM (SELECT 1 FROM albums GROUP BY artist_id, name HAVING COUNT(*) > 1) d),
  (SELECT COUNT(*) FROM (SELECT 1 FROM tracks GROUP BY artist_id, name HAVING COUNT(*) > 1) d),
  (SELECT COUNT(*) FROM (SELECT 1 FROM plays GROUP BY track_id, played_at HAVING COUNT(*) > 1) d),
  (SELECT COUNT(*) FROM plays p LEFT JOIN tracks t ON t.id = p.track_id WHERE t.id IS NULL)
"#;

const STAGING_DDL: &str = r#"
CREATE TEMP TABLE _artists_stage (
  name text, external_id text, image_url text, external_url text
) ON COMMIT DROP;
CREATE TEMP TABLE _albums_stage (
  artist_id bigint, name text, external_id text, image_url text
) ON COMMIT DROP;
CREATE TEMP TABLE _tracks_stage (
  artist_id bigint, album_id bigint, name text, external_id text, duration integer, external_url text
) ON COMMIT DROP;
CREATE TEMP TABLE _plays_stage (
  track_id bigint, played_at timestamptz, device_source text
) ON COMMIT DROP;
"#;

fn split_keys(keys: &[OwnedKey]) -> (Vec<i64>, Vec<String>) {
    keys.iter().map(|(id, name)| (*id, name.clone())).unzip()
}

#[derive(Clone)]
pub struct PgStore {
    db: Db,
    bulk_url: String,
    copy_flush_rows: usize,
    fast_ingest: bool,
}

impl PgStore {
    /// Pool for ORM-style access plus a session-mode DSN for COPY transactions.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let db = Db::connect(database_url, max_connections).await?;
        Ok(Self::new(db, prefer_session_mode(database_url)))
    }

    pub fn new(db: Db, bulk_url: String) -> Self {
        Self {
            db,
            bulk_url,
            copy_flush_rows: env_parse("COPY_FLUSH_ROWS", 5_000usize).max(1),
            fast_ingest: env_flag("FAST_INGEST", false),
        }
    }

    /// Run multi-row inserts in one transaction so the whole slice stays all-or-nothing
    /// even when it has to be split below the bind parameter limit.
    async fn insert_chunked<R, F>(
        &self,
        rows: &[R],
        columns: usize,
        head: &str,
        tail: &str,
        push: F,
    ) -> Result<u64>
    where
        F: Fn(sqlx::query_builder::Separated<'_, '_, Postgres, &'static str>, &R),
        R: Sync,
    {
        if rows.is_empty() {
            return Ok(0);
        }
        let per_statement = (MAX_BIND_PARAMS / columns).max(1);
        let mut tx = self.db.pool.begin().await?;
        let mut inserted = 0u64;
        for chunk in rows.chunks(per_statement) {
            let mut qb: QueryBuilder<'_, Postgres> = QueryBuilder::new(head);
            qb.push_values(chunk, |b, r| push(b, r));
            qb.push(tail);
            inserted += qb
                .build()
                .persistent(false)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;
        Ok(inserted)
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn latest_played_at(&self) -> Result<Option<DateTime<Utc>>> {
        let latest: Option<DateTime<Utc>> = sqlx::query_scalar("SELECT MAX(played_at) FROM plays")
            .persistent(false)
            .fetch_one(&self.db.pool)
            .await
            .context("reading play watermark")?;
        Ok(latest)
    }

    #[instrument(skip(self))]
    async fn load_identities(&self) -> Result<IdentitySnapshot> {
        let artists: Vec<ArtistIdRow> = sqlx::query_as("SELECT id, name FROM artists")
            .persistent(false)
            .fetch_all(&self.db.pool)
            .await?;
        let albums: Vec<OwnedIdRow> = sqlx::query_as("SELECT id, artist_id, name FROM albums")
            .persistent(false)
            .fetch_all(&self.db.pool)
            .await?;
        let tracks: Vec<OwnedIdRow> = sqlx::query_as("SELECT id, artist_id, name FROM tracks")
            .persistent(false)
            .fetch_all(&self.db.pool)
            .await?;
        info!(
            artists = artists.len(),
            albums = albums.len(),
            tracks = tracks.len(),
            "loaded identity snapshot"
        );
        Ok(IdentitySnapshot {
            artists,
            albums,
            tracks,
        })
    }

    async fn lookup_artists(&self, names: &[String]) -> Result<Vec<ArtistIdRow>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        Ok(sqlx::query_as(LOOKUP_ARTISTS_SQL)
            .bind(names)
            .persistent(false)
            .fetch_all(&self.db.pool)
            .await?)
    }

    async fn lookup_albums(&self, keys: &[OwnedKey]) -> Result<Vec<OwnedIdRow>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let (artist_ids, names) = split_keys(keys);
        Ok(sqlx::query_as(LOOKUP_ALBUMS_SQL)
            .bind(artist_ids)
            .bind(names)
            .persistent(false)
            .fetch_all(&self.db.pool)
            .await?)
    }

    async fn lookup_tracks(&self, keys: &[OwnedKey]) -> Result<Vec<OwnedIdRow>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let (artist_ids, names) = split_keys(keys);
        Ok(sqlx::query_as(LOOKUP_TRACKS_SQL)
            .bind(artist_ids)
            .bind(names)
            .persistent(false)
            .fetch_all(&self.db.pool)
            .await?)
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn insert_artists(&self, rows: &[ArtistRow]) -> Result<u64> {
        self.insert_chunked(
            rows,
            4,
            "INSERT INTO artists (name, external_id, image_url, external_url) ",
            " ON CONFLICT (name) DO NOTHING",
            |mut b, r: &ArtistRow| {
                b.push_bind(r.name.clone())
                    .push_bind(r.external_id.clone())
                    .push_bind(r.image_url.clone())
                    .push_bind(r.external_url.clone());
            },
        )
        .await
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn insert_albums(&self, rows: &[AlbumRow]) -> Result<u64> {
        self.insert_chunked(
            rows,
            4,
            "INSERT INTO albums (artist_id, name, external_id, image_url) ",
            " ON CONFLICT (name, artist_id) DO NOTHING",
            |mut b, r: &AlbumRow| {
                b.push_bind(r.artist_id)
                    .push_bind(r.name.clone())
                    .push_bind(r.external_id.clone())
                    .push_bind(r.image_url.clone());
            },
        )
        .await
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn insert_tracks(&self, rows: &[TrackRow]) -> Result<u64> {
        self.insert_chunked(
            rows,
            6,
            "INSERT INTO tracks (artist_id, album_id, name, external_id, duration, external_url) ",
            " ON CONFLICT (name, artist_id) DO NOTHING",
            |mut b, r: &TrackRow| {
                b.push_bind(r.artist_id)
                    .push_bind(r.album_id)
                    .push_bind(r.name.clone())
                    .push_bind(r.external_id.clone())
                    .push_bind(r.duration_secs)
                    .push_bind(r.external_url.clone());
            },
        )
        .await
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn insert_plays(&self, rows: &[PlayRow]) -> Result<u64> {
        self.insert_chunked(
            rows,
            3,
            "INSERT INTO plays (track_id, played_at, device_source) ",
            " ON CONFLICT (track_id, played_at) DO NOTHING",
            |mut b, r: &PlayRow| {
                b.push_bind(r.track_id)
                    .push_bind(r.played_at)
                    .push_bind(r.device_source.clone());
            },
        )
        .await
    }

    async fn counts(&self) -> Result<TableCounts> {
        let row: (i64, i64, i64, i64, i64, i64, i64, i64, i64) = sqlx::query_as(COUNTS_SQL)
            .persistent(false)
            .fetch_one(&self.db.pool)
            .await
            .context("counting catalog rows")?;
        let n = |v: i64| v.max(0) as u64;
        Ok(TableCounts {
            artists: n(row.0),
            albums: n(row.1),
            tracks: n(row.2),
            plays: n(row.3),
            duplicate_artist_names: n(row.4),
            duplicate_album_keys: n(row.5),
            duplicate_track_keys: n(row.6),
            duplicate_play_keys: n(row.7),
            plays_without_track: n(row.8),
        })
    }

    #[instrument(skip(self))]
    async fn begin_bulk(&self) -> Result<Box<dyn BulkSession>> {
        let client = connect_postgres_auto(&self.bulk_url)
            .await
            .context("opening COPY connection")?;
        client.batch_execute("BEGIN").await?;
        if self.fast_ingest {
            apply_fast_ingest_session(&client).await?;
        }
        client
            .batch_execute(STAGING_DDL)
            .await
            .context("creating staging tables")?;
        debug!("bulk session open");
        Ok(Box::new(PgBulkSession {
            client,
            flush_rows: self.copy_flush_rows,
        }))
    }

    /// Session-level advisory lock on its own session-mode connection, so it is visible
    /// to every process sharing the database and ends with the connection.
    #[instrument(skip(self))]
    async fn try_lock_run(&self) -> Result<Option<Box<dyn RunLock>>> {
        let client = connect_postgres_auto(&self.bulk_url)
            .await
            .context("opening run lock connection")?;
        let row = client
            .query_one("SELECT pg_try_advisory_lock($1)", &[&RUN_LOCK_KEY])
            .await
            .context("taking run lock")?;
        let claimed: bool = row.get(0);
        if !claimed {
            info!(key = RUN_LOCK_KEY, "run lock held elsewhere");
            return Ok(None);
        }
        debug!(key = RUN_LOCK_KEY, "run lock taken");
        Ok(Some(Box::new(PgRunLock { _client: client })))
    }
}

/// Dropping the client closes the connection, which releases the advisory lock.
struct PgRunLock {
    _client: Client,
}

impl RunLock for PgRunLock {}

/// One open transaction on a dedicated connection. Dropping it closes the connection,
/// which rolls the transaction back server-side.
struct PgBulkSession {
    client: Client,
    flush_rows: usize,
}

fn opt(v: &Option<String>) -> String {
    v.clone().unwrap_or_default()
}

fn opt_num<T: ToString>(v: Option<T>) -> String {
    v.map(|n| n.to_string()).unwrap_or_default()
}

impl PgBulkSession {
    /// Stream rows as CSV into a staging table. Unquoted empty fields load as NULL.
    async fn copy_csv<R>(
        &self,
        stage: &str,
        columns: &str,
        rows: &[R],
        record: impl Fn(&R) -> Vec<String>,
    ) -> Result<u64> {
        self.client
            .batch_execute(&format!("TRUNCATE {stage}"))
            .await?;
        if rows.is_empty() {
            return Ok(0);
        }
        let stmt = format!("COPY {stage} ({columns}) FROM STDIN WITH (FORMAT csv)");
        let sink = self.client.copy_in(&stmt).await?;
        tokio::pin!(sink);
        for chunk in rows.chunks(self.flush_rows) {
            let mut writer = csv::WriterBuilder::new()
                .has_headers(false)
                .from_writer(vec![]);
            for row in chunk {
                writer.write_record(record(row))?;
            }
            let buf = writer.into_inner()?;
            sink.send(Bytes::from(buf)).await?;
        }
        let copied = sink.as_mut().finish().await?;
        debug!(stage, copied, "staged rows");
        Ok(copied)
    }

    async fn owned_lookup(&self, sql: &str, keys: &[OwnedKey]) -> Result<Vec<OwnedIdRow>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let (artist_ids, names) = split_keys(keys);
        let rows = self.client.query(sql, &[&artist_ids, &names]).await?;
        rows.iter()
            .map(|row| -> Result<OwnedIdRow> {
                Ok((row.try_get(0)?, row.try_get(1)?, row.try_get(2)?))
            })
            .collect()
    }
}

#[async_trait]
impl BulkSession for PgBulkSession {
    async fn copy_artists(&mut self, rows: &[ArtistRow]) -> Result<u64> {
        self.copy_csv(
            "_artists_stage",
            "name, external_id, image_url, external_url",
            rows,
            |r| {
                vec![
                    r.name.clone(),
                    opt(&r.external_id),
                    opt(&r.image_url),
                    opt(&r.external_url),
                ]
            },
        )
        .await
        .context("COPY artists")?;
        let inserted = self
            .client
            .execute(
                "INSERT INTO artists (name, external_id, image_url, external_url)
                 SELECT name, external_id, image_url, external_url FROM _artists_stage
                 ON CONFLICT (name) DO NOTHING",
                &[],
            )
            .await
            .context("merging artists")?;
        Ok(inserted)
    }

    async fn copy_albums(&mut self, rows: &[AlbumRow]) -> Result<u64> {
        self.copy_csv(
            "_albums_stage",
            "artist_id, name, external_id, image_url",
            rows,
            |r| {
                vec![
                    r.artist_id.to_string(),
                    r.name.clone(),
                    opt(&r.external_id),
                    opt(&r.image_url),
                ]
            },
        )
        .await
        .context("COPY albums")?;
        let inserted = self
            .client
            .execute(
                "INSERT INTO albums (artist_id, name, external_id, image_url)
                 SELECT artist_id, name, external_id, image_url FROM _albums_stage
                 ON CONFLICT (name, artist_id) DO NOTHING",
                &[],
            )
            .await
            .context("merging albums")?;
        Ok(inserted)
    }

    async fn copy_tracks(&mut self, rows: &[TrackRow]) -> Result<u64> {
        self.copy_csv(
            "_tracks_stage",
            "artist_id, album_id, name, external_id, duration, external_url",
            rows,
            |r| {
                vec![
                    r.artist_id.to_string(),
                    opt_num(r.album_id),
                    r.name.clone(),
                    opt(&r.external_id),
                    opt_num(r.duration_secs),
                    opt(&r.external_url),
                ]
            },
        )
        .await
        .context("COPY tracks")?;
        let inserted = self
            .client
            .execute(
                "INSERT INTO tracks (artist_id, album_id, name, external_id, duration, external_url)
                 SELECT artist_id, album_id, name, external_id, duration, external_url FROM _tracks_stage
                 ON CONFLICT (name, artist_id) DO NOTHING",
                &[],
            )
            .await
            .context("merging tracks")?;
        Ok(inserted)
    }

    async fn copy_plays(&mut self, rows: &[PlayRow]) -> Result<u64> {
        self.copy_csv(
            "_plays_stage",
            "track_id, played_at, device_source",
            rows,
            |r| {
                vec![
                    r.track_id.to_string(),
                    r.played_at.to_rfc3339(),
                    opt(&r.device_source),
                ]
            },
        )
        .await
        .context("COPY plays")?;
        let inserted = self
            .client
            .execute(
                "INSERT INTO plays (track_id, played_at, device_source)
                 SELECT track_id, played_at, device_source FROM _plays_stage
                 ON CONFLICT (track_id, played_at) DO NOTHING",
                &[],
            )
            .await
            .context("merging plays")?;
        Ok(inserted)
    }

    async fn lookup_artists(&mut self, names: &[String]) -> Result<Vec<ArtistIdRow>> {
        if names.is_empty() {
            return Ok(Vec::new());
        }
        let rows = self.client.query(LOOKUP_ARTISTS_SQL, &[&names]).await?;
        rows.iter()
            .map(|row| -> Result<ArtistIdRow> { Ok((row.try_get(0)?, row.try_get(1)?)) })
            .collect()
    }

    async fn lookup_albums(&mut self, keys: &[OwnedKey]) -> Result<Vec<OwnedIdRow>> {
        self.owned_lookup(LOOKUP_ALBUMS_SQL, keys).await
    }

    async fn lookup_tracks(&mut self, keys: &[OwnedKey]) -> Result<Vec<OwnedIdRow>> {
        self.owned_lookup(LOOKUP_TRACKS_SQL, keys).await
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.client
            .batch_execute("COMMIT")
            .await
            .context("COMMIT bulk transaction")?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.client.batch_execute("ROLLBACK").await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_split_into_parallel_arrays() {
        let (ids, names) = split_keys(&[(1, "a".into()), (2, "b".into())]);
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn absent_values_become_empty_csv_fields() {
        assert_eq!(opt(&None), "");
        assert_eq!(opt_num::<i32>(None), "");
        assert_eq!(opt_num(Some(215)), "215");

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(vec![]);
        writer
            .write_record(["7", "", "Song, with comma", ""])
            .unwrap();
        let line = String::from_utf8(writer.into_inner().unwrap()).unwrap();
        assert_eq!(line.trim_end(), "7,,\"Song, with comma\",");
    }

    #[test]
    fn run_lock_key_spells_the_program() {
        assert_eq!(&RUN_LOCK_KEY.to_be_bytes(), b"scrobble");
    }
}
