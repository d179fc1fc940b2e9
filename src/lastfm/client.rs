use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

pub const DEFAULT_BASE_URL: &str = "https://ws.audioscrobbler.com/2.0/";
const USER_AGENT: &str = concat!("scrobble-sync/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-based.
    pub page: u32,
    pub limit: u32,
    /// Only plays at or after this Unix second.
    pub from: Option<i64>,
}

/// One page of raw records plus the pagination metadata the source reported.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryPage {
    pub total_pages: u32,
    pub total_records: u64,
    pub records: Vec<Value>,
}

/// Paginated, read-only source of listening history.
#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn fetch_page(&self, req: PageRequest) -> Result<HistoryPage>;
}

/// `user.getrecenttracks` over reqwest.
#[derive(Clone)]
pub struct LastFmClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    username: String,
}

impl LastFmClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        username: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .context("building http client")?;
        Ok(Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            username: username.into(),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }
}

#[async_trait]
impl HistorySource for LastFmClient {
    async fn fetch_page(&self, req: PageRequest) -> Result<HistoryPage> {
        let mut query: Vec<(&str, String)> = vec![
            ("method", "user.getrecenttracks".into()),
            ("user", self.username.clone()),
            ("api_key", self.api_key.clone()),
            ("format", "json".into()),
            ("extended", "1".into()),
            ("limit", req.limit.to_string()),
            ("page", req.page.to_string()),
        ];
        if let Some(from) = req.from {
            query.push(("from", from.to_string()));
        }

        // Request errors carry the URL, and the URL carries the API key.
        let resp = self
            .http
            .get(&self.base_url)
            .query(&query)
            .send()
            .await
            .map_err(|e| anyhow!("page {} request failed: {}", req.page, e.without_url()))?;
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .map_err(|e| anyhow!("page {} body unreadable (status {status}): {}", req.page, e.without_url()))?;
        if let Some(err) = api_error(&body) {
            bail!("page {}: {err}", req.page);
        }
        if !status.is_success() {
            bail!("page {}: http status {status}", req.page);
        }
        let page = parse_page(body)?;
        debug!(
            page = req.page,
            total_pages = page.total_pages,
            records = page.records.len(),
            "fetched history page"
        );
        Ok(page)
    }
}

/// `{"error": 29, "message": "Rate Limit Exceeded"}` style payloads.
fn api_error(body: &Value) -> Option<String> {
    let code = body.get("error")?;
    let message = body
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    Some(format!("last.fm error {code}: {message}"))
}

fn meta_u64(attr: Option<&Value>, key: &str) -> Option<u64> {
    match attr?.get(key)? {
        Value::String(s) => s.trim().parse().ok(),
        Value::Number(n) => n.as_u64(),
        _ => None,
    }
}

/// Decode a `recenttracks` payload. `track` may be an array, a single object, or absent.
pub fn parse_page(body: Value) -> Result<HistoryPage> {
    let Value::Object(mut root) = body else {
        bail!("history response is not a JSON object");
    };
    let Some(Value::Object(mut recent)) = root.remove("recenttracks") else {
        bail!("history response has no recenttracks object");
    };
    let attr = recent.remove("@attr");
    let records = match recent.remove("track") {
        Some(Value::Array(items)) => items,
        Some(Value::Null) | None => Vec::new(),
        Some(single) => vec![single],
    };
    let attr = attr.as_ref();
    let total_pages = meta_u64(attr, "totalPages").unwrap_or(0);
    let total_pages = u32::try_from(total_pages)
        .map_err(|_| anyhow!("history reports an impossible page count {total_pages}"))?;
    Ok(HistoryPage {
        total_pages,
        total_records: meta_u64(attr, "total").unwrap_or(0),
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_string_metadata_and_track_array() {
        let page = parse_page(json!({
            "recenttracks": {
                "track": [{"name": "a"}, {"name": "b"}],
                "@attr": {"user": "rj", "page": "2", "perPage": "200", "totalPages": "17", "total": "3301"}
            }
        }))
        .unwrap();
        assert_eq!(page.total_pages, 17);
        assert_eq!(page.total_records, 3301);
        assert_eq!(page.records.len(), 2);
    }

    #[test]
    fn single_track_object_becomes_one_record() {
        let page = parse_page(json!({
            "recenttracks": {"track": {"name": "only"}, "@attr": {"page": 1, "totalPages": 1, "total": 1}}
        }))
        .unwrap();
        assert_eq!(page.records, vec![json!({"name": "only"})]);
        assert_eq!(page.total_pages, 1);
    }

    #[test]
    fn empty_history_has_zero_pages() {
        let page = parse_page(json!({
            "recenttracks": {"track": [], "@attr": {"page": "1", "totalPages": "0", "total": "0"}}
        }))
        .unwrap();
        assert!(page.records.is_empty());
        assert_eq!(page.total_pages, 0);
    }

    #[test]
    fn api_errors_are_detected() {
        let body = json!({"error": 29, "message": "Rate Limit Exceeded"});
        assert_eq!(
            api_error(&body).as_deref(),
            Some("last.fm error 29: Rate Limit Exceeded")
        );
        assert!(parse_page(body).is_err());
        assert!(api_error(&json!({"recenttracks": {}})).is_none());
    }

    #[test]
    fn oversized_page_count_is_rejected() {
        let body = json!({
            "recenttracks": {"track": [], "@attr": {"page": "1", "totalPages": "8589934592"}}
        });
        assert!(parse_page(body).is_err());
    }
}
