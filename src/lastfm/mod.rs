pub mod client;
pub mod fetcher;

pub use client::{HistoryPage, HistorySource, LastFmClient, PageRequest, DEFAULT_BASE_URL};
pub use fetcher::{FetchError, FetchOptions, FetchOutcome, FetchReport, RateLimitedFetcher};
