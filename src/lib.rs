//! Pull a Last.fm user's listening history into Postgres.
//!
//! A run fetches `user.getrecenttracks` pages, normalizes the records into plays, resolves
//! artist/album/track identities against what is already stored, and loads the new rows with
//! one of three strategies. [`orchestrator::SyncOrchestrator`] drives the whole thing.

pub mod database_ops;
pub mod lastfm;
pub mod logging;
pub mod normalization;
pub mod orchestrator;
pub mod progress;
pub mod util;

#[cfg(test)]
pub(crate) mod test_support;
