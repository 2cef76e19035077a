//! The source manager: the single-writer orchestrator that owns the
//! catalogue of sources, feeds and queued downloads.
//!
//! One dedicated task runs the command loop and is the only writer of the
//! catalogue. Callers talk to it through [`SourceManager`], which posts
//! closures onto the command channel and reads replies back over oneshot
//! channels. A fixed pool of download workers performs the actual
//! fetching; workers never touch shared state directly, they post
//! completion closures like every other caller.

mod api;
mod download;
mod error;
mod feed;
mod keys_cache;
mod manager;
mod pmd_cache;
mod source;
mod updater;

pub use api::{
    AddSourceRequest, AttentionSource, FeedInfo, FeedLogEntry, FeedLogQuery, SourceInfo,
    SourceSubscriptions, SourceUpdateOutcome, Stats,
};
pub use error::Error;
pub use manager::{Manager, SourceManager};
pub use updater::{FeedUpdater, SourceUpdater};
