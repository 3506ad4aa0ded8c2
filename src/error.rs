//! Core error taxonomy (§7). One variant per row of the error table;
//! everything below the router is fail-fast and propagates these directly.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("no hit on either artist index for this query")]
    ArtistNotFound,

    #[error("leading character '{0}' routes to no configured shard")]
    ShardUnavailable(char),

    #[error("worker did not reply within the search timeout")]
    SearchTimeout,

    #[error("fuzzy index searched before build()")]
    IndexNotBuilt,

    #[error("fuzzy index build() called with no rows")]
    EmptyIndex,

    #[error("concurrent cache save for artist {0}; first writer wins")]
    CacheCollision(u32),

    #[error("build-time source error: {0}")]
    SourceError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("mapping store error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type CoreResult<T> = Result<T, CoreError>;
