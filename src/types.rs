//! Canonical key types shared across the core (§3).

use serde::{Deserialize, Serialize};
use std::fmt;

pub type ArtistCreditId = u32;
pub type RecordingId = u32;
pub type ReleaseId = u32;

/// A 128-bit stable identifier for an entity in the source corpus, rendered
/// as text where needed. Stored as the canonical hyphenated form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Mbid(pub uuid::Uuid);

impl Mbid {
    pub fn parse(text: &str) -> Option<Self> {
        uuid::Uuid::parse_str(text).ok().map(Mbid)
    }
}

impl fmt::Display for Mbid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The first character of a normalized artist string, or `$` for symbolic
/// artists; governs shard routing.
pub type ShardCh = char;

pub const SYMBOLIC_SHARD_CH: ShardCh = '$';

/// One row of the canonical source relation / mapping store (§3, §6).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRow {
    pub artist_credit_id: ArtistCreditId,
    pub artist_mbids: String,
    pub artist_credit_name: String,
    pub artist_credit_sortname: String,
    pub release_id: ReleaseId,
    pub release_mbid: Option<Mbid>,
    pub release_name: String,
    pub recording_id: RecordingId,
    pub recording_mbid: Option<Mbid>,
    pub recording_name: String,
    pub score: f64,
    pub shard_ch: ShardCh,
}
