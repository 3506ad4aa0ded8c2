//! Artist-data materializer (C5, §4.5): given an artist_credit_id, builds
//! the release/recording sub-indexes and cross-reference tables from the
//! mapping store. Called on cache miss; the result is handed to C6 to cache.

use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};

use crate::error::CoreResult;
use crate::fuzzy_index::{FuzzyIndex, FuzzyRecord};
use crate::mapping_store::MappingStore;
use crate::normalize::normalize;
use crate::types::{ArtistCreditId, RecordingId, ReleaseId};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingOccurrence {
    pub recording_id: RecordingId,
    pub release_id: ReleaseId,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordingEntry {
    pub dense_idx: u32,
    pub occurrences: Vec<RecordingOccurrence>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseEntry {
    pub dense_idx: u32,
    pub release_id_scores: Vec<(ReleaseId, f64)>,
}

/// The materialized per-artist payload of §3. `None` indexes mean the
/// artist had no recordings/releases to match against ("empty artist",
/// §4.5 step 6): any query against it yields no hits.
pub struct ArtistBundle {
    pub artist_credit_id: ArtistCreditId,
    pub recording_data: Vec<(String, RecordingEntry)>,
    pub release_data: Vec<(String, ReleaseEntry)>,
    pub recording_releases: FxHashMap<RecordingId, FxHashSet<ReleaseId>>,
    pub recording_index: Option<FuzzyIndex<RecordingEntry>>,
    pub release_index: Option<FuzzyIndex<ReleaseEntry>>,
}

impl ArtistBundle {
    pub fn is_empty_artist(&self) -> bool {
        self.recording_index.is_none() && self.release_index.is_none()
    }
}

pub fn materialize(store: &MappingStore, artist_credit_id: ArtistCreditId) -> CoreResult<ArtistBundle> {
    let rows = store.select_by_artist(artist_credit_id)?;

    let mut recording_buckets: FxHashMap<String, Vec<RecordingOccurrence>> = FxHashMap::default();
    let mut release_buckets: FxHashMap<String, Vec<(ReleaseId, f64)>> = FxHashMap::default();
    let mut recording_releases: FxHashMap<RecordingId, FxHashSet<ReleaseId>> = FxHashMap::default();

    for row in &rows {
        let recording_text = normalize(&row.recording_name);
        recording_buckets.entry(recording_text).or_default().push(RecordingOccurrence {
            recording_id: row.recording_id,
            release_id: row.release_id,
            score: row.score,
        });
        recording_releases.entry(row.recording_id).or_default().insert(row.release_id);

        let release_text = normalize(&row.release_name);
        if !release_text.is_empty() {
            release_buckets.entry(release_text).or_default().push((row.release_id, row.score));
        }
    }

    let mut recording_data: Vec<(String, RecordingEntry)> = recording_buckets
        .into_iter()
        .enumerate()
        .map(|(i, (text, occurrences))| (text, RecordingEntry { dense_idx: i as u32, occurrences }))
        .collect();
    recording_data.sort_by(|a, b| a.1.dense_idx.cmp(&b.1.dense_idx));

    let mut release_data: Vec<(String, ReleaseEntry)> = release_buckets
        .into_iter()
        .enumerate()
        .map(|(i, (text, release_id_scores))| {
            (text, ReleaseEntry { dense_idx: i as u32, release_id_scores })
        })
        .collect();
    release_data.sort_by(|a, b| a.1.dense_idx.cmp(&b.1.dense_idx));

    if recording_data.is_empty() || release_data.is_empty() {
        return Ok(ArtistBundle {
            artist_credit_id,
            recording_data,
            release_data,
            recording_releases,
            recording_index: None,
            release_index: None,
        });
    }

    let recording_records: Vec<FuzzyRecord<RecordingEntry>> = recording_data
        .iter()
        .map(|(text, entry)| FuzzyRecord { text: text.clone(), payload: entry.clone() })
        .collect();
    let release_records: Vec<FuzzyRecord<ReleaseEntry>> = release_data
        .iter()
        .map(|(text, entry)| FuzzyRecord { text: text.clone(), payload: entry.clone() })
        .collect();

    let recording_index = Some(FuzzyIndex::build(recording_records)?);
    let release_index = Some(FuzzyIndex::build(release_records)?);

    Ok(ArtistBundle {
        artist_credit_id,
        recording_data,
        release_data,
        recording_releases,
        recording_index,
        release_index,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MappingRow;

    fn make_store_with(rows: &[MappingRow]) -> MappingStore {
        let path = std::env::temp_dir().join(format!("materializer_test_{}.db", uuid::Uuid::new_v4()));
        let mut store = MappingStore::open(&path).unwrap();
        store.insert_batch(rows).unwrap();
        store
    }

    fn sample_row() -> MappingRow {
        MappingRow {
            artist_credit_id: 65,
            artist_mbids: "".to_string(),
            artist_credit_name: "Portishead".to_string(),
            artist_credit_sortname: "Portishead".to_string(),
            release_id: 10,
            release_mbid: None,
            release_name: "Dummy".to_string(),
            recording_id: 100,
            recording_mbid: None,
            recording_name: "Strangers".to_string(),
            score: 50.0,
            shard_ch: 'p',
        }
    }

    #[test]
    fn materializes_non_empty_artist() {
        let store = make_store_with(&[sample_row()]);
        let bundle = materialize(&store, 65).unwrap();
        assert!(!bundle.is_empty_artist());
        assert_eq!(bundle.recording_data.len(), 1);
        assert_eq!(bundle.release_data.len(), 1);
        assert!(bundle.recording_releases.get(&100).unwrap().contains(&10));
    }

    #[test]
    fn empty_artist_has_no_indexes() {
        let store = make_store_with(&[]);
        let bundle = materialize(&store, 999).unwrap();
        assert!(bundle.is_empty_artist());
    }

    #[test]
    fn materializing_twice_is_deterministic() {
        let store = make_store_with(&[sample_row()]);
        let a = materialize(&store, 65).unwrap();
        let b = materialize(&store, 65).unwrap();
        let hits_a = a.recording_index.as_ref().unwrap().search("strangers", 0.0).unwrap();
        let hits_b = b.recording_index.as_ref().unwrap().search("strangers", 0.0).unwrap();
        assert_eq!(hits_a.len(), hits_b.len());
        assert!((hits_a[0].confidence - hits_b[0].confidence).abs() < 1e-9);
    }
}
