//! Index builder (C4, §4.4): streams the canonical source (ordered by
//! artist_credit_id), writes the mapping store, constructs and persists the
//! global artist index plus the symbolic-artist fallback, and records the
//! shard-character partition table.

use rustc_hash::FxHashMap;
use std::path::Path;

use crate::error::{CoreError, CoreResult};
use crate::fuzzy_index::{FuzzyIndex, FuzzyRecord};
use crate::mapping_store::MappingStore;
use crate::normalize::{has_non_latin, normalize};
use crate::progress::{create_progress_bar, log_progress};
use crate::types::{ArtistCreditId, Mbid, MappingRow, RecordingId, ReleaseId, ShardCh, SYMBOLIC_SHARD_CH};

pub const ARTIST_INDEX_NAME: &str = "artist_index";
pub const SYMBOLIC_INDEX_NAME: &str = "stupid_artist_index";
pub const PARTITION_TABLE_FILE: &str = "shard_table.bin";
const PARTITION_MAGIC: &[u8; 4] = b"PART";
const PARTITION_VERSION: u32 = 1;
const FLUSH_EVERY: usize = 2_500;

/// One row as delivered by the external canonical source cursor (§6).
#[derive(Debug, Clone)]
pub struct SourceRow {
    pub artist_credit_id: ArtistCreditId,
    pub artist_mbids: Vec<Mbid>,
    pub artist_credit_name: String,
    pub artist_credit_sortname: Vec<String>,
    pub release_id: ReleaseId,
    pub release_mbid: Option<Mbid>,
    pub release_name: String,
    pub recording_id: RecordingId,
    pub recording_mbid: Option<Mbid>,
    pub recording_name: String,
    pub score: f64,
}

/// Artist-index payload: the surviving fields of an artist-index row beyond
/// `text` (§3).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ArtistIndexEntry {
    pub id: ArtistCreditId,
    pub shard_ch: ShardCh,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PartitionEntry {
    pub shard_ch: ShardCh,
    pub count: u64,
}

pub struct BuildOutput {
    pub partition_table: Vec<PartitionEntry>,
    pub rows_written: u64,
    pub artists_indexed: u64,
}

/// Buffers one artist-credit group while streaming, per §4.4 step 1.
struct ArtistGroup {
    artist_credit_id: ArtistCreditId,
    artist_credit_name: String,
    artist_credit_sortname: String,
    rows: Vec<SourceRow>,
}

impl ArtistGroup {
    fn new(row: &SourceRow) -> Self {
        ArtistGroup {
            artist_credit_id: row.artist_credit_id,
            artist_credit_name: row.artist_credit_name.clone(),
            artist_credit_sortname: row.artist_credit_sortname.join(", "),
            rows: Vec::new(),
        }
    }
}

/// Runs the full build pipeline over `source`, writing `mapping.db` and the
/// two global fuzzy indexes under `index_dir`. `total_hint` (if known) drives
/// the progress bar only; pass 0 when the source size is unknown.
pub fn build(
    source: impl Iterator<Item = SourceRow>,
    index_dir: &Path,
    total_hint: u64,
) -> CoreResult<BuildOutput> {
    std::fs::create_dir_all(index_dir)?;
    let mut store = MappingStore::open(&index_dir.join("mapping.db"))?;

    let mut pending_rows: Vec<MappingRow> = Vec::new();
    let mut current_group: Option<ArtistGroup> = None;
    let mut artist_records: Vec<FuzzyRecord<ArtistIndexEntry>> = Vec::new();
    let mut symbolic_records: Vec<FuzzyRecord<ArtistIndexEntry>> = Vec::new();
    let mut histogram: FxHashMap<ShardCh, u64> = FxHashMap::default();
    let mut rows_written: u64 = 0;
    let mut seen = 0u64;

    let pb = create_progress_bar(total_hint, "building index");

    for row in source {
        seen += 1;
        log_progress("build", seen, total_hint.max(seen), 100_000);
        pb.inc(1);

        let boundary = match &current_group {
            Some(g) => g.artist_credit_id != row.artist_credit_id,
            None => false,
        };
        if boundary {
            let finished = current_group.take().unwrap();
            flush_artist_group(
                finished,
                &mut pending_rows,
                &mut artist_records,
                &mut symbolic_records,
                &mut histogram,
            )?;
        }
        if current_group.is_none() {
            current_group = Some(ArtistGroup::new(&row));
        }
        current_group.as_mut().unwrap().rows.push(row);

        if pending_rows.len() >= FLUSH_EVERY {
            rows_written += pending_rows.len() as u64;
            store.insert_batch(&pending_rows)?;
            pending_rows.clear();
        }
    }
    if let Some(finished) = current_group.take() {
        flush_artist_group(
            finished,
            &mut pending_rows,
            &mut artist_records,
            &mut symbolic_records,
            &mut histogram,
        )?;
    }
    if !pending_rows.is_empty() {
        rows_written += pending_rows.len() as u64;
        store.insert_batch(&pending_rows)?;
        pending_rows.clear();
    }
    pb.finish_with_message("build complete");

    let artists_indexed = artist_records.len() as u64 + symbolic_records.len() as u64;

    if !artist_records.is_empty() {
        let idx = FuzzyIndex::build(artist_records)?;
        idx.save(index_dir, ARTIST_INDEX_NAME)?;
    }
    if !symbolic_records.is_empty() {
        let idx = FuzzyIndex::build(symbolic_records)?;
        idx.save(index_dir, SYMBOLIC_INDEX_NAME)?;
    }

    let mut partition_table: Vec<PartitionEntry> = histogram
        .into_iter()
        .map(|(shard_ch, count)| PartitionEntry { shard_ch, count })
        .collect();
    partition_table.sort_by(|a, b| a.shard_ch.cmp(&b.shard_ch));
    save_partition_table(index_dir, &partition_table)?;

    Ok(BuildOutput { partition_table, rows_written, artists_indexed })
}

/// Finalizes one artist-credit group: resolves `shard_ch`, emits artist-index
/// entries, dedupes and flushes its mapping rows (§4.4 step 2).
fn flush_artist_group(
    group: ArtistGroup,
    pending_rows: &mut Vec<MappingRow>,
    artist_records: &mut Vec<FuzzyRecord<ArtistIndexEntry>>,
    symbolic_records: &mut Vec<FuzzyRecord<ArtistIndexEntry>>,
    histogram: &mut FxHashMap<ShardCh, u64>,
) -> CoreResult<()> {
    let encoded = normalize(&group.artist_credit_name);
    let shard_ch = if !encoded.is_empty() {
        let ch = encoded.chars().next().unwrap();
        artist_records.push(FuzzyRecord {
            text: encoded.clone(),
            payload: ArtistIndexEntry { id: group.artist_credit_id, shard_ch: ch },
        });

        if has_non_latin(&group.artist_credit_name) {
            let sort_encoded = normalize(&group.artist_credit_sortname);
            if !sort_encoded.is_empty() && sort_encoded != encoded {
                // Decision (SPEC_FULL §9-a): align the duplicate's shard_ch to
                // the sort-name's own leading char, not the original text's.
                let sort_ch = sort_encoded.chars().next().unwrap();
                artist_records.push(FuzzyRecord {
                    text: sort_encoded,
                    payload: ArtistIndexEntry { id: group.artist_credit_id, shard_ch: sort_ch },
                });
                *histogram.entry(sort_ch).or_insert(0) += 1;
            }
        }
        ch
    } else {
        let symbolic = crate::normalize::normalize_symbolic(&group.artist_credit_name);
        if symbolic.is_empty() {
            // Neither a standard nor symbolic normalization: skip entirely (§4.4 failure semantics).
            return Ok(());
        }
        symbolic_records.push(FuzzyRecord {
            text: symbolic,
            payload: ArtistIndexEntry { id: group.artist_credit_id, shard_ch: SYMBOLIC_SHARD_CH },
        });
        SYMBOLIC_SHARD_CH
    };
    *histogram.entry(shard_ch).or_insert(0) += 1;

    let mut seen_release_recording: rustc_hash::FxHashSet<(ReleaseId, RecordingId)> =
        rustc_hash::FxHashSet::default();
    for src in group.rows {
        let key = (src.release_id, src.recording_id);
        if !seen_release_recording.insert(key) {
            continue;
        }
        pending_rows.push(MappingRow {
            artist_credit_id: src.artist_credit_id,
            artist_mbids: src
                .artist_mbids
                .iter()
                .map(|m| m.to_string())
                .collect::<Vec<_>>()
                .join(","),
            artist_credit_name: src.artist_credit_name,
            artist_credit_sortname: group.artist_credit_sortname.clone(),
            release_id: src.release_id,
            release_mbid: src.release_mbid,
            release_name: src.release_name,
            recording_id: src.recording_id,
            recording_mbid: src.recording_mbid,
            recording_name: src.recording_name,
            score: src.score,
            shard_ch,
        });
    }
    Ok(())
}

fn save_partition_table(index_dir: &Path, table: &[PartitionEntry]) -> CoreResult<()> {
    let bytes = serde_json::to_vec(table).map_err(|e| CoreError::SourceError(e.to_string()))?;
    let mut f = std::fs::File::create(index_dir.join(PARTITION_TABLE_FILE))?;
    crate::framing::write_framed(&mut f, PARTITION_MAGIC, PARTITION_VERSION, &bytes)?;
    Ok(())
}

pub fn load_partition_table(index_dir: &Path) -> CoreResult<Vec<PartitionEntry>> {
    let mut f = std::fs::File::open(index_dir.join(PARTITION_TABLE_FILE))?;
    let bytes = crate::framing::read_framed(&mut f, PARTITION_MAGIC)?;
    serde_json::from_slice(&bytes).map_err(|e| CoreError::SourceError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(artist_id: u32, name: &str, sortname: &str, release_id: u32, recording_id: u32) -> SourceRow {
        SourceRow {
            artist_credit_id: artist_id,
            artist_mbids: vec![],
            artist_credit_name: name.to_string(),
            artist_credit_sortname: vec![sortname.to_string()],
            release_id,
            release_mbid: None,
            release_name: "Dummy".to_string(),
            recording_id,
            recording_mbid: None,
            recording_name: "Strangers".to_string(),
            score: 50.0,
        }
    }

    #[test]
    fn builds_mapping_store_and_artist_index() {
        let dir = std::env::temp_dir().join(format!("builder_test_{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        let rows = vec![row(65, "Portishead", "Portishead", 10, 100)];
        let out = build(rows.into_iter(), &dir, 1).unwrap();
        assert_eq!(out.rows_written, 1);
        assert!(dir.join("mapping.db").exists());
        assert!(dir.join(format!("{ARTIST_INDEX_NAME}.vec")).exists());
        assert!(!dir.join(format!("{SYMBOLIC_INDEX_NAME}.vec")).exists());

        let store = MappingStore::open_read_only(&dir.join("mapping.db")).unwrap();
        let rows = store.select_by_artist(65).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].shard_ch, 'p');
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn symbolic_artist_routes_to_dollar_shard() {
        let dir = std::env::temp_dir().join(format!("builder_test_symbolic_{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        let rows = vec![row(7, "!!!", "!!!", 20, 200)];
        build(rows.into_iter(), &dir, 1).unwrap();
        assert!(dir.join(format!("{SYMBOLIC_INDEX_NAME}.vec")).exists());

        let store = MappingStore::open_read_only(&dir.join("mapping.db")).unwrap();
        let rows = store.select_by_artist(7).unwrap();
        assert_eq!(rows[0].shard_ch, SYMBOLIC_SHARD_CH);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn partition_table_round_trips() {
        let dir = std::env::temp_dir().join(format!("builder_test_partition_{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        let rows = vec![
            row(1, "Alpha", "Alpha", 1, 1),
            row(2, "Beta", "Beta", 2, 2),
        ];
        let out = build(rows.into_iter(), &dir, 2).unwrap();
        let loaded = load_partition_table(&dir).unwrap();
        assert_eq!(loaded.len(), out.partition_table.len());
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn deduplicates_identical_release_recording_rows() {
        let dir = std::env::temp_dir().join(format!("builder_test_dedup_{}", std::process::id()));
        std::fs::remove_dir_all(&dir).ok();
        let rows = vec![
            row(65, "Portishead", "Portishead", 10, 100),
            row(65, "Portishead", "Portishead", 10, 100),
        ];
        let out = build(rows.into_iter(), &dir, 2).unwrap();
        assert_eq!(out.rows_written, 1);
        std::fs::remove_dir_all(&dir).ok();
    }
}
