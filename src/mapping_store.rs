//! Mapping store (C3, §4.3): a persistent, append-only-at-build-time
//! relation of mapping rows, indexed by artist_credit_id, release_id and
//! recording_id. Backed by SQLite with the teacher's own tuning PRAGMAs and
//! batched-transaction insert pattern.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::thread;
use std::time::Duration;

use crate::error::CoreResult;
use crate::types::{ArtistCreditId, Mbid, RecordingId, ReleaseId, MappingRow};

pub const BATCH_SIZE: usize = 2_500;

const BACKOFF_BASE_MS: u64 = 10;
const BACKOFF_MAX_ATTEMPTS: u32 = 5;

pub struct MappingStore {
    conn: Connection,
}

impl MappingStore {
    /// Opens (creating if absent) the mapping store at `path` and applies the
    /// write-optimized PRAGMAs the teacher's `write_enriched_output` uses.
    pub fn open(path: &Path) -> CoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA cache_size=-64000;
             PRAGMA temp_store=MEMORY;",
        )?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS mapping (
                artist_credit_id INTEGER NOT NULL,
                artist_mbids TEXT NOT NULL,
                artist_credit_name TEXT NOT NULL,
                artist_credit_sortname TEXT NOT NULL,
                release_id INTEGER NOT NULL,
                release_mbid TEXT,
                release_name TEXT NOT NULL,
                recording_id INTEGER NOT NULL,
                recording_mbid TEXT,
                recording_name TEXT NOT NULL,
                score REAL NOT NULL,
                shard_ch TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_mapping_artist ON mapping(artist_credit_id);
            CREATE INDEX IF NOT EXISTS idx_mapping_release ON mapping(release_id);
            CREATE INDEX IF NOT EXISTS idx_mapping_recording ON mapping(recording_id);",
        )?;
        Ok(MappingStore { conn })
    }

    /// Opens the store read-only, for worker/search-side connections that
    /// must coexist with other readers after build (§5).
    pub fn open_read_only(path: &Path) -> CoreResult<Self> {
        let conn = Connection::open_with_flags(
            path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY | rusqlite::OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Ok(MappingStore { conn })
    }

    /// Inserts `rows` in a single transaction, retrying the whole batch with
    /// bounded exponential backoff on `SQLITE_BUSY` (§4.4, §9) instead of the
    /// source's busy-wait sleep loop.
    pub fn insert_batch(&mut self, rows: &[MappingRow]) -> CoreResult<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut attempt = 0;
        loop {
            match self.try_insert_batch(rows) {
                Ok(()) => return Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::DatabaseBusy
                        && attempt < BACKOFF_MAX_ATTEMPTS =>
                {
                    let delay = BACKOFF_BASE_MS * (1u64 << attempt);
                    thread::sleep(Duration::from_millis(delay));
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn try_insert_batch(&mut self, rows: &[MappingRow]) -> rusqlite::Result<()> {
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO mapping (
                    artist_credit_id, artist_mbids, artist_credit_name, artist_credit_sortname,
                    release_id, release_mbid, release_name,
                    recording_id, recording_mbid, recording_name,
                    score, shard_ch
                ) VALUES (?,?,?,?,?,?,?,?,?,?,?,?)",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.artist_credit_id,
                    row.artist_mbids,
                    row.artist_credit_name,
                    row.artist_credit_sortname,
                    row.release_id,
                    row.release_mbid.map(|m| m.to_string()),
                    row.release_name,
                    row.recording_id,
                    row.recording_mbid.map(|m| m.to_string()),
                    row.recording_name,
                    row.score,
                    row.shard_ch.to_string(),
                ])?;
            }
        }
        tx.commit()
    }

    pub fn select_by_artist(&self, artist_credit_id: ArtistCreditId) -> CoreResult<Vec<MappingRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT artist_credit_id, artist_mbids, artist_credit_name, artist_credit_sortname,
                    release_id, release_mbid, release_name,
                    recording_id, recording_mbid, recording_name,
                    score, shard_ch
             FROM mapping WHERE artist_credit_id = ?",
        )?;
        let rows = stmt
            .query_map(params![artist_credit_id], Self::row_from_sql)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn select_by_release_recording(
        &self,
        release_id: ReleaseId,
        recording_id: RecordingId,
    ) -> CoreResult<Vec<MappingRow>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT artist_credit_id, artist_mbids, artist_credit_name, artist_credit_sortname,
                    release_id, release_mbid, release_name,
                    recording_id, recording_mbid, recording_name,
                    score, shard_ch
             FROM mapping WHERE release_id = ? AND recording_id = ?",
        )?;
        let rows = stmt
            .query_map(params![release_id, recording_id], Self::row_from_sql)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn exists_by_artist(&self, artist_credit_id: ArtistCreditId) -> CoreResult<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM mapping WHERE artist_credit_id = ? LIMIT 1",
                params![artist_credit_id],
                |r| r.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn row_from_sql(r: &rusqlite::Row) -> rusqlite::Result<MappingRow> {
        let shard_ch_str: String = r.get(11)?;
        let release_mbid_str: Option<String> = r.get(5)?;
        let recording_mbid_str: Option<String> = r.get(8)?;
        Ok(MappingRow {
            artist_credit_id: r.get(0)?,
            artist_mbids: r.get(1)?,
            artist_credit_name: r.get(2)?,
            artist_credit_sortname: r.get(3)?,
            release_id: r.get(4)?,
            release_mbid: release_mbid_str.and_then(|s| Mbid::parse(&s)),
            release_name: r.get(6)?,
            recording_id: r.get(7)?,
            recording_mbid: recording_mbid_str.and_then(|s| Mbid::parse(&s)),
            recording_name: r.get(9)?,
            score: r.get(10)?,
            shard_ch: shard_ch_str.chars().next().unwrap_or('$'),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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
    fn insert_and_select_by_artist() {
        let path = std::env::temp_dir().join(format!("mapping_store_test_{}.db", std::process::id()));
        std::fs::remove_file(&path).ok();
        let mut store = MappingStore::open(&path).unwrap();
        store.insert_batch(&[sample_row()]).unwrap();
        let rows = store.select_by_artist(65).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].recording_id, 100);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn select_by_release_recording_join() {
        let path = std::env::temp_dir().join(format!("mapping_store_test2_{}.db", std::process::id()));
        std::fs::remove_file(&path).ok();
        let mut store = MappingStore::open(&path).unwrap();
        store.insert_batch(&[sample_row()]).unwrap();
        let rows = store.select_by_release_recording(10, 100).unwrap();
        assert_eq!(rows.len(), 1);
        std::fs::remove_file(&path).ok();
    }
}
