//! Shard router and worker pool (C7, §4.7). Owns the two global artist
//! indexes, partitions shard characters across N worker threads by a static
//! request-weight histogram, and drives the end-to-end query pipeline:
//! encode → search artist index(es) → cleaner rescue → pick shard →
//! dispatch → per-artist recording/release search → join against the
//! mapping store.

use once_cell::sync::Lazy;
use rustc_hash::{FxHashMap, FxHashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use uuid::Uuid;

use crossbeam_channel::{unbounded, Receiver, Sender};

use crate::builder::{load_partition_table, ArtistIndexEntry, PartitionEntry, ARTIST_INDEX_NAME, SYMBOLIC_INDEX_NAME};
use crate::cache::{ArtistDataCache, CacheBackend};
use crate::cleaner::Cleaner;
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::fuzzy_index::FuzzyIndex;
use crate::mapping_store::MappingStore;
use crate::materializer::materialize;
use crate::normalize::{normalize, normalize_symbolic};
use crate::types::{ArtistCreditId, Mbid, RecordingId, ReleaseId, ShardCh};

/// Hand-estimated weight per normalized leading character (§6: "embedded
/// constant"). Used only to balance shard assignment at startup — the
/// absolute values don't need to be accurate, only relatively sensible.
static REQUEST_HISTOGRAM: Lazy<FxHashMap<ShardCh, u64>> = Lazy::new(|| {
    let raw: &[(char, u64)] = &[
        ('a', 820), ('b', 150), ('c', 280), ('d', 425), ('e', 212), ('f', 230),
        ('g', 203), ('h', 592), ('i', 731), ('j', 160), ('k', 69), ('l', 398),
        ('m', 261), ('n', 695), ('o', 768), ('p', 182), ('q', 11), ('r', 602),
        ('s', 628), ('t', 910), ('u', 288), ('v', 111), ('w', 209), ('x', 17),
        ('y', 211), ('z', 7), ('0', 50), ('1', 45), ('2', 40), ('3', 35),
        ('4', 30), ('5', 28), ('6', 25), ('7', 22), ('8', 20), ('9', 18),
        (crate::types::SYMBOLIC_SHARD_CH, 95),
    ];
    raw.iter().copied().collect()
});

/// Greedily assigns every `shard_ch` in `table` to one of `num_shards` bins,
/// always placing the next-heaviest character into the currently lightest
/// bin (§4.7). Characters absent from [`REQUEST_HISTOGRAM`] get a weight of
/// 1 so they're still covered, never dropped.
fn split_shards(table: &[PartitionEntry], num_shards: usize) -> FxHashMap<ShardCh, usize> {
    let mut weighted: Vec<(ShardCh, u64)> = table
        .iter()
        .map(|e| (e.shard_ch, *REQUEST_HISTOGRAM.get(&e.shard_ch).unwrap_or(&1)))
        .collect();
    weighted.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    let n = num_shards.max(1);
    let mut bins = vec![0u64; n];
    let mut assignment = FxHashMap::default();
    for (ch, weight) in weighted {
        let (idx, _) = bins.iter().enumerate().min_by_key(|(_, &w)| w).unwrap();
        bins[idx] += weight;
        assignment.insert(ch, idx);
    }
    assignment
}

#[derive(Debug, Clone)]
struct WorkerRequest {
    artist_ids: Vec<ArtistCreditId>,
    release_name: String,
    recording_name: String,
    id: Uuid,
}

enum WorkerMessage {
    Search(WorkerRequest),
    Exit,
}

struct WorkerResponse {
    hits: Option<Vec<(ReleaseId, RecordingId, f64)>>,
    request_id: Uuid,
}

/// A fully resolved hit, joined against the mapping store for display.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub artist_credit_id: ArtistCreditId,
    pub release_id: ReleaseId,
    pub release_mbid: Option<Mbid>,
    pub release_name: String,
    pub recording_id: RecordingId,
    pub recording_mbid: Option<Mbid>,
    pub recording_name: String,
    pub confidence: f64,
}

fn search_one_artist<B: CacheBackend>(
    store: &MappingStore,
    cache: &ArtistDataCache<B>,
    config: &Config,
    artist_id: ArtistCreditId,
    release_name: &str,
    recording_name: &str,
) -> Vec<(ReleaseId, RecordingId, f64)> {
    let bundle = match cache.load(artist_id) {
        Ok(Some(b)) => b,
        _ => match materialize(store, artist_id) {
            Ok(b) => {
                let _ = cache.save(artist_id, &b);
                b
            }
            Err(_) => return Vec::new(),
        },
    };
    if bundle.is_empty_artist() {
        return Vec::new();
    }
    let Some(recording_index) = &bundle.recording_index else { return Vec::new() };

    let normalized_recording = normalize(recording_name);
    let recording_hits = match recording_index.search(&normalized_recording, config.recording_confidence) {
        Ok(h) => h,
        Err(_) => return Vec::new(),
    };

    // (recording_id, release_id, confidence, popularity score) — sorted by
    // confidence desc, popularity score as tie-break (§4.7 step 7).
    let mut occurrences: Vec<(RecordingId, ReleaseId, f64, f64)> = recording_hits
        .iter()
        .flat_map(|hit| {
            hit.payload
                .occurrences
                .iter()
                .map(move |occ| (occ.recording_id, occ.release_id, hit.confidence, occ.score))
        })
        .collect();
    occurrences.sort_by(|a, b| {
        b.2.partial_cmp(&a.2)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.3.partial_cmp(&a.3).unwrap_or(std::cmp::Ordering::Equal))
    });

    if release_name.is_empty() {
        return occurrences
            .into_iter()
            .take(3)
            .map(|(recording_id, release_id, confidence, _score)| (release_id, recording_id, confidence))
            .collect();
    }

    let Some(release_index) = &bundle.release_index else { return Vec::new() };
    let normalized_release = normalize(release_name);
    let release_hits = match release_index.search(&normalized_release, config.release_confidence) {
        Ok(h) => h,
        Err(_) => return Vec::new(),
    };
    let mut release_candidates: Vec<(ReleaseId, f64, f64)> = release_hits
        .iter()
        .flat_map(|hit| hit.payload.release_id_scores.iter().map(move |(id, score)| (*id, hit.confidence, *score)))
        .collect();
    release_candidates.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
    });

    let top_recordings: Vec<_> = occurrences.into_iter().take(3).collect();
    let top_releases: Vec<_> = release_candidates.into_iter().take(3).collect();

    let mut best: Option<(ReleaseId, RecordingId, f64)> = None;
    for (recording_id, release_id, rec_conf, _rec_score) in &top_recordings {
        for (candidate_release_id, rel_conf, _rel_score) in &top_releases {
            if candidate_release_id != release_id {
                continue;
            }
            let Some(releases) = bundle.recording_releases.get(recording_id) else { continue };
            if !releases.contains(candidate_release_id) {
                continue;
            }
            let combined = (rec_conf + rel_conf) / 2.0;
            if best.map(|(_, _, c)| combined > c).unwrap_or(true) {
                best = Some((*candidate_release_id, *recording_id, combined));
            }
        }
    }
    best.into_iter().collect()
}

fn run_worker<B: CacheBackend>(
    mapping_db_path: PathBuf,
    cache: Arc<ArtistDataCache<B>>,
    config: Config,
    input: Receiver<WorkerMessage>,
    output: Sender<WorkerResponse>,
) {
    let Ok(store) = MappingStore::open_read_only(&mapping_db_path) else { return };
    loop {
        let message = match input.recv() {
            Ok(m) => m,
            Err(_) => break,
        };
        let request = match message {
            WorkerMessage::Exit => break,
            WorkerMessage::Search(req) => req,
        };
        if let Some(delay) = config.debug_worker_delay {
            std::thread::sleep(delay);
        }
        let mut all_hits: Vec<(ReleaseId, RecordingId, f64)> = Vec::new();
        for artist_id in &request.artist_ids {
            all_hits.extend(search_one_artist(
                &store,
                &cache,
                &config,
                *artist_id,
                &request.release_name,
                &request.recording_name,
            ));
        }
        all_hits.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        let limit = if request.release_name.is_empty() { 3 } else { 1 };
        all_hits.truncate(limit);
        let hits = if all_hits.is_empty() { None } else { Some(all_hits) };
        let _ = output.send(WorkerResponse { hits, request_id: request.id });
    }
}

/// Ties together the global artist indexes, the shard assignment, the
/// worker threads, and request correlation. One instance serves queries for
/// the lifetime of the process.
pub struct ShardRouter<B: CacheBackend> {
    config: Config,
    cleaner: Box<dyn Cleaner>,
    artist_index: Option<FuzzyIndex<ArtistIndexEntry>>,
    symbolic_index: Option<FuzzyIndex<ArtistIndexEntry>>,
    shard_assignment: FxHashMap<ShardCh, usize>,
    shard_inputs: Vec<Sender<WorkerMessage>>,
    pending: Arc<Mutex<FxHashMap<Uuid, crossbeam_channel::Sender<WorkerResponse>>>>,
    worker_handles: Vec<JoinHandle<()>>,
    correlator_handles: Vec<JoinHandle<()>>,
    mapping_store: MappingStore,
    _cache: Arc<ArtistDataCache<B>>,
}

impl<B: CacheBackend + 'static> ShardRouter<B> {
    pub fn new(index_dir: &Path, config: Config, cleaner: Box<dyn Cleaner>, cache: Arc<ArtistDataCache<B>>) -> CoreResult<Self> {
        let artist_index = FuzzyIndex::load(index_dir, ARTIST_INDEX_NAME)?;
        let symbolic_index = FuzzyIndex::load(index_dir, SYMBOLIC_INDEX_NAME)?;
        if artist_index.is_none() && symbolic_index.is_none() {
            return Err(CoreError::IndexNotBuilt);
        }
        let partition_table = load_partition_table(index_dir)?;
        let shard_assignment = split_shards(&partition_table, config.num_shards);

        let mapping_db_path = index_dir.join("mapping.db");
        let mapping_store = MappingStore::open_read_only(&mapping_db_path)?;

        let pending: Arc<Mutex<FxHashMap<Uuid, crossbeam_channel::Sender<WorkerResponse>>>> =
            Arc::new(Mutex::new(FxHashMap::default()));

        let num_shards = config.num_shards.max(1);
        let mut shard_inputs = Vec::with_capacity(num_shards);
        let mut worker_handles = Vec::with_capacity(num_shards);
        let mut correlator_handles = Vec::with_capacity(num_shards);

        for _ in 0..num_shards {
            let (input_tx, input_rx) = unbounded::<WorkerMessage>();
            let (output_tx, output_rx) = unbounded::<WorkerResponse>();

            let worker_cache = cache.clone();
            let worker_config = config.clone();
            let worker_db_path = mapping_db_path.clone();
            worker_handles.push(std::thread::spawn(move || {
                run_worker(worker_db_path, worker_cache, worker_config, input_rx, output_tx);
            }));

            let correlator_pending = pending.clone();
            correlator_handles.push(std::thread::spawn(move || {
                while let Ok(response) = output_rx.recv() {
                    if let Some(sender) = correlator_pending.lock().unwrap().remove(&response.request_id) {
                        let _ = sender.send(response);
                    }
                    // No registered sender means the request already timed out; drop the stale reply.
                }
            }));

            shard_inputs.push(input_tx);
        }

        Ok(ShardRouter {
            config,
            cleaner,
            artist_index,
            symbolic_index,
            shard_assignment,
            shard_inputs,
            pending,
            worker_handles,
            correlator_handles,
            mapping_store,
            _cache: cache,
        })
    }

    fn threshold_for(&self, encoded: &str) -> f64 {
        if encoded.chars().count() <= self.config.short_artist_len {
            self.config.short_artist_confidence
        } else {
            self.config.normal_artist_confidence
        }
    }

    /// Returns hits plus the confidence threshold used (§4.7 step 2), so the
    /// cleaner-rescue search in step 3 reuses the same threshold rather than
    /// recomputing one from the cleaned spelling.
    fn search_artist_indexes(
        &self,
        artist_name: &str,
        threshold: f64,
    ) -> CoreResult<Vec<crate::fuzzy_index::SearchHit<ArtistIndexEntry>>> {
        let encoded = normalize(artist_name);
        let mut hits = Vec::new();
        if !encoded.is_empty() {
            if let Some(idx) = &self.artist_index {
                hits.extend(idx.search(&encoded, threshold)?);
            }
        } else if let Some(idx) = &self.symbolic_index {
            let symbolic = normalize_symbolic(artist_name);
            hits.extend(idx.search(&symbolic, threshold)?);
        }
        Ok(hits)
    }

    /// Runs the full query pipeline with the router's configured timeout.
    pub fn search(&self, artist_name: &str, release_name: &str, recording_name: &str) -> CoreResult<Vec<SearchResult>> {
        self.search_with_timeout(artist_name, release_name, recording_name, self.config.search_timeout)
    }

    /// Same as [`Self::search`] but with an explicit timeout override, used
    /// by tests exercising the timeout/correlation path (§8 scenario 6).
    pub fn search_with_timeout(
        &self,
        artist_name: &str,
        release_name: &str,
        recording_name: &str,
        timeout: Duration,
    ) -> CoreResult<Vec<SearchResult>> {
        let encoded = normalize(artist_name);
        let threshold = self.threshold_for(&encoded);
        let mut hits = self.search_artist_indexes(artist_name, threshold)?;

        let best_confidence = hits.iter().map(|h| h.confidence).fold(0.0, f64::max);
        if best_confidence <= self.config.cleaner_confidence {
            let cleaned = self.cleaner.clean_artist(artist_name);
            let cleaned_encoded = normalize(&cleaned);
            // Compare encoded forms, not raw strings (original_source's
            // `mapping_search` compares `encode_string(cleaned)` against the
            // already-encoded artist, not the raw spellings) — a cleaner that
            // only changes case/whitespace without changing the normalized
            // form shouldn't trigger a redundant second search.
            if cleaned_encoded != encoded {
                if !cleaned_encoded.is_empty() {
                    if let Some(idx) = &self.artist_index {
                        hits.extend(idx.search(&cleaned_encoded, threshold)?);
                    }
                } else if let Some(idx) = &self.symbolic_index {
                    let cleaned_symbolic = normalize_symbolic(&cleaned);
                    hits.extend(idx.search(&cleaned_symbolic, threshold)?);
                }
            }
        }

        if hits.is_empty() {
            return Err(CoreError::ArtistNotFound);
        }
        hits.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(std::cmp::Ordering::Equal));
        let top_shard = hits[0].payload.shard_ch;

        let mut seen = FxHashSet::default();
        let artist_ids: Vec<ArtistCreditId> = hits
            .iter()
            .filter(|h| h.payload.shard_ch == top_shard)
            .map(|h| h.payload.id)
            .filter(|id| seen.insert(*id))
            .collect();

        let shard_idx = *self
            .shard_assignment
            .get(&top_shard)
            .ok_or(CoreError::ShardUnavailable(top_shard))?;

        let request_id = Uuid::new_v4();
        let (reply_tx, reply_rx) = crossbeam_channel::bounded::<WorkerResponse>(1);
        self.pending.lock().unwrap().insert(request_id, reply_tx);

        self.shard_inputs[shard_idx]
            .send(WorkerMessage::Search(WorkerRequest {
                artist_ids,
                release_name: release_name.to_string(),
                recording_name: recording_name.to_string(),
                id: request_id,
            }))
            .map_err(|_| CoreError::ShardUnavailable(top_shard))?;

        let response = match reply_rx.recv_timeout(timeout) {
            Ok(r) => r,
            Err(_) => {
                self.pending.lock().unwrap().remove(&request_id);
                return Err(CoreError::SearchTimeout);
            }
        };

        let Some(hits) = response.hits else {
            return Err(CoreError::ArtistNotFound);
        };

        let mut results = Vec::with_capacity(hits.len());
        for (release_id, recording_id, confidence) in hits {
            let Some(row) = self
                .mapping_store
                .select_by_release_recording(release_id, recording_id)?
                .into_iter()
                .next()
            else {
                continue;
            };
            results.push(SearchResult {
                artist_credit_id: row.artist_credit_id,
                release_id,
                release_mbid: row.release_mbid,
                release_name: row.release_name,
                recording_id,
                recording_mbid: row.recording_mbid,
                recording_name: row.recording_name,
                confidence,
            });
        }
        Ok(results)
    }
}

impl<B: CacheBackend> Drop for ShardRouter<B> {
    fn drop(&mut self) {
        for input in &self.shard_inputs {
            let _ = input.send(WorkerMessage::Exit);
        }
        for h in self.worker_handles.drain(..) {
            let _ = h.join();
        }
        for h in self.correlator_handles.drain(..) {
            let _ = h.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::{build, SourceRow};
    use crate::cache::{ArtistDataCache, InMemoryCache};
    use crate::cleaner::{Cleaner, IdentityCleaner};
    use crate::types::Mbid;

    fn row(artist_id: u32, name: &str, release: &str, release_id: u32, recording: &str, recording_id: u32, score: f64) -> SourceRow {
        SourceRow {
            artist_credit_id: artist_id,
            artist_mbids: vec![],
            artist_credit_name: name.to_string(),
            artist_credit_sortname: vec![name.to_string()],
            release_id,
            release_mbid: Some(Mbid(uuid::Uuid::new_v4())),
            release_name: release.to_string(),
            recording_id,
            recording_mbid: Some(Mbid(uuid::Uuid::new_v4())),
            recording_name: recording.to_string(),
            score,
        }
    }

    fn build_test_router(rows: Vec<SourceRow>, config: Config) -> ShardRouter<InMemoryCache> {
        let dir = std::env::temp_dir().join(format!("router_test_{}", uuid::Uuid::new_v4()));
        build(rows.into_iter(), &dir, 0).unwrap();
        let cache = Arc::new(ArtistDataCache::new(InMemoryCache::new(), config.max_cache_size_bytes, 0.9, 0.1));
        ShardRouter::new(&dir, config, Box::new(IdentityCleaner), cache).unwrap()
    }

    #[test]
    fn canonical_match_with_release() {
        let router = build_test_router(
            vec![row(65, "Portishead", "Dummy", 10, "Strangers", 100, 50.0)],
            Config::default(),
        );
        let results = router.search("portishead", "dummy", "strangers").unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].release_id, 10);
        assert_eq!(results[0].recording_id, 100);
        assert!(results[0].confidence >= 0.9);
    }

    #[test]
    fn recording_only_returns_up_to_three() {
        let router = build_test_router(
            vec![row(65, "Portishead", "Dummy", 10, "Strangers", 100, 50.0)],
            Config::default(),
        );
        let results = router.search("portishead", "", "strangers").unwrap();
        assert!(!results.is_empty());
        assert!(results.len() <= 3);
        assert_eq!(results[0].release_id, 10);
        assert_eq!(results[0].recording_id, 100);
        assert!(results[0].confidence >= 0.5);
    }

    struct BeyonceCleaner;
    impl Cleaner for BeyonceCleaner {
        fn clean_artist(&self, _text: &str) -> String {
            "Beyonce".to_string()
        }
    }

    #[test]
    fn cleaner_rescues_mangled_artist_name() {
        let dir = std::env::temp_dir().join(format!("router_test_{}", uuid::Uuid::new_v4()));
        build(
            vec![row(9, "Beyonce", "B'Day", 1, "Crazy In Love", 1, 50.0)].into_iter(),
            &dir,
            0,
        )
        .unwrap();
        let cache = Arc::new(ArtistDataCache::new(InMemoryCache::new(), 1024 * 1024, 0.9, 0.1));
        let router = ShardRouter::new(&dir, Config::default(), Box::new(BeyonceCleaner), cache).unwrap();
        let results = router.search("Beyonce feat. Jay-Z", "", "crazy in love").unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].recording_id, 1);
    }

    #[test]
    fn symbolic_artist_routes_through_dollar_shard() {
        let router = build_test_router(
            vec![row(7, "!!!", "Louden Up Now", 1, "Must Be the Moon", 1, 50.0)],
            Config::default(),
        );
        let results = router.search("!!!", "", "must be the moon").unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].recording_id, 1);
    }

    #[test]
    fn unmatched_artist_is_not_found() {
        let router = build_test_router(
            vec![row(65, "Portishead", "Dummy", 10, "Strangers", 100, 50.0)],
            Config::default(),
        );
        let err = router.search("zzzzzzz", "", "x").unwrap_err();
        assert!(matches!(err, CoreError::ArtistNotFound));
    }

    #[test]
    fn timeout_discards_stale_reply_and_later_queries_still_work() {
        let mut config = Config::default();
        config.debug_worker_delay = Some(Duration::from_millis(150));
        let router = build_test_router(
            vec![row(65, "Portishead", "Dummy", 10, "Strangers", 100, 50.0)],
            config,
        );

        let err = router
            .search_with_timeout("portishead", "dummy", "strangers", Duration::from_millis(10))
            .unwrap_err();
        assert!(matches!(err, CoreError::SearchTimeout));

        // The stale reply (still in flight) must not corrupt a later, more patient query.
        let results = router
            .search_with_timeout("portishead", "dummy", "strangers", Duration::from_secs(2))
            .unwrap();
        assert_eq!(results[0].recording_id, 100);
    }
}
