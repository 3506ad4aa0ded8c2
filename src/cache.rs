//! Artist-data cache (C6, §4.6): a process-wide cache keyed by
//! `artist_credit_id`, backed by named POSIX shared-memory regions so
//! multiple worker processes/threads can share one copy of a bundle.
//!
//! The backing store is abstracted behind [`CacheBackend`] (§9) so tests can
//! substitute an in-memory map instead of real shared memory.

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::error::{CoreError, CoreResult};
use crate::fuzzy_index::FuzzyIndex;
use crate::materializer::{ArtistBundle, RecordingEntry, ReleaseEntry};
use crate::types::{ArtistCreditId, RecordingId, ReleaseId};

fn region_name(id: ArtistCreditId) -> String {
    format!("a{id}")
}

/// Backing-store primitives for the cache. `save` is idempotent on
/// concurrent duplicate saves: a backend that detects the region already
/// exists returns `Ok(())` (first writer wins) rather than an error — the
/// `CacheCollision` case is logged by the caller, not surfaced as failure.
pub trait CacheBackend: Send + Sync {
    fn load(&self, id: ArtistCreditId) -> CoreResult<Option<Vec<u8>>>;
    fn save(&self, id: ArtistCreditId, bytes: &[u8]) -> CoreResult<bool>;
    fn evict(&self, id: ArtistCreditId) -> CoreResult<()>;
}

/// Plain in-memory backend. Default for tests and non-Linux builds; also
/// useful as a process-local L1 in front of a real `ShmCache`.
#[derive(Default)]
pub struct InMemoryCache {
    regions: Mutex<FxHashMap<ArtistCreditId, Vec<u8>>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for InMemoryCache {
    fn load(&self, id: ArtistCreditId) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.regions.lock().unwrap().get(&id).cloned())
    }

    fn save(&self, id: ArtistCreditId, bytes: &[u8]) -> CoreResult<bool> {
        let mut regions = self.regions.lock().unwrap();
        if regions.contains_key(&id) {
            return Ok(false);
        }
        regions.insert(id, bytes.to_vec());
        Ok(true)
    }

    fn evict(&self, id: ArtistCreditId) -> CoreResult<()> {
        self.regions.lock().unwrap().remove(&id);
        Ok(())
    }
}

/// POSIX shared-memory backend, one region per cached artist named
/// `a{artist_credit_id}` (§6). Grounded on the `k4-core` `shm.rs` reference:
/// `shm_open`/`ftruncate`/`mmap` to create, plain `mmap` to read, and no
/// `shm_unlink` on normal drop — eviction is the only thing that unlinks, and
/// a process that already mapped a region keeps reading valid bytes after
/// that (advisory eviction, §4.6).
pub struct ShmCache;

impl ShmCache {
    pub fn new() -> Self {
        ShmCache
    }
}

impl Default for ShmCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
mod shm_linux {
    use super::*;
    use std::ffi::CString;

    fn name_cstring(id: ArtistCreditId) -> CString {
        CString::new(region_name(id)).expect("region name has no interior nul")
    }

    impl CacheBackend for ShmCache {
        fn save(&self, id: ArtistCreditId, bytes: &[u8]) -> CoreResult<bool> {
            let name = name_cstring(id);
            let total = 8 + bytes.len();
            // SAFETY: standard POSIX shm_open + ftruncate + mmap create sequence.
            unsafe {
                let fd = libc::shm_open(name.as_ptr(), libc::O_CREAT | libc::O_EXCL | libc::O_RDWR, 0o666);
                if fd < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EEXIST) {
                        return Ok(false);
                    }
                    return Err(CoreError::Io(err));
                }
                if libc::ftruncate(fd, total as libc::off_t) != 0 {
                    let err = std::io::Error::last_os_error();
                    libc::close(fd);
                    return Err(CoreError::Io(err));
                }
                let base = libc::mmap(
                    std::ptr::null_mut(),
                    total,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    0,
                );
                libc::close(fd);
                if base == libc::MAP_FAILED {
                    return Err(CoreError::Io(std::io::Error::last_os_error()));
                }
                let base = base as *mut u8;
                std::ptr::copy_nonoverlapping((bytes.len() as u64).to_le_bytes().as_ptr(), base, 8);
                std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(8), bytes.len());
                libc::munmap(base as *mut libc::c_void, total);
            }
            Ok(true)
        }

        fn load(&self, id: ArtistCreditId) -> CoreResult<Option<Vec<u8>>> {
            let name = name_cstring(id);
            // SAFETY: open read-only, map the 8-byte length header, then the
            // full region once the length is known.
            unsafe {
                let fd = libc::shm_open(name.as_ptr(), libc::O_RDONLY, 0);
                if fd < 0 {
                    let err = std::io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::ENOENT) {
                        return Ok(None);
                    }
                    return Err(CoreError::Io(err));
                }
                let header = libc::mmap(std::ptr::null_mut(), 8, libc::PROT_READ, libc::MAP_SHARED, fd, 0);
                if header == libc::MAP_FAILED {
                    libc::close(fd);
                    return Err(CoreError::Io(std::io::Error::last_os_error()));
                }
                let mut len_buf = [0u8; 8];
                std::ptr::copy_nonoverlapping(header as *const u8, len_buf.as_mut_ptr(), 8);
                libc::munmap(header, 8);
                let data_len = u64::from_le_bytes(len_buf) as usize;
                let total = 8 + data_len;

                let base = libc::mmap(std::ptr::null_mut(), total, libc::PROT_READ, libc::MAP_SHARED, fd, 0);
                libc::close(fd);
                if base == libc::MAP_FAILED {
                    return Err(CoreError::Io(std::io::Error::last_os_error()));
                }
                let mut out = vec![0u8; data_len];
                std::ptr::copy_nonoverlapping((base as *const u8).add(8), out.as_mut_ptr(), data_len);
                libc::munmap(base, total);
                Ok(Some(out))
            }
        }

        fn evict(&self, id: ArtistCreditId) -> CoreResult<()> {
            let name = name_cstring(id);
            // SAFETY: unlinking a name that is already gone is a harmless ENOENT.
            unsafe {
                libc::shm_unlink(name.as_ptr());
            }
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod shm_fallback {
    use super::*;

    /// Non-Linux dev/test builds fall back to a process-local map — POSIX
    /// shared memory is the production path (§4.6); this keeps the crate
    /// buildable elsewhere, same trade-off the `k4-core` reference makes.
    static FALLBACK: once_cell::sync::Lazy<InMemoryCache> = once_cell::sync::Lazy::new(InMemoryCache::new);

    impl CacheBackend for ShmCache {
        fn load(&self, id: ArtistCreditId) -> CoreResult<Option<Vec<u8>>> {
            FALLBACK.load(id)
        }
        fn save(&self, id: ArtistCreditId, bytes: &[u8]) -> CoreResult<bool> {
            FALLBACK.save(id, bytes)
        }
        fn evict(&self, id: ArtistCreditId) -> CoreResult<()> {
            FALLBACK.evict(id)
        }
    }
}

#[derive(Serialize, Deserialize)]
struct SerializedBundle {
    empty: bool,
    recording_data: Vec<(String, RecordingEntry)>,
    release_data: Vec<(String, ReleaseEntry)>,
    recording_releases: Vec<(RecordingId, Vec<ReleaseId>)>,
    recording_index_blobs: Option<[Vec<u8>; 3]>,
    release_index_blobs: Option<[Vec<u8>; 3]>,
}

fn serialize_bundle(bundle: &ArtistBundle) -> CoreResult<Vec<u8>> {
    let recording_releases: Vec<(RecordingId, Vec<ReleaseId>)> = bundle
        .recording_releases
        .iter()
        .map(|(k, v)| (*k, v.iter().copied().collect()))
        .collect();
    let serialized = SerializedBundle {
        empty: bundle.is_empty_artist(),
        recording_data: bundle.recording_data.clone(),
        release_data: bundle.release_data.clone(),
        recording_releases,
        recording_index_blobs: bundle.recording_index.as_ref().map(|i| i.save_to_mem()).transpose()?,
        release_index_blobs: bundle.release_index.as_ref().map(|i| i.save_to_mem()).transpose()?,
    };
    serde_json::to_vec(&serialized).map_err(|e| CoreError::SourceError(e.to_string()))
}

fn deserialize_bundle(artist_credit_id: ArtistCreditId, bytes: &[u8]) -> CoreResult<ArtistBundle> {
    let s: SerializedBundle =
        serde_json::from_slice(bytes).map_err(|e| CoreError::SourceError(e.to_string()))?;
    let recording_releases = s.recording_releases.into_iter().map(|(k, v)| (k, v.into_iter().collect())).collect();

    // The "[empty]" marker (here: `empty: true`) skips sub-index deserialization entirely.
    let recording_index = s
        .recording_index_blobs
        .map(|[v, i, d]| FuzzyIndex::<RecordingEntry>::load_from_mem(&v, &i, &d))
        .transpose()?;
    let release_index = s
        .release_index_blobs
        .map(|[v, i, d]| FuzzyIndex::<ReleaseEntry>::load_from_mem(&v, &i, &d))
        .transpose()?;

    Ok(ArtistBundle {
        artist_credit_id,
        recording_data: s.recording_data,
        release_data: s.release_data,
        recording_releases,
        recording_index,
        release_index,
    })
}

struct EntryMeta {
    last_access: Instant,
    size_bytes: u64,
}

/// The process-wide cache itself: tracks access recency and entry size on
/// top of a `CacheBackend`, and runs the high/low-watermark eviction sweep
/// described in §4.6.
pub struct ArtistDataCache<B: CacheBackend> {
    backend: B,
    metadata: Mutex<FxHashMap<ArtistCreditId, EntryMeta>>,
    max_cache_size_bytes: u64,
    high_watermark_fraction: f64,
    low_watermark_fraction: f64,
    stopped: AtomicBool,
}

impl<B: CacheBackend> ArtistDataCache<B> {
    pub fn new(backend: B, max_cache_size_bytes: u64, high_watermark_fraction: f64, low_watermark_fraction: f64) -> Self {
        ArtistDataCache {
            backend,
            metadata: Mutex::new(FxHashMap::default()),
            max_cache_size_bytes,
            high_watermark_fraction,
            low_watermark_fraction,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn load(&self, id: ArtistCreditId) -> CoreResult<Option<ArtistBundle>> {
        match self.backend.load(id)? {
            Some(bytes) => {
                let bundle = deserialize_bundle(id, &bytes)?;
                let mut meta = self.metadata.lock().unwrap();
                meta.entry(id)
                    .and_modify(|m| m.last_access = Instant::now())
                    .or_insert(EntryMeta { last_access: Instant::now(), size_bytes: bytes.len() as u64 });
                Ok(Some(bundle))
            }
            None => Ok(None),
        }
    }

    /// Idempotent on concurrent duplicate saves: a `CacheCollision` (another
    /// writer already created this region) is non-fatal and simply means the
    /// existing copy wins (§7).
    pub fn save(&self, id: ArtistCreditId, bundle: &ArtistBundle) -> CoreResult<()> {
        let bytes = serialize_bundle(bundle)?;
        let wrote = self.backend.save(id, &bytes)?;
        if wrote {
            let mut meta = self.metadata.lock().unwrap();
            meta.insert(id, EntryMeta { last_access: Instant::now(), size_bytes: bytes.len() as u64 });
        }
        Ok(())
    }

    fn total_size(&self) -> u64 {
        self.metadata.lock().unwrap().values().map(|m| m.size_bytes).sum()
    }

    /// One sweep of the background cache manager (§4.6): if total tracked
    /// size exceeds the high watermark, evict least-recently-accessed
    /// entries until below the low watermark. Eviction only unlinks the
    /// backend region and forgets local metadata; a process that already
    /// holds a loaded `ArtistBundle` keeps using it (advisory eviction).
    pub fn sweep(&self) -> CoreResult<u64> {
        let high = (self.max_cache_size_bytes as f64 * self.high_watermark_fraction) as u64;
        let low = high.saturating_sub((self.max_cache_size_bytes as f64 * self.low_watermark_fraction) as u64);

        if self.total_size() <= high {
            return Ok(0);
        }

        let mut evicted = 0u64;
        loop {
            let victim = {
                let meta = self.metadata.lock().unwrap();
                meta.iter().min_by_key(|(_, m)| m.last_access).map(|(id, _)| *id)
            };
            let Some(id) = victim else { break };
            self.backend.evict(id)?;
            let size = self.metadata.lock().unwrap().remove(&id).map(|m| m.size_bytes).unwrap_or(0);
            evicted += size;
            if self.total_size() <= low {
                break;
            }
        }
        Ok(evicted)
    }

    /// Flushes all entries this process knows about (§4.6 `clear()`).
    pub fn clear(&self) -> CoreResult<()> {
        let ids: Vec<ArtistCreditId> = self.metadata.lock().unwrap().keys().copied().collect();
        for id in ids {
            self.backend.evict(id)?;
        }
        self.metadata.lock().unwrap().clear();
        Ok(())
    }

    pub fn request_stop(&self) {
        self.stopped.store(true, Ordering::Relaxed);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Relaxed)
    }
}

/// Spawns the background eviction-sweep thread (§5: "runs as a parallel
/// background task inside each process but touches only the shared-memory
/// directory and eviction metadata").
pub fn spawn_eviction_thread<B: CacheBackend + 'static>(
    cache: Arc<ArtistDataCache<B>>,
    interval: std::time::Duration,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while !cache.is_stopped() {
            std::thread::sleep(interval);
            if cache.is_stopped() {
                break;
            }
            let _ = cache.sweep();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping_store::MappingStore;
    use crate::materializer::materialize;
    use crate::types::MappingRow;

    fn sample_bundle() -> ArtistBundle {
        let path = std::env::temp_dir().join(format!("cache_test_{}.db", uuid::Uuid::new_v4()));
        let mut store = MappingStore::open(&path).unwrap();
        store
            .insert_batch(&[MappingRow {
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
            }])
            .unwrap();
        materialize(&store, 65).unwrap()
    }

    #[test]
    fn save_then_load_round_trips_search_results() {
        let cache = ArtistDataCache::new(InMemoryCache::new(), 1024 * 1024, 0.9, 0.1);
        let bundle = sample_bundle();
        cache.save(65, &bundle).unwrap();
        let loaded = cache.load(65).unwrap().unwrap();
        let before = bundle.recording_index.as_ref().unwrap().search("strangers", 0.0).unwrap();
        let after = loaded.recording_index.as_ref().unwrap().search("strangers", 0.0).unwrap();
        assert_eq!(before.len(), after.len());
        assert!((before[0].confidence - after[0].confidence).abs() < 1e-6);
    }

    #[test]
    fn duplicate_save_is_non_fatal_first_writer_wins() {
        let backend = InMemoryCache::new();
        assert!(backend.save(1, b"first").unwrap());
        assert!(!backend.save(1, b"second").unwrap());
        assert_eq!(backend.load(1).unwrap().unwrap(), b"first");
    }

    #[test]
    fn sweep_evicts_least_recently_used_under_pressure() {
        let cache = ArtistDataCache::new(InMemoryCache::new(), 100, 0.5, 0.5);
        let bundle = sample_bundle();
        cache.save(1, &bundle).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        cache.save(2, &bundle).unwrap();
        cache.sweep().unwrap();
        assert!(cache.load(1).unwrap().is_none() || cache.load(2).unwrap().is_some());
    }

    #[test]
    fn clear_flushes_everything() {
        let cache = ArtistDataCache::new(InMemoryCache::new(), 1024 * 1024, 0.9, 0.1);
        let bundle = sample_bundle();
        cache.save(65, &bundle).unwrap();
        cache.clear().unwrap();
        assert!(cache.load(65).unwrap().is_none());
    }
}
