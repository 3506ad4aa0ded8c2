//! Runtime configuration (§2.1). Plain struct + `Default`, built by the CLI
//! from `clap` flags or constructed directly by library callers.

#[derive(Debug, Clone)]
pub struct Config {
    pub num_shards: usize,
    pub max_cache_size_bytes: u64,
    pub search_timeout: std::time::Duration,
    pub cleaner_confidence: f64,
    pub short_artist_len: usize,
    pub short_artist_confidence: f64,
    pub normal_artist_confidence: f64,
    pub release_confidence: f64,
    pub recording_confidence: f64,
    pub eviction_sweep_interval: std::time::Duration,
    pub high_watermark_fraction: f64,
    pub low_watermark_fraction: f64,
    /// Test-only latency injection: if set, each worker sleeps this long
    /// before handling a request. Used to exercise the timeout/correlation
    /// path deterministically (§8 scenario 6) without a real slow shard.
    pub debug_worker_delay: Option<std::time::Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            num_shards: 16,
            max_cache_size_bytes: 512 * 1024 * 1024,
            search_timeout: std::time::Duration::from_secs(10),
            cleaner_confidence: 0.9,
            short_artist_len: 5,
            short_artist_confidence: 0.5,
            normal_artist_confidence: 0.7,
            release_confidence: 0.5,
            recording_confidence: 0.5,
            eviction_sweep_interval: std::time::Duration::from_secs(30),
            high_watermark_fraction: 0.9,
            low_watermark_fraction: 0.1,
            debug_worker_delay: None,
        }
    }
}
