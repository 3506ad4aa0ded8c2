//! Fuzzy index (C2, §4.2): trigram TF-IDF vectorizer plus a sparse
//! inverted-file k-NN search. This is the sole matching primitive used by
//! the artist index and by every per-artist release/recording sub-index.

use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{CoreError, CoreResult};

const K: usize = 15;
const MAGIC: &[u8; 4] = b"FZX1";
const FORMAT_VERSION: u32 = 1;

/// Character-trigram tokenizer. Pads with a single leading and trailing
/// space so `"cat"` yields `" ca"`, `"cat"`, `"at "`.
pub fn trigrams(text: &str) -> Vec<String> {
    let padded: Vec<char> = std::iter::once(' ')
        .chain(text.chars())
        .chain(std::iter::once(' '))
        .collect();
    if padded.len() < 3 {
        return vec![padded.iter().collect()];
    }
    (0..=padded.len() - 3)
        .map(|i| padded[i..i + 3].iter().collect())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Vectorizer {
    vocab: FxHashMap<String, u32>,
    idf: Vec<f32>,
}

impl Vectorizer {
    fn fit<'a>(documents: impl Iterator<Item = &'a str>) -> Self {
        let mut doc_freq: FxHashMap<String, u32> = FxHashMap::default();
        let mut n_docs = 0u32;
        for doc in documents {
            n_docs += 1;
            let mut seen: rustc_hash::FxHashSet<String> = rustc_hash::FxHashSet::default();
            for gram in trigrams(doc) {
                if seen.insert(gram.clone()) {
                    *doc_freq.entry(gram).or_insert(0) += 1;
                }
            }
        }
        let mut vocab = FxHashMap::default();
        let mut idf = Vec::with_capacity(doc_freq.len());
        for (i, (gram, df)) in doc_freq.into_iter().enumerate() {
            // min_df = 1: every observed trigram is kept.
            let smoothed_idf = ((1.0 + n_docs as f32) / (1.0 + df as f32)).ln() + 1.0;
            vocab.insert(gram, i as u32);
            idf.push(smoothed_idf);
        }
        Vectorizer { vocab, idf }
    }

    /// Transform `text` into an L2-normalized sparse TF-IDF vector.
    /// Trigrams outside the fitted vocabulary are dropped.
    fn transform(&self, text: &str) -> Vec<(u32, f32)> {
        let grams = trigrams(text);
        let mut tf: FxHashMap<u32, f32> = FxHashMap::default();
        for gram in &grams {
            if let Some(&id) = self.vocab.get(gram) {
                *tf.entry(id).or_insert(0.0) += 1.0;
            }
        }
        let mut weighted: Vec<(u32, f32)> = tf
            .into_iter()
            .map(|(id, count)| (id, count * self.idf[id as usize]))
            .collect();
        let norm = weighted.iter().map(|(_, w)| w * w).sum::<f32>().sqrt();
        if norm > 0.0 {
            for (_, w) in weighted.iter_mut() {
                *w /= norm;
            }
        }
        weighted.sort_by_key(|(id, _)| *id);
        weighted
    }
}

/// One record stored in a fuzzy index: a matched-on `text` field plus an
/// arbitrary payload carried through to search results unchanged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FuzzyRecord<T> {
    pub text: String,
    pub payload: T,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit<T> {
    pub text: String,
    pub payload: T,
    pub confidence: f64,
}

/// A built, immutable fuzzy index over a fixed set of `FuzzyRecord<T>`.
/// Distance is the negated dot product of L2-normalized sparse TF-IDF
/// vectors; confidence is the absolute value of that dot product, already
/// comparable across builds and queries (§9: normalize into `[0, 1]`).
pub struct FuzzyIndex<T> {
    vectorizer: Vectorizer,
    records: Vec<FuzzyRecord<T>>,
    // inverted file: trigram id -> (doc index, weight)
    postings: FxHashMap<u32, Vec<(u32, f32)>>,
    built: bool,
}

impl<T: Clone + Serialize + DeserializeOwned> FuzzyIndex<T> {
    /// Fresh, unbuilt index. Searching it fails with `IndexNotBuilt`.
    pub fn new() -> Self {
        FuzzyIndex {
            vectorizer: Vectorizer { vocab: FxHashMap::default(), idf: Vec::new() },
            records: Vec::new(),
            postings: FxHashMap::default(),
            built: false,
        }
    }

    /// Fit the vectorizer over `records` and insert sparse vectors into the
    /// inverted file. Rebuilding silently replaces prior state.
    pub fn build(records: Vec<FuzzyRecord<T>>) -> CoreResult<Self> {
        if records.is_empty() {
            return Err(CoreError::EmptyIndex);
        }
        let vectorizer = Vectorizer::fit(records.iter().map(|r| r.text.as_str()));
        let mut postings: FxHashMap<u32, Vec<(u32, f32)>> = FxHashMap::default();
        for (doc_idx, record) in records.iter().enumerate() {
            for (term_id, weight) in vectorizer.transform(&record.text) {
                postings.entry(term_id).or_default().push((doc_idx as u32, weight));
            }
        }
        Ok(FuzzyIndex { vectorizer, records, postings, built: true })
    }

    /// k=15 nearest neighbours by sparse cosine-like similarity, filtered to
    /// `min_confidence` and returned in score-descending order (not re-sorted
    /// beyond that — the contract only promises descending confidence).
    pub fn search(&self, query: &str, min_confidence: f64) -> CoreResult<Vec<SearchHit<T>>> {
        if !self.built {
            return Err(CoreError::IndexNotBuilt);
        }
        let query_vec = self.vectorizer.transform(query);
        let mut scores: FxHashMap<u32, f32> = FxHashMap::default();
        for (term_id, q_weight) in &query_vec {
            if let Some(docs) = self.postings.get(term_id) {
                for (doc_idx, d_weight) in docs {
                    *scores.entry(*doc_idx).or_insert(0.0) += q_weight * d_weight;
                }
            }
        }
        let mut scored: Vec<(u32, f32)> = scores.into_iter().collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(K);

        let hits = scored
            .into_iter()
            .map(|(doc_idx, score)| {
                let confidence = score.abs() as f64;
                (doc_idx, confidence)
            })
            .filter(|(_, confidence)| *confidence >= min_confidence)
            .map(|(doc_idx, confidence)| {
                let record = &self.records[doc_idx as usize];
                SearchHit { text: record.text.clone(), payload: record.payload.clone(), confidence }
            })
            .collect();
        Ok(hits)
    }

    pub fn is_built(&self) -> bool {
        self.built
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Serializes the three artifacts (vectorizer, inverted file, payload)
    /// to in-memory framed byte buffers, for the shared-memory cache (C6) to
    /// embed directly rather than round-tripping through the filesystem —
    /// mirrors the original's `save_to_mem`/`load_from_mem` split between
    /// disk persistence and cache persistence.
    pub fn save_to_mem(&self) -> CoreResult<[Vec<u8>; 3]> {
        let vectorizer_bytes = serde_json::to_vec(&self.vectorizer)
            .map_err(|e| CoreError::SourceError(e.to_string()))?;
        let postings_vec: Vec<(u32, Vec<(u32, f32)>)> =
            self.postings.iter().map(|(k, v)| (*k, v.clone())).collect();
        let postings_bytes =
            serde_json::to_vec(&postings_vec).map_err(|e| CoreError::SourceError(e.to_string()))?;
        let records_bytes =
            serde_json::to_vec(&self.records).map_err(|e| CoreError::SourceError(e.to_string()))?;

        let frame = |bytes: &[u8]| -> CoreResult<Vec<u8>> {
            let mut buf = Vec::new();
            crate::framing::write_framed(&mut buf, MAGIC, FORMAT_VERSION, bytes)?;
            Ok(buf)
        };
        Ok([frame(&vectorizer_bytes)?, frame(&postings_bytes)?, frame(&records_bytes)?])
    }

    pub fn load_from_mem(vectorizer: &[u8], postings: &[u8], records: &[u8]) -> CoreResult<Self> {
        let vectorizer_bytes = crate::framing::read_framed(&mut std::io::Cursor::new(vectorizer), MAGIC)?;
        let postings_bytes = crate::framing::read_framed(&mut std::io::Cursor::new(postings), MAGIC)?;
        let records_bytes = crate::framing::read_framed(&mut std::io::Cursor::new(records), MAGIC)?;

        let vectorizer: Vectorizer = serde_json::from_slice(&vectorizer_bytes)
            .map_err(|e| CoreError::SourceError(e.to_string()))?;
        let postings_vec: Vec<(u32, Vec<(u32, f32)>)> = serde_json::from_slice(&postings_bytes)
            .map_err(|e| CoreError::SourceError(e.to_string()))?;
        let records: Vec<FuzzyRecord<T>> = serde_json::from_slice(&records_bytes)
            .map_err(|e| CoreError::SourceError(e.to_string()))?;

        let postings: FxHashMap<u32, Vec<(u32, f32)>> = postings_vec.into_iter().collect();
        Ok(FuzzyIndex { vectorizer, records, postings, built: true })
    }

    /// Writes `{dir}/{name}.vec`, `{dir}/{name}.ivf`, `{dir}/{name}.dat`.
    pub fn save(&self, dir: &Path, name: &str) -> CoreResult<()> {
        std::fs::create_dir_all(dir)?;
        let [vec_bytes, ivf_bytes, dat_bytes] = self.save_to_mem()?;
        for (suffix, bytes) in [("vec", vec_bytes), ("ivf", ivf_bytes), ("dat", dat_bytes)] {
            std::fs::write(dir.join(format!("{name}.{suffix}")), bytes)?;
        }
        Ok(())
    }

    /// Reverses [`Self::save`]. Returns `Ok(None)` if any artifact is
    /// missing — the caller decides whether that's an error.
    pub fn load(dir: &Path, name: &str) -> CoreResult<Option<Self>> {
        let paths = [
            dir.join(format!("{name}.vec")),
            dir.join(format!("{name}.ivf")),
            dir.join(format!("{name}.dat")),
        ];
        if paths.iter().any(|p| !p.exists()) {
            return Ok(None);
        }
        let bytes: Vec<Vec<u8>> = paths.iter().map(std::fs::read).collect::<std::io::Result<_>>()?;
        Ok(Some(Self::load_from_mem(&bytes[0], &bytes[1], &bytes[2])?))
    }
}

impl<T: Clone + Serialize + DeserializeOwned> Default for FuzzyIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_test_index() -> FuzzyIndex<u32> {
        FuzzyIndex::build(vec![
            FuzzyRecord { text: "portishead".to_string(), payload: 1 },
            FuzzyRecord { text: "massive attack".to_string(), payload: 2 },
            FuzzyRecord { text: "tricky".to_string(), payload: 3 },
        ])
        .unwrap()
    }

    #[test]
    fn trigram_padding() {
        let grams = trigrams("cat");
        assert_eq!(grams, vec![" ca", "cat", "at "]);
    }

    #[test]
    fn empty_build_fails() {
        let result: CoreResult<FuzzyIndex<u32>> = FuzzyIndex::build(vec![]);
        assert!(matches!(result, Err(CoreError::EmptyIndex)));
    }

    #[test]
    fn search_before_build_fails() {
        let idx: FuzzyIndex<u32> = FuzzyIndex::new();
        let result = idx.search("x", 0.0);
        assert!(matches!(result, Err(CoreError::IndexNotBuilt)));
    }

    #[test]
    fn exact_match_scores_near_one() {
        let idx = build_test_index();
        let hits = idx.search("portishead", 0.5).unwrap();
        assert!(!hits.is_empty());
        assert_eq!(hits[0].payload, 1);
        assert!(hits[0].confidence > 0.99);
    }

    #[test]
    fn min_confidence_filters_hits() {
        let idx = build_test_index();
        let hits = idx.search("zzzzzzzzzz", 0.5).unwrap();
        assert!(hits.is_empty());
    }

    #[test]
    fn save_and_load_round_trip() {
        let idx = build_test_index();
        let dir = std::env::temp_dir().join(format!("fuzzy_index_test_{}", std::process::id()));
        idx.save(&dir, "test").unwrap();
        let loaded: FuzzyIndex<u32> = FuzzyIndex::load(&dir, "test").unwrap().unwrap();
        let before = idx.search("portishead", 0.0).unwrap();
        let after = loaded.search("portishead", 0.0).unwrap();
        assert_eq!(before.len(), after.len());
        assert_eq!(before[0].payload, after[0].payload);
        assert!((before[0].confidence - after[0].confidence).abs() < 1e-6);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn load_missing_returns_none() {
        let dir = std::env::temp_dir().join("fuzzy_index_missing_dir_xyz");
        let loaded: CoreResult<Option<FuzzyIndex<u32>>> = FuzzyIndex::load(&dir, "nope");
        assert!(matches!(loaded, Ok(None)));
    }
}
