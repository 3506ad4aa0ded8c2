//! String normalizer (C1, §4.1). Two pure, deterministic operations that
//! turn free-text artist/release/recording fields into a noise-tolerant
//! canonical form for trigram matching.

use any_ascii::any_ascii;
use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

pub const MAX_ENCODED_STRING_LENGTH: usize = 30;

static NON_WORD_NON_SPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w ]+").unwrap());
static SPACE_OR_UNDERSCORE: Lazy<Regex> = Lazy::new(|| Regex::new(r"[ _]+").unwrap());

fn is_combining_mark(c: char) -> bool {
    matches!(c, '\u{0300}'..='\u{036F}' | '\u{1AB0}'..='\u{1AFF}' |
             '\u{1DC0}'..='\u{1DFF}' | '\u{20D0}'..='\u{20FF}' |
             '\u{FE20}'..='\u{FE2F}')
}

fn romanize(s: &str) -> String {
    let stripped: String = s.nfkd().filter(|c| !is_combining_mark(*c)).collect();
    any_ascii(&stripped)
}

fn truncate_scalars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Standard normalization: strip everything except word characters and
/// spaces, collapse spaces/underscores, romanize, lowercase, truncate to 30.
/// Returns empty when the input has no word characters — the caller should
/// treat that as "symbolic artist" and fall back to [`normalize_symbolic`].
pub fn normalize(text: &str) -> String {
    let stripped = NON_WORD_NON_SPACE.replace_all(text, "");
    let collapsed = SPACE_OR_UNDERSCORE.replace_all(&stripped, "");
    let trimmed = collapsed.trim();
    let romanized = romanize(trimmed);
    let lowered = romanized.to_lowercase();
    truncate_scalars(&lowered, MAX_ENCODED_STRING_LENGTH)
}

/// Symbolic-artist normalization: only collapses spaces/underscores, then
/// romanizes and truncates. Preserves punctuation (e.g. `"!!!"`). Lowercasing
/// is not required.
pub fn normalize_symbolic(text: &str) -> String {
    let collapsed = SPACE_OR_UNDERSCORE.replace_all(text, "");
    let trimmed = collapsed.trim();
    let romanized = romanize(trimmed);
    truncate_scalars(&romanized, MAX_ENCODED_STRING_LENGTH)
}

/// Whether `text` contains any scalar outside of ASCII — used by the builder
/// to decide whether to additionally index an artist under its sort-name.
pub fn has_non_latin(text: &str) -> bool {
    text.chars().any(|c| !c.is_ascii())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotent_on_own_output() {
        let cases = ["Portishead", "Beyoncé", "  Multiple   Spaces_here ", "!!!"];
        for c in cases {
            let once = normalize(c);
            let twice = normalize(&once);
            assert_eq!(once, twice, "not idempotent for {c:?}");
        }
    }

    #[test]
    fn bounded_length() {
        let long = "a".repeat(100);
        assert!(normalize(&long).chars().count() <= MAX_ENCODED_STRING_LENGTH);
        assert!(normalize_symbolic(&long).chars().count() <= MAX_ENCODED_STRING_LENGTH);
    }

    #[test]
    fn symbolic_artist_is_empty_under_standard_normalization() {
        assert_eq!(normalize("!!!"), "");
        assert_eq!(normalize_symbolic("!!!"), "!!!");
    }

    #[test]
    fn standard_lowercases_and_strips_punctuation() {
        assert_eq!(normalize("Portishead"), "portishead");
        assert_eq!(normalize("Beyonce feat. Jay-Z"), "beyoncefeatjayz");
    }

    #[test]
    fn romanizes_non_latin() {
        let n = normalize("Beyoncé");
        assert_eq!(n, "beyonce");
    }

    #[test]
    fn collapses_spaces_and_underscores() {
        assert_eq!(normalize("a_b c"), "abc");
    }
}
