//! Text folding and character n-gram extraction.
//!
//! Indexed strings and queries go through the same pipeline: Unicode
//! canonical decomposition, removal of combining marks, recomposition,
//! then ASCII lowercasing. N-grams are the 1..=3 byte windows of the folded
//! text, skipping any window that contains a space, so word boundaries never
//! produce cross-word grams.

use std::collections::HashSet;

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Longest n-gram length in bytes.
pub const MAX_NGRAM_LEN: usize = 3;

/// Query tokens elided before n-gram extraction.
const STOP_WORDS: [&str; 3] = ["and", "&", "by"];

/// A 1..=3 byte n-gram of folded text, stored inline.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ngram {
    bytes: [u8; MAX_NGRAM_LEN],
    len: u8,
}

impl Ngram {
    /// Build an n-gram from a window of folded bytes.
    ///
    /// Panics if the window is empty or longer than [`MAX_NGRAM_LEN`];
    /// callers only pass windows produced by [`ngrams`].
    fn new(window: &[u8]) -> Self {
        debug_assert!(!window.is_empty() && window.len() <= MAX_NGRAM_LEN);
        let mut bytes = [0u8; MAX_NGRAM_LEN];
        bytes[..window.len()].copy_from_slice(window);
        Self {
            bytes,
            len: window.len() as u8,
        }
    }

    /// The n-gram bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }
}

impl std::fmt::Debug for Ngram {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Ngram({})", String::from_utf8_lossy(self.as_bytes()))
    }
}

/// Fold text for indexing: NFD, strip combining marks, NFC, ASCII lowercase.
///
/// Folding is idempotent: `fold(fold(s)) == fold(s)`.
pub fn fold(text: &str) -> String {
    let stripped: String = text.nfd().filter(|c| !is_combining_mark(*c)).collect();
    let mut folded: String = stripped.nfc().collect();
    folded.make_ascii_lowercase();
    folded
}

/// The deduplicated set of 1..=3 byte n-grams of the folded text,
/// excluding any window containing a space.
pub fn ngrams(text: &str) -> HashSet<Ngram> {
    let folded = fold(text);
    let bytes = folded.as_bytes();
    let mut set = HashSet::new();
    for n in 1..=MAX_NGRAM_LEN {
        if bytes.len() < n {
            break;
        }
        for window in bytes.windows(n) {
            if window.contains(&b' ') {
                continue;
            }
            set.insert(Ngram::new(window));
        }
    }
    set
}

/// Drop the full-word stop tokens (`and`, `&`, `by`) from a query,
/// rejoining the rest with single spaces.
pub fn strip_stop_words(query: &str) -> String {
    query
        .split_whitespace()
        .filter(|token| !STOP_WORDS.iter().any(|s| token.eq_ignore_ascii_case(s)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// The n-gram set of a trimmed query after stop-word elision.
pub fn query_ngrams(query: &str) -> HashSet<Ngram> {
    let stripped = strip_stop_words(query.trim());
    if stripped.is_empty() {
        return HashSet::new();
    }
    ngrams(&stripped)
}
