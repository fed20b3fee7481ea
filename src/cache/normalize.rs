//! Query text canonicalization
//!
//! Folds case, Arabic orthographic variants and Latin accents, drops
//! punctuation and stop words, and collapses whitespace. The canonical string
//! feeds the fingerprint; the token set feeds similarity and clustering.

use std::collections::{BTreeSet, HashSet};

/// Output of [`Normalizer::normalize`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NormalizedQuery {
    /// Filtered tokens joined by single spaces, in original order
    pub canonical: String,

    /// Deduplicated tokens
    pub tokens: BTreeSet<String>,
}

impl NormalizedQuery {
    /// Empty queries never match anything and are never stored
    pub fn is_empty(&self) -> bool {
        self.canonical.is_empty()
    }
}

/// Stateless text canonicalizer configured with a stop-word set
#[derive(Debug, Clone)]
pub struct Normalizer {
    stop_words: HashSet<String>,
}

impl Normalizer {
    /// Stop words are folded the same way queries are, so "أن" and "ان" both match.
    pub fn new<I, S>(stop_words: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let stop_words = stop_words
            .into_iter()
            .map(|w| fold_text(w.as_ref()))
            .filter(|w| !w.is_empty())
            .collect();

        Self { stop_words }
    }

    pub fn normalize(&self, text: &str) -> NormalizedQuery {
        let folded = fold_text(text);

        let mut canonical = String::with_capacity(folded.len());
        let mut tokens = BTreeSet::new();

        for word in folded.split_whitespace() {
            if self.stop_words.contains(word) {
                continue;
            }
            if !canonical.is_empty() {
                canonical.push(' ');
            }
            canonical.push_str(word);
            tokens.insert(word.to_string());
        }

        NormalizedQuery { canonical, tokens }
    }

    /// Keywords used for clustering: tokens longer than two characters
    pub fn keywords(query: &NormalizedQuery) -> BTreeSet<String> {
        query
            .tokens
            .iter()
            .filter(|t| t.chars().count() > 2)
            .cloned()
            .collect()
    }
}

impl Default for Normalizer {
    fn default() -> Self {
        Self::new(crate::cache::config::default_stop_words())
    }
}

/// Per-character fold; whitespace is preserved as a separator, every other
/// non-alphanumeric character is removed.
fn fold_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());

    for c in text.chars().flat_map(char::to_lowercase) {
        if c.is_whitespace() {
            out.push(' ');
            continue;
        }
        if is_ignorable_mark(c) {
            continue;
        }
        let c = fold_char(c);
        if c.is_alphanumeric() {
            out.push(c);
        }
    }

    out
}

fn is_ignorable_mark(c: char) -> bool {
    matches!(c,
        // Arabic harakat, tanwin, shadda, sukun
        '\u{064B}'..='\u{0652}'
        // superscript alef
        | '\u{0670}'
        // tatweel
        | '\u{0640}'
        // combining diacritical marks
        | '\u{0300}'..='\u{036F}')
}

fn fold_char(c: char) -> char {
    match c {
        'أ' | 'إ' | 'آ' | 'ٱ' => 'ا',
        'ى' => 'ي',
        'ة' => 'ه',
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' => 'a',
        'ç' => 'c',
        'è' | 'é' | 'ê' | 'ë' => 'e',
        'ì' | 'í' | 'î' | 'ï' => 'i',
        'ñ' => 'n',
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' => 'o',
        'ù' | 'ú' | 'û' | 'ü' => 'u',
        'ý' | 'ÿ' => 'y',
        other => other,
    }
}
