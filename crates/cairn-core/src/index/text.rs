//! Text transforms backing the built-in indexers.

use unicode_normalization::{char::is_combining_mark, UnicodeNormalization};

/// Lowercase, trim, and collapse internal whitespace runs to single spaces.
#[must_use]
pub fn normalize(s: &str) -> String {
    s.to_lowercase().split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Compatibility-decompose and drop combining marks.
#[must_use]
pub fn fold_accents(s: &str) -> String {
    s.nfkd().filter(|c| !is_combining_mark(*c)).collect()
}

/// Accent-fold, replace non-alphanumeric runs with spaces, then normalize.
#[must_use]
pub fn keyword(s: &str) -> String {
    let folded = fold_accents(s);
    let spaced: String = folded
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    normalize(&spaced)
}

/// Tokenize into keywords, dropping tokens shorter than `min_len`.
pub fn keywords(s: &str, min_len: usize) -> impl Iterator<Item = String> + '_ {
    keyword(s)
        .split(' ')
        .filter(move |token| !token.is_empty() && token.chars().count() >= min_len)
        .map(str::to_owned)
        .collect::<Vec<_>>()
        .into_iter()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_collapses_whitespace_and_case() {
        assert_eq!(normalize("  Alice@Example.COM "), "alice@example.com");
        assert_eq!(normalize("a\t b\n\nc"), "a b c");
    }

    #[test]
    fn fold_accents_strips_combining_marks() {
        assert_eq!(fold_accents("café"), "cafe");
        assert_eq!(fold_accents("Ångström"), "Angstrom");
    }

    #[test]
    fn keyword_drops_punctuation() {
        assert_eq!(keyword("Hello, Wörld!"), "hello world");
    }

    #[test]
    fn keywords_filter_short_tokens() {
        let tokens: Vec<String> = keywords("The quick fox", 3).collect();
        assert_eq!(tokens, vec!["the", "quick", "fox"]);
        let tokens: Vec<String> = keywords("a an the", 3).collect();
        assert_eq!(tokens, vec!["the"]);
    }
}
