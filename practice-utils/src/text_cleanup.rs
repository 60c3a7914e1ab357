//! Text normalization used for matching subtopics and grading chosen options.
//!
//! Subtopic names carry accents ("Geometría", "Comprensión lectora") that
//! clients and content authors do not enter consistently, so every comparison
//! goes through an accent-folded, lowercased form.

use unicode_normalization::UnicodeNormalization;

/// Lowercase `text` and strip combining marks, so "Álgebra" becomes "algebra".
pub fn fold_accents(text: &str) -> String {
    text.nfd()
        .filter(|c| !unicode_normalization::char::is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase()
}

/// Key a subtopic is stored and searched under.
///
/// - Replaces Unicode quote and hyphen variants with their ASCII equivalents
/// - Folds accents and case
/// - Collapses runs of whitespace
pub fn subtopic_key(subtopic: &str) -> String {
    let normalized_chars = subtopic
        .chars()
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' | '`' | '\u{00B4}' => {
                '\''
            }
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' => '"',
            '\u{2010}' | '\u{2011}' | '\u{2012}' | '\u{2013}' | '\u{2014}' | '\u{2015}'
            | '\u{2212}' => '-',
            _ => c,
        })
        .collect::<String>();

    fold_accents(&normalized_chars)
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalize an option label for grading: trimmed and lowercased.
pub fn normalize_option(label: &str) -> String {
    label.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_accents() {
        assert_eq!(fold_accents("Geometría"), "geometria");
        assert_eq!(fold_accents("ÁLGEBRA"), "algebra");
        assert_eq!(fold_accents("Comprensión lectora"), "comprension lectora");
    }

    #[test]
    fn test_fold_accents_precomposed_and_decomposed_agree() {
        // "é" as one code point vs "e" + combining acute accent
        assert_eq!(fold_accents("caf\u{00E9}"), fold_accents("cafe\u{0301}"));
    }

    #[test]
    fn test_subtopic_key_collapses_whitespace_and_dashes() {
        assert_eq!(
            subtopic_key("  Números \u{2013}  operaciones "),
            "numeros - operaciones"
        );
    }

    #[test]
    fn test_normalize_option() {
        assert_eq!(normalize_option(" b "), "b");
        assert_eq!(normalize_option("C"), "c");
    }
}
