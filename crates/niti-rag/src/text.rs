//! Shared text helpers: tokenization, stop words, sentence splitting.

use std::collections::HashSet;
use std::sync::LazyLock;

/// Filler words stripped before keyword matching and embedding.
pub static STOP_WORDS: LazyLock<HashSet<&'static str>> = LazyLock::new(|| {
    [
        "what", "is", "are", "was", "were", "the", "a", "an", "of", "in", "for", "to", "and",
        "or", "can", "you", "me", "my", "tell", "show", "find", "get", "do", "does", "how",
        "where", "when", "why", "who", "which", "about", "please", "could", "would", "should",
        "there", "their", "from", "with", "that", "this", "have", "has", "had", "be", "been",
        "being", "it", "its", "i", "on", "at", "by", "as", "if", "any", "all", "will", "must",
        "may", "not", "no", "so", "such", "they", "them", "these", "those", "what's", "it's",
        "that's", "i'm", "don't", "can't",
    ]
    .iter()
    .copied()
    .collect()
});

/// Lowercased alphanumeric tokens with surrounding punctuation trimmed.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| {
            w.trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase()
        })
        .filter(|w| !w.is_empty())
        .collect()
}

/// Tokens that carry signal: stop words and single characters removed.
pub fn content_tokens(text: &str) -> Vec<String> {
    tokenize(text)
        .into_iter()
        .filter(|w| w.len() > 1 && !STOP_WORDS.contains(w.as_str()))
        .collect()
}

/// Rough token count using the chars/4 heuristic.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() + 3) / 4
}

/// Lowercase identifier form: alphanumeric runs joined by single hyphens.
pub fn slugify(text: &str) -> String {
    let mut slug = String::with_capacity(text.len());
    let mut pending_sep = false;
    for c in text.chars() {
        if c.is_alphanumeric() {
            if pending_sep && !slug.is_empty() {
                slug.push('-');
            }
            pending_sep = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_sep = true;
        }
    }
    slug
}

/// Truncate on a char boundary without allocating.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Split text into sentences on terminal punctuation or line breaks.
/// A period followed by a digit does not terminate (clause numbering
/// like "3.1" stays intact), and nothing terminates inside square
/// brackets so citation labels are never severed.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut bracket_depth = 0usize;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\n' && bracket_depth == 0 {
            flush(&mut current, &mut sentences);
            continue;
        }
        match c {
            '[' => bracket_depth += 1,
            ']' => bracket_depth = bracket_depth.saturating_sub(1),
            _ => {}
        }
        current.push(c);
        if bracket_depth == 0 && matches!(c, '.' | '!' | '?') {
            match chars.peek() {
                None => flush(&mut current, &mut sentences),
                Some(next) if next.is_whitespace() => flush(&mut current, &mut sentences),
                _ => {}
            }
        }
    }
    flush(&mut current, &mut sentences);
    sentences
}

fn flush(current: &mut String, sentences: &mut Vec<String>) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    current.clear();
}
