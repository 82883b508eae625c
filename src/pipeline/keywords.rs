// pipeline/keywords.rs
// Term scoring shared by cluster labelling, heuristic personas and the hashing embedder

use std::collections::{BTreeMap, HashSet};

/// Tokenize text into lowercase content words.
/// Words shorter than three characters, pure numbers and stopwords are dropped.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric() && c != '\'')
        .map(|w| w.trim_matches('\'').to_lowercase())
        .filter(|w| w.chars().count() > 2)
        .filter(|w| !w.chars().all(|c| c.is_ascii_digit()))
        .filter(|w| !is_stopword(w))
        .collect()
}

/// Unigrams followed by bigrams of consecutive content words
pub fn terms(text: &str) -> Vec<String> {
    let tokens = tokenize(text);
    let bigrams: Vec<String> = tokens
        .windows(2)
        .map(|pair| format!("{} {}", pair[0], pair[1]))
        .collect();
    let mut out = tokens;
    out.extend(bigrams);
    out
}

/// Pick the top `k` terms across a group of documents.
///
/// A term must appear in at least two documents when the group has two or
/// more; if nothing survives that filter the threshold drops to one. Terms are
/// scored by total occurrences times document frequency, ties broken
/// alphabetically so the result is stable.
pub fn top_keywords(texts: &[&str], k: usize) -> Vec<String> {
    if texts.is_empty() || k == 0 {
        return Vec::new();
    }

    let mut term_freq: BTreeMap<String, usize> = BTreeMap::new();
    let mut doc_freq: BTreeMap<String, usize> = BTreeMap::new();

    for text in texts {
        let doc_terms = terms(text);
        let mut seen = HashSet::new();
        for term in doc_terms {
            *term_freq.entry(term.clone()).or_insert(0) += 1;
            if seen.insert(term.clone()) {
                *doc_freq.entry(term).or_insert(0) += 1;
            }
        }
    }

    let min_df = if texts.len() >= 2 { 2 } else { 1 };
    let mut ranked = rank(&term_freq, &doc_freq, min_df);
    if ranked.is_empty() && min_df > 1 {
        ranked = rank(&term_freq, &doc_freq, 1);
    }

    ranked.into_iter().take(k).map(|(term, _)| term).collect()
}

/// Number of documents in `texts` that mention `term` (unigram or bigram)
pub fn document_frequency(texts: &[&str], term: &str) -> usize {
    texts
        .iter()
        .filter(|text| terms(text).iter().any(|t| t == term))
        .count()
}

fn rank(
    term_freq: &BTreeMap<String, usize>,
    doc_freq: &BTreeMap<String, usize>,
    min_df: usize,
) -> Vec<(String, usize)> {
    let mut scored: Vec<(String, usize)> = doc_freq
        .iter()
        .filter(|(_, df)| **df >= min_df)
        .map(|(term, df)| {
            let tf = term_freq.get(term).copied().unwrap_or(0);
            (term.clone(), tf * df)
        })
        .collect();

    scored.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    scored
}

/// Check if word is a stopword
pub fn is_stopword(word: &str) -> bool {
    matches!(
        word,
        "the"
            | "and"
            | "for"
            | "that"
            | "this"
            | "with"
            | "from"
            | "have"
            | "has"
            | "had"
            | "are"
            | "was"
            | "were"
            | "been"
            | "being"
            | "but"
            | "not"
            | "you"
            | "your"
            | "yours"
            | "they"
            | "them"
            | "their"
            | "its"
            | "it's"
            | "our"
            | "ours"
            | "his"
            | "her"
            | "she"
            | "him"
            | "who"
            | "whom"
            | "what"
            | "which"
            | "when"
            | "where"
            | "why"
            | "how"
            | "all"
            | "any"
            | "both"
            | "each"
            | "few"
            | "more"
            | "most"
            | "other"
            | "some"
            | "such"
            | "only"
            | "own"
            | "same"
            | "than"
            | "too"
            | "very"
            | "can"
            | "will"
            | "just"
            | "don't"
            | "should"
            | "now"
            | "also"
            | "about"
            | "into"
            | "over"
            | "after"
            | "before"
            | "then"
            | "there"
            | "here"
            | "these"
            | "those"
            | "would"
            | "could"
            | "did"
            | "does"
            | "doing"
            | "out"
            | "off"
            | "again"
            | "once"
            | "because"
            | "while"
            | "until"
            | "get"
            | "got"
            | "one"
            | "really"
            | "i'm"
            | "i've"
            | "you're"
            | "that's"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_drops_stopwords_and_short_words() {
        let tokens = tokenize("The battery is SO bad, and it dies by 12 noon");
        assert_eq!(tokens, vec!["battery", "bad", "dies", "noon"]);
    }

    #[test]
    fn terms_include_bigrams() {
        let t = terms("battery life drains");
        assert!(t.contains(&"battery life".to_string()));
        assert!(t.contains(&"life drains".to_string()));
    }

    #[test]
    fn top_keywords_requires_repeated_terms_in_groups() {
        let texts = [
            "battery life is awful",
            "awful battery life again",
            "shipping took forever",
        ];
        let kws = top_keywords(&texts, 3);
        assert_eq!(kws[0], "awful");
        assert!(kws.contains(&"battery".to_string()));
        assert!(kws.contains(&"battery life".to_string()) || kws.contains(&"life".to_string()));
        assert!(!kws.contains(&"shipping".to_string()));
    }

    #[test]
    fn top_keywords_falls_back_to_single_document_frequency() {
        let texts = ["pricing feels steep", "shipping was slow"];
        let kws = top_keywords(&texts, 10);
        assert!(!kws.is_empty());
    }

    #[test]
    fn top_keywords_is_stable() {
        let texts = ["alpha beta gamma", "gamma beta alpha", "beta alpha gamma"];
        assert_eq!(top_keywords(&texts, 5), top_keywords(&texts, 5));
    }
}
