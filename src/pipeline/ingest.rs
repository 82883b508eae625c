// pipeline/ingest.rs
// Phase 0: Load the comment-collection artifact and flatten it into comments

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use whatlang::Lang;

use crate::error::PipelineError;
use crate::model::Comment;
use crate::model::input::CommentSource;

/// Configuration for ingest filtering
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Comments shorter than this many characters (after trimming) are dropped
    pub min_chars: usize,

    /// Drop repeats of the same (brand, question, text)
    pub dedup: bool,

    /// Keep only comments detected as this ISO 639-3 language (e.g. "eng")
    pub language: Option<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            min_chars: 25,
            dedup: true,
            language: None,
        }
    }
}

impl IngestConfig {
    /// The language filter, if one is configured and the code is known
    pub fn target_language(&self) -> Option<Lang> {
        self.language.as_deref().and_then(|code| Lang::from_code(code.trim()))
    }
}

/// Flattened comments plus what was filtered out
#[derive(Debug, Clone, Default)]
pub struct IngestResult {
    pub comments: Vec<Comment>,
    pub raw_comments: usize,
    pub dropped_empty: usize,
    pub dropped_short: usize,
    pub dropped_duplicate: usize,
    pub dropped_language: usize,
}

impl IngestResult {
    pub fn dropped(&self) -> usize {
        self.dropped_empty + self.dropped_short + self.dropped_duplicate + self.dropped_language
    }
}

/// Read and parse a collection artifact from disk
pub fn load_source(path: &Path) -> Result<CommentSource, PipelineError> {
    let bytes = fs::read(path).map_err(|source| PipelineError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Flatten brands → questions → videos → comments, in document order
pub fn flatten_comments(source: &CommentSource, config: &IngestConfig) -> IngestResult {
    let mut result = IngestResult::default();
    let mut seen_keys: HashSet<(String, String, String)> = HashSet::new();
    let mut used_ids: HashSet<String> = HashSet::new();
    let language = config.target_language();

    for brand in &source.competitors_data {
        for result_set in &brand.results {
            for video in &result_set.videos {
                for raw in &video.top_comments {
                    result.raw_comments += 1;

                    let text = raw.text.as_deref().unwrap_or("").trim();
                    if text.is_empty() {
                        result.dropped_empty += 1;
                        continue;
                    }
                    if text.chars().count() < config.min_chars {
                        result.dropped_short += 1;
                        continue;
                    }

                    if config.dedup {
                        let key = (
                            brand.brand.trim().to_lowercase(),
                            result_set.question.trim().to_string(),
                            text.to_string(),
                        );
                        if !seen_keys.insert(key) {
                            result.dropped_duplicate += 1;
                            continue;
                        }
                    }

                    // Undetectable text counts as a mismatch
                    if let Some(lang) = language {
                        if whatlang::detect_lang(text) != Some(lang) {
                            result.dropped_language += 1;
                            continue;
                        }
                    }

                    let base_id = raw
                        .id
                        .as_deref()
                        .map(str::trim)
                        .filter(|id| !id.is_empty())
                        .map(str::to_string)
                        .unwrap_or_else(|| {
                            content_id(&brand.brand, &result_set.question, &video.video.video_id, text)
                        });
                    let id = unique_id(base_id, &mut used_ids);

                    result.comments.push(Comment {
                        id,
                        text: text.to_string(),
                        source_video_id: video.video.video_id.clone(),
                        author: raw.author.clone().filter(|a| !a.trim().is_empty()),
                        timestamp: raw.published_at.clone().filter(|t| !t.trim().is_empty()),
                        brand: brand.brand.trim().to_string(),
                        question: result_set.question.trim().to_string(),
                        video_url: video.video.url.clone().filter(|u| !u.trim().is_empty()),
                        like_count: raw.like_count,
                    });
                }
            }
        }
    }

    tracing::info!(
        raw = result.raw_comments,
        kept = result.comments.len(),
        empty = result.dropped_empty,
        short = result.dropped_short,
        duplicate = result.dropped_duplicate,
        language = result.dropped_language,
        "ingested comments"
    );

    result
}

/// First 16 hex chars of SHA-256 over the comment's origin and text
fn content_id(brand: &str, question: &str, video_id: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    for part in [brand, question, video_id, text] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = format!("{:x}", hasher.finalize());
    digest[..16].to_string()
}

fn unique_id(base: String, used: &mut HashSet<String>) -> String {
    if used.insert(base.clone()) {
        return base;
    }
    let mut n = 2;
    loop {
        let candidate = format!("{}-{}", base, n);
        if used.insert(candidate.clone()) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
      "competitors_data": [
        { "brand": "Acme", "website": "https://acme.test",
          "results": [
            { "question": "best trail shoes",
              "videos": [
                { "video": { "video_id": "v1", "url": "https://youtu.be/v1", "title": "Review" },
                  "top_comments": [
                    { "id": "yt1", "text": "  The grip on wet rocks is unbelievable, love these.  ", "author": "sam", "likeCount": 12 },
                    { "text": "too short" },
                    { "text": "" },
                    { "text": "The grip on wet rocks is unbelievable, love these." },
                    { "text": "Sizing runs small so order half a size up.", "publishedAt": "2024-01-02" }
                  ] } ] } ] },
        { "brand": "ACME ",
          "results": [
            { "question": "best trail shoes",
              "videos": [
                { "video": { "video_id": "v2" },
                  "top_comments": [
                    { "text": "Sizing runs small so order half a size up." }
                  ] } ] } ] }
      ]
    }"#;

    fn source() -> CommentSource {
        serde_json::from_str(SAMPLE).unwrap()
    }

    #[test]
    fn flattens_filters_and_dedups() {
        let result = flatten_comments(&source(), &IngestConfig::default());
        assert_eq!(result.raw_comments, 6);
        assert_eq!(result.dropped_empty, 1);
        assert_eq!(result.dropped_short, 1);
        assert_eq!(result.dropped_duplicate, 2);
        assert_eq!(result.comments.len(), 2);

        let first = &result.comments[0];
        assert_eq!(first.id, "yt1");
        assert_eq!(first.text, "The grip on wet rocks is unbelievable, love these.");
        assert_eq!(first.brand, "Acme");
        assert_eq!(first.like_count, 12);
        assert_eq!(first.video_url.as_deref(), Some("https://youtu.be/v1"));

        let second = &result.comments[1];
        assert_eq!(second.id.len(), 16);
        assert_eq!(second.timestamp.as_deref(), Some("2024-01-02"));
    }

    #[test]
    fn dedup_can_be_disabled() {
        let config = IngestConfig {
            min_chars: 1,
            dedup: false,
            ..Default::default()
        };
        let result = flatten_comments(&source(), &config);
        assert_eq!(result.comments.len(), 5);
        let ids: HashSet<&str> = result.comments.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn language_filter_drops_other_languages() {
        let source: CommentSource = serde_json::from_value(serde_json::json!({
            "competitors_data": [{
                "brand": "Acme",
                "results": [{
                    "question": "best trail shoes",
                    "videos": [{ "video": { "video_id": "v1" }, "top_comments": [
                        { "text": "I have been wearing these shoes every day for three months and they are still comfortable and supportive on long walks." },
                        { "text": "Ich trage diese Schuhe seit drei Monaten jeden Tag und sie sind immer noch sehr bequem und stabil auf langen Wanderungen." },
                        { "text": "Llevo estos zapatos todos los días desde hace tres meses y siguen siendo muy cómodos y estables en las caminatas largas." },
                        { "text": "The laces came undone constantly, so I replaced them with a pair from another brand and now they are perfect for me." }
                    ] }]
                }]
            }]
        }))
        .unwrap();

        let config = IngestConfig {
            language: Some("eng".to_string()),
            ..Default::default()
        };
        let result = flatten_comments(&source, &config);
        assert_eq!(result.dropped_language, 2);
        assert_eq!(result.comments.len(), 2);
        assert!(result.comments.iter().all(|c| c.text.starts_with("I have") || c.text.starts_with("The laces")));
        assert_eq!(result.dropped(), 2);

        let unfiltered = flatten_comments(&source, &IngestConfig::default());
        assert_eq!(unfiltered.comments.len(), 4);
        assert_eq!(unfiltered.dropped_language, 0);
    }

    #[test]
    fn unknown_language_codes_resolve_to_nothing() {
        let config = |code: &str| IngestConfig {
            language: Some(code.to_string()),
            ..Default::default()
        };
        assert_eq!(config("eng").target_language(), Some(Lang::Eng));
        assert_eq!(config("klingon").target_language(), None);
        assert_eq!(IngestConfig::default().target_language(), None);
    }

    #[test]
    fn content_ids_are_stable() {
        let a = content_id("Acme", "q", "v1", "text");
        assert_eq!(a, content_id("Acme", "q", "v1", "text"));
        assert_ne!(a, content_id("Acme", "q", "v2", "text"));
    }

    #[test]
    fn repeated_ids_get_suffixes() {
        let mut used = HashSet::new();
        assert_eq!(unique_id("x".to_string(), &mut used), "x");
        assert_eq!(unique_id("x".to_string(), &mut used), "x-2");
        assert_eq!(unique_id("x".to_string(), &mut used), "x-3");
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = load_source(Path::new("/nonexistent/comments.json")).unwrap_err();
        assert!(matches!(err, PipelineError::Read { .. }));
    }
}
