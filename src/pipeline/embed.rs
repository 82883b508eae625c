// pipeline/embed.rs
// Stage 1: comments -> vectors, bounded concurrency, results kept in input order

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::embedder::{EmbeddingConfig, EmbeddingProvider, l2_normalize};
use crate::error::BackendError;
use crate::model::{Comment, EmbeddedComment, EmbeddingFailure};

/// Result of the embedding stage
#[derive(Debug, Clone, Default)]
pub struct EmbeddingOutcome {
    /// Successful embeddings, in the relative order of the input
    pub embedded: Vec<EmbeddedComment>,
    pub failures: Vec<EmbeddingFailure>,
    pub truncated: usize,
    pub dimension: Option<usize>,
}

/// Embed every comment, one backend call per comment.
///
/// Failed comments are excluded from `embedded` and listed in `failures`;
/// this function itself never fails.
pub async fn embed_comments(
    comments: Vec<Comment>,
    provider: Arc<dyn EmbeddingProvider>,
    config: &EmbeddingConfig,
    cancel: &CancellationToken,
) -> EmbeddingOutcome {
    let timeout = Duration::from_secs(config.timeout_secs);
    let retries = config.retries;
    let max_chars = config.max_chars;

    tracing::info!(
        comments = comments.len(),
        model = provider.model_id(),
        concurrency = config.concurrency,
        "embedding comments"
    );

    let calls = comments.into_iter().map(|comment| {
        let provider = Arc::clone(&provider);
        let cancel = cancel.clone();
        async move {
            let (text, truncated) = truncate_chars(&comment.text, max_chars);
            let result = embed_one(provider.as_ref(), text, timeout, retries, &cancel).await;
            (comment, truncated, result)
        }
    });

    let results: Vec<(Comment, bool, Result<Vec<f32>, BackendError>)> = stream::iter(calls)
        .buffered(config.concurrency.max(1))
        .collect()
        .await;

    let expected_dim = config
        .dimension
        .or(provider.dimension())
        .or_else(|| majority_dimension(results.iter().map(|(_, _, r)| r)));

    let mut outcome = EmbeddingOutcome {
        dimension: expected_dim,
        ..Default::default()
    };

    for (comment, truncated, result) in results {
        if truncated {
            outcome.truncated += 1;
        }
        let checked = result.and_then(|vector| check_vector(vector, expected_dim));
        match checked {
            Ok(vector) => outcome.embedded.push(EmbeddedComment { comment, vector }),
            Err(e) => {
                tracing::warn!(comment_id = %comment.id, error = %e, "embedding failed");
                outcome.failures.push(EmbeddingFailure {
                    comment_id: comment.id,
                    reason: e.to_string(),
                });
            }
        }
    }

    tracing::info!(
        embedded = outcome.embedded.len(),
        failed = outcome.failures.len(),
        truncated = outcome.truncated,
        "embedding finished"
    );

    outcome
}

/// One embedding call with a timeout and a bounded number of retries for
/// transient failures.
async fn embed_one(
    provider: &dyn EmbeddingProvider,
    text: &str,
    timeout: Duration,
    retries: usize,
    cancel: &CancellationToken,
) -> Result<Vec<f32>, BackendError> {
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        let result = match tokio::time::timeout(timeout, provider.embed(text)).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(timeout)),
        };

        match result {
            Err(e) if e.is_transient() && attempt < retries => {
                attempt += 1;
                tracing::debug!(attempt, error = %e, "retrying embedding call");
            }
            other => return other,
        }
    }
}

/// Most common length among successful vectors, ties to the one seen first
fn majority_dimension<'a>(results: impl Iterator<Item = &'a Result<Vec<f32>, BackendError>>) -> Option<usize> {
    let mut counts: HashMap<usize, (usize, usize)> = HashMap::new();
    for (position, vector) in results.filter_map(|r| r.as_ref().ok()).enumerate() {
        let entry = counts.entry(vector.len()).or_insert((0, position));
        entry.0 += 1;
    }
    counts
        .into_iter()
        .max_by(|(_, (count_a, first_a)), (_, (count_b, first_b))| {
            count_a.cmp(count_b).then(first_b.cmp(first_a))
        })
        .map(|(dim, _)| dim)
}

/// Validate dimension and values, then normalize to unit length
fn check_vector(mut vector: Vec<f32>, expected_dim: Option<usize>) -> Result<Vec<f32>, BackendError> {
    if let Some(dim) = expected_dim {
        if vector.len() != dim {
            return Err(BackendError::MalformedOutput(format!(
                "vector has dimension {}, expected {}",
                vector.len(),
                dim
            )));
        }
    }
    if vector.is_empty() {
        return Err(BackendError::MalformedOutput("empty vector".to_string()));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(BackendError::MalformedOutput(
            "vector contains non-finite values".to_string(),
        ));
    }
    if l2_normalize(&mut vector) == 0.0 {
        return Err(BackendError::MalformedOutput("zero-norm vector".to_string()));
    }
    Ok(vector)
}

/// Keep the first `max_chars` characters. Returns whether anything was cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> (&str, bool) {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => (&text[..byte_idx], true),
        None => (text, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    fn comment(id: &str, text: &str) -> Comment {
        Comment {
            id: id.to_string(),
            text: text.to_string(),
            source_video_id: "v1".to_string(),
            author: None,
            timestamp: None,
            brand: "Acme".to_string(),
            question: "q".to_string(),
            video_url: None,
            like_count: 0,
        }
    }

    /// Answers with a two-element vector for texts starting with "short"
    struct MixedLengthEmbedder {
        known_dimension: Option<usize>,
    }

    #[async_trait]
    impl EmbeddingProvider for MixedLengthEmbedder {
        fn model_id(&self) -> &str {
            "mixed"
        }

        fn dimension(&self) -> Option<usize> {
            self.known_dimension
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, BackendError> {
            if text.starts_with("short") {
                return Ok(vec![1.0, 0.0]);
            }
            Ok(vec![0.5, 0.5, 0.5, 0.5])
        }
    }

    async fn embed_mixed(known_dimension: Option<usize>) -> EmbeddingOutcome {
        let mut comments = vec![comment("c0", "short answer")];
        for i in 1..6 {
            comments.push(comment(&format!("c{}", i), "a regular comment"));
        }
        let provider: Arc<dyn EmbeddingProvider> = Arc::new(MixedLengthEmbedder { known_dimension });
        embed_comments(comments, provider, &EmbeddingConfig::default(), &CancellationToken::new()).await
    }

    #[tokio::test]
    async fn odd_first_vector_does_not_set_the_dimension() {
        let outcome = embed_mixed(None).await;
        assert_eq!(outcome.dimension, Some(4));
        assert_eq!(outcome.embedded.len(), 5);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].comment_id, "c0");
        assert!(outcome.failures[0].reason.contains("dimension 2"));
    }

    #[tokio::test]
    async fn provider_dimension_wins_over_observed_lengths() {
        let outcome = embed_mixed(Some(2)).await;
        assert_eq!(outcome.dimension, Some(2));
        assert_eq!(outcome.embedded.len(), 1);
        assert_eq!(outcome.embedded[0].id(), "c0");
        assert_eq!(outcome.failures.len(), 5);
    }

    #[test]
    fn majority_dimension_ties_go_to_the_first_seen() {
        let results: Vec<Result<Vec<f32>, BackendError>> = vec![
            Err(BackendError::Cancelled),
            Ok(vec![1.0; 3]),
            Ok(vec![1.0; 2]),
            Ok(vec![1.0; 2]),
            Ok(vec![1.0; 3]),
        ];
        assert_eq!(majority_dimension(results.iter()), Some(3));
        assert_eq!(majority_dimension(results[..1].iter()), None);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo wörld", 5), ("héllo", true));
        assert_eq!(truncate_chars("short", 10), ("short", false));
        assert_eq!(truncate_chars("exact", 5), ("exact", false));
    }

    #[test]
    fn vectors_are_checked_and_normalized() {
        let v = check_vector(vec![0.0, 2.0], Some(2)).unwrap();
        assert_eq!(v, vec![0.0, 1.0]);

        assert!(matches!(
            check_vector(vec![1.0, 2.0, 3.0], Some(2)),
            Err(BackendError::MalformedOutput(_))
        ));
        assert!(matches!(
            check_vector(vec![f32::NAN, 1.0], None),
            Err(BackendError::MalformedOutput(_))
        ));
        assert!(matches!(
            check_vector(vec![0.0, 0.0], None),
            Err(BackendError::MalformedOutput(_))
        ));
    }
}
