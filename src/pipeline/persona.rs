// pipeline/persona.rs
// Stage 3: one persona per cluster, heuristic or LLM-backed

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::generate::{GenerationConfig, OpenAiGenerator, TextGenerator};
use super::keywords;
use crate::embedder::cosine_similarity;
use crate::error::{BackendError, PipelineError};
use crate::model::{
    Cluster, CommentId, EmbeddedComment, Persona, PersonaProfile, SynthesisFallback, SynthesisMethod,
};

const SYSTEM_PROMPT: &str =
    "You are an expert market researcher. Return only valid JSON with exactly the requested keys. No markdown.";

const STRICT_SUFFIX: &str = "Your previous answer could not be used. Respond with one JSON object and nothing else: \
no prose, no markdown fences, no comments, no trailing commas. \
persona_name must be a non-empty string and representative_traits a non-empty array of strings.";

const MAX_LABEL_CHARS: usize = 120;

const GOAL_CUES: &[&str] = &[
    "want", "looking for", "need", "hope", "wish", "trying to", "would love", "planning", "goal",
];

const PAIN_CUES: &[&str] = &[
    "problem", "issue", "broke", "expensive", "overpriced", "disappoint", "waste", "worst", "hate",
    "annoying", "not worth", "doesn't", "didn't", "stopped", "return", "refund", "fake",
];

/// How personas are produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SynthesisStrategy {
    /// Extractive summary of the cluster; deterministic
    Heuristic,
    /// LLM-written persona with heuristic fallback
    Generative,
}

/// Configuration for persona synthesis
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub strategy: SynthesisStrategy,

    /// Maximum clusters synthesized at once
    pub concurrency: usize,

    /// Per-call timeout for the generative backend
    pub timeout_secs: u64,

    pub max_supporting_comments: usize,
    pub max_traits: usize,

    /// Representative comments quoted in the generative prompt
    pub max_quotes: usize,

    #[serde(flatten)]
    pub generation: GenerationConfig,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            strategy: SynthesisStrategy::Heuristic,
            concurrency: 4,
            timeout_secs: 60,
            max_supporting_comments: 5,
            max_traits: 6,
            max_quotes: 3,
            generation: GenerationConfig::default(),
        }
    }
}

/// One synthesized persona, plus the fallback record when the generative
/// path gave up on this cluster
#[derive(Debug, Clone)]
pub struct SynthesisOutcome {
    pub persona: Persona,
    pub fallback: Option<SynthesisFallback>,
}

/// Turns clusters into personas
pub struct PersonaSynthesizer {
    config: SynthesisConfig,
    generator: Option<Arc<dyn TextGenerator>>,
}

impl PersonaSynthesizer {
    /// Heuristic synthesizer, or generative when a generator is given
    pub fn new(config: SynthesisConfig, generator: Option<Arc<dyn TextGenerator>>) -> Self {
        Self { config, generator }
    }

    /// Build from configuration. A generative strategy with no resolvable
    /// provider degrades to heuristic with a warning.
    pub fn from_config(config: &SynthesisConfig) -> Result<Self, PipelineError> {
        let generator: Option<Arc<dyn TextGenerator>> = match config.strategy {
            SynthesisStrategy::Heuristic => None,
            SynthesisStrategy::Generative => match config.generation.resolve()? {
                Some(resolved) => {
                    tracing::info!(provider = ?resolved.provider, model = %resolved.model, "generative synthesis enabled");
                    Some(Arc::new(OpenAiGenerator::new(&resolved, &config.generation)) as Arc<dyn TextGenerator>)
                }
                None => {
                    tracing::warn!("no OPENAI_API_KEY or GROQ_API_KEY found, using heuristic personas");
                    None
                }
            },
        };
        Ok(Self::new(config.clone(), generator))
    }

    /// Strategy label recorded in run metadata
    pub fn strategy_name(&self) -> String {
        match &self.generator {
            Some(generator) => format!("generative:{}", generator.model()),
            None => "heuristic".to_string(),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.config.concurrency.max(1)
    }

    /// Synthesize the persona for one cluster. Returns `None` only when the
    /// run was cancelled before the persona could be produced.
    pub async fn synthesize(
        &self,
        cluster: &Cluster,
        members: &[&EmbeddedComment],
        cancel: &CancellationToken,
    ) -> Option<SynthesisOutcome> {
        if cancel.is_cancelled() {
            return None;
        }

        let supporting = select_supporting(members, &cluster.centroid, self.config.max_supporting_comments);

        let Some(generator) = &self.generator else {
            return Some(SynthesisOutcome {
                persona: heuristic_persona(cluster, members, supporting, self.config.max_traits),
                fallback: None,
            });
        };

        match self.generate(generator.as_ref(), cluster, members, cancel).await {
            Ok(generated) => Some(SynthesisOutcome {
                persona: generated.into_persona(cluster, supporting, self.config.max_traits),
                fallback: None,
            }),
            Err(BackendError::Cancelled) => None,
            Err(e) => {
                tracing::warn!(cluster_id = cluster.cluster_id, error = %e, "generative synthesis failed, using heuristic persona");
                let mut persona = heuristic_persona(cluster, members, supporting, self.config.max_traits);
                persona.method = SynthesisMethod::HeuristicFallback;
                Some(SynthesisOutcome {
                    persona,
                    fallback: Some(SynthesisFallback {
                        cluster_id: cluster.cluster_id,
                        reason: e.to_string(),
                    }),
                })
            }
        }
    }

    /// First attempt, then one retry with a stricter instruction
    async fn generate(
        &self,
        generator: &dyn TextGenerator,
        cluster: &Cluster,
        members: &[&EmbeddedComment],
        cancel: &CancellationToken,
    ) -> Result<GeneratedPersona, BackendError> {
        let context = cluster_context(cluster, members, self.config.max_quotes);

        let first_error = match self.attempt(generator, cluster.cluster_id, &context, false).await {
            Ok(persona) => return Ok(persona),
            Err(e) => e,
        };

        tracing::debug!(cluster_id = cluster.cluster_id, error = %first_error, "retrying persona generation");
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled);
        }
        self.attempt(generator, cluster.cluster_id, &context, true).await
    }

    async fn attempt(
        &self,
        generator: &dyn TextGenerator,
        cluster_id: usize,
        context: &str,
        strict: bool,
    ) -> Result<GeneratedPersona, BackendError> {
        let prompt = build_prompt(cluster_id, context, strict);
        let timeout = Duration::from_secs(self.config.timeout_secs);

        let raw = match tokio::time::timeout(timeout, generator.complete_json(SYSTEM_PROMPT, &prompt)).await {
            Ok(result) => result?,
            Err(_) => return Err(BackendError::Timeout(timeout)),
        };
        parse_generated(&raw)
    }
}

/// Synthesize personas for every cluster, concurrently, in cluster order.
///
/// Labels are made distinct across the run. Clusters not started before
/// cancellation produce nothing.
pub async fn synthesize_personas(
    synthesizer: &PersonaSynthesizer,
    clusters: &[Cluster],
    comments: &[EmbeddedComment],
    cancel: &CancellationToken,
) -> Vec<SynthesisOutcome> {
    let by_id: HashMap<&str, &EmbeddedComment> = comments.iter().map(|c| (c.id(), c)).collect();
    let groups: Vec<(&Cluster, Vec<&EmbeddedComment>)> = clusters
        .iter()
        .map(|cluster| {
            let members = cluster
                .member_comment_ids
                .iter()
                .filter_map(|id| by_id.get(id.as_str()).copied())
                .collect();
            (cluster, members)
        })
        .collect();

    tracing::info!(
        clusters = clusters.len(),
        strategy = %synthesizer.strategy_name(),
        "synthesizing personas"
    );

    let mut outcomes: Vec<SynthesisOutcome> = stream::iter(
        groups
            .iter()
            .map(|(cluster, members)| synthesizer.synthesize(cluster, members, cancel)),
    )
    .buffered(synthesizer.concurrency())
    .filter_map(|outcome| async move { outcome })
    .collect()
    .await;

    let mut personas: Vec<&mut Persona> = outcomes.iter_mut().map(|o| &mut o.persona).collect();
    distinct_labels(&mut personas);

    outcomes
}

/// Append " #2", " #3", ... to repeated labels, in order
pub fn distinct_labels(personas: &mut [&mut Persona]) {
    let mut seen: HashSet<String> = HashSet::new();
    for persona in personas.iter_mut() {
        let base = persona.label.trim().to_string();
        let base = if base.is_empty() { "Persona".to_string() } else { base };
        let mut label = base.clone();
        let mut n = 2;
        while seen.contains(&label) {
            label = format!("{} #{}", base, n);
            n += 1;
        }
        seen.insert(label.clone());
        persona.label = label;
    }
}

/// The `k` members closest to the centroid, ties in input order
pub fn select_supporting(members: &[&EmbeddedComment], centroid: &[f32], k: usize) -> Vec<CommentId> {
    let mut scored: Vec<(usize, f32)> = members
        .iter()
        .enumerate()
        .map(|(i, m)| (i, cosine_similarity(&m.vector, centroid)))
        .collect();
    scored.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

    scored
        .into_iter()
        .take(k.max(1))
        .map(|(i, _)| members[i].comment.id.clone())
        .collect()
}

/// Extractive persona built from cluster keywords, brands and comment text
pub fn heuristic_persona(
    cluster: &Cluster,
    members: &[&EmbeddedComment],
    supporting: Vec<CommentId>,
    max_traits: usize,
) -> Persona {
    let texts: Vec<&str> = members.iter().map(|m| m.comment.text.as_str()).collect();
    let n = members.len();

    let base = if cluster.keywords.is_empty() {
        "General Interest".to_string()
    } else {
        title_case(&cluster.keywords.iter().take(2).cloned().collect::<Vec<_>>().join(", "))
    };

    let mut traits = Vec::new();
    for keyword in cluster.keywords.iter().take(3) {
        let df = keywords::document_frequency(&texts, keyword);
        traits.push(format!("frequently mentions \"{}\" ({} of {} comments)", keyword, df, n));
    }
    if let Some((brand, count)) = cluster.top_brands.first() {
        traits.push(format!("talks mostly about {} ({} of {} comments)", brand, count, n));
    }
    if let Some((question, _)) = cluster.top_questions.first() {
        traits.push(format!("reached through \"{}\"", shorten(question, 120)));
    }
    if let Some(quote) = by_likes(members).first() {
        traits.push(format!("in their words: \"{}\"", shorten(&quote.comment.text, 160)));
    }
    if traits.is_empty() {
        traits.push("general interest in the discussed products".to_string());
    }
    traits.truncate(max_traits.max(1));

    let channels = if members.iter().any(|m| !m.comment.source_video_id.is_empty()) {
        vec!["YouTube".to_string()]
    } else {
        Vec::new()
    };

    Persona {
        persona_id: persona_id(cluster),
        label: format!("{} Buyer", base),
        representative_traits: traits,
        supporting_comment_ids: supporting,
        source_cluster_id: cluster.cluster_id,
        keywords: cluster.keywords.clone(),
        profile: PersonaProfile {
            goals: cue_sentences(&texts, GOAL_CUES, 3),
            pain_points: cue_sentences(&texts, PAIN_CUES, 3),
            demographics: BTreeMap::new(),
            channels,
            content_preferences: cluster
                .keywords
                .iter()
                .take(3)
                .map(|k| format!("topics: {}", k))
                .collect(),
            marketing_strategy: None,
        },
        method: SynthesisMethod::Heuristic,
    }
}

fn persona_id(cluster: &Cluster) -> String {
    format!("persona-{}", cluster.cluster_id)
}

/// Members sorted by like count, most liked first, ties in input order
fn by_likes<'a>(members: &[&'a EmbeddedComment]) -> Vec<&'a EmbeddedComment> {
    let mut sorted = members.to_vec();
    sorted.sort_by(|a, b| b.comment.like_count.cmp(&a.comment.like_count));
    sorted
}

/// Sentences containing one of `cues`, deduplicated, at most `limit`
fn cue_sentences(texts: &[&str], cues: &[&str], limit: usize) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    for text in texts {
        for sentence in text.split(['.', '!', '?', '\n']) {
            let sentence = sentence.trim();
            if sentence.chars().count() < 12 {
                continue;
            }
            let lower = sentence.to_lowercase();
            if cues.iter().any(|cue| lower.contains(cue)) && seen.insert(lower) {
                found.push(shorten(sentence, 160));
                if found.len() == limit {
                    return found;
                }
            }
        }
    }
    found
}

fn title_case(text: &str) -> String {
    text.split(' ')
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn shorten(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &flat[..idx]),
        None => flat,
    }
}

/// Cluster summary handed to the LLM
fn cluster_context(cluster: &Cluster, members: &[&EmbeddedComment], max_quotes: usize) -> String {
    let mut parts = vec![
        format!("Cluster ID: {}", cluster.cluster_id),
        format!("Cluster Size: {} comments", cluster.size),
    ];
    if !cluster.keywords.is_empty() {
        parts.push(format!("Top Keywords: {}", cluster.keywords.join(", ")));
    }
    if !cluster.top_brands.is_empty() {
        let brands: Vec<String> = cluster
            .top_brands
            .iter()
            .map(|(brand, count)| format!("{}:{}", brand, count))
            .collect();
        parts.push(format!("Top Brands: {}", brands.join(", ")));
    }
    if !cluster.top_questions.is_empty() {
        let questions: Vec<String> = cluster
            .top_questions
            .iter()
            .map(|(question, _)| shorten(question, 120))
            .collect();
        parts.push(format!("Top Questions: {}", questions.join(", ")));
    }

    let quotes = by_likes(members);
    if !quotes.is_empty() && max_quotes > 0 {
        parts.push("Representative Comments:".to_string());
        for quote in quotes.iter().take(max_quotes) {
            parts.push(format!(
                "- \"{}\" (brand={}, likes={})",
                shorten(&quote.comment.text, 280),
                quote.comment.brand,
                quote.comment.like_count
            ));
        }
    }

    parts.join("\n")
}

fn build_prompt(cluster_id: usize, context: &str, strict: bool) -> String {
    let mut prompt = format!(
        r#"Create exactly one customer persona for cluster {cluster_id}.

Include ONLY these keys:
- persona_name (string)
- representative_traits (array of short strings describing what sets this group apart)
- goals (array of strings)
- pain_points (array of strings)
- demographics (object with string values)
- channels (array of strings)
- content_preferences (object: formats, topics, tone; each an array of strings)
- marketing_strategy (string)

All keys and values must be double-quoted. Numeric ranges (e.g. "28-35") must be strings.
Ground every trait in the comments below.

{context}"#
    );
    if strict {
        prompt.push_str("\n\n");
        prompt.push_str(STRICT_SUFFIX);
    }
    prompt
}

/// Persona record returned by the LLM
#[derive(Debug, Clone, Deserialize)]
struct GeneratedPersona {
    persona_name: String,
    representative_traits: Vec<String>,
    #[serde(default)]
    goals: Value,
    #[serde(default)]
    pain_points: Value,
    #[serde(default)]
    demographics: Value,
    #[serde(default)]
    channels: Value,
    #[serde(default)]
    content_preferences: Value,
    #[serde(default)]
    marketing_strategy: Value,
}

impl GeneratedPersona {
    fn validate(mut self) -> Result<Self, BackendError> {
        self.persona_name = self.persona_name.trim().to_string();
        if self.persona_name.is_empty() {
            return Err(BackendError::MalformedOutput("empty persona_name".to_string()));
        }
        if self.persona_name.chars().count() > MAX_LABEL_CHARS {
            return Err(BackendError::MalformedOutput(format!(
                "persona_name longer than {} characters",
                MAX_LABEL_CHARS
            )));
        }

        self.representative_traits = self
            .representative_traits
            .into_iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        if self.representative_traits.is_empty() {
            return Err(BackendError::MalformedOutput("no representative_traits".to_string()));
        }
        Ok(self)
    }

    fn into_persona(self, cluster: &Cluster, supporting: Vec<CommentId>, max_traits: usize) -> Persona {
        let mut traits = self.representative_traits;
        traits.truncate(max_traits.max(1));

        let strategy = flatten_strings(&self.marketing_strategy);
        Persona {
            persona_id: persona_id(cluster),
            label: self.persona_name,
            representative_traits: traits,
            supporting_comment_ids: supporting,
            source_cluster_id: cluster.cluster_id,
            keywords: cluster.keywords.clone(),
            profile: PersonaProfile {
                goals: flatten_strings(&self.goals),
                pain_points: flatten_strings(&self.pain_points),
                demographics: string_map(&self.demographics),
                channels: flatten_strings(&self.channels),
                content_preferences: flatten_strings(&self.content_preferences),
                marketing_strategy: (!strategy.is_empty()).then(|| strategy.join("; ")),
            },
            method: SynthesisMethod::Generative,
        }
    }
}

/// Parse an LLM answer, recovering JSON wrapped in prose or fences
fn parse_generated(raw: &str) -> Result<GeneratedPersona, BackendError> {
    let parsed = match serde_json::from_str::<GeneratedPersona>(raw.trim()) {
        Ok(parsed) => parsed,
        Err(direct) => {
            let block = extract_json_block(raw).ok_or_else(|| {
                BackendError::MalformedOutput(format!("no JSON object in response: {}", direct))
            })?;
            serde_json::from_str::<GeneratedPersona>(block)
                .map_err(|e| BackendError::MalformedOutput(format!("invalid persona JSON: {}", e)))?
        }
    };
    parsed.validate()
}

/// First balanced `{...}` object in `text`, skipping braces inside strings
pub fn extract_json_block(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Collapse strings, arrays and objects into a flat list of strings
fn flatten_strings(value: &Value) -> Vec<String> {
    match value {
        Value::Null => Vec::new(),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() { Vec::new() } else { vec![s.to_string()] }
        }
        Value::Array(items) => items.iter().flat_map(flatten_strings).collect(),
        Value::Object(map) => map
            .iter()
            .flat_map(|(key, v)| {
                flatten_strings(v)
                    .into_iter()
                    .map(move |s| format!("{}: {}", key, s))
            })
            .collect(),
        other => vec![other.to_string()],
    }
}

fn string_map(value: &Value) -> BTreeMap<String, String> {
    let Value::Object(map) = value else {
        return BTreeMap::new();
    };
    map.iter()
        .filter_map(|(key, v)| {
            let joined = match v {
                Value::String(s) => s.trim().to_string(),
                Value::Array(_) | Value::Object(_) => flatten_strings(v).join(", "),
                Value::Null => String::new(),
                other => other.to_string(),
            };
            (!joined.is_empty()).then(|| (key.clone(), joined))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Comment;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays canned answers in order
    struct ScriptedGenerator {
        replies: Mutex<VecDeque<Result<String, BackendError>>>,
        calls: AtomicUsize,
    }

    impl ScriptedGenerator {
        fn new(replies: Vec<Result<String, BackendError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TextGenerator for ScriptedGenerator {
        fn model(&self) -> &str {
            "scripted"
        }

        async fn complete_json(&self, _system: &str, _prompt: &str) -> Result<String, BackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(BackendError::MalformedOutput("script exhausted".to_string())))
        }
    }

    fn embedded(id: &str, text: &str, likes: u64, vector: Vec<f32>) -> EmbeddedComment {
        EmbeddedComment {
            comment: Comment {
                id: id.to_string(),
                text: text.to_string(),
                source_video_id: "vid1".to_string(),
                author: None,
                timestamp: None,
                brand: "Acme".to_string(),
                question: "best running shoes".to_string(),
                video_url: None,
                like_count: likes,
            },
            vector,
        }
    }

    fn fixture() -> (Cluster, Vec<EmbeddedComment>) {
        let comments = vec![
            embedded("a", "The battery life is a real problem after two months.", 3, vec![1.0, 0.0]),
            embedded("b", "I want better battery life for long hikes.", 10, vec![0.9, 0.1]),
            embedded("c", "Battery life drains overnight, so annoying.", 1, vec![0.8, 0.2]),
        ];
        let cluster = Cluster {
            cluster_id: 0,
            member_comment_ids: comments.iter().map(|c| c.comment.id.clone()).collect(),
            centroid: vec![0.9, 0.1],
            size: 3,
            keywords: vec!["battery life".to_string(), "battery".to_string(), "life".to_string()],
            top_brands: vec![("Acme".to_string(), 3)],
            top_questions: vec![("best running shoes".to_string(), 3)],
        };
        (cluster, comments)
    }

    const VALID: &str = r#"{"persona_name": "Trail Tech Hiker", "representative_traits": ["needs multi-day battery"],
        "goals": {"primary": "reliable gear"}, "pain_points": ["short battery life"],
        "demographics": {"age_range": "28-35"}, "channels": ["YouTube"], "content_preferences": {"formats": ["teardown videos"]},
        "marketing_strategy": "lead with endurance"}"#;

    fn generative(generator: Arc<ScriptedGenerator>) -> PersonaSynthesizer {
        let config = SynthesisConfig {
            strategy: SynthesisStrategy::Generative,
            ..Default::default()
        };
        PersonaSynthesizer::new(config, Some(generator as Arc<dyn TextGenerator>))
    }

    #[test]
    fn json_block_skips_braces_in_strings() {
        let text = r#"Sure! Here it is: {"persona_name": "Curly {brace} fan", "x": {"y": "\"}"}} trailing"#;
        assert_eq!(
            extract_json_block(text),
            Some(r#"{"persona_name": "Curly {brace} fan", "x": {"y": "\"}"}}"#)
        );
        assert_eq!(extract_json_block("no json here"), None);
        assert_eq!(extract_json_block("{ unbalanced"), None);
    }

    #[test]
    fn generated_persona_is_strictly_validated() {
        assert!(parse_generated(VALID).is_ok());
        assert!(parse_generated(&format!("```json\n{}\n```", VALID)).is_ok());

        let empty_name = r#"{"persona_name": "  ", "representative_traits": ["x"]}"#;
        assert!(matches!(parse_generated(empty_name), Err(BackendError::MalformedOutput(_))));

        let blank_traits = r#"{"persona_name": "A", "representative_traits": ["", "  "]}"#;
        assert!(matches!(parse_generated(blank_traits), Err(BackendError::MalformedOutput(_))));

        let missing_traits = r#"{"persona_name": "A"}"#;
        assert!(parse_generated(missing_traits).is_err());
    }

    #[test]
    fn lenient_profile_shapes_are_flattened() {
        let (cluster, _) = fixture();
        let persona = parse_generated(VALID)
            .unwrap()
            .into_persona(&cluster, vec!["a".to_string()], 6);
        assert_eq!(persona.profile.goals, vec!["primary: reliable gear".to_string()]);
        assert_eq!(persona.profile.demographics.get("age_range").map(String::as_str), Some("28-35"));
        assert_eq!(persona.profile.content_preferences, vec!["formats: teardown videos".to_string()]);
        assert_eq!(persona.profile.marketing_strategy.as_deref(), Some("lead with endurance"));
        assert_eq!(persona.method, SynthesisMethod::Generative);
    }

    #[test]
    fn supporting_comments_are_closest_to_centroid() {
        let (cluster, comments) = fixture();
        let members: Vec<&EmbeddedComment> = comments.iter().collect();
        let supporting = select_supporting(&members, &cluster.centroid, 2);
        assert_eq!(supporting, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn supporting_ties_keep_input_order() {
        let comments = vec![
            embedded("x", "same", 0, vec![1.0, 0.0]),
            embedded("y", "same", 0, vec![1.0, 0.0]),
            embedded("z", "same", 0, vec![1.0, 0.0]),
        ];
        let members: Vec<&EmbeddedComment> = comments.iter().collect();
        assert_eq!(
            select_supporting(&members, &[1.0, 0.0], 2),
            vec!["x".to_string(), "y".to_string()]
        );
    }

    #[test]
    fn heuristic_persona_describes_cluster() {
        let (cluster, comments) = fixture();
        let members: Vec<&EmbeddedComment> = comments.iter().collect();
        let persona = heuristic_persona(&cluster, &members, vec!["b".to_string()], 6);

        assert_eq!(persona.label, "Battery Life, Battery Buyer");
        assert_eq!(persona.method, SynthesisMethod::Heuristic);
        assert!(persona.representative_traits[0].contains("(3 of 3 comments)"));
        assert!(persona.representative_traits.iter().any(|t| t.contains("Acme")));
        assert_eq!(persona.profile.goals.len(), 1);
        assert_eq!(persona.profile.pain_points.len(), 2);
        assert_eq!(persona.profile.content_preferences[0], "topics: battery life");
        assert!(persona.supporting_comment_ids.iter().all(|id| cluster.contains(id)));
    }

    #[test]
    fn heuristic_persona_without_keywords() {
        let (mut cluster, comments) = fixture();
        cluster.keywords.clear();
        let members: Vec<&EmbeddedComment> = comments.iter().collect();
        let persona = heuristic_persona(&cluster, &members, vec!["a".to_string()], 1);
        assert_eq!(persona.label, "General Interest Buyer");
        assert_eq!(persona.representative_traits.len(), 1);
    }

    #[test]
    fn labels_are_made_distinct() {
        let (cluster, comments) = fixture();
        let members: Vec<&EmbeddedComment> = comments.iter().collect();
        let mut a = heuristic_persona(&cluster, &members, vec!["a".to_string()], 3);
        let mut b = a.clone();
        let mut c = a.clone();
        a.label = "Saver".to_string();
        b.label = "Saver".to_string();
        c.label = "Saver".to_string();
        distinct_labels(&mut [&mut a, &mut b, &mut c]);
        assert_eq!(
            [a.label, b.label, c.label],
            ["Saver".to_string(), "Saver #2".to_string(), "Saver #3".to_string()]
        );
    }

    #[tokio::test]
    async fn generative_success_uses_one_call() {
        let (cluster, comments) = fixture();
        let members: Vec<&EmbeddedComment> = comments.iter().collect();
        let generator = ScriptedGenerator::new(vec![Ok(VALID.to_string())]);
        let synthesizer = generative(Arc::clone(&generator));

        let outcome = synthesizer
            .synthesize(&cluster, &members, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.persona.label, "Trail Tech Hiker");
        assert!(outcome.fallback.is_none());
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_first_answer_is_retried() {
        let (cluster, comments) = fixture();
        let members: Vec<&EmbeddedComment> = comments.iter().collect();
        let generator = ScriptedGenerator::new(vec![Ok("not json".to_string()), Ok(VALID.to_string())]);
        let synthesizer = generative(Arc::clone(&generator));

        let outcome = synthesizer
            .synthesize(&cluster, &members, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.persona.method, SynthesisMethod::Generative);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn malformed_twice_falls_back_to_heuristic() {
        let (cluster, comments) = fixture();
        let members: Vec<&EmbeddedComment> = comments.iter().collect();
        let generator = ScriptedGenerator::new(vec![
            Ok("{\"persona_name\": \"\"}".to_string()),
            Err(BackendError::Transient("502".to_string())),
        ]);
        let synthesizer = generative(Arc::clone(&generator));

        let outcome = synthesizer
            .synthesize(&cluster, &members, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.persona.method, SynthesisMethod::HeuristicFallback);
        assert!(!outcome.persona.representative_traits.is_empty());
        let fallback = outcome.fallback.unwrap();
        assert_eq!(fallback.cluster_id, 0);
        assert!(fallback.reason.contains("502"));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cancelled_run_synthesizes_nothing() {
        let (cluster, comments) = fixture();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let synthesizer = PersonaSynthesizer::new(SynthesisConfig::default(), None);

        let outcomes = synthesize_personas(&synthesizer, &[cluster], &comments, &cancel).await;
        assert!(outcomes.is_empty());
    }

    #[tokio::test]
    async fn personas_follow_cluster_order() {
        let (first, comments) = fixture();
        let mut second = first.clone();
        second.cluster_id = 1;
        let synthesizer = PersonaSynthesizer::new(SynthesisConfig::default(), None);

        let outcomes =
            synthesize_personas(&synthesizer, &[first, second], &comments, &CancellationToken::new()).await;
        let ids: Vec<usize> = outcomes.iter().map(|o| o.persona.source_cluster_id).collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(outcomes[1].persona.label, "Battery Life, Battery Buyer #2");
    }
}
