// model/input.rs
// Wire shape of the comment-collection artifact; every field defaults when missing

use serde::{Deserialize, Serialize};

/// Root of the collection artifact: one entry per brand or competitor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommentSource {
    #[serde(default)]
    pub competitors_data: Vec<BrandComments>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BrandComments {
    #[serde(default)]
    pub brand: String,
    #[serde(default)]
    pub website: String,
    #[serde(default)]
    pub results: Vec<QuestionResult>,
}

/// Videos found for one business question.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuestionResult {
    #[serde(default)]
    pub question: String,
    #[serde(default)]
    pub videos: Vec<VideoComments>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoComments {
    #[serde(default)]
    pub video: VideoInfo,
    #[serde(default)]
    pub top_comments: Vec<RawComment>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoInfo {
    #[serde(default)]
    pub video_id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawComment {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default, rename = "likeCount")]
    pub like_count: u64,
    #[serde(default, rename = "publishedAt")]
    pub published_at: Option<String>,
}
