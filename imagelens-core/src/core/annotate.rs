//! Annotation of images through an external vision model.
//!
//! The chain degrades in tiers: no credential yields a fixed mock, an
//! unparseable model reply yields a degraded result built from the raw text,
//! and a failed call yields the failure fallback. Whatever the tier, the
//! result always carries a description, tags and colors.

use crate::config::AppConfig;
use crate::core::color::normalize_hex;
use crate::core::vision::{OpenAiVisionClient, VisionClient};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

pub const ANNOTATION_PROMPT: &str = r##"Analyze this image and provide:
1. A one-sentence description
2. 5-10 relevant tags (comma-separated)
3. Top 3 dominant colors as hex codes (comma-separated)

Format your response as JSON:
{
  "description": "one sentence description",
  "tags": ["tag1", "tag2", ...],
  "colors": ["#RRGGBB", "#RRGGBB", "#RRGGBB"]
}"##;

pub const MOCK_DESCRIPTION: &str = "A beautiful landscape with mountains and trees";
pub const MOCK_TAGS: [&str; 8] = [
    "landscape", "mountain", "nature", "outdoor", "scenic", "tree", "sky", "green",
];
pub const MOCK_COLORS: [&str; 3] = ["#4A90E2", "#7ED321", "#F5A623"];

pub const DEGRADED_TAGS: [&str; 2] = ["image", "photo"];
pub const DEGRADED_COLORS: [&str; 3] = ["#808080", "#A0A0A0", "#606060"];
pub const DEGRADED_DESCRIPTION_CHARS: usize = 200;
pub const MISSING_DESCRIPTION: &str = "No description available";

pub const FAILURE_DESCRIPTION: &str = "Image analysis failed - using fallback description";
pub const FAILURE_TAGS: [&str; 3] = ["image", "photo", "picture"];
pub const FAILURE_COLORS: [&str; 1] = ["#808080"];

#[derive(Debug, Error)]
pub enum AnnotateError {
    #[error("Vision model error {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Vision model request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Vision model request timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Unparseable annotation response: {message}")]
    Parse { message: String },
}

/// Normalized annotation payload, identical in shape for every provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnnotationResult {
    pub description: String,
    pub tags: Vec<String>,
    pub colors: Vec<String>,
}

impl AnnotationResult {
    fn from_parts(description: &str, tags: &[&str], colors: &[&str]) -> Self {
        Self {
            description: description.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            colors: colors.iter().map(|c| c.to_string()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnnotationSource {
    Mock,
    Model,
    Fallback,
}

impl AnnotationSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnotationSource::Mock => "mock",
            AnnotationSource::Model => "model",
            AnnotationSource::Fallback => "fallback",
        }
    }
}

/// An annotation tagged with the tier of the chain that produced it.
#[derive(Debug, Clone, PartialEq)]
pub enum AnnotationOutcome {
    Mock(AnnotationResult),
    Model(AnnotationResult),
    Fallback(AnnotationResult),
}

impl AnnotationOutcome {
    pub fn source(&self) -> AnnotationSource {
        match self {
            AnnotationOutcome::Mock(_) => AnnotationSource::Mock,
            AnnotationOutcome::Model(_) => AnnotationSource::Model,
            AnnotationOutcome::Fallback(_) => AnnotationSource::Fallback,
        }
    }

    pub fn result(&self) -> &AnnotationResult {
        match self {
            AnnotationOutcome::Mock(result)
            | AnnotationOutcome::Model(result)
            | AnnotationOutcome::Fallback(result) => result,
        }
    }

    pub fn into_result(self) -> AnnotationResult {
        match self {
            AnnotationOutcome::Mock(result)
            | AnnotationOutcome::Model(result)
            | AnnotationOutcome::Fallback(result) => result,
        }
    }
}

pub fn mock_annotation() -> AnnotationResult {
    AnnotationResult::from_parts(MOCK_DESCRIPTION, &MOCK_TAGS, &MOCK_COLORS)
}

pub fn failure_fallback() -> AnnotationResult {
    AnnotationResult::from_parts(FAILURE_DESCRIPTION, &FAILURE_TAGS, &FAILURE_COLORS)
}

/// Result used when the model answered but not with usable JSON.
pub fn degraded_annotation(raw: &str) -> AnnotationResult {
    let description: String = raw.trim().chars().take(DEGRADED_DESCRIPTION_CHARS).collect();
    let description = if description.trim().is_empty() {
        MISSING_DESCRIPTION
    } else {
        description.as_str()
    };

    AnnotationResult::from_parts(description, &DEGRADED_TAGS, &DEGRADED_COLORS)
}

pub struct Annotator {
    client: Option<Arc<dyn VisionClient>>,
}

impl Annotator {
    /// `None` puts the annotator in development mode: every call returns the mock.
    pub fn new(client: Option<Arc<dyn VisionClient>>) -> Self {
        Self { client }
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, AnnotateError> {
        let client = match config.openai_api_key.as_deref() {
            Some(key) => {
                let client = OpenAiVisionClient::new(
                    key,
                    &config.vision_base_url,
                    &config.vision_model,
                    config.vision_timeout(),
                )?;
                Some(Arc::new(client) as Arc<dyn VisionClient>)
            }
            None => None,
        };

        Ok(Self::new(client))
    }

    pub fn has_client(&self) -> bool {
        self.client.is_some()
    }

    /// Run the chain up to the model call; call failures are returned to the caller.
    pub async fn annotate(&self, image_url: &str) -> Result<AnnotationOutcome, AnnotateError> {
        let Some(client) = &self.client else {
            log::info!("No vision credential configured, using mock annotation");
            return Ok(AnnotationOutcome::Mock(mock_annotation()));
        };

        let reply = client.describe(image_url, ANNOTATION_PROMPT).await?;
        Ok(AnnotationOutcome::Model(interpret_reply(&reply)))
    }

    /// Run the whole chain; a failed model call becomes the failure fallback.
    pub async fn annotate_with_fallback(&self, image_url: &str) -> AnnotationOutcome {
        match self.annotate(image_url).await {
            Ok(outcome) => outcome,
            Err(e) => {
                log::warn!("Annotation of {} failed, using fallback: {}", image_url, e);
                AnnotationOutcome::Fallback(failure_fallback())
            }
        }
    }
}

/// Interpret a model reply, degrading when it holds no usable JSON object.
pub fn interpret_reply(raw: &str) -> AnnotationResult {
    match parse_model_reply(raw) {
        Ok(result) => result,
        Err(e) => {
            log::warn!("{}; using degraded annotation", e);
            degraded_annotation(raw)
        }
    }
}

/// Parse the first JSON object embedded in `raw` into a normalized result.
pub fn parse_model_reply(raw: &str) -> Result<AnnotationResult, AnnotateError> {
    let json = extract_json_object(raw).ok_or_else(|| AnnotateError::Parse {
        message: "no JSON object found in response".to_string(),
    })?;

    let parsed: RawAnnotation = serde_json::from_str(json).map_err(|e| AnnotateError::Parse {
        message: e.to_string(),
    })?;

    Ok(parsed.normalize())
}

/// Return the first balanced top-level `{...}` span in `text`.
///
/// Braces inside JSON strings are ignored. If the first `{` is never closed there
/// is no balanced object and `None` is returned.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match c {
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

#[derive(Debug, Deserialize)]
struct RawAnnotation {
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    tags: Option<StringList>,
    #[serde(default)]
    colors: Option<StringList>,
}

/// Models sometimes answer with a comma-separated string where a list was asked for.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum StringList {
    Many(Vec<String>),
    Joined(String),
}

impl StringList {
    fn into_items(self) -> Vec<String> {
        let items = match self {
            StringList::Many(items) => items,
            StringList::Joined(joined) => joined.split(',').map(str::to_string).collect(),
        };

        let mut seen = Vec::with_capacity(items.len());
        for item in items {
            let item = item.trim().to_string();
            if !item.is_empty() && !seen.contains(&item) {
                seen.push(item);
            }
        }
        seen
    }
}

impl RawAnnotation {
    fn normalize(self) -> AnnotationResult {
        let description = self
            .description
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| MISSING_DESCRIPTION.to_string());

        let mut tags = self.tags.map(StringList::into_items).unwrap_or_default();
        if tags.is_empty() {
            tags = DEGRADED_TAGS.iter().map(|t| t.to_string()).collect();
        }

        let mut colors: Vec<String> = Vec::new();
        for color in self.colors.map(StringList::into_items).unwrap_or_default() {
            if let Some(hex) = normalize_hex(&color) {
                if !colors.contains(&hex) {
                    colors.push(hex);
                }
            }
        }
        if colors.is_empty() {
            colors = DEGRADED_COLORS.iter().map(|c| c.to_string()).collect();
        }

        AnnotationResult {
            description,
            tags,
            colors,
        }
    }
}
