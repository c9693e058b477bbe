//! Cloud recognition client.
//!
//! Sends the current frame plus the reference photos of every known
//! visitor to a Gemini `generateContent` endpoint and asks for structured
//! JSON back. Rate limiting is reported as [`RecognitionError::QuotaExceeded`]
//! so callers can back off; every other failure is recoverable.

use crate::imaging::{self, ImageError, ImageSettings, InlineImage};
use crate::types::{RecognitionResult, Visitor};
use async_trait::async_trait;
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub const DEFAULT_ENDPOINT: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

const HTTP_TOO_MANY_REQUESTS: u16 = 429;

const IDENTIFY_INSTRUCTIONS: &str = "\
You are ReMembr, a gentle vision assistant supporting a person in memory care.
Look at the current view image and report every person visible in it.

Rules:
1. Only report a match when the face clearly matches a reference photo. If in doubt, report no match.
2. For people who do not match, use the name \"Unknown Person\". Never guess a name, race or gender.
3. If a face is too dark, blurred, back-lit or covered to judge, set confidenceIsLow to true.
4. Reply with a JSON object holding a \"people\" array.

For each person:
- box_2d: [ymin, xmin, ymax, xmax] on a 0-1000 scale
- matchFound: true only for a confident match
- visitorId: the ID from the reference database when matched
- name: the reference name, or \"Unknown Person\"
- type: 'trusted' or 'blocked' from the reference database, omitted when unknown
- relationship, lastInteraction, notes: from the reference database, or null";

const VALIDATE_INSTRUCTIONS: &str =
    "Does this image contain a clear, visible human face suitable for recognition? Reply with JSON.";

#[derive(Error, Debug)]
pub enum RecognitionError {
    #[error("recognition quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("recognition timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed recognition response: {0}")]
    MalformedResponse(String),
    #[error("recognition transport failure: {0}")]
    Transport(String),
    #[error("image preparation failed: {0}")]
    Image(#[from] ImageError),
}

impl RecognitionError {
    /// Whether the caller should switch to the backoff interval.
    pub fn is_quota(&self) -> bool {
        matches!(self, RecognitionError::QuotaExceeded(_))
    }

    /// Short label for logs and status output.
    pub fn kind(&self) -> &'static str {
        match self {
            RecognitionError::QuotaExceeded(_) => "quota_exceeded",
            RecognitionError::Timeout(_) => "timeout",
            RecognitionError::MalformedResponse(_) => "malformed_response",
            RecognitionError::Transport(_) => "transport_failure",
            RecognitionError::Image(_) => "image",
        }
    }
}

/// Identity recognition backend.
#[async_trait]
pub trait Recognizer: Send + Sync {
    /// Locate people in `frame` and match them against `known`.
    async fn identify(
        &self,
        frame: &DynamicImage,
        known: &[Visitor],
    ) -> Result<RecognitionResult, RecognitionError>;

    /// Check that a reference photo shows a usable face.
    ///
    /// Only quota exhaustion is an error; any other failure reads as `false`.
    async fn validate_has_face(&self, photo: &DynamicImage) -> Result<bool, RecognitionError>;
}

/// Connection settings for [`GeminiRecognizer`].
#[derive(Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub endpoint: String,
    pub image: ImageSettings,
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            endpoint: DEFAULT_ENDPOINT.to_string(),
            image: ImageSettings::default(),
        }
    }
}

impl fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("endpoint", &self.endpoint)
            .field("image", &self.image)
            .finish()
    }
}

/// [`Recognizer`] backed by the Gemini REST API.
pub struct GeminiRecognizer {
    client: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiRecognizer {
    /// No client-level timeout is set; callers race each call against their own budget.
    pub fn new(config: GeminiConfig) -> Result<Self, RecognitionError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("remembr/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RecognitionError::Transport(format!("failed to build HTTP client: {e}")))?;

        tracing::info!(model = %config.model, endpoint = %config.endpoint, "recognition client ready");
        Ok(Self { client, config })
    }

    fn url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        )
    }

    async fn generate(&self, request: &GenerateContentRequest) -> Result<String, RecognitionError> {
        let response = self
            .client
            .post(self.url())
            .header("x-goog-api-key", &self.config.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| RecognitionError::Transport(e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| RecognitionError::Transport(format!("failed to read body: {e}")))?;

        if !status.is_success() {
            return Err(classify_failure(status.as_u16(), &body));
        }
        response_text(&body)
    }
}

#[async_trait]
impl Recognizer for GeminiRecognizer {
    async fn identify(
        &self,
        frame: &DynamicImage,
        known: &[Visitor],
    ) -> Result<RecognitionResult, RecognitionError> {
        let view = imaging::compress(frame, self.config.image)?;
        let request = identify_request(&view, known);

        tracing::debug!(visitors = known.len(), "sending recognition request");
        let text = self.generate(&request).await?;
        let result = parse_recognition(&text)?;
        tracing::debug!(people = result.people.len(), "recognition response parsed");
        Ok(result)
    }

    async fn validate_has_face(&self, photo: &DynamicImage) -> Result<bool, RecognitionError> {
        let inline = imaging::compress(photo, self.config.image)?;
        let request = validate_request(&inline);

        face_verdict(self.generate(&request).await)
    }
}

// --- Wire types ---

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text {
        text: String,
    },
    Inline {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
    response_schema: serde_json::Value,
}

impl Part {
    fn text(text: impl Into<String>) -> Self {
        Part::Text { text: text.into() }
    }

    fn image(image: &InlineImage) -> Self {
        Part::Inline {
            inline_data: InlineData {
                mime_type: image.mime_type.clone(),
                data: image.data.clone(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FaceCheck {
    #[serde(rename = "hasFace")]
    has_face: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

// --- Request construction ---

fn recognition_schema() -> serde_json::Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "people": {
                "type": "ARRAY",
                "items": {
                    "type": "OBJECT",
                    "properties": {
                        "box_2d": { "type": "ARRAY", "items": { "type": "NUMBER" } },
                        "matchFound": { "type": "BOOLEAN" },
                        "visitorId": { "type": "STRING", "nullable": true },
                        "name": { "type": "STRING" },
                        "type": { "type": "STRING", "enum": ["trusted", "blocked"], "nullable": true },
                        "relationship": { "type": "STRING", "nullable": true },
                        "lastInteraction": { "type": "STRING", "nullable": true },
                        "notes": { "type": "STRING", "nullable": true },
                        "confidenceIsLow": { "type": "BOOLEAN", "nullable": true }
                    },
                    "required": ["box_2d", "matchFound", "name"]
                }
            }
        },
        "required": ["people"]
    })
}

fn face_check_schema() -> serde_json::Value {
    json!({
        "type": "OBJECT",
        "properties": { "hasFace": { "type": "BOOLEAN" } },
        "required": ["hasFace"]
    })
}

/// Build the recognition request: instructions, current view, then one
/// metadata line and reference photo per known visitor.
pub fn identify_request(view: &InlineImage, known: &[Visitor]) -> GenerateContentRequest {
    let mut parts = Vec::with_capacity(3 + known.len() * 2);
    parts.push(Part::text(IDENTIFY_INSTRUCTIONS));
    parts.push(Part::text("Current view image:"));
    parts.push(Part::image(view));

    if !known.is_empty() {
        parts.push(Part::text("Reference database:"));
        for visitor in known {
            parts.push(Part::text(format!(
                "ID: {} | Name: {} | Status: {}",
                visitor.id, visitor.name, visitor.kind
            )));
            parts.push(Part::image(&imaging::inline_photo(&visitor.photo_base64)));
        }
    }

    GenerateContentRequest {
        contents: vec![Content { role: "user", parts }],
        generation_config: GenerationConfig {
            response_mime_type: "application/json",
            response_schema: recognition_schema(),
        },
    }
}

pub fn validate_request(photo: &InlineImage) -> GenerateContentRequest {
    GenerateContentRequest {
        contents: vec![Content {
            role: "user",
            parts: vec![Part::text(VALIDATE_INSTRUCTIONS), Part::image(photo)],
        }],
        generation_config: GenerationConfig {
            response_mime_type: "application/json",
            response_schema: face_check_schema(),
        },
    }
}

// --- Response handling ---

/// Map a non-success HTTP reply to an error, singling out rate limiting.
pub fn classify_failure(status: u16, body: &str) -> RecognitionError {
    let (message, service_status) = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(env) => (env.error.message, env.error.status),
        Err(_) => (body.chars().take(200).collect(), String::new()),
    };

    let quota = status == HTTP_TOO_MANY_REQUESTS
        || service_status == "RESOURCE_EXHAUSTED"
        || message.to_ascii_lowercase().contains("quota");

    if quota {
        RecognitionError::QuotaExceeded(format!("HTTP {status}: {message}"))
    } else {
        RecognitionError::Transport(format!("HTTP {status}: {message}"))
    }
}

/// Extract the generated text from a `generateContent` reply body.
pub fn response_text(body: &str) -> Result<String, RecognitionError> {
    let response: GenerateContentResponse = serde_json::from_str(body)
        .map_err(|e| RecognitionError::MalformedResponse(format!("envelope: {e}")))?;

    let text: String = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        return Err(RecognitionError::MalformedResponse("empty response".into()));
    }
    Ok(text)
}

/// Models occasionally wrap JSON in a markdown fence.
fn strip_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(inner) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let inner = inner.strip_prefix("json").unwrap_or(inner);
    inner.strip_suffix("```").unwrap_or(inner).trim()
}

pub fn parse_recognition(text: &str) -> Result<RecognitionResult, RecognitionError> {
    serde_json::from_str(strip_fence(text))
        .map_err(|e| RecognitionError::MalformedResponse(format!("people: {e}")))
}

pub fn parse_face_check(text: &str) -> Result<bool, RecognitionError> {
    serde_json::from_str::<FaceCheck>(strip_fence(text))
        .map(|c| c.has_face)
        .map_err(|e| RecognitionError::MalformedResponse(format!("hasFace: {e}")))
}

/// Turn the model's reply text into a face-check verdict.
///
/// Only quota exhaustion stays an error; any other failure reads as "no face".
pub fn face_verdict(reply: Result<String, RecognitionError>) -> Result<bool, RecognitionError> {
    match reply.and_then(|text| parse_face_check(&text)) {
        Ok(has_face) => Ok(has_face),
        Err(e) if e.is_quota() => Err(e),
        Err(e) => {
            tracing::warn!(error = %e, "face validation failed; treating as no face");
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::fixtures::visitor;
    use crate::types::VisitorType;

    fn view() -> InlineImage {
        InlineImage {
            mime_type: "image/jpeg".into(),
            data: "VIEW".into(),
        }
    }

    #[test]
    fn test_identify_request_layout() {
        let mut blocked = visitor("v2", "Rex", VisitorType::Blocked);
        blocked.photo_base64 = "data:image/png;base64,REF2".into();
        let visitors = vec![visitor("v1", "Ann", VisitorType::Trusted), blocked];

        let body = serde_json::to_value(identify_request(&view(), &visitors)).unwrap();
        let parts = body["contents"][0]["parts"].as_array().unwrap();

        assert_eq!(parts.len(), 8);
        assert_eq!(parts[2]["inlineData"]["data"], "VIEW");
        assert_eq!(parts[4]["text"], "ID: v1 | Name: Ann | Status: trusted");
        assert_eq!(parts[6]["text"], "ID: v2 | Name: Rex | Status: blocked");
        assert_eq!(parts[7]["inlineData"]["mimeType"], "image/png");
        assert_eq!(parts[7]["inlineData"]["data"], "REF2");
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
        assert_eq!(
            body["generationConfig"]["responseSchema"]["properties"]["people"]["items"]["required"],
            json!(["box_2d", "matchFound", "name"])
        );
    }

    #[test]
    fn test_identify_request_without_visitors() {
        let body = serde_json::to_value(identify_request(&view(), &[])).unwrap();
        assert_eq!(body["contents"][0]["parts"].as_array().unwrap().len(), 3);
    }

    #[test]
    fn test_validate_request_schema() {
        let body = serde_json::to_value(validate_request(&view())).unwrap();
        assert_eq!(body["generationConfig"]["responseSchema"]["required"], json!(["hasFace"]));
    }

    #[test]
    fn test_classify_rate_limit() {
        assert!(classify_failure(429, "").is_quota());

        let exhausted = r#"{"error":{"code":400,"message":"busy","status":"RESOURCE_EXHAUSTED"}}"#;
        assert!(classify_failure(400, exhausted).is_quota());

        let quota_msg = r#"{"error":{"code":403,"message":"Quota exceeded for metric","status":"PERMISSION_DENIED"}}"#;
        assert!(classify_failure(403, quota_msg).is_quota());
    }

    #[test]
    fn test_classify_other_failure() {
        let err = classify_failure(500, r#"{"error":{"message":"internal","status":"INTERNAL"}}"#);
        assert!(matches!(err, RecognitionError::Transport(msg) if msg.contains("internal")));
        assert!(!classify_failure(502, "<html>bad gateway</html>").is_quota());
    }

    #[test]
    fn test_response_text_joins_parts() {
        let body = r#"{"candidates":[{"content":{"parts":[{"text":"{\"people\":"},{"text":"[]}"}]}}]}"#;
        assert_eq!(response_text(body).unwrap(), r#"{"people":[]}"#);
    }

    #[test]
    fn test_response_text_empty_is_malformed() {
        assert!(matches!(
            response_text(r#"{"candidates":[]}"#),
            Err(RecognitionError::MalformedResponse(_))
        ));
        assert!(matches!(
            response_text("not json"),
            Err(RecognitionError::MalformedResponse(_))
        ));
    }

    #[test]
    fn test_parse_recognition() {
        let text = r#"{"people":[{"box_2d":[100,100,500,500],"matchFound":true,"visitorId":"v1","name":"Ann","type":"trusted","relationship":"Daughter","lastInteraction":"Sunday"}]}"#;
        let result = parse_recognition(text).unwrap();
        assert_eq!(result.people.len(), 1);
        assert_eq!(result.people[0].visitor_id.as_deref(), Some("v1"));
    }

    #[test]
    fn test_parse_recognition_fenced_and_empty() {
        let fenced = "```json\n{\"people\": []}\n```";
        assert!(parse_recognition(fenced).unwrap().people.is_empty());
        assert!(parse_recognition("{}").unwrap().people.is_empty());
        assert!(parse_recognition("{\"people\": [{\"name\": 3}]}").is_err());
    }

    #[test]
    fn test_parse_face_check() {
        assert!(parse_face_check(r#"{"hasFace": true}"#).unwrap());
        assert!(!parse_face_check(r#"{"hasFace": false}"#).unwrap());
        assert!(parse_face_check(r#"{"face": true}"#).is_err());
    }

    #[test]
    fn test_face_verdict_fallbacks() {
        assert!(face_verdict(Ok(r#"{"hasFace":true}"#.into())).unwrap());
        assert!(!face_verdict(Ok("I see a person".into())).unwrap());
        assert!(!face_verdict(Err(classify_failure(500, "internal error"))).unwrap());
        assert!(!face_verdict(Err(RecognitionError::Transport("connection reset".into()))).unwrap());

        let quota = face_verdict(Err(classify_failure(429, "slow down")));
        assert!(matches!(quota, Err(RecognitionError::QuotaExceeded(_))));
    }

    #[test]
    fn test_config_debug_redacts_key() {
        let config = GeminiConfig::new("secret-key");
        assert!(!format!("{config:?}").contains("secret-key"));
    }
}
