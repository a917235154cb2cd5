//! OCR fallback through Gemini
//!
//! Scanned pages are sent to Gemini as inline data with a prompt asking for
//! a Markdown transcription. Either the page JPEGs or the whole PDF are sent.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use condoportal_common::config::GeminiConfig;
use condoportal_common::errors::{AppError, Result, Upstream};
use condoportal_common::upstream::{check_response, with_retry};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument};

pub const MIME_JPEG: &str = "image/jpeg";
pub const MIME_PDF: &str = "application/pdf";

const OCR_PROMPT: &str = "Transcribe all text in this document into clean Markdown. \
Keep the original language and reading order. Use headings for section titles, \
Markdown lists for bulleted or numbered items and Markdown tables for tables. \
Do not summarize, translate or add commentary. Output only the Markdown.";

/// Turns images or whole documents into Markdown text
#[async_trait]
pub trait OcrEngine: Send + Sync {
    /// Transcribe one page made of one or more JPEG images
    async fn transcribe_images(&self, images: &[Vec<u8>]) -> Result<String>;

    /// Transcribe an entire PDF at once
    async fn transcribe_pdf(&self, pdf: &[u8]) -> Result<String>;
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Part<'a> {
    Text { text: &'a str },
    Inline { inline_data: InlineData<'a> },
}

#[derive(Serialize)]
struct InlineData<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

impl GenerateResponse {
    /// Concatenated text of the first candidate
    fn text(self) -> String {
        self.candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| {
                c.parts
                    .into_iter()
                    .filter_map(|p| p.text)
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }
}

/// Gemini `generateContent` client used for OCR
#[derive(Clone)]
pub struct GeminiOcr {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
    retry_budget: Duration,
}

impl GeminiOcr {
    pub fn new(http: reqwest::Client, config: &GeminiConfig, retry_budget: Duration) -> Self {
        Self {
            http,
            endpoint: format!(
                "{}/models/{}:generateContent",
                config.base_url.trim_end_matches('/'),
                config.model
            ),
            api_key: config.api_key.clone(),
            retry_budget,
        }
    }

    async fn generate_once(&self, request: &GenerateRequest<'_>) -> Result<String> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("x-goog-api-key", &self.api_key)
            .json(request)
            .send()
            .await?;
        let parsed: GenerateResponse = check_response(Upstream::Gemini, response)
            .await?
            .json()
            .await?;
        Ok(parsed.text())
    }

    async fn generate(&self, mime_type: &str, blobs: &[&[u8]]) -> Result<String> {
        let mut parts = vec![Part::Text { text: OCR_PROMPT }];
        parts.extend(blobs.iter().map(|blob| Part::Inline {
            inline_data: InlineData {
                mime_type,
                data: STANDARD.encode(blob),
            },
        }));

        let request = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts,
            }],
            generation_config: GenerationConfig { temperature: 0.0 },
        };

        let text = with_retry(Upstream::Gemini, self.retry_budget, || self.generate_once(&request)).await?;
        debug!(chars = text.len(), "OCR transcription received");
        Ok(strip_code_fence(&text))
    }
}

#[async_trait]
impl OcrEngine for GeminiOcr {
    #[instrument(skip_all, fields(images = images.len()))]
    async fn transcribe_images(&self, images: &[Vec<u8>]) -> Result<String> {
        if images.is_empty() {
            return Err(AppError::Internal {
                message: "OCR called without images".to_string(),
            });
        }
        let blobs: Vec<&[u8]> = images.iter().map(Vec::as_slice).collect();
        self.generate(MIME_JPEG, &blobs).await
    }

    #[instrument(skip_all, fields(bytes = pdf.len()))]
    async fn transcribe_pdf(&self, pdf: &[u8]) -> Result<String> {
        self.generate(MIME_PDF, &[pdf]).await
    }
}

/// Models sometimes wrap the whole answer in a ```markdown fence
pub fn strip_code_fence(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let Some(body) = rest.strip_suffix("```") else {
        return trimmed.to_string();
    };
    // Drop the info string (`markdown`, `md`) on the opening line
    match body.split_once('\n') {
        Some((info, inner)) if !info.trim().contains(' ') => inner.trim().to_string(),
        _ => body.trim().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_shape() {
        let request = GenerateRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![
                    Part::Text { text: "prompt" },
                    Part::Inline {
                        inline_data: InlineData {
                            mime_type: MIME_JPEG,
                            data: STANDARD.encode([0xFF, 0xD8]),
                        },
                    },
                ],
            }],
            generation_config: GenerationConfig { temperature: 0.0 },
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["contents"][0]["parts"][0]["text"], "prompt");
        assert_eq!(json["contents"][0]["parts"][1]["inline_data"]["mime_type"], "image/jpeg");
        assert_eq!(json["contents"][0]["parts"][1]["inline_data"]["data"], "/9g=");
        assert_eq!(json["generationConfig"]["temperature"], 0.0);
    }

    #[test]
    fn test_response_text() {
        let response: GenerateResponse = serde_json::from_str(
            r##"{"candidates": [{"content": {"role": "model", "parts": [
                    {"text": "# Verbale\n\n"}, {"text": "Presenti 12 condomini."}
                ]}, "finishReason": "STOP"}],
                "usageMetadata": {"promptTokenCount": 1290, "candidatesTokenCount": 14}}"##,
        )
        .unwrap();
        assert_eq!(response.text(), "# Verbale\n\nPresenti 12 condomini.");
    }

    #[test]
    fn test_blocked_response_is_empty() {
        let response: GenerateResponse =
            serde_json::from_str(r#"{"promptFeedback": {"blockReason": "OTHER"}}"#).unwrap();
        assert_eq!(response.text(), "");
    }

    #[test]
    fn test_strip_code_fence() {
        assert_eq!(strip_code_fence("```markdown\n# Titolo\ntesto\n```"), "# Titolo\ntesto");
        assert_eq!(strip_code_fence("  # Titolo  "), "# Titolo");
        assert_eq!(strip_code_fence("```\ntesto\n```"), "testo");
    }
}
