//! Collaborators backed by the OpenAI HTTP API.
//!
//! Only available with the `openai` feature. Both types read
//! `OPENAI_API_KEY` in `from_env` and share one request path, so transport
//! and API errors are reported the same way.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::document::VerdictStatus;
use crate::embedding::EmbeddingProvider;
use crate::error::{AuditError, Result};
use crate::reasoner::{JudgeRequest, Judgment, Reasoner, Sufficiency, SummaryRequest};

const EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";
const CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";

const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";
const DEFAULT_EMBEDDING_DIMENSIONS: usize = 1536;
const DEFAULT_CHAT_MODEL: &str = "gpt-4o-mini";

#[derive(Deserialize)]
struct ErrorResponse {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

fn api_key_from_env() -> std::result::Result<String, String> {
    std::env::var("OPENAI_API_KEY")
        .map_err(|_| "OPENAI_API_KEY environment variable not set".to_string())
}

/// POST `body` to `url` and decode the JSON reply. Errors are returned as
/// plain messages for the caller to wrap in its own error variant.
async fn post_json<B: Serialize, R: DeserializeOwned>(
    client: &reqwest::Client,
    api_key: &str,
    url: &str,
    body: &B,
) -> std::result::Result<R, String> {
    let response = client
        .post(url)
        .bearer_auth(api_key)
        .json(body)
        .send()
        .await
        .map_err(|e| format!("request failed: {e}"))?;

    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let detail = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.error.message)
            .unwrap_or(body);
        return Err(format!("API returned {status}: {detail}"));
    }

    response.json().await.map_err(|e| format!("failed to parse response: {e}"))
}

fn embedding_error(message: impl Into<String>) -> AuditError {
    AuditError::EmbeddingError { provider: "OpenAI".into(), message: message.into() }
}

/// An [`EmbeddingProvider`] calling `/v1/embeddings`.
///
/// The reference, checklist and subject stores must all use the same model
/// and dimensions, otherwise persisted generations stop matching queries.
///
/// ```rust,ignore
/// use audit_rag::openai::OpenAIEmbeddingProvider;
///
/// let provider = OpenAIEmbeddingProvider::from_env()?.with_dimensions(512);
/// let ingestor = Ingestor::default().with_embedder(Arc::new(provider));
/// ```
pub struct OpenAIEmbeddingProvider {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dimensions: usize,
    /// Sent to the API for Matryoshka truncation when set.
    request_dimensions: Option<usize>,
}

impl OpenAIEmbeddingProvider {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(embedding_error("API key must not be empty"));
        }
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            model: DEFAULT_EMBEDDING_MODEL.into(),
            dimensions: DEFAULT_EMBEDDING_DIMENSIONS,
            request_dimensions: None,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(api_key_from_env().map_err(embedding_error)?)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_dimensions(mut self, dims: usize) -> Self {
        self.dimensions = dims;
        self.request_dimensions = Some(dims);
        self
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [&'a str],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAIEmbeddingProvider {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_batch(&[text])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| embedding_error("API returned empty response"))
    }

    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        debug!(
            provider = "OpenAI",
            batch_size = texts.len(),
            model = %self.model,
            "embedding batch"
        );

        let request = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions: self.request_dimensions,
        };
        let response: EmbeddingResponse =
            post_json(&self.client, &self.api_key, EMBEDDINGS_URL, &request).await.map_err(|e| {
                error!(provider = "OpenAI", error = %e, "embedding request failed");
                embedding_error(e)
            })?;

        if response.data.len() != texts.len() {
            return Err(embedding_error(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                response.data.len()
            )));
        }
        Ok(response.data.into_iter().map(|d| d.embedding).collect())
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// A [`Reasoner`] calling `/v1/chat/completions`.
///
/// `judge` asks for a JSON object `{"sufficient": bool, "rationale": str}`;
/// `summarize` asks for plain prose.
pub struct OpenAIReasoner {
    client: reqwest::Client,
    api_key: String,
    model: String,
}

impl OpenAIReasoner {
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(AuditError::ReasoningCapabilityError("API key must not be empty".into()));
        }
        Ok(Self { client: reqwest::Client::new(), api_key, model: DEFAULT_CHAT_MODEL.into() })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(api_key_from_env().map_err(AuditError::ReasoningCapabilityError)?)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    async fn complete(&self, system: &str, user: String, json: bool) -> Result<String> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage { role: "system", content: system.to_string() },
                ChatMessage { role: "user", content: user },
            ],
            temperature: 0.0,
            response_format: json.then_some(ResponseFormat { kind: "json_object" }),
        };
        let response: ChatResponse =
            post_json(&self.client, &self.api_key, CHAT_URL, &request).await.map_err(|e| {
                error!(provider = "OpenAI", error = %e, "chat request failed");
                AuditError::ReasoningCapabilityError(e)
            })?;
        response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                AuditError::ReasoningCapabilityError("API returned no completion".into())
            })
    }
}

const JUDGE_PROMPT: &str = "You audit corporate reports against a checklist. Decide whether \
the extracted passage sufficiently discloses the criterion, using the reference rules as the \
standard. Reply with a JSON object \
{\"sufficient\": true|false, \"rationale\": \"one sentence\"}.";

const SUMMARY_PROMPT: &str = "You write audit findings. In at most three sentences state \
whether the criterion is disclosed, cite the evidence passage, and name the rules consulted.";

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: Option<String>,
}

#[derive(Deserialize)]
struct JudgeReply {
    sufficient: bool,
    #[serde(default)]
    rationale: String,
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "(none)".to_string();
    }
    items.iter().map(|i| format!("- {i}")).collect::<Vec<_>>().join("\n")
}

/// Parse the model's JSON verdict into a [`Judgment`].
pub(crate) fn parse_judgment(raw: &str) -> Result<Judgment> {
    let reply: JudgeReply = serde_json::from_str(raw.trim())
        .map_err(|e| AuditError::ReasoningCapabilityError(format!("unparseable verdict: {e}")))?;
    let verdict =
        if reply.sufficient { Sufficiency::Sufficient } else { Sufficiency::Insufficient };
    Ok(Judgment { verdict, rationale: reply.rationale })
}

#[async_trait]
impl Reasoner for OpenAIReasoner {
    async fn judge(&self, request: &JudgeRequest) -> Result<Judgment> {
        let user = format!(
            "Criterion: {}\nDescription: {}\n\nExtracted passage:\n{}\n\nReference rules:\n{}",
            request.criterion,
            request.description,
            request.extracted_text,
            bullet_list(&request.reference_texts)
        );
        debug!(
            provider = "OpenAI",
            criterion = %request.criterion,
            attempt = request.attempt.number(),
            "judging"
        );
        parse_judgment(&self.complete(JUDGE_PROMPT, user, true).await?)
    }

    async fn summarize(&self, request: &SummaryRequest) -> Result<String> {
        let status = match request.status {
            VerdictStatus::Validated => "validated",
            VerdictStatus::Retry | VerdictStatus::Flagged => "flagged",
        };
        let user = format!(
            "Criterion: {} ({})\nDescription: {}\nVerdict: {status} ({})\n\n\
             Passages:\n{}\n\nReferences from {}:\n{}",
            request.criterion,
            request.category,
            request.description,
            request.reason,
            bullet_list(&request.passages),
            if request.rules.is_empty() {
                "no rules".to_string()
            } else {
                request.rules.join(", ")
            },
            bullet_list(&request.reference_texts)
        );
        let text = self.complete(SUMMARY_PROMPT, user, false).await?;
        Ok(text.trim().to_string())
    }
}
