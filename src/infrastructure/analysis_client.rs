use crate::infrastructure::error::InfraError;
use async_trait::async_trait;
use reqwest::Client;
use url::Url;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-3.5-turbo";
const DEFAULT_MAX_TOKENS: u32 = 150;
const DEFAULT_TEMPERATURE: f64 = 0.3;
const SYSTEM_PROMPT: &str =
    "You are a meeting assistant that extracts clear decisions and key takeaways from meeting transcripts.";

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisSettings {
    pub base_url: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub api_key: Option<String>,
}

impl Default for AnalysisSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: DEFAULT_TEMPERATURE,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalysisRequest {
    pub item_title: String,
    pub transcript: String,
}

impl AnalysisRequest {
    pub fn prompt(&self) -> String {
        format!(
            "Analyze this meeting transcript and provide a concise decision or key takeaway for the agenda item \"{}\".\n\n\
             Transcript: \"{}\"\n\n\
             Please provide a clear, actionable decision or conclusion that was reached during this agenda item. \
             If no clear decision was made, summarize the main points discussed.\n\n\
             Format your response as a brief, professional decision statement.",
            self.item_title, self.transcript
        )
    }
}

/// Turns a finished agenda item's transcript into a decision summary.
#[async_trait]
pub trait AnalysisClient: Send + Sync {
    /// Returns the trimmed decision text, or `None` when the service answered
    /// without content.
    async fn summarize_decision(&self, request: &AnalysisRequest) -> Result<Option<String>, InfraError>;
}

#[derive(Debug, Clone)]
pub struct ReqwestAnalysisClient {
    client: Client,
    settings: AnalysisSettings,
}

impl ReqwestAnalysisClient {
    pub fn new(settings: AnalysisSettings) -> Self {
        Self {
            client: Client::new(),
            settings,
        }
    }

    fn analysis_http_error(status: reqwest::StatusCode, body: &str) -> InfraError {
        let message = if body.trim().is_empty() {
            format!("analysis api error: http {}", status.as_u16())
        } else {
            format!("analysis api error: http {}; body={body}", status.as_u16())
        };
        InfraError::Analysis(message)
    }

    fn completions_endpoint(&self) -> Result<Url, InfraError> {
        let mut url = Url::parse(self.settings.base_url.trim())
            .map_err(|error| InfraError::Analysis(format!("invalid analysis base url: {error}")))?;
        {
            let mut segments = url.path_segments_mut().map_err(|_| {
                InfraError::Analysis("analysis base URL cannot be a base".to_string())
            })?;
            segments.pop_if_empty();
            segments.push("chat");
            segments.push("completions");
        }
        Ok(url)
    }
}

#[derive(Debug, serde::Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    temperature: f64,
}

#[derive(Debug, serde::Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, serde::Deserialize)]
struct ChatCompletionResponse {
    choices: Option<Vec<ChatChoice>>,
}

#[derive(Debug, serde::Deserialize)]
struct ChatChoice {
    message: Option<ChatChoiceMessage>,
}

#[derive(Debug, serde::Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[async_trait]
impl AnalysisClient for ReqwestAnalysisClient {
    async fn summarize_decision(&self, request: &AnalysisRequest) -> Result<Option<String>, InfraError> {
        let Some(api_key) = self.settings.api_key.as_deref() else {
            return Err(InfraError::Analysis("analysis api key is not configured".to_string()));
        };

        let prompt = request.prompt();
        let payload = ChatCompletionRequest {
            model: &self.settings.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: &prompt,
                },
            ],
            max_tokens: self.settings.max_tokens,
            temperature: self.settings.temperature,
        };

        let response = self
            .client
            .post(self.completions_endpoint()?)
            .bearer_auth(api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|error| InfraError::Analysis(format!("network error while requesting analysis: {error}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| InfraError::Analysis(format!("failed reading analysis response: {error}")))?;

        if !status.is_success() {
            return Err(Self::analysis_http_error(status, &body));
        }

        let parsed: ChatCompletionResponse = serde_json::from_str(&body).map_err(|error| {
            InfraError::Analysis(format!("invalid analysis payload: {error}; body={body}"))
        })?;

        Ok(parsed
            .choices
            .unwrap_or_default()
            .into_iter()
            .next()
            .and_then(|choice| choice.message)
            .and_then(|message| message.content)
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty()))
    }
}
