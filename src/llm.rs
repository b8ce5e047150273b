use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::{
    error::{Error, Result},
    text_util::{
        PROMPT_TEXT_CHARS,
        clean_expansion,
        parse_summary_response,
        truncate_chars,
    },
};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);
const TEMPERATURE: f64 = 0.3;
const NUM_PREDICT: u32 = 1024;

/// Model-generated description of a file or attachment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub summary: String,
    pub keywords: Vec<String>,
}

impl Summary {
    /// Summary and keywords flattened into one line of query text.
    pub fn as_query_text(&self) -> String {
        let mut parts = Vec::with_capacity(self.keywords.len() + 1);
        if !self.summary.is_empty() {
            parts.push(self.summary.as_str());
        }
        parts.extend(self.keywords.iter().map(String::as_str));
        parts.join(" ")
    }
}

/// Reachability of the model runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelHealth {
    pub llm_running: bool,
    pub model_available: bool,
    pub available_models: Vec<String>,
    pub required_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The local language-model capability used for indexing and search.
///
/// Every call may fail or time out; callers decide how to degrade.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Describe a text document.
    async fn summarize(&self, file_name: &str, text: &str) -> Result<Summary>;

    /// Describe an image.
    async fn caption(&self, file_name: &str, image: &[u8]) -> Result<Summary>;

    /// Rewrite a user query into a richer keyword line.
    async fn expand(&self, query: &str) -> Result<String>;

    /// Probe the runtime. Never fails; problems are reported in the result.
    async fn health(&self) -> ModelHealth;

    /// Model name for logging and status output.
    fn model_name(&self) -> &str;
}

/// [`Summarizer`] backed by an Ollama server's chat API.
pub struct OllamaClient {
    client: Client,
    base_url: String,
    model: String,
    timeout: Duration,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str, timeout: Duration) -> Result<Self> {
        let client = ClientBuilder::new()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("cannot build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            timeout,
        })
    }

    fn classify(&self, e: reqwest::Error) -> Error {
        if e.is_timeout() {
            Error::ModelTimeout(self.timeout.as_secs())
        } else {
            Error::ModelUnavailable(e.to_string())
        }
    }

    async fn chat(&self, prompt: &str, image: Option<&[u8]>) -> Result<String> {
        let body = chat_request_body(&self.model, prompt, image);
        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::ModelUnavailable(format!(
                "model server returned {status}: {detail}"
            )));
        }

        let parsed: ChatResponse =
            response.json().await.map_err(|e| self.classify(e))?;
        Ok(parsed.message.content)
    }
}

impl std::fmt::Debug for OllamaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OllamaClient")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Summarizer for OllamaClient {
    async fn summarize(&self, file_name: &str, text: &str) -> Result<Summary> {
        let response = self.chat(&summarize_prompt(file_name, text), None).await?;
        Ok(parse_summary_response(&response))
    }

    async fn caption(&self, file_name: &str, image: &[u8]) -> Result<Summary> {
        let response =
            self.chat(&caption_prompt(file_name), Some(image)).await?;
        Ok(parse_summary_response(&response))
    }

    async fn expand(&self, query: &str) -> Result<String> {
        let response = self.chat(&expand_prompt(query), None).await?;
        clean_expansion(&response).ok_or_else(|| {
            Error::ModelUnavailable("model returned an empty expansion".into())
        })
    }

    async fn health(&self) -> ModelHealth {
        let result = async {
            let response = self
                .client
                .get(format!("{}/api/tags", self.base_url))
                .timeout(HEALTH_TIMEOUT)
                .send()
                .await?
                .error_for_status()?;
            response.json::<TagsResponse>().await
        }
        .await;

        match result {
            Ok(tags) => {
                let names: Vec<String> =
                    tags.models.into_iter().map(|m| m.name).collect();
                ModelHealth {
                    llm_running: true,
                    model_available: model_present(&names, &self.model),
                    available_models: names,
                    required_model: self.model.clone(),
                    error: None,
                }
            }
            Err(e) => ModelHealth {
                llm_running: false,
                model_available: false,
                available_models: Vec::new(),
                required_model: self.model.clone(),
                error: Some(e.to_string()),
            },
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

/// Whether any installed model matches the required model's family
/// (the part before the tag).
pub fn model_present(installed: &[String], required: &str) -> bool {
    let family = required.split(':').next().unwrap_or(required);
    installed.iter().any(|name| name.contains(family))
}

fn chat_request_body(model: &str, prompt: &str, image: Option<&[u8]>) -> Value {
    let mut message = json!({"role": "user", "content": prompt});
    if let Some(bytes) = image {
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        message["images"] = json!([encoded]);
    }
    json!({
        "model": model,
        "messages": [message],
        "stream": false,
        "options": {
            "temperature": TEMPERATURE,
            "num_predict": NUM_PREDICT,
        },
    })
}

fn summarize_prompt(file_name: &str, text: &str) -> String {
    format!(
        "Describe this file for a search index.\n\
         File name: {file_name}\n\n\
         CONTENT:\n{content}\n\n\
         Reply with a single JSON object and nothing else, in English \
         (translate key concepts if needed). \"summary\" is 1-3 sentences on \
         what the file is about. \"keywords\" lists 15-30 topics, names, \
         places, technical terms and concepts.\n\n\
         {{\"summary\": \"...\", \"keywords\": [\"...\", \"...\"]}}",
        content = truncate_chars(text, PROMPT_TEXT_CHARS),
    )
}

fn caption_prompt(file_name: &str) -> String {
    format!(
        "Describe this image for a search index.\n\
         File name: {file_name}\n\n\
         Transcribe any visible text (signs, screens, boards, formulas). \
         Note people and what they are doing, notable objects and materials, \
         the setting and lighting, and whether it is a photo, screenshot, \
         diagram or drawing.\n\n\
         Reply with a single JSON object and nothing else, in English. \
         \"summary\" is 2-4 sentences. \"keywords\" lists 30-60 terms and \
         must include any transcribed text.\n\n\
         {{\"summary\": \"...\", \"keywords\": [\"...\", \"...\"]}}"
    )
}

fn expand_prompt(query: &str) -> String {
    format!(
        "A user is looking for a file on their computer.\n\
         QUERY: {query}\n\n\
         Produce English search keywords for the files they want: the core \
         intent, synonyms, related terms, broader categories and concrete \
         examples. Translate non-English concepts. For visual concepts add \
         words for colors, objects and scenes.\n\n\
         Reply with ONE line of 15-30 space-separated keywords. No labels, \
         no explanation, no punctuation."
    )
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_shape() {
        let body = chat_request_body("gemma3:4b", "hi", None);
        assert_eq!(body["model"], "gemma3:4b");
        assert_eq!(body["stream"], false);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["options"]["num_predict"], 1024);
        assert!(body["messages"][0].get("images").is_none());
    }

    #[test]
    fn request_body_encodes_images() {
        let body = chat_request_body("m", "describe", Some(b"abc"));
        assert_eq!(body["messages"][0]["images"][0], "YWJj");
    }

    #[test]
    fn model_family_match() {
        let installed = vec!["gemma3:12b".to_string(), "llama3:8b".to_string()];
        assert!(model_present(&installed, "gemma3:4b"));
        assert!(!model_present(&installed, "qwen2:7b"));
        assert!(!model_present(&[], "gemma3:4b"));
    }

    #[test]
    fn summarize_prompt_truncates_content() {
        let text = "x".repeat(PROMPT_TEXT_CHARS + 100);
        let prompt = summarize_prompt("big.txt", &text);
        assert!(prompt.contains("big.txt"));
        assert!(!prompt.contains(&"x".repeat(PROMPT_TEXT_CHARS + 1)));
    }

    #[test]
    fn query_text_joins_summary_and_keywords() {
        let summary = Summary {
            summary: "A cat".into(),
            keywords: vec!["animal".into(), "pet".into()],
        };
        assert_eq!(summary.as_query_text(), "A cat animal pet");
        assert_eq!(Summary::default().as_query_text(), "");
    }

    #[tokio::test]
    async fn unreachable_server_reports_down() {
        let client = OllamaClient::new(
            "http://127.0.0.1:9",
            "gemma3:4b",
            Duration::from_secs(2),
        )
        .unwrap();
        let health = client.health().await;
        assert!(!health.llm_running);
        assert!(!health.model_available);
        assert_eq!(health.required_model, "gemma3:4b");

        let err = client.expand("cats").await.unwrap_err();
        assert!(err.is_model_error());
    }
}
