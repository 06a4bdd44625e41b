use async_trait::async_trait;
use fincon_core::{CategoryPath, CategoryTree, Transaction};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::text::fold;

pub const GEMINI_ENDPOINT: &str =
    "https://generativelanguage.googleapis.com/v1beta/models/gemini-1.5-flash:generateContent";

#[derive(Debug, Error)]
pub enum AiError {
    #[error("AI request failed: {0}")]
    Http(String),
    #[error("AI provider returned status {0}")]
    Status(u16),
    #[error("AI request timed out")]
    Timeout,
    #[error("Unparseable AI verdict: {0}")]
    Parse(String),
    #[error("API key environment variable '{0}' is not set")]
    MissingKey(String),
    #[error("AI provider still rate limiting after {0} attempts")]
    RetriesExhausted(u32),
}

impl From<reqwest::Error> for AiError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            AiError::Timeout
        } else {
            AiError::Http(e.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AiVerdict {
    pub category: CategoryPath,
    /// 0 to 100.
    pub confidence: u8,
}

#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, tx: &Transaction, tree: &CategoryTree) -> Result<AiVerdict, AiError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub api_key_env: String,
    pub timeout_secs: u64,
    pub per_minute: u32,
    pub per_day: u32,
    pub confidence_threshold: u8,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: GEMINI_ENDPOINT.to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            timeout_secs: 30,
            per_minute: 10,
            per_day: 1000,
            confidence_threshold: 75,
            max_retries: 3,
            backoff_base_ms: 2000,
        }
    }
}

impl AiConfig {
    /// Builds the Gemini client, reading the key from `api_key_env`.
    pub fn classifier(&self) -> Result<GeminiClassifier, AiError> {
        let api_key = std::env::var(&self.api_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| AiError::MissingKey(self.api_key_env.clone()))?;
        GeminiClassifier::new(
            &self.endpoint,
            api_key,
            Duration::from_secs(self.timeout_secs),
            self.max_retries,
            Duration::from_millis(self.backoff_base_ms),
        )
    }
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize, Deserialize, Default)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Content,
}

pub struct GeminiClassifier {
    client: Client,
    endpoint: String,
    api_key: String,
    max_retries: u32,
    backoff_base: Duration,
}

impl GeminiClassifier {
    pub fn new(
        endpoint: &str,
        api_key: String,
        timeout: Duration,
        max_retries: u32,
        backoff_base: Duration,
    ) -> Result<Self, AiError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            api_key,
            max_retries,
            backoff_base,
        })
    }

    /// Sends `prompt`, retrying only on 429 with exponential backoff.
    async fn generate(&self, prompt: &str) -> Result<String, AiError> {
        let request = GenerateContentRequest {
            contents: vec![Content { parts: vec![Part { text: prompt.to_string() }] }],
            generation_config: GenerationConfig { temperature: 0.1 },
        };

        let mut attempt = 0u32;
        loop {
            let response = self
                .client
                .post(&self.endpoint)
                .header("x-goog-api-key", self.api_key.as_str())
                .json(&request)
                .send()
                .await?;

            let status = response.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                if attempt >= self.max_retries {
                    return Err(AiError::RetriesExhausted(attempt + 1));
                }
                let delay = self.backoff_base * 2u32.saturating_pow(attempt);
                warn!("AI provider rate limited, retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                attempt += 1;
                continue;
            }
            if !status.is_success() {
                return Err(AiError::Status(status.as_u16()));
            }

            let body: GenerateContentResponse =
                response.json().await.map_err(|e| AiError::Parse(e.to_string()))?;
            return body
                .candidates
                .into_iter()
                .next()
                .and_then(|c| c.content.parts.into_iter().next())
                .map(|p| p.text)
                .ok_or_else(|| AiError::Parse("response has no candidates".to_string()));
        }
    }
}

#[async_trait]
impl Classifier for GeminiClassifier {
    async fn classify(&self, tx: &Transaction, tree: &CategoryTree) -> Result<AiVerdict, AiError> {
        let prompt = build_prompt(tx, tree);
        debug!(id = %tx.id, prompt_len = prompt.len(), "Sending transaction to AI");
        let text = self.generate(&prompt).await?;
        parse_verdict(&text)
    }
}

/// Cache key for AI verdicts: folded description, folded counterparty and
/// the amount rounded to whole units.
pub fn fingerprint(tx: &Transaction) -> String {
    format!(
        "{}|{}|{}",
        fold(&tx.description),
        tx.counterparty.name.as_deref().map(fold).unwrap_or_default(),
        tx.amount.round_dp(0).normalize()
    )
}

pub fn build_prompt(tx: &Transaction, tree: &CategoryTree) -> String {
    let mut prompt = String::from(
        "Categorize this bank transaction into exactly one leaf of the category tree below.\n\n",
    );
    prompt.push_str(&format!("Date: {}\n", tx.date));
    prompt.push_str(&format!("Amount: {} {}\n", tx.amount, tx.currency.as_str()));
    prompt.push_str(&format!("Description: {}\n", tx.description));
    if let Some(name) = &tx.counterparty.name {
        prompt.push_str(&format!("Counterparty: {name}\n"));
    }
    if let Some(kind) = &tx.transaction_type {
        prompt.push_str(&format!("Type: {kind}\n"));
    }
    prompt.push_str(&format!("Institution: {}\n\nCategories:\n", tx.institution));
    prompt.push_str(&tree.summary());
    prompt.push_str(
        "\nAnswer with JSON only: \
         {\"tier1\": \"...\", \"tier2\": \"...\", \"tier3\": \"...\", \"confidence\": 0-100}\n",
    );
    prompt
}

#[derive(Deserialize)]
struct RawVerdict {
    tier1: String,
    tier2: String,
    tier3: String,
    #[serde(default)]
    confidence: serde_json::Value,
}

/// Accepts a JSON object (optionally inside a code fence or prose) or
/// `Tier1:` / `Tier2:` / `Tier3:` / `Confidence:` lines.
pub fn parse_verdict(text: &str) -> Result<AiVerdict, AiError> {
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            if let Ok(raw) = serde_json::from_str::<RawVerdict>(&text[start..=end]) {
                let confidence = match &raw.confidence {
                    serde_json::Value::Number(n) => n.as_f64().map(clamp_confidence),
                    serde_json::Value::String(s) => parse_confidence(s),
                    _ => None,
                };
                return verdict(&raw.tier1, &raw.tier2, &raw.tier3, confidence.unwrap_or(0));
            }
        }
    }

    let (mut tier1, mut tier2, mut tier3, mut confidence) = (None, None, None, 0);
    for line in text.lines() {
        let line = line.trim().trim_start_matches(['*', '-', ' ']);
        let Some((key, value)) = line.split_once(':') else { continue };
        let value = value.trim().trim_matches('*').trim();
        match key.trim().trim_end_matches('*').to_ascii_lowercase().as_str() {
            "tier1" => tier1 = Some(value),
            "tier2" => tier2 = Some(value),
            "tier3" => tier3 = Some(value),
            "confidence" => confidence = parse_confidence(value).unwrap_or(0),
            _ => {}
        }
    }
    match (tier1, tier2, tier3) {
        (Some(t1), Some(t2), Some(t3)) => verdict(t1, t2, t3, confidence),
        _ => Err(AiError::Parse(format!("no category in response: {}", text.trim()))),
    }
}

fn verdict(t1: &str, t2: &str, t3: &str, confidence: u8) -> Result<AiVerdict, AiError> {
    let (t1, t2, t3) = (t1.trim(), t2.trim(), t3.trim());
    if t1.is_empty() || t2.is_empty() || t3.is_empty() {
        return Err(AiError::Parse("empty category tier".to_string()));
    }
    Ok(AiVerdict { category: CategoryPath::new(t1, t2, t3), confidence })
}

fn parse_confidence(raw: &str) -> Option<u8> {
    raw.trim().trim_end_matches('%').trim().parse::<f64>().ok().map(clamp_confidence)
}

fn clamp_confidence(value: f64) -> u8 {
    value.round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::tests::{make_tx, tree};
    use wiremock::matchers::{header, method, path, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gemini_body(text: &str) -> serde_json::Value {
        serde_json::json!({
            "candidates": [{ "content": { "parts": [{ "text": text }] } }]
        })
    }

    fn classifier(server: &MockServer) -> GeminiClassifier {
        GeminiClassifier::new(
            &format!("{}/v1beta/models/test:generateContent", server.uri()),
            "secret".to_string(),
            Duration::from_secs(5),
            3,
            Duration::from_millis(1),
        )
        .unwrap()
    }

    const ANSWER: &str =
        r#"{"tier1": "Living", "tier2": "Groceries", "tier3": "Supermarket", "confidence": 92}"#;

    #[tokio::test]
    async fn retries_after_429_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1beta/models/test:generateContent"))
            .and(header("x-goog-api-key", "secret"))
            .and(query_param_is_missing("key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(gemini_body(ANSWER)))
            .expect(1)
            .mount(&server)
            .await;

        let verdict = classifier(&server).classify(&make_tx("ALBERT 123", "-250"), &tree()).await.unwrap();
        assert_eq!(verdict.category, CategoryPath::new("Living", "Groceries", "Supermarket"));
        assert_eq!(verdict.confidence, 92);
    }

    #[tokio::test]
    async fn server_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let err = classifier(&server).classify(&make_tx("x", "-1"), &tree()).await.unwrap_err();
        assert!(matches!(err, AiError::Status(500)));
    }

    #[tokio::test]
    async fn gives_up_after_max_retries() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .expect(4)
            .mount(&server)
            .await;

        let err = classifier(&server).classify(&make_tx("x", "-1"), &tree()).await.unwrap_err();
        assert!(matches!(err, AiError::RetriesExhausted(4)));
    }

    #[test]
    fn parses_fenced_json() {
        let text = format!("Sure!\n```json\n{ANSWER}\n```");
        assert_eq!(parse_verdict(&text).unwrap().confidence, 92);
    }

    #[test]
    fn parses_tier_lines() {
        let verdict = parse_verdict("Tier1: Living\nTier2: Housing\nTier3: Rent\nConfidence: 80%").unwrap();
        assert_eq!(verdict.category, CategoryPath::new("Living", "Housing", "Rent"));
        assert_eq!(verdict.confidence, 80);
    }

    #[test]
    fn string_confidence_is_clamped() {
        let verdict =
            parse_verdict(r#"{"tier1":"a","tier2":"b","tier3":"c","confidence":"150"}"#).unwrap();
        assert_eq!(verdict.confidence, 100);
    }

    #[test]
    fn rejects_response_without_category() {
        assert!(matches!(parse_verdict("I am not sure."), Err(AiError::Parse(_))));
    }

    #[test]
    fn fingerprint_ignores_case_and_cents() {
        let a = make_tx("ALBERT, Praha", "-250.40");
        let b = make_tx("albert praha", "-249.60");
        assert_eq!(fingerprint(&a), fingerprint(&b));
        assert_ne!(fingerprint(&a), fingerprint(&make_tx("albert praha", "-300")));
    }

    #[test]
    fn prompt_lists_the_tree() {
        let prompt = build_prompt(&make_tx("SPOTIFY", "-199"), &tree());
        assert!(prompt.contains("Description: SPOTIFY"));
        assert!(prompt.contains("  - Media: Music"));
    }

    #[test]
    fn missing_key_is_reported() {
        let config = AiConfig { api_key_env: "FINCON_TEST_UNSET_KEY".to_string(), ..Default::default() };
        assert!(matches!(config.classifier(), Err(AiError::MissingKey(_))));
    }
}
