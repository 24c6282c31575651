use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::heuristics::{detect_carrier, parse_day};
use super::{ExtractedInvoice, ExtractionFailure, Extractor, SERVICE_ERROR, pdf};
use crate::config::RemoteConfig;
use crate::credentials::{CredentialCache, TokenLease};

/// Instructs the model to return the four invoice fields as JSON.
const SYSTEM_PROMPT: &str = r#"You are a telecom invoice data extraction assistant.
Given raw text extracted from a PDF carrier invoice, return ONLY valid JSON matching:
{
  "carrier": "string or null (e.g. VIVO, CLARO)",
  "invoice_number": "string or null",
  "due_date": "string dd/mm/yyyy or null",
  "total_value": "string decimal with dot separator, e.g. 1234.56, or null",
  "confidence": integer 0-100 or null
}

Notes:
- The text may be garbled due to PDF column extraction issues.
- Use null for fields you cannot determine.
- Return ONLY the JSON object, no markdown fences, no commentary."#;

/// Very long texts are cut to stay within context limits.
const MAX_PROMPT_CHARS: usize = 12_000;

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

/// What the model is asked to return. Every field is optional.
#[derive(Debug, Default, Deserialize)]
struct ModelInvoice {
    carrier: Option<String>,
    invoice_number: Option<String>,
    due_date: Option<String>,
    total_value: Option<serde_json::Value>,
    confidence: Option<u8>,
}

/// Chat-completions extractor authenticated through the shared credential
/// cache.
pub struct RemoteExtractor {
    client: Client,
    endpoint: RemoteConfig,
    credentials: Arc<CredentialCache>,
}

impl RemoteExtractor {
    pub fn new(endpoint: RemoteConfig, credentials: Arc<CredentialCache>) -> Self {
        info!(url = %endpoint.base_url, model = %endpoint.model, "Using remote extraction backend");
        Self {
            client: Client::new(),
            endpoint,
            credentials,
        }
    }

    async fn send(&self, lease: &TokenLease, text: &str) -> Result<reqwest::Response, ExtractionFailure> {
        let request = ChatRequest {
            model: self.endpoint.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: format!("Extract invoice data from the following PDF text:\n\n{text}"),
                },
            ],
            temperature: 0.0,
        };

        let url = format!("{}/chat/completions", self.endpoint.base_url.trim_end_matches('/'));
        self.client
            .post(&url)
            .bearer_auth(lease.token.secret())
            .json(&request)
            .send()
            .await
            .map_err(|e| ExtractionFailure::new(SERVICE_ERROR, e))
    }

    async fn complete(&self, text: &str) -> Result<String, ExtractionFailure> {
        let service = |e: crate::credentials::CredentialError| ExtractionFailure::new(SERVICE_ERROR, e);

        let lease = self.credentials.token().await.map_err(service)?;
        let mut response = self.send(&lease, text).await?;

        // one coalesced refresh and one retry
        if response.status() == StatusCode::UNAUTHORIZED {
            warn!("Extraction endpoint rejected the token, refreshing");
            let lease = self
                .credentials
                .refresh_after(lease.epoch)
                .await
                .map_err(service)?;
            response = self.send(&lease, text).await?;
        }

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ExtractionFailure::new(
                SERVICE_ERROR,
                format!("LLM API error {status}: {body}"),
            ));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| ExtractionFailure::new(SERVICE_ERROR, e))?;
        chat.choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ExtractionFailure::new(SERVICE_ERROR, "empty response from LLM"))
    }
}

#[async_trait]
impl Extractor for RemoteExtractor {
    async fn extract(&self, bytes: &[u8]) -> Result<ExtractedInvoice, ExtractionFailure> {
        let bytes = bytes.to_vec();
        let text = tokio::task::spawn_blocking(move || pdf::read_text(&bytes))
            .await
            .map_err(|e| ExtractionFailure::new(SERVICE_ERROR, e))?
            .into_text()?;

        let prompt_text: String = text.chars().take(MAX_PROMPT_CHARS).collect();
        let content = self.complete(&prompt_text).await?;
        let mut invoice = parse_model_reply(&content)?;
        if invoice.carrier.is_none() {
            invoice.carrier = detect_carrier(&text);
        }

        let (filled, total) = invoice.coverage();
        info!(
            filled,
            total,
            carrier = ?invoice.carrier,
            total_value = ?invoice.total_value,
            confidence = invoice.confidence_score,
            "LLM extraction result"
        );
        Ok(invoice)
    }
}

/// Map the model's reply onto an extraction record.
fn parse_model_reply(content: &str) -> Result<ExtractedInvoice, ExtractionFailure> {
    // strip markdown fences if the model added them despite instructions
    let trimmed = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();
    let json_str = extract_json_object(trimmed)?;

    let reply: ModelInvoice = serde_json::from_str(json_str).map_err(|e| {
        ExtractionFailure::new(SERVICE_ERROR, format!("unparseable LLM reply: {e}"))
    })?;

    let mut invoice = ExtractedInvoice {
        carrier: reply
            .carrier
            .map(|c| c.trim().to_uppercase())
            .filter(|c| !c.is_empty()),
        invoice_number: reply.invoice_number.filter(|n| !n.trim().is_empty()),
        due_date: reply.due_date.as_deref().and_then(parse_day),
        total_value: reply.total_value.as_ref().and_then(json_amount),
        confidence_score: 0,
    };
    invoice.confidence_score = match reply.confidence {
        Some(score) => score.min(100),
        None => {
            // derived from how much was found
            let (filled, total) = invoice.coverage();
            (filled * 100 / total) as u8
        }
    };
    Ok(invoice)
}

fn json_amount(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::String(s) => s.trim().parse().ok(),
        serde_json::Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

/// Cut the outermost JSON object out of a reply that may carry reasoning
/// text around it.
fn extract_json_object(s: &str) -> Result<&str, ExtractionFailure> {
    let malformed = |why: &str| ExtractionFailure::new(SERVICE_ERROR, why);
    let start = s.find('{').ok_or_else(|| malformed("no '{' found in LLM response"))?;
    let end = s.rfind('}').ok_or_else(|| malformed("no '}' found in LLM response"))?;
    if end <= start {
        return Err(malformed("malformed JSON in LLM response"));
    }
    Ok(&s[start..=end])
}
