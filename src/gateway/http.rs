//! HTTP inference backend
//!
//! Talks to an OpenAI-compatible completions endpoint (LM Studio, vLLM,
//! llama.cpp server) over a long-lived pooled client. Token entropies come
//! from returned logprobs when the backend supplies them; otherwise a
//! small self-consistency sample approximates the uncertainty signal.

use crate::error::OrchestrationError;
use crate::gateway::{Generation, ModelBackend};
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{debug, error};

/// Extra samples drawn when the backend cannot return logprobs.
const CONSISTENCY_SAMPLES: usize = 2;

pub struct HttpModelBackend {
    client: Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpModelBackend {
    pub fn new(base_url: String, model: String, api_key: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(8)
            .timeout(Duration::from_secs(60))
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
            api_key,
        })
    }

    async fn completion(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
        logprobs: bool,
    ) -> Result<CompletionChoice> {
        let url = format!("{}/v1/completions", self.base_url);

        let request = CompletionRequest {
            model: self.model.clone(),
            prompt: prompt.to_string(),
            max_tokens,
            temperature,
            logprobs: if logprobs { Some(1) } else { None },
        };

        let mut builder = self.client.post(&url).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await.map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(%status, model = %self.model, "Completion request rejected");
            return Err(if status.is_server_error() {
                OrchestrationError::BackendUnavailable(format!("{}: {}", status, body))
            } else {
                OrchestrationError::SchemaViolation(format!("{}: {}", status, body))
            });
        }

        let parsed: CompletionResponse = response.json().await.map_err(|e| {
            OrchestrationError::SchemaViolation(format!("completion parse error: {}", e))
        })?;

        parsed.choices.into_iter().next().ok_or_else(|| {
            OrchestrationError::SchemaViolation("completion returned no choices".into())
        })
    }

    /// Approximate token uncertainty when logprobs are unavailable: draw a
    /// few extra samples and use vocabulary disagreement as a uniform
    /// per-token entropy.
    async fn self_consistency_entropy(
        &self,
        prompt: &str,
        max_tokens: u32,
        reference: &str,
    ) -> Result<f64> {
        let reference_words: HashSet<&str> = reference.split_whitespace().collect();
        if reference_words.is_empty() {
            return Ok(1.0);
        }

        let mut disagreement = 0.0;
        for _ in 0..CONSISTENCY_SAMPLES {
            let sample = self.completion(prompt, max_tokens, 0.9, false).await?;
            let sample_words: HashSet<&str> = sample.text.split_whitespace().collect();
            let overlap = reference_words.intersection(&sample_words).count() as f64;
            let union = reference_words.union(&sample_words).count() as f64;
            disagreement += 1.0 - overlap / union.max(1.0);
        }

        Ok((disagreement / CONSISTENCY_SAMPLES as f64).clamp(0.0, 1.0))
    }
}

#[async_trait]
impl ModelBackend for HttpModelBackend {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn generate(
        &self,
        prompt: &str,
        max_tokens: u32,
        temperature: f32,
    ) -> Result<Generation> {
        let choice = self
            .completion(prompt, max_tokens, temperature, true)
            .await?;

        let token_entropies = match choice
            .logprobs
            .as_ref()
            .and_then(|lp| lp.token_logprobs.as_ref())
        {
            Some(logprobs) if !logprobs.is_empty() => logprobs
                .iter()
                .map(|lp| {
                    // Probability of the chosen token; the remaining mass is
                    // the uncertainty we route on.
                    let p = lp.unwrap_or(f64::NEG_INFINITY).exp();
                    (1.0 - p).clamp(0.0, 1.0)
                })
                .collect(),
            _ => {
                debug!(model = %self.model, "No logprobs available - sampling for consistency");
                let uniform = self
                    .self_consistency_entropy(prompt, max_tokens, &choice.text)
                    .await?;
                vec![uniform; choice.text.split_whitespace().count().max(1)]
            }
        };

        Ok(Generation {
            text: choice.text,
            token_entropies,
        })
    }
}

fn classify_transport_error(e: reqwest::Error) -> OrchestrationError {
    if e.is_timeout() {
        OrchestrationError::BackendTimeout(e.to_string())
    } else if e.is_connect() {
        OrchestrationError::BackendUnavailable(e.to_string())
    } else {
        OrchestrationError::HttpError(e)
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest {
    model: String,
    prompt: String,
    max_tokens: u32,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    logprobs: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    text: String,
    logprobs: Option<LogprobData>,
}

#[derive(Debug, Deserialize)]
struct LogprobData {
    token_logprobs: Option<Vec<Option<f64>>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_serialization() {
        let request = CompletionRequest {
            model: "granite-tiny".to_string(),
            prompt: "Summarize the tape for NVDA".to_string(),
            max_tokens: 256,
            temperature: 0.3,
            logprobs: Some(1),
        };

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains("granite-tiny"));
        assert!(json.contains("logprobs"));
    }

    #[test]
    fn test_response_parse_with_logprobs() {
        let raw = r#"{
            "choices": [{
                "text": "Momentum is intact.",
                "logprobs": {"token_logprobs": [-0.05, -0.9, null]}
            }]
        }"#;
        let parsed: CompletionResponse = serde_json::from_str(raw).unwrap();
        let choice = &parsed.choices[0];
        let logprobs = choice.logprobs.as_ref().unwrap();
        assert_eq!(logprobs.token_logprobs.as_ref().unwrap().len(), 3);
    }
}
