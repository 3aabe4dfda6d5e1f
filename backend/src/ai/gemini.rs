use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Value, json};
use tokio::time::{Duration, sleep};
use tracing::warn;

use super::{AnswerGenerator, Embedder};

const DEFAULT_BASE: &str = "https://generativelanguage.googleapis.com";

/// batchEmbedContents caps the number of requests per call.
const EMBED_BATCH_LIMIT: usize = 100;

pub struct GeminiClient {
    http: Client,
    api_key: String,
    base: String,
    generation_model: String,
    embedding_model: String,
}

impl GeminiClient {
    pub fn new(
        api_key: String,
        generation_model: String,
        embedding_model: String,
        base: Option<String>,
    ) -> Self {
        let http = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .timeout(Duration::from_secs(120))
            .build()
            .expect("client");
        Self {
            http,
            api_key,
            base: base.unwrap_or_else(|| DEFAULT_BASE.into()),
            generation_model,
            embedding_model,
        }
    }

    async fn post_json(
        &self,
        model: &str,
        method: &str,
        body: &Value,
    ) -> reqwest::Result<reqwest::Response> {
        self.http
            .post(format!("{}/v1beta/models/{}:{}", self.base, model, method))
            .header("x-goog-api-key", &self.api_key)
            .json(body)
            .send()
            .await
    }

    /// Single generateContent call. Deliberately not retried: a question is
    /// answered at most once per request.
    async fn generate_text(&self, prompt: &str) -> Result<String> {
        let body = json!({
            "contents": [ { "parts": [ { "text": prompt } ] } ]
        });

        let resp = self
            .post_json(&self.generation_model, "generateContent", &body)
            .await
            .context("Gemini generateContent request failed")?;

        if !resp.status().is_success() {
            let status = resp.status();
            let err_txt = resp.text().await.unwrap_or_default();
            bail!("Gemini error {status}: {err_txt}");
        }

        let value: Value = resp
            .json()
            .await
            .context("invalid JSON from Gemini generateContent")?;
        parse_generation(&value)
    }

    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH_LIMIT) {
            vectors.extend(self.embed_batch(batch).await?);
        }
        if vectors.len() != texts.len() {
            bail!(
                "embedding count mismatch: requested {}, received {}",
                texts.len(),
                vectors.len()
            );
        }
        Ok(vectors)
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let model_path = format!("models/{}", self.embedding_model);
        let requests: Vec<Value> = batch
            .iter()
            .map(|text| {
                json!({
                    "model": model_path,
                    "content": { "parts": [ { "text": text } ] }
                })
            })
            .collect();
        let body = json!({ "requests": requests });

        let mut delay = Duration::from_millis(300);
        for attempt in 0..5 {
            let resp = self
                .post_json(&self.embedding_model, "batchEmbedContents", &body)
                .await
                .context("Gemini batchEmbedContents request failed")?;

            if resp.status().is_success() {
                let value: Value = resp
                    .json()
                    .await
                    .context("invalid JSON from Gemini batchEmbedContents")?;
                return parse_embeddings(&value);
            }

            if matches!(resp.status(), StatusCode::TOO_MANY_REQUESTS)
                || resp.status().is_server_error()
            {
                if attempt < 4 {
                    warn!(status = %resp.status(), attempt, "Gemini embedding call rejected, backing off");
                    sleep(delay).await;
                    delay = Duration::from_millis((delay.as_millis() as f64 * 1.8) as u64)
                        + Duration::from_millis(fastrand::u64(0..250));
                    continue;
                }
            }

            let status = resp.status();
            let err_txt = resp.text().await.unwrap_or_default();
            bail!("Gemini error {status}: {err_txt}");
        }
        bail!("Retries exhausted for Gemini embeddings")
    }
}

fn parse_generation(root: &Value) -> Result<String> {
    let first_candidate = root
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|candidates| candidates.first());

    let text = first_candidate
        .and_then(|candidate| candidate.get("content"))
        .and_then(|content| content.get("parts"))
        .and_then(Value::as_array)
        .map(|parts| {
            parts
                .iter()
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    if text.is_empty() {
        let reason = first_candidate
            .and_then(|candidate| candidate.get("finishReason"))
            .and_then(Value::as_str)
            .or_else(|| {
                root.get("promptFeedback")
                    .and_then(|feedback| feedback.get("blockReason"))
                    .and_then(Value::as_str)
            });
        match reason {
            Some(reason) => bail!("Gemini returned no text (reason: {reason})"),
            None => bail!("Gemini returned no text"),
        }
    }

    Ok(text)
}

fn parse_embeddings(root: &Value) -> Result<Vec<Vec<f32>>> {
    let entries = root
        .get("embeddings")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("embeddings field missing in Gemini response"))?;

    let mut vectors = Vec::with_capacity(entries.len());
    for entry in entries {
        let values = entry
            .get("values")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow!("embedding values missing in Gemini response"))?;
        let mut vector = Vec::with_capacity(values.len());
        for value in values {
            vector.push(
                value
                    .as_f64()
                    .ok_or_else(|| anyhow!("non-numeric embedding value"))? as f32,
            );
        }
        vectors.push(vector);
    }
    Ok(vectors)
}

#[async_trait]
impl Embedder for GeminiClient {
    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embed_texts(texts).await
    }
}

#[async_trait]
impl AnswerGenerator for GeminiClient {
    async fn generate(&self, prompt: &str) -> Result<String> {
        self.generate_text(prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_generated_text_across_parts() {
        let response = json!({
            "candidates": [ {
                "content": { "parts": [ { "text": "Hello " }, { "text": "world" } ] },
                "finishReason": "STOP"
            } ]
        });
        assert_eq!(parse_generation(&response).unwrap(), "Hello world");
    }

    #[test]
    fn empty_candidates_report_block_reason() {
        let response = json!({
            "candidates": [],
            "promptFeedback": { "blockReason": "SAFETY" }
        });
        let err = parse_generation(&response).unwrap_err();
        assert!(err.to_string().contains("SAFETY"));
    }

    #[test]
    fn parses_embedding_batches() {
        let response = json!({
            "embeddings": [
                { "values": [0.25, -1.0, 3.5] },
                { "values": [1.0, 2.0, 3.0] }
            ]
        });
        let vectors = parse_embeddings(&response).unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(vectors[0], vec![0.25, -1.0, 3.5]);
    }

    #[test]
    fn missing_embeddings_field_is_an_error() {
        let response = json!({ "error": { "message": "boom" } });
        assert!(parse_embeddings(&response).is_err());
    }
}
