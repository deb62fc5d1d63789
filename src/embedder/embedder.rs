use std::time::Duration;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::vectors::normalize;
use crate::db::{EngineError, EngineResult};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The embedding provider capability set. Implementations are selected by
/// configuration at construction time and shared as `Arc<dyn Embedder>`.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts; one vector per input, in order.
    async fn batch_embed(&self, texts: Vec<&str>) -> EngineResult<Vec<Vec<f32>>>;

    fn dimension(&self) -> usize;

    fn model_name(&self) -> &str;

    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let mut vectors = self.batch_embed(vec![text]).await?;
        vectors
            .pop()
            .ok_or_else(|| EngineError::Data("provider returned no vector".into()))
    }
}

#[derive(Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

/// OpenAI-compatible embeddings endpoint over HTTP. Vectors are
/// cosine-normalized before they leave this type.
pub struct RemoteEmbedder {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    dimension: usize,
}

impl RemoteEmbedder {
    pub fn new(
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        dimension: usize,
    ) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            client,
            api_base: api_base.into(),
            api_key: api_key.into(),
            model: model.into(),
            dimension,
        })
    }
}

#[async_trait]
impl Embedder for RemoteEmbedder {
    async fn batch_embed(&self, texts: Vec<&str>) -> EngineResult<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let expected = texts.len();

        let response = self
            .client
            .post(format!("{}/embeddings", self.api_base.trim_end_matches('/')))
            .bearer_auth(&self.api_key)
            .json(&EmbeddingsRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await
            .map_err(|err| EngineError::Transient(anyhow!("embeddings request failed: {err}")))?;

        let status = response.status();
        if status.as_u16() == 429 || status.is_server_error() {
            return Err(EngineError::Transient(anyhow!(
                "provider returned {status}"
            )));
        }
        if !status.is_success() {
            return Err(EngineError::Data(format!("provider returned {status}")));
        }

        let payload: EmbeddingsResponse = response
            .json()
            .await
            .map_err(|err| EngineError::Data(format!("malformed provider response: {err}")))?;
        if payload.data.len() != expected {
            return Err(EngineError::Data(format!(
                "provider returned {} vectors for {} inputs",
                payload.data.len(),
                expected
            )));
        }

        let mut rows = payload.data;
        rows.sort_by_key(|row| row.index);
        let vectors = rows
            .into_iter()
            .map(|row| {
                let mut vector = row.embedding;
                normalize(&mut vector);
                vector
            })
            .collect();
        debug!(batch = expected, model = %self.model, "batch embedded");
        Ok(vectors)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}
