use std::sync::Arc;

use async_trait::async_trait;
use concierge_core::ToolArguments;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::retrieval::RetrievalClient;
use crate::tools::{decode_arguments, Tool, ToolError};

const DEFAULT_K: usize = 5;
const MAX_K: usize = 50;

#[derive(Debug, Deserialize)]
struct SearchArgs {
    query: String,
    k: Option<f64>,
}

/// Document retrieval exposed to the tool loop.
pub struct SearchDocumentsTool {
    retrieval: Arc<RetrievalClient>,
}

impl SearchDocumentsTool {
    pub fn new(retrieval: Arc<RetrievalClient>) -> Self {
        Self { retrieval }
    }
}

#[async_trait]
impl Tool for SearchDocumentsTool {
    fn name(&self) -> &'static str {
        "search_documents"
    }

    fn description(&self) -> &'static str {
        "Search the internal document corpus and return the most relevant passages"
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "What to search for"
                },
                "k": {
                    "type": "integer",
                    "description": "Number of passages to return (default 5, at most 50)"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, arguments: ToolArguments) -> Result<Value, ToolError> {
        let args: SearchArgs = decode_arguments(self.name(), arguments)?;
        let k = match args.k {
            None => DEFAULT_K,
            Some(k) if k.is_finite() && k >= 1.0 && k.fract() == 0.0 => {
                k.min(MAX_K as f64) as usize
            }
            Some(k) => {
                return Err(ToolError::InvalidArguments {
                    tool: self.name().to_owned(),
                    reason: format!("k must be a positive integer (got {k})"),
                })
            }
        };
        let chunks = self.retrieval.retrieve(&args.query, k).await?;
        Ok(Value::Array(
            chunks
                .into_iter()
                .map(|chunk| json!({ "source": chunk.source, "content": chunk.content }))
                .collect(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;
    use concierge_core::Chunk;
    use serde_json::json;

    use super::SearchDocumentsTool;
    use crate::retrieval::{Corpus, CorpusLoader, Embedder, FlatIndex, RetrievalClient};
    use crate::tools::{Tool, ToolError};

    struct AxisEmbedder;

    #[async_trait]
    impl Embedder for AxisEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            Ok(if text.contains("relocation") { vec![1.0, 0.0] } else { vec![0.0, 1.0] })
        }
    }

    struct TwoChunkLoader;

    #[async_trait]
    impl CorpusLoader for TwoChunkLoader {
        async fn load(&self) -> Result<Corpus> {
            let mut index = FlatIndex::new(2);
            index.add(vec![1.0, 0.0])?;
            index.add(vec![0.0, 1.0])?;
            Ok(Corpus {
                chunks: vec![
                    Chunk::new("Relocation allowance is $5,000.", "relocation.md"),
                    Chunk::new("Overtime is paid at 1.5x.", "overtime.md"),
                ],
                index: Arc::new(index),
            })
        }
    }

    fn tool() -> SearchDocumentsTool {
        SearchDocumentsTool::new(Arc::new(RetrievalClient::new(
            Arc::new(AxisEmbedder),
            Arc::new(TwoChunkLoader),
        )))
    }

    #[tokio::test]
    async fn returns_ranked_passages_with_sources() {
        let value = tool()
            .execute(json!({"query": "relocation budget", "k": 1}).as_object().cloned().unwrap_or_default())
            .await
            .expect("search");
        assert_eq!(value, json!([{"source": "relocation.md", "content": "Relocation allowance is $5,000."}]));
    }

    #[tokio::test]
    async fn huge_k_is_capped_instead_of_allocating() {
        let value = tool()
            .execute(json!({"query": "x", "k": 1e18}).as_object().cloned().unwrap_or_default())
            .await
            .expect("search");
        assert_eq!(value.as_array().map(Vec::len), Some(2));
    }

    #[tokio::test]
    async fn rejects_fractional_k() {
        let error = tool()
            .execute(json!({"query": "x", "k": 1.5}).as_object().cloned().unwrap_or_default())
            .await;
        assert!(matches!(error, Err(ToolError::InvalidArguments { .. })));
    }
}
