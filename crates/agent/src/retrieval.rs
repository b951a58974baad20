use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use concierge_core::Chunk;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RetrievalError {
    #[error("could not read corpus index `{path}`: {source}")]
    ReadIndex { path: PathBuf, source: std::io::Error },
    #[error("could not parse corpus index `{path}`: {source}")]
    ParseIndex { path: PathBuf, source: serde_json::Error },
    #[error("corpus index declares dimension zero")]
    ZeroDimension,
    #[error("vector dimension mismatch at {context}: expected {expected}, found {found}")]
    DimensionMismatch { context: String, expected: usize, found: usize },
}

#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

pub trait VectorIndex: Send + Sync {
    fn dimension(&self) -> usize;

    /// Up to `k` `(position, distance)` pairs, nearest first.
    fn search(&self, vector: &[f32], k: usize) -> Vec<(usize, f32)>;
}

/// Exact nearest-neighbour search by squared L2 distance. Ties keep insertion order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FlatIndex {
    dimension: usize,
    vectors: Vec<Vec<f32>>,
}

impl FlatIndex {
    pub fn new(dimension: usize) -> Self {
        Self { dimension, vectors: Vec::new() }
    }

    pub fn add(&mut self, vector: Vec<f32>) -> Result<(), RetrievalError> {
        if vector.len() != self.dimension {
            return Err(RetrievalError::DimensionMismatch {
                context: format!("index entry {}", self.vectors.len()),
                expected: self.dimension,
                found: vector.len(),
            });
        }
        self.vectors.push(vector);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }
}

impl VectorIndex for FlatIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn search(&self, vector: &[f32], k: usize) -> Vec<(usize, f32)> {
        let mut scored: Vec<(usize, f32)> = self
            .vectors
            .iter()
            .enumerate()
            .map(|(position, stored)| {
                let distance =
                    stored.iter().zip(vector).map(|(a, b)| (a - b) * (a - b)).sum::<f32>();
                (position, distance)
            })
            .collect();
        scored.sort_by(|left, right| left.1.total_cmp(&right.1));
        scored.truncate(k);
        scored
    }
}

/// Chunk table plus the index built over the same entries; positions line up.
#[derive(Clone)]
pub struct Corpus {
    pub chunks: Vec<Chunk>,
    pub index: Arc<dyn VectorIndex>,
}

impl Corpus {
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

#[async_trait]
pub trait CorpusLoader: Send + Sync {
    async fn load(&self) -> Result<Corpus>;
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CorpusFile {
    pub dimension: usize,
    pub entries: Vec<CorpusEntry>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct CorpusEntry {
    pub content: String,
    pub source: String,
    pub embedding: Vec<f32>,
}

impl CorpusFile {
    pub fn into_corpus(self) -> Result<Corpus, RetrievalError> {
        if self.dimension == 0 {
            return Err(RetrievalError::ZeroDimension);
        }
        let mut index = FlatIndex::new(self.dimension);
        let mut chunks = Vec::with_capacity(self.entries.len());
        for entry in self.entries {
            index.add(entry.embedding)?;
            chunks.push(Chunk::new(entry.content, entry.source));
        }
        Ok(Corpus { chunks, index: Arc::new(index) })
    }
}

/// Reads the JSON index written by the offline ingestion step.
#[derive(Clone, Debug)]
pub struct JsonCorpusLoader {
    path: PathBuf,
}

impl JsonCorpusLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl CorpusLoader for JsonCorpusLoader {
    async fn load(&self) -> Result<Corpus> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| RetrievalError::ReadIndex { path: self.path.clone(), source })?;
        let file: CorpusFile = serde_json::from_str(&raw)
            .map_err(|source| RetrievalError::ParseIndex { path: self.path.clone(), source })?;
        let corpus = file.into_corpus()?;
        info!(
            event_name = "retrieval.corpus_loaded",
            path = %self.path.display(),
            chunks = corpus.len(),
            "loaded corpus index"
        );
        Ok(corpus)
    }
}

/// Embeds a query and returns its nearest chunks. The corpus is loaded on first use and shared
/// for the lifetime of the client.
pub struct RetrievalClient {
    embedder: Arc<dyn Embedder>,
    loader: Arc<dyn CorpusLoader>,
    corpus: OnceCell<Corpus>,
}

impl RetrievalClient {
    pub fn new(embedder: Arc<dyn Embedder>, loader: Arc<dyn CorpusLoader>) -> Self {
        Self { embedder, loader, corpus: OnceCell::new() }
    }

    pub async fn corpus(&self) -> Result<&Corpus> {
        self.corpus.get_or_try_init(|| self.loader.load()).await
    }

    pub async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<Chunk>> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let corpus = self.corpus().await?;
        let vector = self.embedder.embed(query).await?;
        if vector.len() != corpus.index.dimension() {
            return Err(RetrievalError::DimensionMismatch {
                context: "query embedding".to_owned(),
                expected: corpus.index.dimension(),
                found: vector.len(),
            }
            .into());
        }

        let mut chunks = Vec::with_capacity(k.min(corpus.len()));
        for (position, distance) in corpus.index.search(&vector, k) {
            match corpus.chunks.get(position) {
                Some(chunk) => {
                    debug!(source = %chunk.source, distance, "retrieved chunk");
                    chunks.push(chunk.clone());
                }
                None => warn!(
                    event_name = "retrieval.index_out_of_range",
                    position,
                    chunks = corpus.len(),
                    "index returned a position with no chunk"
                ),
            }
        }
        chunks.truncate(k);
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use anyhow::Result;
    use async_trait::async_trait;
    use concierge_core::Chunk;
    use serde_json::json;
    use tempfile::TempDir;

    use super::{
        Corpus, CorpusLoader, Embedder, FlatIndex, JsonCorpusLoader, RetrievalClient,
        RetrievalError, VectorIndex,
    };

    struct FixedEmbedder(Vec<f32>);

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }
    }

    struct CountingLoader {
        loads: AtomicUsize,
    }

    /// Reports more positions than there are chunks.
    struct OverreachingIndex;

    impl VectorIndex for OverreachingIndex {
        fn dimension(&self) -> usize {
            2
        }

        fn search(&self, _vector: &[f32], _k: usize) -> Vec<(usize, f32)> {
            vec![(7, 0.0), (0, 0.5)]
        }
    }

    #[async_trait]
    impl CorpusLoader for CountingLoader {
        async fn load(&self) -> Result<Corpus> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            let mut index = FlatIndex::new(2);
            index.add(vec![0.0, 0.0])?;
            index.add(vec![1.0, 1.0])?;
            Ok(Corpus {
                chunks: vec![
                    Chunk::new("Relocation allowance is $5,000.", "relocation.md"),
                    Chunk::new("Per diem is $50.", "travel.md"),
                ],
                index: Arc::new(index),
            })
        }
    }

    #[test]
    fn flat_index_orders_by_distance_and_keeps_ties_stable() {
        let mut index = FlatIndex::new(2);
        for vector in [vec![3.0, 0.0], vec![1.0, 0.0], vec![-1.0, 0.0], vec![0.0, 2.0]] {
            index.add(vector).expect("matching dimension");
        }

        let hits = index.search(&[0.0, 0.0], 3);
        let positions: Vec<usize> = hits.iter().map(|(position, _)| *position).collect();
        assert_eq!(positions, vec![1, 2, 3]);
        assert_eq!(hits[0].1, 1.0);

        assert!(matches!(
            index.add(vec![1.0]),
            Err(RetrievalError::DimensionMismatch { expected: 2, found: 1, .. })
        ));
    }

    #[tokio::test]
    async fn corpus_is_loaded_once_and_results_are_ranked() {
        let loader = Arc::new(CountingLoader { loads: AtomicUsize::new(0) });
        let client = RetrievalClient::new(Arc::new(FixedEmbedder(vec![0.9, 0.9])), loader.clone());

        let first = client.retrieve("relocation", 1).await.expect("retrieve");
        let second = client.retrieve("relocation", 5).await.expect("retrieve");

        assert_eq!(first, vec![Chunk::new("Per diem is $50.", "travel.md")]);
        assert_eq!(second.len(), 2);
        assert_eq!(loader.loads.load(Ordering::SeqCst), 1);
        assert!(client.retrieve("anything", 0).await.expect("k = 0").is_empty());
        assert_eq!(client.retrieve("anything", usize::MAX).await.expect("huge k").len(), 2);
    }

    #[tokio::test]
    async fn out_of_range_positions_are_skipped() {
        struct Loader;

        #[async_trait]
        impl CorpusLoader for Loader {
            async fn load(&self) -> Result<Corpus> {
                Ok(Corpus {
                    chunks: vec![Chunk::new("only chunk", "a.md")],
                    index: Arc::new(OverreachingIndex),
                })
            }
        }

        let client = RetrievalClient::new(Arc::new(FixedEmbedder(vec![0.0, 0.0])), Arc::new(Loader));
        let chunks = client.retrieve("q", 2).await.expect("retrieve");
        assert_eq!(chunks, vec![Chunk::new("only chunk", "a.md")]);
    }

    #[tokio::test]
    async fn query_dimension_mismatch_is_an_error() {
        let loader = Arc::new(CountingLoader { loads: AtomicUsize::new(0) });
        let client = RetrievalClient::new(Arc::new(FixedEmbedder(vec![1.0, 2.0, 3.0])), loader);
        let error = client.retrieve("q", 2).await.expect_err("mismatch");
        assert!(error.to_string().contains("query embedding"));
    }

    #[tokio::test]
    async fn json_loader_reads_index_file() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("corpus.json");
        let body = json!({
            "dimension": 3,
            "entries": [
                {"content": "Relocation allowance: $5,000", "source": "relocation.md", "embedding": [1.0, 0.0, 0.0]},
                {"content": "Walkthroughs are booked via the portal", "source": "walkthrough.md", "embedding": [0.0, 1.0, 0.0]}
            ]
        });
        std::fs::write(&path, body.to_string()).expect("write index");

        let corpus = JsonCorpusLoader::new(&path).load().await.expect("load");
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.index.dimension(), 3);
        assert_eq!(corpus.chunks[1].source, "walkthrough.md");
    }

    #[tokio::test]
    async fn json_loader_rejects_bad_dimensions_and_missing_files() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("corpus.json");
        let body = json!({
            "dimension": 2,
            "entries": [{"content": "x", "source": "x.md", "embedding": [1.0, 0.0, 0.0]}]
        });
        std::fs::write(&path, body.to_string()).expect("write index");

        let error = JsonCorpusLoader::new(&path).load().await.err().expect("mismatch");
        assert!(error.to_string().contains("dimension mismatch"));

        let missing = JsonCorpusLoader::new(dir.path().join("absent.json")).load().await;
        assert!(missing.err().is_some_and(|error| error.to_string().contains("could not read")));
    }
}
