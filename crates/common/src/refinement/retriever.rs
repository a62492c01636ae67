//! Evidence retrieval
//!
//! The controller consumes retrieval as a single call returning an ordered
//! evidence set. Similarity search, reranking and compression belong to the
//! search service behind [`HttpRetriever`]; [`KeywordRetriever`] ranks an
//! in-process corpus for local deployments.

use crate::errors::{AppError, Result};
use crate::models::{ContentType, EvidenceItem};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

/// Common trait for evidence sources
#[async_trait]
pub trait Retriever: Send + Sync {
    /// Fetch the ordered evidence set for a query (rank 1 first)
    async fn fetch(&self, query: &str) -> Result<Vec<EvidenceItem>>;

    /// Backend name for logs
    fn name(&self) -> &'static str;
}

/// Give items consecutive 1-based ranks in their current order
fn rerank(mut items: Vec<EvidenceItem>) -> Vec<EvidenceItem> {
    for (i, item) in items.iter_mut().enumerate() {
        item.rank = i + 1;
    }
    items
}

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    top_k: usize,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<EvidenceItem>,
}

/// Client for a remote search service
pub struct HttpRetriever {
    client: reqwest::Client,
    endpoint: String,
    top_k: usize,
    timeout_ms: u64,
}

impl HttpRetriever {
    pub fn new(endpoint: impl Into<String>, top_k: usize, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            top_k,
            timeout_ms: timeout.as_millis() as u64,
        })
    }
}

#[async_trait]
impl Retriever for HttpRetriever {
    async fn fetch(&self, query: &str) -> Result<Vec<EvidenceItem>> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&SearchRequest {
                query,
                top_k: self.top_k,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AppError::Timeout {
                        operation: "retrieval".to_string(),
                        timeout_ms: self.timeout_ms,
                    }
                } else {
                    AppError::upstream("retrieval", format!("Request failed: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("Search service error {}: {}", status, body);
            return Err(if status.is_client_error() && status.as_u16() != 429 {
                AppError::Configuration { message }
            } else {
                AppError::upstream("retrieval", message)
            });
        }

        let parsed: SearchResponse = response.json().await.map_err(|e| {
            AppError::upstream("retrieval", format!("Failed to parse response: {}", e))
        })?;

        let mut items = parsed.results;
        items.truncate(self.top_k);
        debug!(query = %query, results = items.len(), "Evidence retrieved");
        Ok(rerank(items))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// A corpus passage as stored in the local corpus file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorpusPassage {
    pub document_id: String,
    #[serde(default)]
    pub locator: String,
    #[serde(default)]
    pub content_type: ContentType,
    pub text: String,
}

/// Lexical retriever over an in-process corpus
///
/// Scores passages by the idf-weighted share of query terms they contain.
pub struct KeywordRetriever {
    passages: Vec<CorpusPassage>,
    terms: Vec<HashSet<String>>,
    idf: HashMap<String, f32>,
    top_k: usize,
}

impl KeywordRetriever {
    pub fn new(passages: Vec<CorpusPassage>, top_k: usize) -> Self {
        let terms: Vec<HashSet<String>> = passages.iter().map(|p| tokenize(&p.text)).collect();

        let mut document_frequency: HashMap<String, usize> = HashMap::new();
        for passage_terms in &terms {
            for term in passage_terms {
                *document_frequency.entry(term.clone()).or_default() += 1;
            }
        }

        let n = passages.len() as f32;
        let idf = document_frequency
            .into_iter()
            .map(|(term, df)| (term, ((n + 1.0) / (df as f32 + 0.5)).ln()))
            .collect();

        Self {
            passages,
            terms,
            idf,
            top_k,
        }
    }

    /// Load a JSON array of passages
    pub async fn from_file(path: impl AsRef<Path>, top_k: usize) -> Result<Self> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|e| AppError::Configuration {
            message: format!("Failed to read corpus {}: {}", path.display(), e),
        })?;
        let passages: Vec<CorpusPassage> =
            serde_json::from_slice(&bytes).map_err(|e| AppError::Configuration {
                message: format!("Invalid corpus {}: {}", path.display(), e),
            })?;

        info!(path = %path.display(), passages = passages.len(), "Corpus loaded");
        Ok(Self::new(passages, top_k))
    }

    pub fn len(&self) -> usize {
        self.passages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }
}

/// Lowercased alphanumeric terms longer than two characters
fn tokenize(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.len() > 2)
        .map(|w| w.to_lowercase())
        .collect()
}

#[async_trait]
impl Retriever for KeywordRetriever {
    async fn fetch(&self, query: &str) -> Result<Vec<EvidenceItem>> {
        let query_terms = tokenize(query);
        if query_terms.is_empty() {
            return Ok(vec![]);
        }

        let total: f32 = query_terms
            .iter()
            .map(|t| self.idf.get(t).copied().unwrap_or(0.0))
            .sum();
        if total <= 0.0 {
            return Ok(vec![]);
        }

        let mut scored: Vec<(usize, f32)> = self
            .terms
            .iter()
            .enumerate()
            .filter_map(|(i, passage_terms)| {
                let matched: f32 = query_terms
                    .iter()
                    .filter(|t| passage_terms.contains(*t))
                    .map(|t| self.idf.get(t).copied().unwrap_or(0.0))
                    .sum();
                (matched > 0.0).then_some((i, matched / total))
            })
            .collect();

        // Stable sort keeps corpus order for equal scores
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.top_k);

        let items = scored
            .into_iter()
            .map(|(i, score)| {
                let passage = &self.passages[i];
                EvidenceItem {
                    document_id: passage.document_id.clone(),
                    locator: passage.locator.clone(),
                    content_type: passage.content_type,
                    text: passage.text.clone(),
                    rank: 0,
                    score: Some(score),
                }
            })
            .collect();

        Ok(rerank(items))
    }

    fn name(&self) -> &'static str {
        "keyword"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(id: &str, text: &str) -> CorpusPassage {
        CorpusPassage {
            document_id: id.to_string(),
            locator: String::new(),
            content_type: ContentType::Text,
            text: text.to_string(),
        }
    }

    fn corpus() -> KeywordRetriever {
        KeywordRetriever::new(
            vec![
                passage("lipids", "Saturated fat and trans fat raise LDL cholesterol."),
                passage("fibre", "Soluble fibre from oats can lower LDL cholesterol."),
                passage("iron", "Iron deficiency is the most common cause of anemia."),
            ],
            2,
        )
    }

    #[tokio::test]
    async fn test_keyword_ranking() {
        let items = corpus().fetch("which fat raises cholesterol").await.unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].document_id, "lipids");
        assert_eq!(items[0].rank, 1);
        assert_eq!(items[1].rank, 2);
        assert!(items[0].score.unwrap() >= items[1].score.unwrap());
    }

    #[tokio::test]
    async fn test_no_match_returns_empty_set() {
        assert!(corpus().fetch("quantum chromodynamics").await.unwrap().is_empty());
        assert!(corpus().fetch("a an").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_corpus_file_loading() {
        let path = std::env::temp_dir().join(format!("nutrisage-corpus-{}.json", uuid::Uuid::new_v4()));
        tokio::fs::write(
            &path,
            r#"[{"document_id": "anemia.pdf", "locator": "p. 2", "text": "Ferritin reflects iron stores."}]"#,
        )
        .await
        .unwrap();

        let retriever = KeywordRetriever::from_file(&path, 3).await.unwrap();
        assert_eq!(retriever.len(), 1);

        let items = retriever.fetch("ferritin levels").await.unwrap();
        assert_eq!(items[0].locator, "p. 2");

        let _ = tokio::fs::remove_file(&path).await;
    }

    #[tokio::test]
    async fn test_missing_corpus_is_configuration_error() {
        let result = KeywordRetriever::from_file("/nonexistent/corpus.json", 3).await;
        assert!(matches!(result, Err(AppError::Configuration { .. })));
    }

    #[test]
    fn test_search_response_parsing() {
        let parsed: SearchResponse = serde_json::from_str(
            r#"{"results": [{"document_id": "d", "text": "t", "rank": 7, "content_type": "table"}]}"#,
        )
        .unwrap();

        let items = rerank(parsed.results);
        assert_eq!(items[0].rank, 1);
        assert_eq!(items[0].content_type, ContentType::Table);
    }
}
