//! Long-term user memory
//!
//! Provides:
//! - The [`MemoryStore`] collaborator interface (read before, write after a turn)
//! - A mem0 REST adapter
//! - An in-process store and a no-op store
//!
//! The pipeline treats memory as best effort: callers degrade a failed read
//! to an empty context and a failed write to a logged warning.

use crate::errors::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Memories relevant to the current query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemoryContext {
    memories: Vec<String>,
}

impl MemoryContext {
    pub fn new(memories: Vec<String>) -> Self {
        Self {
            memories: memories.into_iter().filter(|m| !m.trim().is_empty()).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.memories.is_empty()
    }

    pub fn len(&self) -> usize {
        self.memories.len()
    }

    /// Prompt block for the generator; empty when there is nothing to recall
    pub fn render(&self) -> String {
        if self.memories.is_empty() {
            return String::new();
        }
        let mut rendered = String::from("Previous relevant interactions:\n");
        for memory in &self.memories {
            rendered.push_str("- ");
            rendered.push_str(memory);
            rendered.push('\n');
        }
        rendered
    }
}

/// What gets remembered about one released turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnSummary {
    pub query: String,
    pub answer: String,
    pub created_at: DateTime<Utc>,
}

/// External long-term memory
#[async_trait]
pub trait MemoryStore: Send + Sync {
    /// Memories of `user` relevant to `query`
    async fn read(&self, user: &str, query: &str) -> Result<MemoryContext>;

    async fn write(&self, user: &str, summary: &TurnSummary) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Store that remembers nothing
pub struct NoopMemoryStore;

#[async_trait]
impl MemoryStore for NoopMemoryStore {
    async fn read(&self, _user: &str, _query: &str) -> Result<MemoryContext> {
        Ok(MemoryContext::default())
    }

    async fn write(&self, _user: &str, _summary: &TurnSummary) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

/// Process-local store returning the most recent turns
pub struct InMemoryMemoryStore {
    turns: RwLock<HashMap<String, Vec<TurnSummary>>>,
    limit: usize,
}

impl InMemoryMemoryStore {
    pub fn new(limit: usize) -> Self {
        Self {
            turns: RwLock::new(HashMap::new()),
            limit,
        }
    }
}

#[async_trait]
impl MemoryStore for InMemoryMemoryStore {
    async fn read(&self, user: &str, _query: &str) -> Result<MemoryContext> {
        let turns = self.turns.read().await;
        let memories = turns
            .get(user)
            .map(|history| {
                history
                    .iter()
                    .rev()
                    .take(self.limit)
                    .map(|t| format!("Customer asked: {} | Answer given: {}", t.query, t.answer))
                    .collect()
            })
            .unwrap_or_default();
        Ok(MemoryContext::new(memories))
    }

    async fn write(&self, user: &str, summary: &TurnSummary) -> Result<()> {
        self.turns
            .write()
            .await
            .entry(user.to_string())
            .or_default()
            .push(summary.clone());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

#[derive(Serialize)]
struct Mem0Message<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct Mem0AddRequest<'a> {
    messages: Vec<Mem0Message<'a>>,
    user_id: &'a str,
    metadata: serde_json::Value,
    output_format: &'a str,
}

#[derive(Serialize)]
struct Mem0SearchRequest<'a> {
    query: &'a str,
    user_id: &'a str,
    limit: usize,
}

#[derive(Debug, Deserialize)]
struct Mem0Memory {
    #[serde(default)]
    memory: String,
}

/// Search replies come back either bare or wrapped, depending on API version
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Mem0SearchResponse {
    List(Vec<Mem0Memory>),
    Wrapped { results: Vec<Mem0Memory> },
}

impl Mem0SearchResponse {
    fn into_memories(self) -> Vec<String> {
        let items = match self {
            Mem0SearchResponse::List(items) => items,
            Mem0SearchResponse::Wrapped { results } => results,
        };
        items.into_iter().map(|m| m.memory).collect()
    }
}

/// mem0 platform client
pub struct Mem0MemoryStore {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    limit: usize,
}

impl Mem0MemoryStore {
    pub fn new(
        api_base: impl Into<String>,
        api_key: String,
        limit: usize,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key,
            limit,
        })
    }

    async fn post<T: Serialize>(&self, path: &str, body: &T) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}{}", self.api_base, path))
            .header("Authorization", format!("Token {}", self.api_key))
            .json(body)
            .send()
            .await
            .map_err(|e| AppError::Memory {
                message: format!("Request failed: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Memory {
                message: format!("mem0 error {}: {}", status, body),
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl MemoryStore for Mem0MemoryStore {
    async fn read(&self, user: &str, query: &str) -> Result<MemoryContext> {
        let response = self
            .post(
                "/v1/memories/search/",
                &Mem0SearchRequest {
                    query,
                    user_id: user,
                    limit: self.limit,
                },
            )
            .await?;

        let parsed: Mem0SearchResponse = response.json().await.map_err(|e| AppError::Memory {
            message: format!("Failed to parse search response: {}", e),
        })?;

        let mut memories = parsed.into_memories();
        memories.truncate(self.limit);
        debug!(user = %user, memories = memories.len(), "Memories recalled");
        Ok(MemoryContext::new(memories))
    }

    async fn write(&self, user: &str, summary: &TurnSummary) -> Result<()> {
        let request = Mem0AddRequest {
            messages: vec![
                Mem0Message {
                    role: "user",
                    content: &summary.query,
                },
                Mem0Message {
                    role: "assistant",
                    content: &summary.answer,
                },
            ],
            user_id: user,
            metadata: serde_json::json!({
                "type": "support_query",
                "timestamp": summary.created_at.to_rfc3339(),
            }),
            output_format: "v1.1",
        };

        self.post("/v1/memories/", &request).await?;
        debug!(user = %user, "Interaction stored");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mem0"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary(query: &str) -> TurnSummary {
        TurnSummary {
            query: query.to_string(),
            answer: format!("answer to {}", query),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_render() {
        assert_eq!(MemoryContext::default().render(), "");

        let context = MemoryContext::new(vec!["Lactose intolerant".to_string(), " ".to_string()]);
        assert_eq!(context.len(), 1);
        assert_eq!(
            context.render(),
            "Previous relevant interactions:\n- Lactose intolerant\n"
        );
    }

    #[tokio::test]
    async fn test_in_memory_store_keeps_recent_turns_per_user() {
        let store = InMemoryMemoryStore::new(2);
        for q in ["first", "second", "third"] {
            store.write("ana", &summary(q)).await.unwrap();
        }
        store.write("ben", &summary("other")).await.unwrap();

        let context = store.read("ana", "anything").await.unwrap();
        let rendered = context.render();
        assert_eq!(context.len(), 2);
        assert!(rendered.contains("third"));
        assert!(rendered.contains("second"));
        assert!(!rendered.contains("first"));
        assert!(!rendered.contains("other"));
    }

    #[test]
    fn test_search_response_shapes() {
        let bare: Mem0SearchResponse =
            serde_json::from_str(r#"[{"id": "1", "memory": "Prefers vegetarian meals"}]"#).unwrap();
        assert_eq!(bare.into_memories(), vec!["Prefers vegetarian meals"]);

        let wrapped: Mem0SearchResponse =
            serde_json::from_str(r#"{"results": [{"memory": "Has type 2 diabetes"}]}"#).unwrap();
        assert_eq!(wrapped.into_memories(), vec!["Has type 2 diabetes"]);
    }

    #[test]
    fn test_add_request_shape() {
        let s = summary("is oat milk ok");
        let request = Mem0AddRequest {
            messages: vec![Mem0Message {
                role: "user",
                content: &s.query,
            }],
            user_id: "ana",
            metadata: serde_json::json!({"type": "support_query"}),
            output_format: "v1.1",
        };

        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["user_id"], "ana");
        assert_eq!(json["output_format"], "v1.1");
        assert_eq!(json["messages"][0]["content"], "is oat milk ok");
    }
}
