//! Safety gate over an external moderation classifier
//!
//! The gate is a hard veto applied to the raw user input and to the final
//! answer. A classifier failure counts as unsafe.

use crate::errors::{AppError, Result};
use crate::llm::{ChatModel, Completion};
use crate::metrics;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Category reported when the classifier could not be reached
pub const MODERATION_UNAVAILABLE: &str = "moderation_unavailable";

/// Which side of the pipeline a text comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Input => write!(f, "input"),
            Direction::Output => write!(f, "output"),
        }
    }
}

/// Classifier verdict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum SafetyVerdict {
    Safe,
    Unsafe { category: String },
}

impl SafetyVerdict {
    pub fn is_safe(&self) -> bool {
        matches!(self, SafetyVerdict::Safe)
    }
}

/// External content-moderation capability
#[async_trait]
pub trait ModerationService: Send + Sync {
    async fn classify(&self, text: &str) -> Result<SafetyVerdict>;
}

/// Llama Guard served through an OpenAI-compatible endpoint
pub struct LlamaGuardModeration {
    model: Arc<dyn ChatModel>,
}

impl LlamaGuardModeration {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }

    /// Parse "safe" or "unsafe\nS1,S10"; only the first category is kept
    pub(crate) fn parse(reply: &str) -> Result<SafetyVerdict> {
        let normalized = reply.trim().to_lowercase();
        let mut tokens = normalized
            .split(|c: char| c.is_whitespace() || c == ',')
            .filter(|t| !t.is_empty());

        match tokens.next() {
            Some("safe") => Ok(SafetyVerdict::Safe),
            Some("unsafe") => Ok(SafetyVerdict::Unsafe {
                category: tokens
                    .next()
                    .map(str::to_uppercase)
                    .unwrap_or_else(|| "unspecified".to_string()),
            }),
            _ => Err(AppError::Moderation {
                message: format!("Unexpected guard reply: {}", reply),
            }),
        }
    }
}

#[async_trait]
impl ModerationService for LlamaGuardModeration {
    async fn classify(&self, text: &str) -> Result<SafetyVerdict> {
        let reply = self.model.complete(Completion::user_only(text)).await?;
        Self::parse(&reply)
    }
}

/// Hard veto on unsafe input and output
pub struct SafetyGate {
    moderation: Arc<dyn ModerationService>,
    allowed_categories: HashSet<String>,
    timeout: Duration,
}

impl SafetyGate {
    pub fn new(
        moderation: Arc<dyn ModerationService>,
        allowed_categories: impl IntoIterator<Item = String>,
        timeout: Duration,
    ) -> Self {
        Self {
            moderation,
            allowed_categories: allowed_categories
                .into_iter()
                .map(|c| c.to_uppercase())
                .collect(),
            timeout,
        }
    }

    /// Classify `text`; never fails
    pub async fn check(&self, text: &str, direction: Direction) -> SafetyVerdict {
        let classified = match tokio::time::timeout(self.timeout, self.moderation.classify(text)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout {
                operation: "moderation".to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        };

        let verdict = match classified {
            Ok(SafetyVerdict::Unsafe { category }) if self.allowed_categories.contains(&category) => {
                info!(direction = %direction, category = %category, "Allowed moderation category");
                SafetyVerdict::Safe
            }
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(direction = %direction, error = %e, "Moderation unavailable, refusing");
                SafetyVerdict::Unsafe {
                    category: MODERATION_UNAVAILABLE.to_string(),
                }
            }
        };

        if let SafetyVerdict::Unsafe { category } = &verdict {
            info!(direction = %direction, category = %category, "Content vetoed");
        }
        metrics::record_safety(&direction.to_string(), verdict.is_safe());
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedModel;

    fn gate(model: ScriptedModel) -> SafetyGate {
        SafetyGate::new(
            Arc::new(LlamaGuardModeration::new(Arc::new(model))),
            vec!["S6".to_string(), "S7".to_string()],
            Duration::from_secs(1),
        )
    }

    #[test]
    fn test_parse_guard_replies() {
        assert_eq!(LlamaGuardModeration::parse("safe").unwrap(), SafetyVerdict::Safe);
        assert_eq!(
            LlamaGuardModeration::parse("unsafe\nS1").unwrap(),
            SafetyVerdict::Unsafe {
                category: "S1".to_string()
            }
        );
        assert_eq!(
            LlamaGuardModeration::parse("unsafe s11,S2").unwrap(),
            SafetyVerdict::Unsafe {
                category: "S11".to_string()
            }
        );
        assert!(LlamaGuardModeration::parse("maybe").is_err());
    }

    #[tokio::test]
    async fn test_allowed_category_passes() {
        let gate = gate(ScriptedModel::new().reply("unsafe\nS6"));
        assert!(gate.check("how much iron should I take", Direction::Input).await.is_safe());
    }

    #[tokio::test]
    async fn test_disallowed_category_is_vetoed() {
        let gate = gate(ScriptedModel::new().reply("unsafe\nS2"));
        assert_eq!(
            gate.check("...", Direction::Output).await,
            SafetyVerdict::Unsafe {
                category: "S2".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_moderation_failure_fails_closed() {
        let gate = gate(ScriptedModel::new().fail(AppError::upstream("moderation", "503")));
        assert_eq!(
            gate.check("hello", Direction::Input).await,
            SafetyVerdict::Unsafe {
                category: MODERATION_UNAVAILABLE.to_string()
            }
        );
    }
}
