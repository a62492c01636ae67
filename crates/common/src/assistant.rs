//! Request pipeline
//!
//! admit -> input safety -> memory read -> refinement -> output safety ->
//! memory write -> turn appended. Nothing is persisted before the answer is
//! cleared for release, so an abandoned request leaves no partial turn.

use crate::config::AppConfig;
use crate::errors::{AppError, Result};
use crate::llm::{ChatModel, OpenAiChatModel};
use crate::memory::{InMemoryMemoryStore, Mem0MemoryStore, MemoryContext, MemoryStore, NoopMemoryStore, TurnSummary};
use crate::models::{OutcomeKind, Turn};
use crate::ratelimit::{
    Admission, CounterStore, InMemoryCounterStore, JsonFileCounterStore, RateLimiter, RedisCounterStore,
};
use crate::refinement::{
    Collaborators, Direction, GroundednessEvaluator, HttpRetriever, KeywordRetriever, LlamaGuardModeration,
    LlmGenerator, LlmQueryExpander, LlmQueryRefiner, PrecisionEvaluator, QueryExpander, QueryRefiner,
    RefinementController, Retriever, RetryPolicy, SafetyGate, SafetyVerdict, SynonymExpander,
    GENERATION_UNAVAILABLE_ANSWER,
};
use crate::session::SessionRegistry;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Fixed reply when the safety gate vetoes input or output
pub const REFUSAL_ANSWER: &str = "I apologize, but I cannot help with that request as it may be \
inappropriate. Please rephrase your nutrition question and try again.";

/// One chat message from the presentation layer
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Rate-limit identity (client network address)
    pub identity: String,
    /// Display name, used as the session's user id
    pub user_id: String,
    pub message: String,
    pub session_id: Option<Uuid>,
}

/// How a reply was produced
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReplyStatus {
    /// Both critics accepted the answer
    Answered,
    /// Round budget ran out; best candidate released
    LowConfidence,
    /// Safety gate veto
    Refused,
    /// Generation stayed unavailable; canned apology
    Unavailable,
}

/// Reply returned to the presentation layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub session_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<Uuid>,
    pub status: ReplyStatus,
    pub answer: String,
    pub rounds: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub groundedness: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub precision: Option<f32>,
    pub hour_remaining: u32,
    pub day_remaining: u32,
}

/// The nutrition assistant: quota, safety, memory and refinement wired together
pub struct Assistant {
    limiter: Arc<RateLimiter>,
    safety: Arc<SafetyGate>,
    memory: Arc<dyn MemoryStore>,
    controller: Arc<RefinementController>,
    sessions: Arc<SessionRegistry>,
}

impl Assistant {
    pub fn new(
        limiter: Arc<RateLimiter>,
        safety: Arc<SafetyGate>,
        memory: Arc<dyn MemoryStore>,
        controller: Arc<RefinementController>,
        sessions: Arc<SessionRegistry>,
    ) -> Self {
        Self {
            limiter,
            safety,
            memory,
            controller,
            sessions,
        }
    }

    /// Build every component from configuration
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let call_timeout = config.call_timeout();

        let llm_key = config.llm.api_key.clone().ok_or_else(|| AppError::Configuration {
            message: "llm.api_key (or OPENAI_API_KEY) is required".to_string(),
        })?;
        let llm: Arc<dyn ChatModel> = Arc::new(OpenAiChatModel::new(
            "llm",
            llm_key,
            config.llm.model.clone(),
            config.llm.api_base.clone(),
            call_timeout,
        )?);

        let guard_key = config.moderation.api_key.clone().ok_or_else(|| AppError::Configuration {
            message: "moderation.api_key (or GROQ_API_KEY) is required".to_string(),
        })?;
        let guard: Arc<dyn ChatModel> = Arc::new(OpenAiChatModel::new(
            "moderation",
            guard_key,
            config.moderation.model.clone(),
            config.moderation.api_base.clone(),
            call_timeout,
        )?);

        let retriever: Arc<dyn Retriever> = match config.retrieval.provider.as_str() {
            "http" => {
                let endpoint = config.retrieval.endpoint.clone().ok_or_else(|| AppError::Configuration {
                    message: "retrieval.endpoint is required for the http provider".to_string(),
                })?;
                Arc::new(HttpRetriever::new(endpoint, config.retrieval.top_k, call_timeout)?)
            }
            "local" => {
                let path = config.retrieval.corpus_path.as_deref().ok_or_else(|| AppError::Configuration {
                    message: "retrieval.corpus_path is required for the local provider".to_string(),
                })?;
                Arc::new(KeywordRetriever::from_file(path, config.retrieval.top_k).await?)
            }
            other => {
                return Err(AppError::Configuration {
                    message: format!("Unknown retrieval provider: {}", other),
                })
            }
        };

        let memory: Arc<dyn MemoryStore> = match config.memory.provider.as_str() {
            "mem0" => {
                let key = config.memory.api_key.clone().ok_or_else(|| AppError::Configuration {
                    message: "memory.api_key (or MEM0_API_KEY) is required for mem0".to_string(),
                })?;
                Arc::new(Mem0MemoryStore::new(
                    config.memory.api_base.clone(),
                    key,
                    config.memory.search_limit,
                    call_timeout,
                )?)
            }
            "in_memory" => Arc::new(InMemoryMemoryStore::new(config.memory.search_limit)),
            "none" => Arc::new(NoopMemoryStore),
            other => {
                return Err(AppError::Configuration {
                    message: format!("Unknown memory provider: {}", other),
                })
            }
        };

        let store: Arc<dyn CounterStore> = match config.rate_limit.store.as_str() {
            "memory" => Arc::new(InMemoryCounterStore::new()),
            "file" => Arc::new(JsonFileCounterStore::open(&config.rate_limit.file_path).await?),
            "redis" => Arc::new(RedisCounterStore::connect(&config.rate_limit.redis_url).await?),
            other => {
                return Err(AppError::Configuration {
                    message: format!("Unknown counter store: {}", other),
                })
            }
        };

        let (expander, refiner): (Arc<dyn QueryExpander>, Arc<dyn QueryRefiner>) =
            if config.llm.llm_query_expansion {
                (
                    Arc::new(LlmQueryExpander::new(llm.clone())),
                    Arc::new(LlmQueryRefiner::new(llm.clone())),
                )
            } else {
                let synonyms = Arc::new(SynonymExpander::new());
                (synonyms.clone(), synonyms)
            };

        let refinement = &config.refinement;
        let controller = RefinementController::new(
            Collaborators {
                expander,
                refiner,
                retriever,
                generator: Arc::new(LlmGenerator::new(
                    llm.clone(),
                    config.llm.temperature,
                    config.llm.max_tokens,
                )),
                groundedness: Arc::new(GroundednessEvaluator::new(
                    llm.clone(),
                    refinement.groundedness_threshold,
                )),
                precision: Arc::new(PrecisionEvaluator::new(llm, refinement.precision_threshold)),
            },
            RetryPolicy::from_config(&refinement.retry, call_timeout),
            refinement.max_rounds,
        );

        let safety = SafetyGate::new(
            Arc::new(LlamaGuardModeration::new(guard)),
            config.moderation.allowed_categories.clone(),
            call_timeout,
        );

        info!(
            retrieval = config.retrieval.provider.as_str(),
            memory = memory.name(),
            counters = store.backend(),
            max_rounds = refinement.max_rounds,
            "Assistant configured"
        );

        Ok(Self::new(
            Arc::new(RateLimiter::from_config(store, &config.rate_limit)),
            Arc::new(safety),
            memory,
            Arc::new(controller),
            Arc::new(SessionRegistry::new()),
        ))
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Answer one chat message
    ///
    /// Only quota denials, unknown sessions, invalid input and counter-store
    /// failures are errors; every collaborator failure degrades the reply.
    #[instrument(skip(self, request), fields(identity = %request.identity, user_id = %request.user_id))]
    pub async fn handle(&self, request: ChatRequest, now: DateTime<Utc>) -> Result<Reply> {
        let message = request.message.trim();
        if message.is_empty() {
            return Err(AppError::Validation {
                message: "message must not be empty".to_string(),
                field: Some("message".to_string()),
            });
        }

        let (hour_remaining, day_remaining) = match self.limiter.admit(&request.identity, now).await? {
            Admission::Allowed {
                hour_remaining,
                day_remaining,
            } => (hour_remaining, day_remaining),
            Admission::Denied { scope, retry_after } => {
                let retry_after_secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
                return Err(AppError::QuotaExceeded {
                    scope,
                    retry_after_secs,
                });
            }
        };

        let session = self.sessions.open(request.session_id, &request.user_id).await?;
        let refused = || Reply {
            session_id: session.id,
            turn_id: None,
            status: ReplyStatus::Refused,
            answer: REFUSAL_ANSWER.to_string(),
            rounds: 0,
            groundedness: None,
            precision: None,
            hour_remaining,
            day_remaining,
        };

        if let SafetyVerdict::Unsafe { category } = self.safety.check(message, Direction::Input).await {
            info!(category = %category, "Input refused");
            return Ok(refused());
        }

        let memory = match self.memory.read(&session.memory_handle, message).await {
            Ok(context) => context,
            Err(e) => {
                warn!(error = %e, store = self.memory.name(), "Memory read failed, continuing without context");
                MemoryContext::default()
            }
        };

        let outcome = self.controller.run(message, &memory).await;

        if let SafetyVerdict::Unsafe { category } =
            self.safety.check(&outcome.candidate().answer, Direction::Output).await
        {
            info!(category = %category, rounds = outcome.rounds(), "Answer discarded by output gate");
            return Ok(refused());
        }

        let rounds = outcome.rounds();
        let kind = outcome.kind();
        let candidate = outcome.into_candidate();
        let status = if candidate.answer == GENERATION_UNAVAILABLE_ANSWER {
            ReplyStatus::Unavailable
        } else {
            match kind {
                OutcomeKind::Accepted => ReplyStatus::Answered,
                OutcomeKind::Exhausted => ReplyStatus::LowConfidence,
            }
        };

        let turn = Turn {
            id: Uuid::new_v4(),
            query: message.to_string(),
            answer: candidate.answer,
            rounds,
            groundedness: candidate.groundedness.value,
            precision: candidate.precision.value,
            outcome: kind,
            created_at: now,
        };

        if status != ReplyStatus::Unavailable {
            let summary = TurnSummary {
                query: turn.query.clone(),
                answer: turn.answer.clone(),
                created_at: now,
            };
            if let Err(e) = self.memory.write(&session.memory_handle, &summary).await {
                warn!(error = %e, store = self.memory.name(), "Memory write failed");
            }
        }

        let reply = Reply {
            session_id: session.id,
            turn_id: Some(turn.id),
            status,
            answer: turn.answer.clone(),
            rounds,
            groundedness: Some(turn.groundedness),
            precision: Some(turn.precision),
            hour_remaining,
            day_remaining,
        };
        self.sessions.append(session.id, turn).await?;

        info!(status = ?reply.status, rounds, "Reply released");
        Ok(reply)
    }
}
