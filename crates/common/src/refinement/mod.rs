//! Answer refinement engine
//!
//! The refinement engine turns a nutrition question into a validated answer:
//! - Query expansion and feedback-driven refinement
//! - Evidence retrieval
//! - Grounded answer generation
//! - Groundedness and precision critics
//! - The bounded refinement controller
//! - The safety gate applied before and after the loop

mod controller;
mod critic;
mod expander;
mod generator;
mod retriever;
mod retry;
mod safety;

pub use controller::{
    Candidate, Collaborators, Outcome, RefinementController, RefinementState,
    GENERATION_UNAVAILABLE_ANSWER, INSUFFICIENT_EVIDENCE_ANSWER,
};
pub use critic::{Critic, GroundednessEvaluator, PrecisionEvaluator, Reference, Verdict};
pub use expander::{LlmQueryExpander, LlmQueryRefiner, QueryExpander, QueryRefiner, SynonymExpander};
pub use generator::{Generator, LlmGenerator};
pub use retriever::{CorpusPassage, HttpRetriever, KeywordRetriever, Retriever};
pub use retry::RetryPolicy;
pub use safety::{
    Direction, LlamaGuardModeration, ModerationService, SafetyGate, SafetyVerdict,
    MODERATION_UNAVAILABLE,
};
