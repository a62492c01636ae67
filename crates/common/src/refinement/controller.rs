//! Evaluation-gated answer refinement
//!
//! One [`RefinementController::run`] drives a bounded loop of
//! retrieve -> generate -> evaluate rounds:
//!
//! - both critics pass: the candidate is accepted
//! - precision fails, or the round had no evidence: the retrieval query is
//!   refined with the precision gap and the next round re-retrieves
//! - only groundedness fails: the answer is revised against the same
//!   evidence with the groundedness gap
//!
//! The best candidate seen is tracked by `(min(g, p), g + p)`; when the
//! round budget runs out it is returned instead of the last one.
//! Collaborator failures are absorbed into degraded candidates, so a run
//! always ends with a non-empty answer.

use super::critic::{Critic, Reference, Verdict};
use super::expander::{QueryExpander, QueryRefiner};
use super::generator::Generator;
use super::retriever::Retriever;
use super::retry::RetryPolicy;
use crate::memory::MemoryContext;
use crate::metrics;
use crate::models::{EvidenceItem, OutcomeKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Candidate used when retrieval found nothing to ground an answer in
pub const INSUFFICIENT_EVIDENCE_ANSWER: &str = "I don't have sufficient information in my reference \
documents to answer this question reliably. Please try rephrasing it, or consult a registered \
dietitian for personal advice.";

/// Candidate used when the generation service stayed unavailable
pub const GENERATION_UNAVAILABLE_ANSWER: &str = "I'm sorry, I couldn't put together an answer right \
now. Please try again in a moment.";

/// One evaluated answer and the exact inputs its scores refer to
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub answer: String,
    /// Retrieval query of the round that produced the answer
    pub query: String,
    pub evidence: Vec<EvidenceItem>,
    pub groundedness: Verdict,
    pub precision: Verdict,
    pub round: u32,
}

impl Candidate {
    fn rank_key(&self) -> (f32, f32) {
        let (g, p) = (self.groundedness.value, self.precision.value);
        (g.min(p), g + p)
    }

    /// Strictly better by `(min, sum)`; ties favour the incumbent
    pub fn better_than(&self, other: &Candidate) -> bool {
        let (mine, theirs) = (self.rank_key(), other.rank_key());
        mine.0 > theirs.0 || (mine.0 == theirs.0 && mine.1 > theirs.1)
    }
}

/// Terminal result of a refinement run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Outcome {
    /// Both critics passed
    Accepted { candidate: Candidate, rounds: u32 },
    /// Round budget exhausted; carries the best candidate seen
    Exhausted { best: Candidate, rounds: u32 },
}

impl Outcome {
    pub fn candidate(&self) -> &Candidate {
        match self {
            Outcome::Accepted { candidate, .. } => candidate,
            Outcome::Exhausted { best, .. } => best,
        }
    }

    pub fn into_candidate(self) -> Candidate {
        match self {
            Outcome::Accepted { candidate, .. } => candidate,
            Outcome::Exhausted { best, .. } => best,
        }
    }

    pub fn rounds(&self) -> u32 {
        match self {
            Outcome::Accepted { rounds, .. } | Outcome::Exhausted { rounds, .. } => *rounds,
        }
    }

    pub fn kind(&self) -> OutcomeKind {
        match self {
            Outcome::Accepted { .. } => OutcomeKind::Accepted,
            Outcome::Exhausted { .. } => OutcomeKind::Exhausted,
        }
    }
}

/// Working state of one run; dropped when the run returns
#[derive(Debug, Clone, Default)]
pub struct RefinementState {
    pub query: String,
    pub evidence: Vec<EvidenceItem>,
    pub answer: String,
    pub round: u32,
    pub groundedness: Option<Verdict>,
    pub precision: Option<Verdict>,
}

/// What the next round starts with
enum NextStep {
    Retrieve,
    Revise { gap: String },
}

/// Collaborators injected into the controller
#[derive(Clone)]
pub struct Collaborators {
    pub expander: Arc<dyn QueryExpander>,
    pub refiner: Arc<dyn QueryRefiner>,
    pub retriever: Arc<dyn Retriever>,
    pub generator: Arc<dyn Generator>,
    pub groundedness: Arc<dyn Critic>,
    pub precision: Arc<dyn Critic>,
}

/// Bounded refinement state machine
pub struct RefinementController {
    parts: Collaborators,
    retry: RetryPolicy,
    max_rounds: u32,
}

impl RefinementController {
    pub fn new(parts: Collaborators, retry: RetryPolicy, max_rounds: u32) -> Self {
        Self {
            parts,
            retry,
            max_rounds: max_rounds.max(1),
        }
    }

    pub fn max_rounds(&self) -> u32 {
        self.max_rounds
    }

    /// Turn a user query into an accepted or best-effort answer
    pub async fn run(&self, original_query: &str, memory: &MemoryContext) -> Outcome {
        let started = Instant::now();
        let mut state = RefinementState {
            query: self.expand(original_query).await,
            ..RefinementState::default()
        };
        let mut next = NextStep::Retrieve;
        let mut best: Option<Candidate> = None;

        loop {
            state.round += 1;
            let round = state.round;

            state.answer = match std::mem::replace(&mut next, NextStep::Retrieve) {
                NextStep::Retrieve => {
                    state.evidence = self.retrieve(&state.query).await;
                    if state.evidence.is_empty() {
                        INSUFFICIENT_EVIDENCE_ANSWER.to_string()
                    } else {
                        self.produce(&state.query, &state.evidence, memory).await
                    }
                }
                NextStep::Revise { gap } => {
                    self.revise(&state.query, &state.evidence, &state.answer, &gap, memory)
                        .await
                }
            };

            let (groundedness, precision) =
                self.evaluate(&state.answer, &state.evidence, original_query).await;
            state.groundedness = Some(groundedness.clone());
            state.precision = Some(precision.clone());

            info!(
                round,
                groundedness = groundedness.value,
                precision = precision.value,
                evidence = state.evidence.len(),
                "Refinement round evaluated"
            );

            let candidate = Candidate {
                answer: state.answer.clone(),
                query: state.query.clone(),
                evidence: state.evidence.clone(),
                groundedness: groundedness.clone(),
                precision: precision.clone(),
                round,
            };

            if groundedness.passed && precision.passed {
                metrics::record_refinement("accepted", round);
                info!(round, elapsed_ms = started.elapsed().as_millis() as u64, "Candidate accepted");
                return Outcome::Accepted {
                    candidate,
                    rounds: round,
                };
            }

            let leader = match best.take() {
                Some(incumbent) if !candidate.better_than(&incumbent) => incumbent,
                _ => candidate,
            };

            if round >= self.max_rounds {
                metrics::record_refinement("exhausted", round);
                info!(
                    rounds = round,
                    best_round = leader.round,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Round budget exhausted"
                );
                return Outcome::Exhausted {
                    best: leader,
                    rounds: round,
                };
            }
            best = Some(leader);

            next = if !precision.passed || state.evidence.is_empty() {
                let feedback = if state.evidence.is_empty() && precision.gap.is_empty() {
                    "No passages matched the previous query; broaden it with related terms"
                } else {
                    precision.gap.as_str()
                };
                state.query = self.refine(original_query, &state.query, feedback).await;
                NextStep::Retrieve
            } else {
                NextStep::Revise {
                    gap: groundedness.gap.clone(),
                }
            };
        }
    }

    async fn expand(&self, query: &str) -> String {
        match self.retry.bounded("expansion", self.parts.expander.expand(query)).await {
            Ok(expanded) if !expanded.trim().is_empty() => expanded,
            Ok(_) => query.to_string(),
            Err(e) => {
                warn!(error = %e, "Query expansion failed, using original query");
                query.to_string()
            }
        }
    }

    async fn refine(&self, original: &str, current: &str, feedback: &str) -> String {
        match self
            .retry
            .bounded("refinement", self.parts.refiner.refine(original, current, feedback))
            .await
        {
            Ok(refined) if !refined.trim().is_empty() => {
                debug!(previous = %current, refined = %refined, "Retrieval query refined");
                refined
            }
            Ok(_) => current.to_string(),
            Err(e) => {
                warn!(error = %e, "Query refinement failed, keeping current query");
                current.to_string()
            }
        }
    }

    async fn retrieve(&self, query: &str) -> Vec<EvidenceItem> {
        let retriever = &self.parts.retriever;
        match self.retry.run("retrieval", || retriever.fetch(query)).await {
            Ok(evidence) => evidence,
            Err(e) => {
                warn!(error = %e, backend = retriever.name(), "Evidence unavailable after retries");
                Vec::new()
            }
        }
    }

    async fn produce(&self, query: &str, evidence: &[EvidenceItem], memory: &MemoryContext) -> String {
        let generator = &self.parts.generator;
        let result = self
            .retry
            .run("generation", || generator.produce(query, evidence, memory))
            .await;
        Self::answer_or_apology(result)
    }

    async fn revise(
        &self,
        query: &str,
        evidence: &[EvidenceItem],
        previous: &str,
        gap: &str,
        memory: &MemoryContext,
    ) -> String {
        let generator = &self.parts.generator;
        let result = self
            .retry
            .run("generation", || generator.revise(query, evidence, previous, gap, memory))
            .await;
        Self::answer_or_apology(result)
    }

    fn answer_or_apology(result: crate::errors::Result<String>) -> String {
        match result {
            Ok(answer) if !answer.trim().is_empty() => answer,
            Ok(_) => {
                warn!("Generator returned an empty answer");
                GENERATION_UNAVAILABLE_ANSWER.to_string()
            }
            Err(e) => {
                warn!(error = %e, "Generation unavailable after retries");
                GENERATION_UNAVAILABLE_ANSWER.to_string()
            }
        }
    }

    /// Score with both critics; an evaluator error is a failing 0.0 verdict
    async fn evaluate(
        &self,
        answer: &str,
        evidence: &[EvidenceItem],
        original_query: &str,
    ) -> (Verdict, Verdict) {
        let groundedness = &self.parts.groundedness;
        let precision = &self.parts.precision;

        let (g, p) = tokio::join!(
            self.retry.bounded(
                groundedness.name(),
                groundedness.score(answer, Reference::Evidence(evidence))
            ),
            self.retry.bounded(
                precision.name(),
                precision.score(answer, Reference::Query(original_query))
            ),
        );

        let fail_closed = |critic: &dyn Critic, result: crate::errors::Result<Verdict>| {
            result.unwrap_or_else(|e| {
                warn!(critic = critic.name(), error = %e, "Critic failed, scoring 0");
                Verdict::failed(format!("{} could not be evaluated", critic.name()))
            })
        };

        (
            fail_closed(groundedness.as_ref(), g),
            fail_closed(precision.as_ref(), p),
        )
    }
}
