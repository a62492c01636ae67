//! Scoreable critics
//!
//! A critic scores a candidate answer against a reference (the evidence set
//! or the user query) and reports a normalized 0.0 - 1.0 value, whether it
//! meets the critic's threshold, and a short gap description the
//! refinement step can act on.

use crate::errors::{AppError, Result};
use crate::llm::{ChatModel, Completion};
use crate::models::EvidenceItem;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// What a candidate is judged against
#[derive(Debug, Clone, Copy)]
pub enum Reference<'a> {
    Evidence(&'a [EvidenceItem]),
    Query(&'a str),
}

/// Critic output
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Verdict {
    /// Normalized score (0.0 - 1.0)
    pub value: f32,
    pub passed: bool,
    /// What the candidate is missing; empty when nothing to add
    pub gap: String,
}

impl Verdict {
    pub fn new(value: f32, threshold: f32, gap: impl Into<String>) -> Self {
        let value = value.clamp(0.0, 1.0);
        Self {
            value,
            passed: value >= threshold,
            gap: gap.into(),
        }
    }

    /// Failing verdict used when a critic cannot produce a score
    pub fn failed(gap: impl Into<String>) -> Self {
        Self {
            value: 0.0,
            passed: false,
            gap: gap.into(),
        }
    }
}

/// Trait for answer critics
#[async_trait]
pub trait Critic: Send + Sync {
    /// Short name used in logs and metrics
    fn name(&self) -> &'static str;

    /// Pass threshold on the normalized scale
    fn threshold(&self) -> f32;

    async fn score(&self, candidate: &str, reference: Reference<'_>) -> Result<Verdict>;
}

const GROUNDEDNESS_SYSTEM: &str = "You assess how well a response is supported by retrieved context.

Break the response into distinct claims and check each one against the context. \
Count direct support and reasonable inferences as supported. Weigh the severity of \
unsupported claims, how central they are to the response, and any contradiction \
with the context. A response that states the context is insufficient makes no \
unsupported claims.

Reply with JSON only: {\"score\": <0-10>, \"gap\": \"<unsupported claims or missing support, empty if none>\"}";

const PRECISION_SYSTEM: &str = "You assess how precisely a response addresses a nutrition question.

Identify the core information request, its explicit and implicit constraints and \
each distinct component of the question. Then check that the response answers every \
component directly, at the right depth, without tangential content.

Reply with JSON only: {\"score\": <0-10>, \"gap\": \"<parts of the question left unanswered or off-topic content, empty if none>\"}";

#[derive(Debug, Deserialize)]
struct Judgement {
    score: f32,
    #[serde(default)]
    gap: Option<String>,
}

/// Extract the JSON object from a reply (tolerates surrounding prose and code fences)
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (start < end).then(|| &text[start..=end])
}

fn first_number() -> Option<&'static regex_lite::Regex> {
    static NUMBER: OnceLock<Option<regex_lite::Regex>> = OnceLock::new();
    NUMBER
        .get_or_init(|| regex_lite::Regex::new(r"\d+(?:\.\d+)?").ok())
        .as_ref()
}

/// Parse a judge reply into a 0-10 score and a gap description
///
/// Falls back to the first number in the reply when the model ignored the
/// JSON instruction.
pub(crate) fn parse_judgement(reply: &str) -> Option<(f32, String)> {
    if let Some(parsed) = extract_json(reply).and_then(|json| serde_json::from_str::<Judgement>(json).ok()) {
        return Some((parsed.score, parsed.gap.unwrap_or_default()));
    }

    let score = first_number()?.find(reply)?.as_str().parse::<f32>().ok()?;
    Some((score, String::new()))
}

async fn judge(model: &dyn ChatModel, judged_by: &dyn Critic, system: &str, user: String) -> Result<Verdict> {
    let critic = judged_by.name();
    let threshold = judged_by.threshold();
    let reply = model
        .complete(Completion::new(system, user).temperature(0.0).max_tokens(200))
        .await?;

    let (raw, gap) = parse_judgement(&reply).ok_or_else(|| {
        warn!(critic, reply = %reply, "Unparseable critic reply");
        AppError::upstream(critic, "Critic reply carried no score")
    })?;

    let verdict = Verdict::new(raw / 10.0, threshold, gap);
    debug!(critic, raw, value = verdict.value, passed = verdict.passed, "Candidate scored");
    Ok(verdict)
}

/// Scores whether an answer's claims are supported by the evidence set
pub struct GroundednessEvaluator {
    model: Arc<dyn ChatModel>,
    threshold: f32,
}

impl GroundednessEvaluator {
    pub fn new(model: Arc<dyn ChatModel>, threshold: f32) -> Self {
        Self { model, threshold }
    }
}

#[async_trait]
impl Critic for GroundednessEvaluator {
    fn name(&self) -> &'static str {
        "groundedness"
    }

    fn threshold(&self) -> f32 {
        self.threshold
    }

    async fn score(&self, candidate: &str, reference: Reference<'_>) -> Result<Verdict> {
        let Reference::Evidence(evidence) = reference else {
            return Err(AppError::Internal {
                message: "groundedness is judged against evidence".to_string(),
            });
        };

        if evidence.is_empty() {
            return Ok(Verdict::failed("No evidence was retrieved for this question"));
        }

        let context = evidence
            .iter()
            .map(EvidenceItem::render)
            .collect::<Vec<_>>()
            .join("\n\n");
        let user = format!("Context:\n{}\n\nResponse:\n{}", context, candidate);

        judge(self.model.as_ref(), self, GROUNDEDNESS_SYSTEM, user).await
    }
}

/// Scores whether an answer addresses the user's actual question
pub struct PrecisionEvaluator {
    model: Arc<dyn ChatModel>,
    threshold: f32,
}

impl PrecisionEvaluator {
    pub fn new(model: Arc<dyn ChatModel>, threshold: f32) -> Self {
        Self { model, threshold }
    }
}

#[async_trait]
impl Critic for PrecisionEvaluator {
    fn name(&self) -> &'static str {
        "precision"
    }

    fn threshold(&self) -> f32 {
        self.threshold
    }

    async fn score(&self, candidate: &str, reference: Reference<'_>) -> Result<Verdict> {
        let Reference::Query(query) = reference else {
            return Err(AppError::Internal {
                message: "precision is judged against the query".to_string(),
            });
        };

        let user = format!("Query: {}\n\nResponse:\n{}", query, candidate);
        judge(self.model.as_ref(), self, PRECISION_SYSTEM, user).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedModel;

    fn evidence() -> Vec<EvidenceItem> {
        vec![EvidenceItem {
            document_id: "lipids.pdf".to_string(),
            locator: "p. 4".to_string(),
            content_type: Default::default(),
            text: "Limit saturated fat and trans fat to lower LDL cholesterol.".to_string(),
            rank: 1,
            score: None,
        }]
    }

    #[test]
    fn test_parse_json_judgement() {
        let (score, gap) =
            parse_judgement("```json\n{\"score\": 6, \"gap\": \"no mention of fibre\"}\n```").unwrap();
        assert_eq!(score, 6.0);
        assert_eq!(gap, "no mention of fibre");
    }

    #[test]
    fn test_parse_bare_number() {
        let (score, gap) = parse_judgement("Precision score: 7.5").unwrap();
        assert_eq!(score, 7.5);
        assert!(gap.is_empty());
        assert!(parse_judgement("no idea").is_none());
    }

    #[test]
    fn test_verdict_clamps_and_applies_threshold() {
        let verdict = Verdict::new(1.3, 0.7, "");
        assert_eq!(verdict.value, 1.0);
        assert!(verdict.passed);
        assert!(!Verdict::new(0.69, 0.7, "").passed);
    }

    #[tokio::test]
    async fn test_groundedness_normalizes_score() {
        let model = Arc::new(ScriptedModel::new().reply(r#"{"score": 9, "gap": ""}"#));
        let critic = GroundednessEvaluator::new(model.clone(), 0.7);

        let verdict = critic
            .score("Cut saturated fat.", Reference::Evidence(&evidence()))
            .await
            .unwrap();

        assert!((verdict.value - 0.9).abs() < 1e-6);
        assert!(verdict.passed);
        assert!(model.prompt(0).contains("lipids.pdf"));
    }

    #[tokio::test]
    async fn test_groundedness_without_evidence_skips_model() {
        let model = Arc::new(ScriptedModel::new());
        let critic = GroundednessEvaluator::new(model.clone(), 0.7);

        let verdict = critic.score("anything", Reference::Evidence(&[])).await.unwrap();

        assert_eq!(verdict.value, 0.0);
        assert!(!verdict.passed);
        assert_eq!(model.calls(), 0);
    }

    #[tokio::test]
    async fn test_precision_reports_gap() {
        let model = Arc::new(
            ScriptedModel::new().reply(r#"{"score": 4, "gap": "does not list foods to avoid"}"#),
        );
        let critic = PrecisionEvaluator::new(model, 0.7);

        let verdict = critic
            .score("Cholesterol is a lipid.", Reference::Query("foods to avoid with high cholesterol"))
            .await
            .unwrap();

        assert!(!verdict.passed);
        assert_eq!(verdict.gap, "does not list foods to avoid");
    }

    #[tokio::test]
    async fn test_configured_threshold_decides_pass() {
        let strict = PrecisionEvaluator::new(Arc::new(ScriptedModel::new().reply(r#"{"score": 8}"#)), 0.9);
        assert_eq!(strict.threshold(), 0.9);
        let verdict = strict.score("answer", Reference::Query("q")).await.unwrap();
        assert!(!verdict.passed);

        let lenient = PrecisionEvaluator::new(Arc::new(ScriptedModel::new().reply("score: 8")), 0.5);
        let verdict = lenient.score("answer", Reference::Query("q")).await.unwrap();
        assert!(verdict.passed);
    }

    #[test]
    fn test_number_fallback_is_reused() {
        assert!(std::ptr::eq(first_number().unwrap(), first_number().unwrap()));
        assert_eq!(parse_judgement("I'd say 3 out of 10").unwrap().0, 3.0);
        assert_eq!(parse_judgement("roughly 8.5").unwrap().0, 8.5);
    }

    #[tokio::test]
    async fn test_wrong_reference_is_rejected() {
        let critic = PrecisionEvaluator::new(Arc::new(ScriptedModel::new()), 0.7);
        assert!(critic.score("a", Reference::Evidence(&[])).await.is_err());
    }
}
