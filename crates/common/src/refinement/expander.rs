//! Query expansion and refinement
//!
//! Provides:
//! - Model-backed rewriting into retrieval-friendly clinical vocabulary
//! - Feedback-driven query refinement after a precision failure
//! - Deterministic dictionary expansion with nutrition synonyms
//!
//! Every implementation returns a non-empty string and only adds context;
//! the user's intent is never narrowed.

use crate::errors::Result;
use crate::llm::{ChatModel, Completion};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Rewrites the user's query before the first retrieval
#[async_trait]
pub trait QueryExpander: Send + Sync {
    async fn expand(&self, query: &str) -> Result<String>;
}

/// Rewrites the retrieval query using critic feedback
#[async_trait]
pub trait QueryRefiner: Send + Sync {
    /// `original` is the user's question, `current` the query used last round
    async fn refine(&self, original: &str, current: &str, feedback: &str) -> Result<String>;
}

const EXPAND_SYSTEM: &str = "You are a nutrition specialist preparing a search query for a library of \
clinical nutrition documents.

Rewrite the user's question using the terminology physicians and dietitians use: \
precise clinical terms, relevant biomarkers and established dietary frameworks. \
Keep every technical term and acronym from the original. Add context, never remove \
or narrow any part of the question.

Reply with the rewritten query only, on a single line.";

const REFINE_SYSTEM: &str = "You improve search queries for a library of clinical nutrition documents.

The previous query retrieved passages that led to an answer which missed part of the \
user's question. Using the feedback, write a better search query that covers the \
missing aspects while keeping the user's original intent and every term they used.

Reply with the new query only, on a single line.";

/// Drop a leading "1." / "2)" / "-" list marker
fn strip_list_marker(line: &str) -> &str {
    let rest = line.trim_start_matches(|c: char| c.is_ascii_digit());
    if rest.len() < line.len() {
        return match rest.strip_prefix('.').or_else(|| rest.strip_prefix(')')) {
            Some(after) if after.starts_with(' ') => after.trim_start(),
            _ => line,
        };
    }
    line.strip_prefix("- ")
        .or_else(|| line.strip_prefix("* "))
        .unwrap_or(line)
}

/// Normalize a model rewrite; empty output falls back to `fallback`
fn clean_rewrite(reply: &str, fallback: &str) -> String {
    let line = reply
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    let line = strip_list_marker(line).trim_matches('"').trim();

    if line.is_empty() {
        fallback.to_string()
    } else {
        line.to_string()
    }
}

/// Model-backed query expander
pub struct LlmQueryExpander {
    model: Arc<dyn ChatModel>,
}

impl LlmQueryExpander {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl QueryExpander for LlmQueryExpander {
    async fn expand(&self, query: &str) -> Result<String> {
        let reply = self
            .model
            .complete(Completion::new(EXPAND_SYSTEM, format!("Query: {}", query)).temperature(0.0))
            .await?;

        let expanded = clean_rewrite(&reply, query);
        debug!(original = %query, expanded = %expanded, "Query expanded");
        Ok(expanded)
    }
}

/// Model-backed query refiner
pub struct LlmQueryRefiner {
    model: Arc<dyn ChatModel>,
}

impl LlmQueryRefiner {
    pub fn new(model: Arc<dyn ChatModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl QueryRefiner for LlmQueryRefiner {
    async fn refine(&self, original: &str, current: &str, feedback: &str) -> Result<String> {
        let user = format!(
            "Original question: {}\nPrevious search query: {}\nFeedback: {}",
            original,
            current,
            if feedback.is_empty() { "none" } else { feedback }
        );

        let reply = self
            .model
            .complete(Completion::new(REFINE_SYSTEM, user).temperature(0.0))
            .await?;

        let refined = clean_rewrite(&reply, current);
        debug!(previous = %current, refined = %refined, "Query refined");
        Ok(refined)
    }
}

/// Dictionary expander with nutrition vocabulary
///
/// Appends synonyms of matched terms; never removes a word.
pub struct SynonymExpander {
    synonyms: HashMap<String, Vec<String>>,
    max_expansions: usize,
}

impl Default for SynonymExpander {
    fn default() -> Self {
        Self::new()
    }
}

impl SynonymExpander {
    pub fn new() -> Self {
        Self {
            synonyms: Self::load_default_synonyms(),
            max_expansions: 6,
        }
    }

    fn expansions(&self, text: &str, existing: &str) -> Vec<String> {
        let existing = existing.to_lowercase();
        let mut terms: Vec<String> = Vec::new();

        for word in text
            .split(|c: char| !c.is_alphanumeric() && c != '-')
            .filter(|w| !w.is_empty())
        {
            if let Some(syns) = self.synonyms.get(&word.to_lowercase()) {
                for syn in syns {
                    if !existing.contains(&syn.to_lowercase()) && !terms.contains(syn) {
                        terms.push(syn.clone());
                    }
                }
            }
        }

        terms.truncate(self.max_expansions);
        terms
    }

    fn append(base: &str, terms: &[String]) -> String {
        if terms.is_empty() {
            base.to_string()
        } else {
            format!("{} {}", base.trim(), terms.join(" "))
        }
    }

    fn load_default_synonyms() -> HashMap<String, Vec<String>> {
        let entries: &[(&str, &[&str])] = &[
            ("cholesterol", &["LDL", "HDL", "lipids", "hypercholesterolemia"]),
            ("fat", &["lipids", "saturated fat", "trans fat"]),
            ("fats", &["lipids", "saturated fat", "trans fat"]),
            ("sugar", &["glucose", "added sugars", "glycemic index"]),
            ("diabetes", &["glycemic control", "HbA1c", "insulin resistance"]),
            ("blood", &["serum"]),
            ("pressure", &["hypertension", "sodium intake"]),
            ("salt", &["sodium"]),
            ("weight", &["BMI", "obesity"]),
            ("obesity", &["BMI", "adiposity"]),
            ("fiber", &["dietary fibre", "soluble fiber"]),
            ("fibre", &["dietary fiber", "soluble fiber"]),
            ("protein", &["amino acids"]),
            ("anemia", &["iron deficiency", "hemoglobin", "ferritin"]),
            ("anaemia", &["iron deficiency", "hemoglobin", "ferritin"]),
            ("kidney", &["renal", "CKD"]),
            ("heart", &["cardiovascular", "CVD"]),
            ("vitamin", &["micronutrient"]),
            ("vitamins", &["micronutrients"]),
            ("malnutrition", &["undernutrition", "protein-energy malnutrition"]),
            ("celiac", &["gluten", "coeliac disease"]),
            ("gout", &["uric acid", "purines"]),
            ("ibs", &["irritable bowel syndrome", "FODMAP"]),
        ];

        entries
            .iter()
            .map(|(term, syns)| {
                (
                    term.to_string(),
                    syns.iter().map(|s| s.to_string()).collect(),
                )
            })
            .collect()
    }
}

#[async_trait]
impl QueryExpander for SynonymExpander {
    async fn expand(&self, query: &str) -> Result<String> {
        let terms = self.expansions(query, query);
        Ok(Self::append(query, &terms))
    }
}

#[async_trait]
impl QueryRefiner for SynonymExpander {
    async fn refine(&self, original: &str, current: &str, feedback: &str) -> Result<String> {
        let base = if current.trim().is_empty() { original } else { current };
        let source = format!("{} {}", original, feedback);
        let terms = self.expansions(&source, base);
        Ok(Self::append(base, &terms))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedModel;

    #[tokio::test]
    async fn test_synonyms_only_append() {
        let expander = SynonymExpander::new();
        let query = "foods to avoid with high cholesterol";

        let expanded = expander.expand(query).await.unwrap();

        assert!(expanded.starts_with(query));
        assert!(expanded.contains("LDL"));
        assert!(expanded.contains("lipids"));
    }

    #[tokio::test]
    async fn test_unmatched_query_is_unchanged() {
        let expander = SynonymExpander::new();
        assert_eq!(
            expander.expand("is quinoa gluten free").await.unwrap(),
            "is quinoa gluten free"
        );
    }

    #[tokio::test]
    async fn test_refine_uses_feedback_terms() {
        let expander = SynonymExpander::new();

        let refined = expander
            .refine("what should I eat", "what should I eat", "answer ignores kidney disease")
            .await
            .unwrap();

        assert!(refined.starts_with("what should I eat"));
        assert!(refined.contains("renal"));
    }

    #[test]
    fn test_clean_rewrite_strips_numbering() {
        assert_eq!(clean_rewrite("1. \"LDL dietary management\"\n2. other", "q"), "LDL dietary management");
        assert_eq!(clean_rewrite("2000 kcal diet plan", "q"), "2000 kcal diet plan");
        assert_eq!(clean_rewrite("   \n", "fallback"), "fallback");
    }

    #[tokio::test]
    async fn test_llm_expander_falls_back_on_empty_reply() {
        let model = Arc::new(ScriptedModel::new().reply("\"\""));
        let expander = LlmQueryExpander::new(model);

        assert_eq!(expander.expand("vitamin d dose").await.unwrap(), "vitamin d dose");
    }

    #[tokio::test]
    async fn test_llm_refiner_sends_feedback() {
        let model = Arc::new(ScriptedModel::new().reply("dietary sources of saturated and trans fats raising LDL"));
        let refiner = LlmQueryRefiner::new(model.clone());

        let refined = refiner
            .refine(
                "foods to avoid with high cholesterol",
                "hypercholesterolemia diet",
                "does not list foods to avoid",
            )
            .await
            .unwrap();

        assert_eq!(refined, "dietary sources of saturated and trans fats raising LDL");
        assert!(model.prompt(0).contains("does not list foods to avoid"));
    }
}
