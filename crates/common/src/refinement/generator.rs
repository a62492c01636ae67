//! Answer generation over retrieved evidence

use crate::errors::Result;
use crate::llm::{ChatModel, Completion};
use crate::memory::MemoryContext;
use crate::models::EvidenceItem;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Produces candidate answers from a query and its evidence set
#[async_trait]
pub trait Generator: Send + Sync {
    /// Fresh answer for this round's evidence
    async fn produce(
        &self,
        query: &str,
        evidence: &[EvidenceItem],
        memory: &MemoryContext,
    ) -> Result<String>;

    /// Rewrite a previous answer against the same evidence, closing `gap`
    async fn revise(
        &self,
        query: &str,
        evidence: &[EvidenceItem],
        previous: &str,
        gap: &str,
        memory: &MemoryContext,
    ) -> Result<String>;
}

const GENERATION_SYSTEM: &str = "You are a caring and knowledgeable nutrition support assistant. \
You answer questions about nutrition disorders using only the provided context.

When responding:
1. Base your answer solely on the provided context; never add general knowledge.
2. Cite sources with the document name and locator in parentheses, e.g. (guidelines.pdf, p. 23).
3. Use quotation marks for direct quotes and cite them.
4. If several passages are relevant, cite all of them.
5. If the context covers only part of the question, say which parts you can and cannot address.
6. If the context cannot answer the question at all, reply: \"I don't have sufficient information in the provided context to answer this question.\"
7. Keep a professional, empathetic tone and structure longer answers with short paragraphs or bullet points.
8. Use previous interactions only to personalize the answer, never as a source of facts.";

/// Chat-model backed generator
pub struct LlmGenerator {
    model: Arc<dyn ChatModel>,
    temperature: f32,
    max_tokens: u32,
}

impl LlmGenerator {
    pub fn new(model: Arc<dyn ChatModel>, temperature: f32, max_tokens: u32) -> Self {
        Self {
            model,
            temperature,
            max_tokens,
        }
    }

    fn build_prompt(query: &str, evidence: &[EvidenceItem], memory: &MemoryContext) -> String {
        let context = evidence
            .iter()
            .map(EvidenceItem::render)
            .collect::<Vec<_>>()
            .join("\n\n");

        let mut prompt = format!("Query: {}\n\nContext:\n{}", query, context);
        if !memory.is_empty() {
            prompt.push_str("\n\n");
            prompt.push_str(&memory.render());
        }
        prompt
    }

    async fn complete(&self, user: String) -> Result<String> {
        self.model
            .complete(
                Completion::new(GENERATION_SYSTEM, user)
                    .temperature(self.temperature)
                    .max_tokens(self.max_tokens),
            )
            .await
    }
}

#[async_trait]
impl Generator for LlmGenerator {
    async fn produce(
        &self,
        query: &str,
        evidence: &[EvidenceItem],
        memory: &MemoryContext,
    ) -> Result<String> {
        debug!(passages = evidence.len(), "Generating answer");
        self.complete(Self::build_prompt(query, evidence, memory)).await
    }

    async fn revise(
        &self,
        query: &str,
        evidence: &[EvidenceItem],
        previous: &str,
        gap: &str,
        memory: &MemoryContext,
    ) -> Result<String> {
        debug!(passages = evidence.len(), "Revising answer");
        let mut prompt = Self::build_prompt(query, evidence, memory);
        prompt.push_str(&format!(
            "\n\nPrevious answer:\n{}\n\nFeedback: {}\n\nRewrite the answer so every claim is supported by the context above.",
            previous,
            if gap.is_empty() { "some claims are not supported by the context" } else { gap }
        ));
        self.complete(prompt).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::testing::ScriptedModel;
    use crate::models::ContentType;

    fn evidence() -> Vec<EvidenceItem> {
        vec![EvidenceItem {
            document_id: "gout.pdf".to_string(),
            locator: "p. 9".to_string(),
            content_type: ContentType::Text,
            text: "Organ meats and shellfish are high in purines.".to_string(),
            rank: 1,
            score: Some(0.7),
        }]
    }

    #[tokio::test]
    async fn test_produce_prompt_carries_evidence_and_memory() {
        let model = Arc::new(ScriptedModel::new().reply("Avoid organ meats (gout.pdf, p. 9)."));
        let generator = LlmGenerator::new(model.clone(), 0.2, 400);
        let memory = MemoryContext::new(vec!["User follows a pescatarian diet".to_string()]);

        let answer = generator
            .produce("what to avoid with gout", &evidence(), &memory)
            .await
            .unwrap();

        assert_eq!(answer, "Avoid organ meats (gout.pdf, p. 9).");
        let prompt = model.prompt(0);
        assert!(prompt.contains("gout.pdf, p. 9"));
        assert!(prompt.contains("pescatarian"));
        assert!(!prompt.contains("Previous answer"));
    }

    #[tokio::test]
    async fn test_revise_includes_previous_answer_and_gap() {
        let model = Arc::new(ScriptedModel::new().reply("revised"));
        let generator = LlmGenerator::new(model.clone(), 0.2, 400);

        generator
            .revise(
                "what to avoid with gout",
                &evidence(),
                "Avoid beer and coffee.",
                "coffee is not mentioned in the context",
                &MemoryContext::default(),
            )
            .await
            .unwrap();

        let prompt = model.prompt(0);
        assert!(prompt.contains("Avoid beer and coffee."));
        assert!(prompt.contains("coffee is not mentioned in the context"));
        assert!(!prompt.contains("Previous relevant interactions"));
    }
}
