//! Retrieved evidence passages

use serde::{Deserialize, Serialize};

/// Kind of content a passage was extracted from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    #[default]
    Text,
    Table,
}

/// A passage returned by retrieval for one round
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvidenceItem {
    /// Source document identifier
    pub document_id: String,

    /// Page or section locator inside the document
    #[serde(default)]
    pub locator: String,

    /// Content type tag
    #[serde(default)]
    pub content_type: ContentType,

    /// Raw passage text
    pub text: String,

    /// 1-based relevance rank within the evidence set
    pub rank: usize,

    /// Raw similarity score reported by the search service
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

impl EvidenceItem {
    /// Render the passage with its provenance for prompting
    pub fn render(&self) -> String {
        let kind = match self.content_type {
            ContentType::Text => "text",
            ContentType::Table => "table",
        };
        if self.locator.is_empty() {
            format!("[{}] ({}, {})\n{}", self.rank, self.document_id, kind, self.text)
        } else {
            format!(
                "[{}] ({}, {}, {})\n{}",
                self.rank, self.document_id, self.locator, kind, self.text
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_provenance() {
        let item = EvidenceItem {
            document_id: "dietary-guidelines.pdf".to_string(),
            locator: "p. 12".to_string(),
            content_type: ContentType::Table,
            text: "Saturated fat < 10% of calories".to_string(),
            rank: 1,
            score: Some(0.82),
        };

        let rendered = item.render();
        assert!(rendered.starts_with("[1] (dietary-guidelines.pdf, p. 12, table)"));
        assert!(rendered.ends_with("Saturated fat < 10% of calories"));
    }

    #[test]
    fn test_deserialize_defaults() {
        let item: EvidenceItem = serde_json::from_str(
            r#"{"document_id": "doc", "text": "Oats contain beta-glucan.", "rank": 2}"#,
        )
        .unwrap();

        assert_eq!(item.content_type, ContentType::Text);
        assert!(item.locator.is_empty());
        assert!(item.score.is_none());
    }
}
