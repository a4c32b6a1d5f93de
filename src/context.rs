//! Projection of ranked pages into the passages handed to the LLM
//! grounding collaborator.

use serde::Serialize;

use crate::{retrieval::RankedPage, snippet::truncate_chars};

/// One grounding passage. Carries the final score only; the individual
/// ranking factors stay internal.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextPassage {
    pub filename: String,
    pub page: u32,
    pub equipment: String,
    pub doc_class: String,
    pub content: String,
    pub authority_label: String,
    pub score: f32,
}

impl ContextPassage {
    pub fn from_ranked(ranked: &RankedPage, max_chars: usize) -> Self {
        let hit = &ranked.hit;
        Self {
            filename: hit.filename.clone(),
            page: hit.page,
            equipment: hit.equipment.clone(),
            doc_class: hit.doc_class.clone(),
            content: truncate_chars(&ranked.content, max_chars),
            authority_label: hit.authority_label().to_string(),
            score: hit.score,
        }
    }
}

/// Map an already ranked and paginated list, keeping its order.
pub fn to_context(ranked: &[RankedPage], max_chars: usize) -> Vec<ContextPassage> {
    ranked
        .iter()
        .map(|r| ContextPassage::from_ranked(r, max_chars))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Authority, SearchHit};

    fn ranked(filename: &str, score: f32, authority: Option<Authority>) -> RankedPage {
        RankedPage {
            hit: SearchHit {
                filename: filename.to_string(),
                equipment: "c18".to_string(),
                doc_class: "testing".to_string(),
                page: 4,
                base_score: 1.0,
                tags: vec!["fuel system".to_string()],
                score,
                snippet: "<mark>valve</mark>".to_string(),
                authority,
            },
            content: "Valve lash adjustment procedure in full.".to_string(),
        }
    }

    #[test]
    fn projection_keeps_order_and_fields() {
        let pages = vec![
            ranked("a.pdf", 3.0, Some(Authority::Primary)),
            ranked("b.pdf", 1.0, None),
        ];
        let passages = to_context(&pages, 2000);

        assert_eq!(passages.len(), 2);
        assert_eq!(passages[0].filename, "a.pdf");
        assert_eq!(passages[0].page, 4);
        assert_eq!(passages[0].authority_label, "primary");
        assert_eq!(passages[0].score, 3.0);
        assert_eq!(passages[0].content, "Valve lash adjustment procedure in full.");
        assert_eq!(passages[1].authority_label, "unset");
    }

    #[test]
    fn content_is_plain_and_bounded() {
        let passages = to_context(&[ranked("a.pdf", 1.0, None)], 5);
        assert_eq!(passages[0].content, "Valve");
    }

    #[test]
    fn serialized_passage_has_fixed_schema() {
        let passage = ContextPassage::from_ranked(&ranked("a.pdf", 1.0, None), 100);
        let value = serde_json::to_value(&passage).unwrap();
        let mut keys: Vec<&str> = value
            .as_object()
            .unwrap()
            .keys()
            .map(String::as_str)
            .collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec![
                "authority_label",
                "content",
                "doc_class",
                "equipment",
                "filename",
                "page",
                "score"
            ]
        );
    }
}
