use serde::{Deserialize, Serialize};

use crate::document::{Document, NodeId};

/// Lookups the observer needs from the document, kept behind a trait so the
/// card marker can change without touching the pipeline.
pub trait CardLocator: Send + Sync {
    fn matches_marker(&self, document: &Document, node: NodeId) -> bool;

    fn find_descendant_markers(&self, document: &Document, node: NodeId) -> Vec<NodeId> {
        document
            .descendants(node)
            .into_iter()
            .filter(|&candidate| self.matches_marker(document, candidate))
            .collect()
    }
}

/// `[attribute="value"]`, or `[attribute]` when `value` is absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSelector {
    pub attribute: String,
    #[serde(default)]
    pub value: Option<String>,
}

impl AttributeSelector {
    pub fn new(attribute: &str, value: &str) -> Self {
        Self {
            attribute: attribute.to_string(),
            value: Some(value.to_string()),
        }
    }

    pub fn menu_item_card() -> Self {
        Self::new("data-cy", "menu_item_card")
    }

    pub fn first_match(&self, document: &Document, scope: NodeId) -> Option<NodeId> {
        document
            .descendants(scope)
            .into_iter()
            .find(|&node| self.matches_marker(document, node))
    }
}

impl CardLocator for AttributeSelector {
    fn matches_marker(&self, document: &Document, node: NodeId) -> bool {
        match (document.attribute(node, &self.attribute), &self.value) {
            (Some(actual), Some(expected)) => actual == expected,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}
