use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde::Serialize;

use crate::document::{Document, NodeId, SharedDocument};
use crate::domain::OptionGroup;
use crate::error::MbtError;

pub const SLOT_CLASS: &str = "mbt-mod-tag-container";
pub const EMPTY_CLASS: &str = "mbt-mod-tag-container--empty";
pub const ERROR_CLASS: &str = "mbt-mod-tag-container--error";
pub const BADGE_CLASS: &str = "mbt-mod-tag";
pub const DISABLED_BADGE_CLASS: &str = "mbt-mod-tag--disabled";
pub const STATE_ATTRIBUTE: &str = "data-mbt-state";

pub const LOADING_TEXT: &str = "Loading modifiers…";
pub const EMPTY_TEXT: &str = "No modifiers";
pub const ERROR_TEXT: &str = "Tags: error";

const SLOT_STYLE: &str = "margin-top:-0.5rem;padding-bottom:1rem;padding-left:1rem;display:flex;\
                          flex-wrap:wrap;gap:4px;font-size:11px;align-items:center";
const BADGE_STYLE: &str = "border:1px solid rgba(0,0,0,0.2);border-radius:9999px;padding:1px 6px;\
                           background:#f5f5f5;white-space:nowrap";
const DISABLED_BADGE_STYLE: &str = "border:1px dashed rgba(0,0,0,0.2);border-radius:9999px;\
                                    padding:1px 6px;background:#fafafa;color:#9e9e9e;\
                                    text-decoration:line-through;white-space:nowrap";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "groups", rename_all = "lowercase")]
pub enum CardAnnotationState {
    Idle,
    Loading,
    Rendered(Vec<OptionGroup>),
    Empty,
    Error,
}

/// "Min: 1 • Max: 3", only for the bounds that are present.
pub fn range_hint(group: &OptionGroup) -> String {
    let mut parts = Vec::new();
    if let Some(min) = group.min_selections {
        parts.push(format!("Min: {min}"));
    }
    if let Some(max) = group.max_selections {
        parts.push(format!("Max: {max}"));
    }
    parts.join(" • ")
}

/// Owns the annotation slot of every card it has touched.
pub struct CardRenderer {
    document: SharedDocument,
    anchor_class: String,
    states: Mutex<HashMap<NodeId, CardAnnotationState>>,
}

impl CardRenderer {
    pub fn new(document: SharedDocument, anchor_class: &str) -> Self {
        Self {
            document,
            anchor_class: anchor_class.to_string(),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, card: NodeId) -> CardAnnotationState {
        self.lock()
            .get(&card)
            .cloned()
            .unwrap_or(CardAnnotationState::Idle)
    }

    /// Enters Loading, reusing the card's slot or creating it under the anchor.
    pub fn begin(&self, card: NodeId) -> Result<NodeId, MbtError> {
        let slot = self.document.write(|document| {
            let slot = match find_slot(document, card) {
                Some(slot) => slot,
                None => {
                    let anchor = document
                        .descendants(card)
                        .into_iter()
                        .find(|&node| document.has_class(node, &self.anchor_class))
                        .unwrap_or(card);
                    let slot = document.create_element("div");
                    document.add_class(slot, SLOT_CLASS)?;
                    document.append_child(anchor, slot)?;
                    slot
                }
            };
            document.remove_class(slot, EMPTY_CLASS)?;
            document.remove_class(slot, ERROR_CLASS)?;
            document.set_attribute(slot, "style", SLOT_STYLE)?;
            document.set_text(slot, LOADING_TEXT)?;
            document.set_attribute(slot, STATE_ATTRIBUTE, "loading")?;
            Ok::<_, MbtError>(slot)
        })?;
        self.set_state(card, CardAnnotationState::Loading);
        Ok(slot)
    }

    /// Leaves Loading for Empty or Rendered depending on `groups`.
    pub fn finish(
        &self,
        card: NodeId,
        groups: &[OptionGroup],
    ) -> Result<CardAnnotationState, MbtError> {
        let state = self.document.write(|document| {
            let slot = find_slot(document, card).ok_or_else(|| {
                MbtError::Render(format!("annotation slot for card {card} disappeared"))
            })?;
            document.set_text(slot, "")?;

            if groups.is_empty() {
                document.set_text(slot, EMPTY_TEXT)?;
                document.add_class(slot, EMPTY_CLASS)?;
                document.set_attribute(slot, "style", &format!("{SLOT_STYLE};opacity:0.6"))?;
                document.set_attribute(slot, STATE_ATTRIBUTE, "empty")?;
                return Ok::<_, MbtError>(CardAnnotationState::Empty);
            }

            let mut badges = Vec::with_capacity(groups.len());
            for group in groups {
                let Some(name) = group.name.as_deref().filter(|name| !name.is_empty()) else {
                    continue;
                };
                let badge = document.create_element("span");
                document.add_class(badge, BADGE_CLASS)?;
                if group.enabled {
                    document.set_attribute(badge, "style", BADGE_STYLE)?;
                } else {
                    document.add_class(badge, DISABLED_BADGE_CLASS)?;
                    document.set_attribute(badge, "style", DISABLED_BADGE_STYLE)?;
                }
                document.set_text(badge, name)?;
                let hint = range_hint(group);
                if !hint.is_empty() {
                    document.set_attribute(badge, "title", &hint)?;
                }
                badges.push(badge);
            }
            document.append_children(slot, &badges)?;
            document.set_attribute(slot, STATE_ATTRIBUTE, "rendered")?;
            Ok(CardAnnotationState::Rendered(groups.to_vec()))
        })?;
        self.set_state(card, state.clone());
        Ok(state)
    }

    /// Enters Error. Best effort: a card without a slot keeps only the recorded state.
    pub fn fail(&self, card: NodeId) -> CardAnnotationState {
        let painted = self.document.write(|document| {
            let slot = find_slot(document, card)?;
            document.set_text(slot, ERROR_TEXT).ok()?;
            document.add_class(slot, ERROR_CLASS).ok()?;
            document
                .set_attribute(slot, "style", &format!("{SLOT_STYLE};opacity:0.7"))
                .ok()?;
            document.set_attribute(slot, STATE_ATTRIBUTE, "error").ok()
        });
        if painted.is_none() {
            tracing::error!(%card, "could not paint error badge: no annotation slot");
        }
        self.set_state(card, CardAnnotationState::Error);
        CardAnnotationState::Error
    }

    fn set_state(&self, card: NodeId, state: CardAnnotationState) {
        self.lock().insert(card, state);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<NodeId, CardAnnotationState>> {
        self.states
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn find_slot(document: &Document, card: NodeId) -> Option<NodeId> {
    document
        .descendants(card)
        .into_iter()
        .find(|&node| document.has_class(node, SLOT_CLASS))
}
