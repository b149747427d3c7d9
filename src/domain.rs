use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::MbtError;

static CARD_IDENTITY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+)-item$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(u64);

impl ItemId {
    pub fn new(value: u64) -> Option<Self> {
        (value > 0).then_some(Self(value))
    }

    pub fn get(self) -> u64 {
        self.0
    }

    /// Parses a card identity attribute such as `482-item`.
    pub fn from_card_identity(identity: &str) -> Option<Self> {
        let captures = CARD_IDENTITY.captures(identity)?;
        captures
            .get(1)
            .and_then(|digits| digits.as_str().parse::<u64>().ok())
            .and_then(Self::new)
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ItemId {
    type Err = MbtError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        let is_numeric = !trimmed.is_empty() && trimmed.chars().all(|ch| ch.is_ascii_digit());
        if !is_numeric {
            return Err(MbtError::InvalidItemId(value.to_string()));
        }
        trimmed
            .parse::<u64>()
            .ok()
            .and_then(Self::new)
            .ok_or_else(|| MbtError::InvalidItemId(value.to_string()))
    }
}

/// A modifier group as it arrives on the wire, before deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupEntry {
    #[serde(default, deserialize_with = "lenient_int")]
    pub id: Option<i64>,
    #[serde(default, deserialize_with = "lenient_text")]
    pub name: Option<String>,
    #[serde(default, rename = "minSelectionsCount", deserialize_with = "lenient_int")]
    pub min_selections: Option<i64>,
    #[serde(default, rename = "maxSelectionsCount", deserialize_with = "lenient_int")]
    pub max_selections: Option<i64>,
    #[serde(
        default = "default_enabled",
        rename = "isEnabled",
        alias = "enabled",
        deserialize_with = "lenient_enabled"
    )]
    pub enabled: bool,
}

impl GroupEntry {
    pub fn named(id: i64, name: &str) -> Self {
        Self {
            id: Some(id),
            name: Some(name.to_string()),
            min_selections: None,
            max_selections: None,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OptionGroup {
    pub id: i64,
    pub name: Option<String>,
    pub min_selections: Option<i64>,
    pub max_selections: Option<i64>,
    pub enabled: bool,
}

impl OptionGroup {
    pub fn from_entry(entry: &GroupEntry) -> Option<Self> {
        Some(Self {
            id: entry.id?,
            name: entry.name.clone(),
            min_selections: entry.min_selections,
            max_selections: entry.max_selections,
            enabled: entry.enabled,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DishRecord {
    pub item_id: ItemId,
    pub name: Option<String>,
    pub groups_primary: Vec<GroupEntry>,
    pub groups_secondary: Vec<GroupEntry>,
}

impl DishRecord {
    /// Normalizes a `data.dish` object from either query tier. Group entries
    /// that are not objects or do not decode are dropped.
    pub fn from_dish_json(item_id: ItemId, dish: &Value) -> Self {
        let name = dish
            .get("name")
            .and_then(|value| value.as_str())
            .map(|value| value.to_string());
        let groups_primary = parse_groups(dish.get("modifierGroups"));
        let groups_secondary = parse_groups(
            dish.get("selectedVariant")
                .and_then(|variant| variant.get("modifierGroups")),
        );
        Self {
            item_id,
            name,
            groups_primary,
            groups_secondary,
        }
    }
}

fn parse_groups(value: Option<&Value>) -> Vec<GroupEntry> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    items
        .iter()
        .filter(|item| item.is_object())
        .filter_map(|item| match GroupEntry::deserialize(item) {
            Ok(entry) => Some(entry),
            Err(err) => {
                tracing::debug!(error = %err, "dropping undecodable modifier group");
                None
            }
        })
        .collect()
}

fn default_enabled() -> bool {
    true
}

fn lenient_int<'de, D>(deserializer: D) -> Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::Number(number)) => number.as_i64(),
        Some(Value::String(text)) => text.trim().parse::<i64>().ok(),
        _ => None,
    })
}

fn lenient_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(text)) => Some(text),
        Some(Value::Number(number)) => Some(number.to_string()),
        _ => None,
    })
}

/// Null or non-boolean values count as enabled.
fn lenient_enabled<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(!matches!(value, Some(Value::Bool(false))))
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;

    #[test]
    fn extract_item_id_from_identity() {
        assert_eq!(ItemId::from_card_identity("482-item"), ItemId::new(482));
        assert_eq!(ItemId::from_card_identity("item-482"), None);
        assert_eq!(ItemId::from_card_identity("482-menu-item"), None);
        assert_eq!(ItemId::from_card_identity("0-item"), None);
        assert_eq!(ItemId::from_card_identity(""), None);
    }

    #[test]
    fn parse_item_id_invalid() {
        let err = "12a".parse::<ItemId>().unwrap_err();
        assert_matches!(err, MbtError::InvalidItemId(_));
        let err = "0".parse::<ItemId>().unwrap_err();
        assert_matches!(err, MbtError::InvalidItemId(_));
    }

    #[test]
    fn group_entry_accepts_string_ids_and_defaults() {
        let entry: GroupEntry = serde_json::from_value(json!({
            "id": "17",
            "name": "Size",
            "maxSelectionsCount": 1
        }))
        .unwrap();
        assert_eq!(entry.id, Some(17));
        assert_eq!(entry.max_selections, Some(1));
        assert_eq!(entry.min_selections, None);
        assert!(entry.enabled);

        let entry: GroupEntry =
            serde_json::from_value(json!({"id": "abc", "name": "Sauce", "enabled": false}))
                .unwrap();
        assert_eq!(entry.id, None);
        assert!(!entry.enabled);
    }

    #[test]
    fn dish_json_reads_both_group_locations() {
        let id = ItemId::new(9).unwrap();
        let dish = json!({
            "id": 9,
            "name": "Burger",
            "modifierGroups": [{"id": 1, "name": "Size"}, null],
            "selectedVariant": {"modifierGroups": [{"id": 2, "name": "Cheese"}]}
        });
        let record = DishRecord::from_dish_json(id, &dish);
        assert_eq!(record.name.as_deref(), Some("Burger"));
        assert_eq!(record.groups_primary, vec![GroupEntry::named(1, "Size")]);
        assert_eq!(record.groups_secondary, vec![GroupEntry::named(2, "Cheese")]);
    }

    #[test]
    fn nullable_and_malformed_fields_do_not_reject_the_dish() {
        let id = ItemId::new(4).unwrap();
        let dish = json!({
            "modifierGroups": [
                {"id": 1, "name": "Size", "isEnabled": true},
                {"id": 2, "name": "Spice", "isEnabled": null, "minSelectionsCount": "many"},
                {"id": 3, "name": ["not", "text"], "maxSelectionsCount": null},
                {"id": {"nested": true}, "name": "Broken"}
            ]
        });
        let record = DishRecord::from_dish_json(id, &dish);
        assert_eq!(record.groups_primary.len(), 4);
        let spice = &record.groups_primary[1];
        assert!(spice.enabled);
        assert_eq!(spice.min_selections, None);
        assert_eq!(record.groups_primary[2].name, None);
        assert_eq!(record.groups_primary[3].id, None);
    }
}
