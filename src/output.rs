use std::io::{self, Write};

use serde::Serialize;

use crate::document::NodeId;
use crate::domain::{ItemId, OptionGroup};
use crate::query::{ProbeReport, QueryTier};
use crate::render::{CardAnnotationState, range_hint};

#[derive(Debug, Clone, Serialize)]
pub struct GroupsResult {
    pub item_id: ItemId,
    pub dish_name: Option<String>,
    pub source: Option<QueryTier>,
    pub outcome: String,
    pub groups: Vec<GroupLine>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupLine {
    pub id: i64,
    pub name: Option<String>,
    pub enabled: bool,
    pub hint: Option<String>,
}

impl From<&OptionGroup> for GroupLine {
    fn from(group: &OptionGroup) -> Self {
        let hint = range_hint(group);
        Self {
            id: group.id,
            name: group.name.clone(),
            enabled: group.enabled,
            hint: (!hint.is_empty()).then_some(hint),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AnnotateResult {
    pub started: bool,
    pub cards: Vec<CardResult>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CardResult {
    pub node: NodeId,
    pub identity: Option<String>,
    pub annotation: CardAnnotationState,
    pub text: String,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_probe(report: &ProbeReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_groups(result: &GroupsResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_annotate(result: &AnnotateResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}
