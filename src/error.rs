use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum MbtError {
    #[error("invalid menu item id: {0}")]
    InvalidItemId(String),

    #[error("missing config file mbt.json in current directory or user config directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config value: {0}")]
    InvalidConfig(String),

    #[error("GraphQL request failed: {0}")]
    QueryHttp(String),

    #[error("GraphQL endpoint returned status {status}: {message}")]
    QueryStatus { status: u16, message: String },

    #[error("GraphQL response could not be decoded: {0}")]
    QueryDecode(String),

    #[error("failed to render annotation: {0}")]
    Render(String),

    #[error("unknown document node #{0}")]
    UnknownNode(usize),

    #[error("invalid document snapshot: {0}")]
    Snapshot(String),

    #[error("modifier tags feature already started")]
    AlreadyStarted,
}
