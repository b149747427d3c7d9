pub mod cache;
pub mod config;
pub mod document;
pub mod domain;
pub mod error;
pub mod gate;
pub mod locator;
pub mod merge;
pub mod output;
pub mod pipeline;
pub mod query;
pub mod render;
