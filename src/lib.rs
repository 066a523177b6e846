//! Document ingestion, knowledge-graph construction, and entity
//! unification core. See `DESIGN.md` for how each module is grounded.

pub mod api;
pub mod app_state;
pub mod chunker;
pub mod community;
pub mod config;
pub mod decision;
pub mod domain;
pub mod embedding;
pub mod errors;
pub mod extractor;
pub mod fragment;
pub mod graph_store;
pub mod llm;
pub mod merger;
pub mod metadata_store;
pub mod object_store;
pub mod pipeline;
pub mod similarity;
pub mod task;
pub mod text_extract;
pub mod unification;
