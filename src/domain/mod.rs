//! Data model (spec §3): `Document`, `Chunk`, `Entity`, `Relation`,
//! `GraphFragment`, `Community`, `Task`/`TaskStep`, and the dynamic property
//! map type.

pub mod chunk;
pub mod community;
pub mod document;
pub mod entity;
pub mod fragment;
pub mod ids;
pub mod property;
pub mod relation;
pub mod task;

pub use chunk::{Chunk, ChunkType};
pub use community::Community;
pub use document::{Document, DocumentStatus, ObjectLocation};
pub use entity::Entity;
pub use fragment::{EdgeType, FragmentValidationError, GraphEdge, GraphFragment, GraphNode};
pub use property::{PropertyMap, PropertyValue};
pub use relation::Relation;
pub use task::{Task, TaskStatus, TaskStep};
