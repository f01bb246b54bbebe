//! Idempotent SQLite persistence for investigations and their artifacts.

mod schema;
mod store;

pub use schema::{initialize_schema, is_initialized, SCHEMA_VERSION};
pub use store::{
    CompletionArtifacts, SqliteStore, StartOutcome, VectorMatch, WorklistFilter, WorklistPage,
};
