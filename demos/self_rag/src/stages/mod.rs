// self_rag_bench/src/stages/mod.rs

//! Stand-ins for the Self RAG stage components. They keep the shape of the
//! real stages (a dataset loader feeding a retriever) without models or a
//! database, so the executor can be benchmarked on its own.

pub mod data_loader;
pub mod sqlite_search;

use benchline::{ComponentRegistry, Stage, StageSpec};
use std::sync::Arc;

pub use data_loader::{MockDataLoader, MOCK_DATA_LOADER};
pub use sqlite_search::{SqliteSearch, SQLITE_SEARCH};

/// Words shared by generated prompts and the search corpus, so retrieval has
/// something to match on.
pub(crate) const VOCABULARY: &[&str] = &[
  "rust", "memory", "ownership", "borrow", "async", "runtime", "thread", "channel", "pipeline", "stage",
  "latency", "throughput", "cache", "index", "query", "vector", "token", "model", "prompt", "retrieval",
  "database", "schema", "network", "socket", "compiler", "parser", "graph", "scheduler", "queue", "deadline",
];

/// Registers the mock Self RAG components.
pub fn register(registry: &ComponentRegistry) {
  registry.register_stage(MOCK_DATA_LOADER, |spec: &StageSpec| {
    Ok(Arc::new(MockDataLoader::from_spec(spec)?) as Arc<dyn Stage>)
  });
  registry.register_stage(SQLITE_SEARCH, |spec: &StageSpec| {
    Ok(Arc::new(SqliteSearch::from_spec(spec)?) as Arc<dyn Stage>)
  });
}
