// benchline/src/core/mod.rs

//! The query lifecycle and the stage contract.

pub mod query;
pub mod stage;

pub use query::{Query, QueryState, QueryStatus};
pub use stage::{Stage, StageId, StageOutput, StagePolicy, Upstream};
