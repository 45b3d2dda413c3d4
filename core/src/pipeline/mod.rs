// benchline/src/pipeline/mod.rs

//! Defines `PipelineExecutor`: assembly from configuration, the stage graph,
//! queue slot accounting and the run loop.

pub mod definition;
pub mod execution;
pub mod graph;
pub mod slots;

pub use definition::{assemble_all, PipelineExecutor};
pub use execution::RunOutcome;
pub use graph::PipelineGraph;
pub use slots::{QueueSlots, SlotGuard};
