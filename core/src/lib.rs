// benchline/src/lib.rs

//! Benchline: an async executor for staged benchmark pipelines.
//!
//! A pipeline is a directed acyclic graph of stages declared in YAML. A load
//! scheduler admits queries into it at a target arrival rate, bounded by a
//! queue depth, and every admitted query walks the graph:
//!  - Stages run as soon as all of their predecessors produced an output.
//!  - Independent branches run concurrently; fan-in points wait.
//!  - Each query resolves exactly once: completed, timed out, or failed.
//!  - Stage failures and timeouts are recorded, never fatal to the run.
//!  - Components are resolved by id through an explicit `ComponentRegistry`.
//!
//! ```text
//!   1. BenchDocument::from_file("bench.yaml")?
//!   2. let registry = ComponentRegistry::with_builtins(); register your stages.
//!   3. PipelineExecutor::from_spec(&doc.pipelines[0], &registry)?
//!   4. executor.run(shutdown_token).await? -> RunOutcome { report, results }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod loadgen;
pub mod pipeline;
pub mod registry;
pub mod report;
pub mod stages;

// --- Re-exports for the Public API ---

pub use crate::config::{BenchDocument, ComponentConfig, LoadgenSpec, PipelineSpec, StageSpec};
pub use crate::core::{Query, QueryState, QueryStatus, Stage, StageId, StageOutput, StagePolicy, Upstream};
pub use crate::error::{BenchError, BenchResult, StageError};

pub use crate::loadgen::{produce, Admission, ArrivalProcess, LoadScheduler, OfflineConfig, OfflineLoadScheduler};
pub use crate::pipeline::{assemble_all, PipelineExecutor, PipelineGraph, QueueSlots, RunOutcome, SlotGuard};
pub use crate::registry::{ComponentRegistry, SchedulerFactory, StageFactory};
pub use crate::report::{ExecutionResult, LatencySummary, RunReport, StageSummary};
pub use crate::stages::Passthrough;

// Stage implementations receive a token per query; re-exported so they need
// not depend on tokio-util directly.
pub use tokio_util::sync::CancellationToken;
