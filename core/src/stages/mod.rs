// benchline/src/stages/mod.rs

//! Stage implementations shipped with the engine. Domain stages (dataset
//! loaders, retrieval backends) live with the application and are registered
//! through `ComponentRegistry::register_stage`.

pub mod passthrough;

pub use passthrough::Passthrough;
