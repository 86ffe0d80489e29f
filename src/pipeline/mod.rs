pub mod orchestrator;
pub mod stats;

pub use orchestrator::{Orchestrator, OrchestratorHandle};
pub use stats::{CycleReport, CycleStage, StatusSnapshot};
