//! Domain types for the sandbox broker: runs, categories, events.

pub mod event;
pub mod run;

pub use event::{RunEvent, StreamItem};
pub use run::{Category, DeletedSummary, DeployMode, Run, RunId, RunInfo, RunStatus};
