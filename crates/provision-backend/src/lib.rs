//! Provision-Backend: the remote side of the sandbox broker
//!
//! The broker admits runs and drives their lifecycle; the resources
//! themselves come from collaborators it does not own. This crate pins down
//! that boundary.
//!
//! ## Key Components
//!
//! - `ProvisioningBackend`: create, exec, detached start, delete
//! - `SandboxPool`: warm pool lifecycle and acquisition
//! - `ArchiveStore`: prebuilt workload archives, with `SpacesArchiveStore`
//!   as the HTTP implementation
//! - `BackendError`: failures classified by `BackendErrorKind`
//! - `fakes`: scriptable in-memory implementations

mod error;
pub mod fakes;
mod spaces;
pub mod traits;
mod types;

pub use error::{ArchiveError, BackendError, BackendErrorKind, BackendResult};
pub use spaces::{SpacesArchiveStore, SpacesConfig};
pub use traits::{ArchiveStore, ProvisioningBackend, SandboxPool};
pub use types::{
    CreateSpec, ExecOutput, OnEmpty, PoolMetrics, PoolMetricsByImage, PoolSettings, SandboxHandle,
    SandboxMode,
};
