//! Build orchestration for kiln
//!
//! This crate drives container-backed builds from a parsed build file:
//! the `Lifecycle` controller walks the phases of a run, the `BuildWorker`
//! performs them against a `ContainerEngine`, and the supporting modules
//! cover step caching, git version resolution and container state
//! tracking.

mod cache;
mod error;
mod lifecycle;
mod state;
mod worker;

pub mod version;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;

pub use cache::{compute_key, CacheDescriptor};
pub use error::{merge_errors, CoreError, Result};
pub use lifecycle::{Lifecycle, Phase, Worker};
pub use state::{ContainerRole, ContainerState, StateSet, StepStatus};
pub use worker::{AbortHandle, BuildWorker, DEFAULT_BUILD_TIMEOUT};
