//! Build file parsing for kiln
//!
//! This crate handles parsing of the `.kiln.yml` build file and discovery
//! of the repo identity (name, branch/tag, commit) the run is built from.

mod artifact;
mod error;
mod spec;
mod step;

pub use artifact::*;
pub use error::*;
pub use spec::*;
pub use step::*;
