//! Infrastructure shared by every crate in the workspace: the runtime
//! abstraction, backoff, tunable knobs, and common types.

pub mod backoff;
pub mod errors;
pub mod knobs;
mod metrics;
pub mod runtime;
pub mod types;
