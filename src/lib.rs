//! Cairn: declarative infrastructure convergence.
//!
//! Resources are declared with ordering constraints, ordered into a
//! dependency graph and converged one by one through pluggable providers:
//! inspect, diff, apply only what differs. Every run yields a report.

pub mod cli;
pub mod core;
pub mod providers;
pub mod resources;
pub mod transport;
pub mod tripwire;

pub use crate::core::declare::{Declarations, Resource};
pub use crate::core::engine::{converge, CancelToken, RunOptions};
pub use crate::core::error::{Error, Result};
pub use crate::core::graph::{build_graph, Graph};
pub use crate::core::report::{FailureReason, Outcome, OutcomeStatus, RunReport, RunState};
pub use crate::providers::{Provider, ProviderRegistry};
