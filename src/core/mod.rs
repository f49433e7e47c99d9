//! Core engine: declarations, dependency graph, convergence and planning.

pub mod declare;
pub mod engine;
pub mod error;
pub mod graph;
pub mod parser;
pub mod planner;
pub mod report;
pub mod resolver;
pub mod types;
