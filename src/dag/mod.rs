// src/dag/mod.rs

//! Resource registry and the dependency structure between resources.
//!
//! - [`registry`] owns the guid -> resource map of one experiment.
//! - [`conditions`] evaluates "act once these resources reached a state".
//! - [`graph`] derives a guard -> target graph from the registered
//!   conditions, used for cycle checks and the release order.

pub mod conditions;
pub mod graph;
pub mod registry;

pub use conditions::{Condition, Verdict, evaluate};
pub use graph::{ALL_ACTIONS, ConditionGraph, ORDERED_ACTIONS};
pub use registry::{GuidGenerator, Registry};
