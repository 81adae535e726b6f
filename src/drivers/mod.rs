// src/drivers/mod.rs

//! Concrete resource drivers shipped with the crate.

pub mod local;

pub use local::{LocalApplication, LocalNode};
