//! Shared test helpers for integration tests.
//!
//! Note: We use `helpers/mod.rs` instead of the modern `helpers.rs` + `helpers/` pattern
//! because Cargo auto-discovers top-level `.rs` files in `tests/` as integration tests.
//! A `tests/helpers.rs` file would be compiled as a standalone test, which we don't want.

#![allow(dead_code)]

pub mod manual_stream;
pub mod scheduling;

/// Response type shared by the scenario tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Feature {
    pub id: u32,
    pub name: String,
}

impl Feature {
    pub fn new(id: u32) -> Self {
        Self {
            id,
            name: format!("feature-{id}"),
        }
    }
}
