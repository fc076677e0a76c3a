//! Governance layers and fact validation.
//!
//! - **`model`**: L0 rules, L1 append-only facts with corrections, L2 derived state.
//! - **`validation`**: evidence, location and rule checks for candidate facts.

pub mod model;
pub mod validation;

pub use model::*;
pub use validation::*;
