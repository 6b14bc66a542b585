//! # Configuration Module
//!
//! Centralizes every tunable constant in the engine. Constants are grouped by
//! functional area and their interdependencies are documented and enforced
//! through compile-time assertions.
//!
//! ## Why Centralization?
//!
//! The chunk layout, the allocator's size-class table, the pointer
//! compression scheme and the growable-array tiers are all arithmetic
//! consequences of a handful of base values. Scattering those values across
//! modules invites mismatch bugs; co-locating them with `const` assertions
//! makes an inconsistent combination fail to compile.
//!
//! ## Module Organization
//!
//! - [`constants`]: All numeric configuration values with dependency
//!   documentation

pub mod constants;
pub use constants::*;
