//! # Typed Records
//!
//! Everything above raw storage deals in *records*: contiguous allocations
//! whose first two bytes are a type tag, written once at creation and never
//! mutated. This module provides the three pieces that make records typed:
//!
//! - [`registry`]: maps tags to [`TypeFactory`] strategies (record size,
//!   destruction, deletion readiness).
//! - [`handle`]: the lightweight `(database, address)` identity of a record
//!   and the [`NodeType`] trait for compile-time-typed wrappers.
//! - [`layout`]: the struct builder every record type uses to describe its
//!   on-disk layout out of fixed-width fields.
//!
//! [`TypeFactory`]: registry::TypeFactory
//! [`NodeType`]: handle::NodeType

pub mod handle;
pub mod layout;
pub mod registry;

pub use handle::{NodeHandle, NodeType, TypedNode};
pub use layout::{
    FieldArray, FieldByte, FieldInt, FieldLong, FieldPointer, FieldShort, FieldString,
    StructBuilder,
};
pub use registry::{DeletionSemantics, TypeFactory, TypeRegistry};
