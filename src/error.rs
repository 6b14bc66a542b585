//! # Error Taxonomy
//!
//! The engine reports failures as `eyre::Result` like the rest of the crate,
//! but the handful of conditions callers need to distinguish are carried as a
//! typed [`StoreError`] inside the report. Match them with
//! `report.downcast_ref::<StoreError>()`.
//!
//! ## Kinds
//!
//! - `IndexCorruption`: the backing file is structurally unusable (bad magic,
//!   unknown type tag, impossible size). On open this is handled internally
//!   by discarding and recreating the file; anywhere else it propagates.
//! - `TypeMismatch`: a typed load found a record whose stored tag is not
//!   accepted by the requested type.
//! - `IllegalState`: lock protocol misuse - releasing a lock that is not
//!   held, releasing the write lock from a non-owning thread, re-entrant
//!   write-lock acquisition, or writing without exclusive access.
//! - `IllegalArgument`: caller bugs such as storing 0 in a growable array or
//!   indexing past its size.
//! - `OperationCancelled`: the cancel probe fired while waiting for the
//!   write lock.
//!
//! Everything except corruption-at-open is a hard, un-retried failure: these
//! are programmer or data-integrity bugs, not transient conditions.

use std::fmt;

use crate::storage::Address;

/// Typed error kinds carried inside `eyre::Report`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing file is structurally unusable.
    IndexCorruption(String),
    /// A typed load found an incompatible record.
    TypeMismatch {
        expected: &'static str,
        found_tag: u16,
        address: Address,
    },
    /// Lock or mutation protocol misuse.
    IllegalState(String),
    /// Invalid argument from the caller.
    IllegalArgument(String),
    /// The cancel probe fired while waiting for the write lock.
    OperationCancelled,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::IndexCorruption(msg) => write!(f, "index corruption: {msg}"),
            StoreError::TypeMismatch {
                expected,
                found_tag,
                address,
            } => write!(
                f,
                "type mismatch at address {address:#x}: expected {expected}, found tag {found_tag:#06x}"
            ),
            StoreError::IllegalState(msg) => write!(f, "illegal state: {msg}"),
            StoreError::IllegalArgument(msg) => write!(f, "illegal argument: {msg}"),
            StoreError::OperationCancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for StoreError {}

impl StoreError {
    /// True iff `report` wraps this exact error kind.
    pub fn matches(report: &eyre::Report, kind: fn(&StoreError) -> bool) -> bool {
        report.downcast_ref::<StoreError>().is_some_and(kind)
    }

    pub fn is_corruption(report: &eyre::Report) -> bool {
        Self::matches(report, |e| matches!(e, StoreError::IndexCorruption(_)))
    }

    pub fn is_type_mismatch(report: &eyre::Report) -> bool {
        Self::matches(report, |e| matches!(e, StoreError::TypeMismatch { .. }))
    }

    pub fn is_illegal_state(report: &eyre::Report) -> bool {
        Self::matches(report, |e| matches!(e, StoreError::IllegalState(_)))
    }

    pub fn is_illegal_argument(report: &eyre::Report) -> bool {
        Self::matches(report, |e| matches!(e, StoreError::IllegalArgument(_)))
    }

    pub fn is_cancelled(report: &eyre::Report) -> bool {
        Self::matches(report, |e| matches!(e, StoreError::OperationCancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_survive_eyre_roundtrip() {
        let report: eyre::Report = StoreError::OperationCancelled.into();
        assert!(StoreError::is_cancelled(&report));
        assert!(!StoreError::is_corruption(&report));

        let report: eyre::Report = StoreError::TypeMismatch {
            expected: "Symbol",
            found_tag: 7,
            address: 0x1002,
        }
        .into();
        assert!(StoreError::is_type_mismatch(&report));
    }

    #[test]
    fn display_includes_context() {
        let err = StoreError::IllegalArgument("cannot store 0 in a growable array".into());
        assert!(err.to_string().contains("growable array"));
    }
}
