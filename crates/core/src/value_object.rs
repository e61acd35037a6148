//! Value object trait: equality by value, not identity.
//!
//! Value objects carry no identity of their own. An `AcademicYear` of
//! `2024-2025` is the same value wherever it appears, and two identity keys
//! with the same subject, year and template describe the same logical work.

/// Marker trait for value objects.
///
/// Value objects are **immutable** and **compared by value**. To "modify" one,
/// construct a new value. Constructors validate, so a value object that exists
/// is always well-formed.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}
