//! `coursegen-core` — domain primitives shared by the generation pipeline.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns):
//! typed identifiers, the academic-year value object and the identity key
//! that makes job submission idempotent.

pub mod academic_year;
pub mod error;
pub mod id;
pub mod identity;
pub mod value_object;

pub use academic_year::AcademicYear;
pub use error::{DomainError, DomainResult};
pub use id::{JobId, SubjectId, TemplateId, UserId};
pub use identity::IdentityKey;
pub use value_object::ValueObject;
