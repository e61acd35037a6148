//! Identity key of a generation job.

use core::fmt;

use serde::{Deserialize, Serialize};

use crate::academic_year::AcademicYear;
use crate::id::{SubjectId, TemplateId};
use crate::value_object::ValueObject;

/// The logical target of a job. At most one non-terminal job may exist per key.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    pub subject_id: SubjectId,
    pub academic_year: AcademicYear,
    pub template_id: TemplateId,
}

impl ValueObject for IdentityKey {}

impl IdentityKey {
    pub fn new(subject_id: SubjectId, academic_year: AcademicYear, template_id: TemplateId) -> Self {
        Self {
            subject_id,
            academic_year,
            template_id,
        }
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "subject={} year={} template={}",
            self.subject_id, self.academic_year, self.template_id
        )
    }
}
