//! Academic year value object.

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::value_object::ValueObject;

const MIN_YEAR: u16 = 1900;
const MAX_YEAR: u16 = 2999;

/// An academic year, either a single calendar year (`"2025"`) or a span of two
/// consecutive years (`"2024-2025"`).
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AcademicYear {
    start: u16,
    spans_two_years: bool,
}

impl ValueObject for AcademicYear {}

impl AcademicYear {
    pub fn single(year: u16) -> Result<Self, DomainError> {
        check_range(year)?;
        Ok(Self {
            start: year,
            spans_two_years: false,
        })
    }

    pub fn span(start: u16) -> Result<Self, DomainError> {
        check_range(start)?;
        check_range(start + 1)?;
        Ok(Self {
            start,
            spans_two_years: true,
        })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        if self.spans_two_years {
            self.start + 1
        } else {
            self.start
        }
    }

    pub fn parse(s: &str) -> Result<Self, DomainError> {
        let s = s.trim();
        match s.split_once('-') {
            None => Self::single(parse_year(s)?),
            Some((first, second)) => {
                let start = parse_year(first)?;
                let end = parse_year(second)?;
                if end != start + 1 {
                    return Err(DomainError::validation(format!(
                        "academic year {s}: second year must follow the first"
                    )));
                }
                Self::span(start)
            }
        }
    }
}

fn parse_year(s: &str) -> Result<u16, DomainError> {
    if s.len() != 4 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(DomainError::validation(format!(
            "academic year component {s:?} is not a four-digit year"
        )));
    }
    s.parse::<u16>()
        .map_err(|e| DomainError::validation(format!("academic year {s:?}: {e}")))
}

fn check_range(year: u16) -> Result<(), DomainError> {
    if (MIN_YEAR..=MAX_YEAR).contains(&year) {
        Ok(())
    } else {
        Err(DomainError::validation(format!(
            "academic year {year} outside {MIN_YEAR}..={MAX_YEAR}"
        )))
    }
}

impl fmt::Display for AcademicYear {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.spans_two_years {
            write!(f, "{}-{}", self.start, self.start + 1)
        } else {
            write!(f, "{}", self.start)
        }
    }
}

impl FromStr for AcademicYear {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AcademicYear {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AcademicYear> for String {
    fn from(value: AcademicYear) -> Self {
        value.to_string()
    }
}
