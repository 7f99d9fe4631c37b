use crate::error::ValidationError;
use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

/// Calendar attributes of the date dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateParts {
    pub year: i32,
    pub quarter: u32,
    pub month: u32,
    pub day: u32,
}

/// Derives calendar attributes from a date. Stateless.
pub struct DateDeriver;

impl DateDeriver {
    pub fn derive(date: NaiveDate) -> DateParts {
        let month = date.month();
        DateParts {
            year: date.year(),
            quarter: (month - 1) / 3 + 1,
            month,
            day: date.day(),
        }
    }

    /// Derive from raw components, rejecting dates that do not exist.
    pub fn derive_ymd(year: i32, month: u32, day: u32) -> Result<DateParts, ValidationError> {
        NaiveDate::from_ymd_opt(year, month, day)
            .map(Self::derive)
            .ok_or_else(|| ValidationError::InvalidDate(format!("{year:04}-{month:02}-{day:02}")))
    }
}

/// Parse an ISO `YYYY-MM-DD` calendar date.
pub fn parse_calendar_date(raw: &str) -> Result<NaiveDate, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::MissingField("date"));
    }
    NaiveDate::parse_from_str(trimmed, "%Y-%m-%d")
        .map_err(|_| ValidationError::InvalidDate(raw.to_string()))
}
