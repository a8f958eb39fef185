//! Small value types shared across the Spinlog crates

use crate::error::{Result, SpinlogError};
use chrono::{Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A calendar month, the natural key of a dump batch
///
/// Canonical text form is `YYYY-MM` (e.g. `2024-06`); the provider's dump
/// file names use the compact first-of-month form `YYYYMM01`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct YearMonth {
    year: i32,
    month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Result<Self> {
        if !(1900..=9999).contains(&year) || !(1..=12).contains(&month) {
            return Err(SpinlogError::InvalidYearMonth(format!("{year:04}-{month:02}")));
        }
        Ok(Self { year, month })
    }

    /// The current calendar month (UTC)
    pub fn current() -> Self {
        let now = Utc::now();
        Self {
            year: now.year(),
            month: now.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    /// Compact form without separator, e.g. `202406`
    pub fn compact(&self) -> String {
        format!("{:04}{:02}", self.year, self.month)
    }

    /// First-of-month form used in dump file names, e.g. `20240601`
    pub fn first_day_compact(&self) -> String {
        format!("{:04}{:02}01", self.year, self.month)
    }
}

impl FromStr for YearMonth {
    type Err = SpinlogError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || SpinlogError::InvalidYearMonth(s.to_string());

        let (year_str, month_str) = s.split_once('-').ok_or_else(invalid)?;
        if year_str.len() != 4 || month_str.len() != 2 {
            return Err(invalid());
        }

        let year: i32 = year_str.parse().map_err(|_| invalid())?;
        let month: u32 = month_str.parse().map_err(|_| invalid())?;
        Self::new(year, month)
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl TryFrom<String> for YearMonth {
    type Error = SpinlogError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<YearMonth> for String {
    fn from(value: YearMonth) -> Self {
        value.to_string()
    }
}
