//! Timestamps stored in resource specs and statuses use the Unix `date` layout, e.g.
//! `Mon Jan  2 15:04:05 UTC 2006`. Only UTC is written; `UTC`, `GMT`, and `Z` are accepted when
//! reading.

use chrono::{DateTime, NaiveDateTime, Utc};

const WRITE_FORMAT: &str = "%a %b %e %H:%M:%S UTC %Y";
const READ_FORMAT: &str = "%a %b %d %H:%M:%S %Y";

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("expected 6 fields in a unix date, got {0}")]
    Fields(usize),

    #[error("unsupported time zone: {0}")]
    Zone(String),

    #[error("invalid unix date: {0}")]
    Invalid(#[from] chrono::ParseError),
}

pub fn format(time: DateTime<Utc>) -> String {
    time.format(WRITE_FORMAT).to_string()
}

pub fn parse(value: &str) -> Result<DateTime<Utc>, ParseError> {
    let fields = value.split_whitespace().collect::<Vec<_>>();
    let [weekday, month, day, time, zone, year] = fields.as_slice() else {
        return Err(ParseError::Fields(fields.len()));
    };
    if !matches!(*zone, "UTC" | "GMT" | "Z") {
        return Err(ParseError::Zone(zone.to_string()));
    }

    let normalized = format!("{weekday} {month} {day} {time} {year}");
    let naive = NaiveDateTime::parse_from_str(&normalized, READ_FORMAT)?;
    Ok(naive.and_utc())
}
