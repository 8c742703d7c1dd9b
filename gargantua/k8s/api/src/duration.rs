//! Durations written as a sequence of decimal numbers with unit suffixes, e.g. `"1h30m"`,
//! `"45s"` or `"2.5m"`, as used for scenario keepalive and pause limits.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{fmt, str::FromStr, time::Duration};

/// A non-negative duration. Embed in CRD fields with `#[schemars(with = "String")]`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct K8sDuration(Duration);

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("invalid unit: {}", EXPECTED_UNITS)]
    InvalidUnit,

    #[error("missing a unit: {}", EXPECTED_UNITS)]
    NoUnit,

    #[error("durations must not be negative")]
    Negative,

    #[error("empty duration")]
    Empty,

    #[error("invalid number: {0}")]
    NotANumber(#[from] std::num::ParseFloatError),
}

const EXPECTED_UNITS: &str = "expected one of 'ns', 'us', '\u{00b5}s', 'ms', 's', 'm', or 'h'";

impl K8sDuration {
    pub const fn from_secs(secs: u64) -> Self {
        Self(Duration::from_secs(secs))
    }

    pub fn as_std(&self) -> Duration {
        self.0
    }

    /// Converts to a signed duration for wall-clock arithmetic, saturating on overflow.
    pub fn as_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.0).unwrap_or(chrono::Duration::MAX)
    }
}

impl From<Duration> for K8sDuration {
    fn from(duration: Duration) -> Self {
        Self(duration)
    }
}

impl From<K8sDuration> for Duration {
    fn from(K8sDuration(duration): K8sDuration) -> Self {
        duration
    }
}

impl fmt::Display for K8sDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut secs = self.0.as_secs();
        let nanos = self.0.subsec_nanos();
        if secs == 0 && nanos == 0 {
            return f.write_str("0s");
        }

        let hours = secs / 3600;
        secs %= 3600;
        let minutes = secs / 60;
        secs %= 60;
        if hours > 0 {
            write!(f, "{hours}h")?;
        }
        if minutes > 0 {
            write!(f, "{minutes}m")?;
        }
        match (secs, nanos) {
            (0, 0) => Ok(()),
            (secs, 0) => write!(f, "{secs}s"),
            (secs, nanos) if nanos % 1_000_000 == 0 => {
                write!(f, "{secs}.{:03}s", nanos / 1_000_000)
            }
            (secs, nanos) => write!(f, "{secs}.{nanos:09}s"),
        }
    }
}

impl FromStr for K8sDuration {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn unit(unit: &str) -> Result<Duration, ParseError> {
            const MINUTE: Duration = Duration::from_secs(60);
            match unit {
                "ns" => Ok(Duration::from_nanos(1)),
                // U+00B5 is the micro sign; U+03BC is the Greek letter mu.
                "us" | "\u{00b5}s" | "\u{03bc}s" => Ok(Duration::from_micros(1)),
                "ms" => Ok(Duration::from_millis(1)),
                "s" => Ok(Duration::from_secs(1)),
                "m" => Ok(MINUTE),
                "h" => Ok(MINUTE * 60),
                _ => Err(ParseError::InvalidUnit),
            }
        }

        let s = s.trim();
        if s.starts_with('-') {
            return Err(ParseError::Negative);
        }
        let mut rest = s.trim_start_matches('+');
        if rest.is_empty() {
            return Err(ParseError::Empty);
        }
        if rest == "0" {
            return Ok(Self::default());
        }

        let mut total = Duration::ZERO;
        while !rest.is_empty() {
            let unit_start = rest
                .find(|c: char| c.is_alphabetic())
                .ok_or(ParseError::NoUnit)?;
            let (value, tail) = rest.split_at(unit_start);
            let value = value.parse::<f64>()?;
            let unit_end = tail
                .find(|c: char| !c.is_alphabetic())
                .unwrap_or(tail.len());
            let (u, tail) = tail.split_at(unit_end);
            total += unit(u)?.mul_f64(value);
            rest = tail;
        }
        Ok(Self(total))
    }
}

impl Serialize for K8sDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for K8sDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct Visitor;
        impl de::Visitor<'_> for Visitor {
            type Value = K8sDuration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a duration such as \"1h30m\"")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                value.parse().map_err(de::Error::custom)
            }
        }
        deserializer.deserialize_str(Visitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses() {
        const MINUTE: Duration = Duration::from_secs(60);
        for (input, expected) in [
            ("0", Duration::ZERO),
            ("+0", Duration::ZERO),
            ("45s", Duration::from_secs(45)),
            ("2.5m", MINUTE * 2 + Duration::from_secs(30)),
            ("1h30m", MINUTE * 90),
            ("1h2m3s4ms", MINUTE * 62 + Duration::from_millis(3004)),
            (".5s", Duration::from_millis(500)),
            ("12\u{00b5}s", Duration::from_micros(12)),
            ("10ns", Duration::from_nanos(10)),
        ] {
            assert_eq!(
                input.parse::<K8sDuration>(),
                Ok(K8sDuration(expected)),
                "{input}"
            );
        }
    }

    #[test]
    fn rejects() {
        for (input, expected) in [
            ("", ParseError::Empty),
            ("-5s", ParseError::Negative),
            ("5", ParseError::NoUnit),
            ("5d", ParseError::InvalidUnit),
        ] {
            assert_eq!(input.parse::<K8sDuration>(), Err(expected), "{input:?}");
        }
        assert!(matches!(
            "x5s".parse::<K8sDuration>(),
            Err(ParseError::NotANumber(_))
        ));
    }

    #[test]
    fn displays_parseable() {
        for d in [
            Duration::ZERO,
            Duration::from_secs(90),
            Duration::from_secs(3600 * 4 + 1),
            Duration::from_millis(1500),
        ] {
            let shown = K8sDuration(d).to_string();
            assert_eq!(shown.parse::<K8sDuration>(), Ok(K8sDuration(d)), "{shown}");
        }
        assert_eq!(K8sDuration::from_secs(5400).to_string(), "1h30m");
    }
}
