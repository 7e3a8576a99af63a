//! Parsing of human-written durations such as `5m`, `30s` or `1h30m`.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DurationError {
    #[error("duration is empty")]
    Empty,

    #[error("invalid duration '{input}': {source}")]
    Invalid {
        input: String,
        #[source]
        source: humantime::DurationError,
    },

    #[error("duration '{input}' is shorter than the minimum of {min:?}")]
    TooShort { input: String, min: Duration },
}

/// Parses a sequence of `<number><unit>` pairs (`ms`, `s`, `m`, `h`, `d`, ...).
///
/// A bare `0` is accepted. Values that do not fit a [`Duration`] are errors.
pub fn parse_duration(input: &str) -> Result<Duration, DurationError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(DurationError::Empty);
    }
    if s == "0" {
        return Ok(Duration::ZERO);
    }

    humantime::parse_duration(s).map_err(|source| DurationError::Invalid {
        input: input.to_string(),
        source,
    })
}

/// Like [`parse_duration`] but rejects values below `min`.
pub fn parse_duration_at_least(input: &str, min: Duration) -> Result<Duration, DurationError> {
    let d = parse_duration(input)?;
    if d < min {
        return Err(DurationError::TooShort {
            input: input.to_string(),
            min,
        });
    }
    Ok(d)
}
