use crate::perfdata::PerfValue;
use crate::range::{Range, RangeError};
use crate::states::State;
use log::info;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
#[error("unable to parse range '{input}' with error: {source}")]
pub struct ThresholdParseError {
    pub input: String,
    pub source: RangeError,
}

/// A pair of alert ranges. Either side may be unset.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct Thresholds {
    pub warning: Option<Range>,
    pub critical: Option<Range>,
}

impl Thresholds {
    /// Build thresholds from the raw `-w`/`-c` strings, keeping the
    /// offending input in the error for the UNKNOWN message.
    pub fn from_strings(
        warning: Option<&str>,
        critical: Option<&str>,
    ) -> Result<Thresholds, ThresholdParseError> {
        let parse = |input: &str| {
            Range::parse(input).map_err(|source| ThresholdParseError {
                input: input.to_string(),
                source,
            })
        };
        Ok(Thresholds {
            warning: warning.map(parse).transpose()?,
            critical: critical.map(parse).transpose()?,
        })
    }

    /// Classify a value: critical takes precedence over warning, a value
    /// violating neither range is Ok.
    pub fn classify(&self, value: impl Into<PerfValue>) -> State {
        let value = value.into();
        if let Some(critical) = &self.critical {
            if critical.violates(value) {
                info!("Value {} violates critical range {}", value, critical);
                return State::Critical;
            }
        }
        if let Some(warning) = &self.warning {
            if warning.violates(value) {
                info!("Value {} violates warning range {}", value, warning);
                return State::Warning;
            }
        }
        State::Ok
    }
}

#[cfg(test)]
mod classify_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn thresholds(warning: &str, critical: &str) -> Thresholds {
        Thresholds::from_strings(Some(warning), Some(critical)).unwrap()
    }

    #[test]
    fn test_ok_inside_both() {
        assert_eq!(thresholds("10", "20").classify(5), State::Ok);
    }

    #[test]
    fn test_warning_outside_warn_only() {
        assert_eq!(thresholds("10", "20").classify(15), State::Warning);
    }

    #[test]
    fn test_critical_precedence() {
        assert_eq!(thresholds("10", "20").classify(25), State::Critical);
    }

    #[test]
    fn test_inverted_range() {
        let th = Thresholds::from_strings(None, Some("@3:7")).unwrap();
        assert_eq!(th.classify(5), State::Critical);
        assert_eq!(th.classify(2), State::Ok);
    }

    #[test]
    fn test_no_thresholds_is_ok() {
        assert_eq!(Thresholds::default().classify(1_000_000), State::Ok);
    }

    #[test]
    fn test_nested_ranges_value_in_warn_is_ok() {
        // w subset of c: a value inside the warning range is Ok.
        let th = thresholds("0:10", "0:100");
        assert_eq!(th.classify(10), State::Ok);
        assert_eq!(th.classify(50), State::Warning);
        assert_eq!(th.classify(500), State::Critical);
    }

    #[test]
    fn test_parse_error_carries_input() {
        let err = Thresholds::from_strings(Some("2:1"), None).unwrap_err();
        assert_eq!(err.input, "2:1");
        assert_eq!(err.source, RangeError::StartGreaterThanEnd);
    }

    #[test]
    fn test_float_value() {
        let th = thresholds("0:0.5", "0:1");
        assert_eq!(th.classify(0.1), State::Ok);
        assert_eq!(th.classify(0.7), State::Warning);
        assert_eq!(th.classify(1.5), State::Critical);
    }
}
