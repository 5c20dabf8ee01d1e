use crate::perfdata::PerfValue;
use log::debug;
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Longest accepted range string. Anything beyond this is a hostile or
/// broken input, not a threshold.
const MAX_RANGE_INPUT: usize = 16 * 1024;

#[non_exhaustive]
#[derive(Error, Debug, PartialEq)]
pub enum RangeError {
    #[error("unexpected character in range: '{0}'")]
    InvalidChar(String),

    #[error("range start is larger than range end")]
    StartGreaterThanEnd,

    #[error("number too large for a 64 bit value: '{0}'")]
    Overflow(String),

    #[error("number too small for a signed 64 bit value: '{0}'")]
    Underflow(String),

    #[error("range string is longer than {MAX_RANGE_INPUT} bytes")]
    InputTooLong,
}

/// A threshold interval in monitoring plugin range syntax.
///
/// `start == None` stands for minus infinity, `end == None` for plus
/// infinity. With `alert_on_inside == false` (the default, unprefixed
/// syntax) a value alerts when it lies outside `[start, end]`; the
/// `@`-prefixed syntax inverts that.
#[derive(Clone, Debug, PartialEq)]
pub struct Range {
    pub start: Option<PerfValue>,
    pub end: Option<PerfValue>,
    pub alert_on_inside: bool,
}

/// Lex one endpoint number with the typed-value rules: plain integers stay
/// integral (signed first, unsigned for values past `i64::MAX`), anything
/// with a fraction or exponent becomes a double.
fn parse_number(input: &str) -> Result<PerfValue, RangeError> {
    if input.contains(['.', 'e', 'E']) {
        let parsed: f64 = input
            .parse()
            .map_err(|_| RangeError::InvalidChar(input.to_string()))?;
        if parsed.is_infinite() {
            if parsed.is_sign_negative() {
                return Err(RangeError::Underflow(input.to_string()));
            }
            return Err(RangeError::Overflow(input.to_string()));
        }
        return Ok(PerfValue::Double(parsed));
    }

    if let Ok(int) = input.parse::<i64>() {
        return Ok(PerfValue::Int(int));
    }

    let digits = input.strip_prefix(['-', '+']).unwrap_or(input);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RangeError::InvalidChar(input.to_string()));
    }

    if input.starts_with('-') {
        // All digits, starts with a minus, did not fit i64.
        return Err(RangeError::Underflow(input.to_string()));
    }

    match digits.parse::<u64>() {
        Ok(uint) => Ok(PerfValue::Uint(uint)),
        Err(_) => Err(RangeError::Overflow(input.to_string())),
    }
}

impl Range {
    /// Parse the range grammar:
    ///
    /// ```text
    /// range := "@"? part (":" part)?
    /// part  := number | "~" | ""
    /// ```
    ///
    /// `"10"` means `[0,10]`, `"~:5"` means `(-inf,5]`, `":5"` means
    /// `[0,5]`, `"10:"` means `[10,+inf)` and a leading `@` alerts inside
    /// instead of outside.
    pub fn parse(input: &str) -> Result<Range, RangeError> {
        if input.len() > MAX_RANGE_INPUT {
            return Err(RangeError::InputTooLong);
        }

        let (alert_on_inside, rest) = match input.strip_prefix('@') {
            Some(rest) => (true, rest),
            None => (false, input),
        };

        let (start, end) = match rest.split_once(':') {
            None => {
                // A single part is the end of the range; start defaults to 0.
                if rest.is_empty() || rest == "~" {
                    return Err(RangeError::InvalidChar(input.to_string()));
                }
                (Some(PerfValue::Int(0)), Some(parse_number(rest)?))
            }
            Some((start_part, end_part)) => {
                let start = match start_part {
                    "" => Some(PerfValue::Int(0)),
                    "~" => None,
                    number => Some(parse_number(number)?),
                };
                let end = match end_part {
                    "" => None,
                    "~" => return Err(RangeError::InvalidChar(input.to_string())),
                    number => Some(parse_number(number)?),
                };
                (start, end)
            }
        };

        if let (Some(start), Some(end)) = (start, end) {
            if start.compare(end) == Ordering::Greater {
                return Err(RangeError::StartGreaterThanEnd);
            }
        }

        let range = Range {
            start,
            end,
            alert_on_inside,
        };
        debug!("Parsed range '{}' as {:?}", input, range);

        Ok(range)
    }

    /// True when the value lies inside `[start, end]`.
    fn contains(&self, value: PerfValue) -> bool {
        if let Some(start) = self.start {
            if value.compare(start) == Ordering::Less {
                return false;
            }
        }
        if let Some(end) = self.end {
            if value.compare(end) == Ordering::Greater {
                return false;
            }
        }
        true
    }

    /// True when the value should raise an alert against this range.
    pub fn violates(&self, value: PerfValue) -> bool {
        if self.alert_on_inside {
            self.contains(value)
        } else {
            !self.contains(value)
        }
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.alert_on_inside {
            write!(f, "@")?;
        }
        match self.start {
            Some(start) => write!(f, "{}", start)?,
            None => write!(f, "~")?,
        }
        write!(f, ":")?;
        match self.end {
            Some(end) => write!(f, "{}", end)?,
            None => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod parse_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_single_number() {
        let range = Range::parse("10").unwrap();
        assert_eq!(
            range,
            Range {
                start: Some(PerfValue::Int(0)),
                end: Some(PerfValue::Int(10)),
                alert_on_inside: false,
            }
        );
    }

    #[test]
    fn test_simple_pair() {
        let range = Range::parse("-7:23").unwrap();
        assert_eq!(range.start, Some(PerfValue::Int(-7)));
        assert_eq!(range.end, Some(PerfValue::Int(23)));
    }

    #[test]
    fn test_empty_start_is_zero() {
        let range = Range::parse(":5.75").unwrap();
        assert_eq!(range.start, Some(PerfValue::Int(0)));
        assert_eq!(range.end, Some(PerfValue::Double(5.75)));
    }

    #[test]
    fn test_negative_infinity_start() {
        let range = Range::parse("~:-95.99").unwrap();
        assert_eq!(range.start, None);
        assert_eq!(range.end, Some(PerfValue::Double(-95.99)));
    }

    #[test]
    fn test_open_end() {
        let range = Range::parse("10:").unwrap();
        assert_eq!(range.start, Some(PerfValue::Int(10)));
        assert_eq!(range.end, None);
    }

    #[test]
    fn test_huge_start_becomes_unsigned() {
        let range = Range::parse("12345678901234567890:").unwrap();
        assert_eq!(range.start, Some(PerfValue::Uint(12345678901234567890)));
        assert_eq!(range.end, None);
    }

    #[test]
    fn test_inside_prefix() {
        let range = Range::parse("@0:657.8210567").unwrap();
        assert!(range.alert_on_inside);
        assert_eq!(range.start, Some(PerfValue::Int(0)));
        assert_eq!(range.end, Some(PerfValue::Double(657.8210567)));
    }

    #[test]
    fn test_degenerate_interval() {
        let range = Range::parse("1:1").unwrap();
        assert_eq!(range.start, Some(PerfValue::Int(1)));
        assert_eq!(range.end, Some(PerfValue::Int(1)));
    }

    #[test]
    fn test_inverted_interval_rejected() {
        assert_eq!(Range::parse("2:1"), Err(RangeError::StartGreaterThanEnd));
    }

    #[test]
    fn test_garbage_rejected() {
        assert_eq!(
            Range::parse("1:2:3"),
            Err(RangeError::InvalidChar("2:3".to_string()))
        );
        assert!(matches!(Range::parse("abc"), Err(RangeError::InvalidChar(_))));
        assert!(matches!(Range::parse(""), Err(RangeError::InvalidChar(_))));
        assert!(matches!(Range::parse("~"), Err(RangeError::InvalidChar(_))));
        assert!(matches!(Range::parse("5:~"), Err(RangeError::InvalidChar(_))));
    }

    #[test]
    fn test_overflow_and_underflow() {
        assert_eq!(
            Range::parse("99999999999999999999999:"),
            Err(RangeError::Overflow("99999999999999999999999".to_string()))
        );
        assert_eq!(
            Range::parse("-99999999999999999999999:"),
            Err(RangeError::Underflow("-99999999999999999999999".to_string()))
        );
    }

    #[test]
    fn test_oversized_input_rejected() {
        let huge = "1".repeat(MAX_RANGE_INPUT + 1);
        assert_eq!(Range::parse(&huge), Err(RangeError::InputTooLong));
    }
}
