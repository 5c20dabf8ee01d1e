use serde::Serialize;
use std::fmt;

/// The result state of a check or subcheck.
///
/// Two different severity orderings exist for aggregation, see [`State::max`]
/// and [`State::max_alt`]. Neither matches the numeric order of the exit
/// codes, so never compare states with `<`/`>` directly.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
    Ok,
    Warning,
    Critical,
    Unknown,
    Dependent,
}

impl State {
    /// The process exit code consumed by the monitoring host.
    ///
    /// Only 0..=3 are part of the contract. `Dependent` has no code of its
    /// own and surfaces as Unknown.
    pub fn exit_code(self) -> i32 {
        match self {
            State::Ok => 0,
            State::Warning => 1,
            State::Critical => 2,
            State::Unknown => 3,
            State::Dependent => 3,
        }
    }

    /// Combine two states under the rollup ordering:
    /// `Dependent < Unknown < Ok < Warning < Critical`.
    ///
    /// Unknown ranks below Ok here so that an unknown subresult does not
    /// mask a real problem elsewhere in an aggregation.
    pub fn max(self, other: State) -> State {
        for candidate in [
            State::Critical,
            State::Warning,
            State::Ok,
            State::Unknown,
            State::Dependent,
        ] {
            if self == candidate || other == candidate {
                return candidate;
            }
        }
        self
    }

    /// Combine two states under the alternate ordering:
    /// `Ok < Dependent < Unknown < Warning < Critical`.
    ///
    /// Used where Unknown must escalate over Ok instead of disappearing
    /// into it.
    pub fn max_alt(self, other: State) -> State {
        for candidate in [
            State::Critical,
            State::Warning,
            State::Unknown,
            State::Dependent,
            State::Ok,
        ] {
            if self == candidate || other == candidate {
                return candidate;
            }
        }
        self
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            State::Ok => write!(f, "OK"),
            State::Warning => write!(f, "WARNING"),
            State::Critical => write!(f, "CRITICAL"),
            State::Unknown => write!(f, "UNKNOWN"),
            State::Dependent => write!(f, "DEPENDENT"),
        }
    }
}


#[cfg(test)]
mod max_state_alt_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_unknown_escalates_over_ok() {
        assert_eq!(State::Ok.max_alt(State::Unknown), State::Unknown);
        assert_eq!(State::Unknown.max_alt(State::Ok), State::Unknown);
    }

    #[test]
    fn test_dependent_over_ok() {
        assert_eq!(State::Ok.max_alt(State::Dependent), State::Dependent);
    }

    #[test]
    fn test_critical_still_wins() {
        assert_eq!(State::Unknown.max_alt(State::Critical), State::Critical);
    }
}
