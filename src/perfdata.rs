use crate::range::Range;
use std::cmp::Ordering;
use std::fmt;

/// A typed perfdata numeric.
///
/// Mirrors the three wire representations: signed 64 bit, unsigned 64 bit
/// and double. Comparisons between the two integer kinds stay integral;
/// anything involving a double widens to double.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum PerfValue {
    Int(i64),
    Uint(u64),
    Double(f64),
}

impl PerfValue {
    /// Widen to a comparable double. Defined for all three representations.
    pub fn as_f64(self) -> f64 {
        match self {
            PerfValue::Int(i) => i as f64,
            PerfValue::Uint(u) => u as f64,
            PerfValue::Double(d) => d,
        }
    }

    /// Total comparison across representations.
    pub fn compare(self, other: PerfValue) -> Ordering {
        match (self, other) {
            (PerfValue::Int(a), PerfValue::Int(b)) => a.cmp(&b),
            (PerfValue::Uint(a), PerfValue::Uint(b)) => a.cmp(&b),
            (PerfValue::Int(a), PerfValue::Uint(b)) => {
                if a < 0 {
                    Ordering::Less
                } else {
                    (a as u64).cmp(&b)
                }
            }
            (PerfValue::Uint(a), PerfValue::Int(b)) => {
                if b < 0 {
                    Ordering::Greater
                } else {
                    a.cmp(&(b as u64))
                }
            }
            (a, b) => a.as_f64().total_cmp(&b.as_f64()),
        }
    }
}

impl From<i64> for PerfValue {
    fn from(v: i64) -> Self {
        PerfValue::Int(v)
    }
}

impl From<i32> for PerfValue {
    fn from(v: i32) -> Self {
        PerfValue::Int(v as i64)
    }
}

impl From<u64> for PerfValue {
    fn from(v: u64) -> Self {
        PerfValue::Uint(v)
    }
}

impl From<u32> for PerfValue {
    fn from(v: u32) -> Self {
        PerfValue::Uint(v as u64)
    }
}

impl From<f64> for PerfValue {
    fn from(v: f64) -> Self {
        PerfValue::Double(v)
    }
}

impl fmt::Display for PerfValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PerfValue::Int(i) => write!(f, "{}", i),
            PerfValue::Uint(u) => write!(f, "{}", u),
            // `{}` on f64 is the shortest representation that round-trips.
            PerfValue::Double(d) => write!(f, "{}", d),
        }
    }
}


/// One labeled performance observation, emitted after the `|` separator.
#[derive(Clone, Debug, PartialEq)]
pub struct Perfdata {
    pub label: String,
    pub uom: String,
    pub value: PerfValue,
    pub warn: Option<Range>,
    pub crit: Option<Range>,
    pub min: Option<PerfValue>,
    pub max: Option<PerfValue>,
}

impl Perfdata {
    pub fn new(label: impl Into<String>, value: impl Into<PerfValue>) -> Self {
        Perfdata {
            label: label.into(),
            uom: String::new(),
            value: value.into(),
            warn: None,
            crit: None,
            min: None,
            max: None,
        }
    }

    pub fn with_uom(mut self, uom: impl Into<String>) -> Self {
        self.uom = uom.into();
        self
    }

    pub fn with_warn(mut self, warn: Range) -> Self {
        self.warn = Some(warn);
        self
    }

    pub fn with_crit(mut self, crit: Range) -> Self {
        self.crit = Some(crit);
        self
    }

    /// Attach both threshold ranges at once, skipping the unset ones.
    pub fn with_thresholds(mut self, thresholds: &crate::thresholds::Thresholds) -> Self {
        self.warn = thresholds.warning.clone();
        self.crit = thresholds.critical.clone();
        self
    }

    pub fn with_min(mut self, min: impl Into<PerfValue>) -> Self {
        self.min = Some(min.into());
        self
    }

    pub fn with_max(mut self, max: impl Into<PerfValue>) -> Self {
        self.max = Some(max.into());
        self
    }

    /// A label needs quoting when it carries whitespace, `=`, `'` or `,`.
    /// Embedded single quotes cannot be represented at all; attaching such
    /// a record to a subcheck is rejected there.
    fn quoted_label(&self) -> String {
        if self
            .label
            .chars()
            .any(|c| c.is_whitespace() || c == '=' || c == '\'' || c == ',')
        {
            format!("'{}'", self.label)
        } else {
            self.label.clone()
        }
    }
}

impl fmt::Display for Perfdata {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}={}{}", self.quoted_label(), self.value, self.uom)?;
        match &self.warn {
            Some(w) => write!(f, ";{}", w)?,
            None => write!(f, ";")?,
        }
        match &self.crit {
            Some(c) => write!(f, ";{}", c)?,
            None => write!(f, ";")?,
        }
        match &self.min {
            Some(m) => write!(f, ";{}", m)?,
            None => write!(f, ";")?,
        }
        match &self.max {
            Some(m) => write!(f, ";{}", m)?,
            None => write!(f, ";")?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod perfdata_emission_tests {
    use super::*;
    use crate::range::Range;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_bare_record() {
        let pd = Perfdata::new("foo", 23).with_uom("s");
        assert_eq!(pd.to_string(), "foo=23s;;;;");
    }

    #[test]
    fn test_full_record() {
        let pd = Perfdata::new("rta", 0.12)
            .with_uom("s")
            .with_warn(Range::parse("0:0.2").unwrap())
            .with_crit(Range::parse("0:0.5").unwrap());
        assert_eq!(pd.to_string(), "rta=0.12s;0:0.2;0:0.5;;");
    }

    #[test]
    fn test_min_max() {
        let pd = Perfdata::new("pl", 5u64)
            .with_uom("%")
            .with_min(0)
            .with_max(100);
        assert_eq!(pd.to_string(), "pl=5%;;;0;100");
    }

    #[test]
    fn test_label_quoting() {
        let pd = Perfdata::new("Average Jitter", 0.1).with_uom("ms");
        assert_eq!(pd.to_string(), "'Average Jitter'=0.1ms;;;;");

        let pd = Perfdata::new("a=b", 1);
        assert_eq!(pd.to_string(), "'a=b'=1;;;;");

        let pd = Perfdata::new("a,b", 1);
        assert_eq!(pd.to_string(), "'a,b'=1;;;;");
    }

    #[test]
    fn test_uint_record() {
        let pd = Perfdata::new("packets", 5u64);
        assert_eq!(pd.to_string(), "packets=5;;;;");
    }

    #[test]
    fn test_thresholds_attach_both_ranges() {
        let thresholds =
            crate::thresholds::Thresholds::from_strings(Some("0:0.2"), Some("0:0.5")).unwrap();
        let pd = Perfdata::new("rta", 0.12)
            .with_uom("s")
            .with_thresholds(&thresholds);
        assert_eq!(pd.to_string(), "rta=0.12s;0:0.2;0:0.5;;");
    }
}
