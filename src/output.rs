use crate::perfdata::Perfdata;
use crate::states::State;
use log::debug;
use serde::Serialize;
use std::fmt;
use std::process;
use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug, PartialEq)]
pub enum OutputError {
    #[error("subcheck needs output text and either an explicit state or subchecks")]
    InvalidSubcheck,

    #[error("perfdata label must not be empty")]
    EmptyPerfdataLabel,

    #[error("perfdata label must not contain a single quote: '{0}'")]
    QuoteInPerfdataLabel(String),
}

/// How the final check result is rendered.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Everything on a single line, subchecks inlined.
    OneLine,
    /// Summary line, one indented line per subcheck, perfdata at the end.
    #[default]
    MultiLine,
    /// The summary line only.
    SummaryOnly,
    /// Stable JSON rendering, for test-suite diffing only.
    TestJson,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "one-line" | "oneline" => Ok(OutputFormat::OneLine),
            "multi-line" | "multiline" => Ok(OutputFormat::MultiLine),
            "summary-only" | "summary" => Ok(OutputFormat::SummaryOnly),
            "test-json" | "json" => Ok(OutputFormat::TestJson),
            _ => Err(format!("'{}' is not a valid output format", s)),
        }
    }
}

/// A partial check result: one logical test inside a check.
#[derive(Clone, Debug, PartialEq)]
pub struct Subcheck {
    state: State,
    default_state: State,
    state_set_explicitly: bool,
    pub output: String,
    perfdata: Vec<Perfdata>,
    children: Vec<Subcheck>,
}

impl Subcheck {
    /// A fresh subcheck: state Unknown, not explicitly set, no perfdata,
    /// no children.
    pub fn new(output: impl Into<String>) -> Self {
        Subcheck {
            state: State::Unknown,
            default_state: State::Unknown,
            state_set_explicitly: false,
            output: output.into(),
            perfdata: Vec::new(),
            children: Vec::new(),
        }
    }

    pub fn set_state(&mut self, state: State) {
        self.state = state;
        self.state_set_explicitly = true;
    }

    /// Used only if the state is never set explicitly and no children
    /// exist to roll up from.
    pub fn set_default_state(&mut self, state: State) {
        self.default_state = state;
    }

    /// Builder form of [`Subcheck::set_state`].
    pub fn with_state(mut self, state: State) -> Self {
        self.set_state(state);
        self
    }

    pub fn add_perfdata(&mut self, perfdata: Perfdata) -> Result<(), OutputError> {
        if perfdata.label.is_empty() {
            return Err(OutputError::EmptyPerfdataLabel);
        }
        if perfdata.label.contains('\'') {
            return Err(OutputError::QuoteInPerfdataLabel(perfdata.label.clone()));
        }
        self.perfdata.push(perfdata);
        Ok(())
    }

    /// Attach a child. The child must carry output text and either an
    /// explicit state or children of its own to roll a state up from.
    pub fn add_subcheck(&mut self, child: Subcheck) -> Result<(), OutputError> {
        if child.output.is_empty() || (!child.state_set_explicitly && child.children.is_empty()) {
            return Err(OutputError::InvalidSubcheck);
        }
        self.children.push(child);
        Ok(())
    }

    /// The effective state: explicit if set, else the rollup maximum over
    /// the children, else the default state.
    pub fn computed_state(&self) -> State {
        if self.state_set_explicitly {
            return self.state;
        }
        self.children
            .iter()
            .map(Subcheck::computed_state)
            .reduce(State::max)
            .unwrap_or(self.default_state)
    }

    fn collect_perfdata<'a>(&'a self, into: &mut Vec<&'a Perfdata>) {
        for perfdata in &self.perfdata {
            into.push(perfdata);
        }
        for child in &self.children {
            child.collect_perfdata(into);
        }
    }

    fn render_multi_line(&self, depth: usize, into: &mut String) {
        for _ in 0..depth {
            into.push('\t');
        }
        into.push_str(&format!(
            "\\_[{}] - {}\n",
            self.computed_state(),
            self.output
        ));
        for child in &self.children {
            child.render_multi_line(depth + 1, into);
        }
    }

    fn render_one_line(&self, into: &mut String) {
        into.push_str(&format!(", [{}] - {}", self.computed_state(), self.output));
        for child in &self.children {
            child.render_one_line(into);
        }
    }
}

#[derive(Serialize)]
struct JsonSubcheck {
    state: State,
    output: String,
    perfdata: Vec<String>,
    subchecks: Vec<JsonSubcheck>,
}

impl From<&Subcheck> for JsonSubcheck {
    fn from(subcheck: &Subcheck) -> Self {
        JsonSubcheck {
            state: subcheck.computed_state(),
            output: subcheck.output.clone(),
            perfdata: subcheck.perfdata.iter().map(|pd| pd.to_string()).collect(),
            subchecks: subcheck.children.iter().map(JsonSubcheck::from).collect(),
        }
    }
}

/// The root of a check: exists once per plugin invocation. The final
/// result is derived from the worst state among the direct subchecks.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Check {
    pub format: OutputFormat,
    pub summary: Option<String>,
    subchecks: Vec<Subcheck>,
}

impl Check {
    pub fn new() -> Self {
        Check::default()
    }

    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    pub fn set_summary(&mut self, summary: impl Into<String>) {
        self.summary = Some(summary.into());
    }

    pub fn add_subcheck(&mut self, child: Subcheck) -> Result<(), OutputError> {
        if child.output.is_empty() || (!child.state_set_explicitly && child.children.is_empty()) {
            return Err(OutputError::InvalidSubcheck);
        }
        self.subchecks.push(child);
        Ok(())
    }

    /// The exit state: the rollup maximum over the direct subchecks only.
    /// Deeper levels already rolled up into their parents. An empty check
    /// never becomes Ok.
    pub fn computed_state(&self) -> State {
        self.subchecks
            .iter()
            .map(Subcheck::computed_state)
            .reduce(State::max)
            .unwrap_or(State::Unknown)
    }

    fn summary_line(&self) -> String {
        if let Some(summary) = &self.summary {
            return summary.clone();
        }

        let mut ok = 0;
        let mut warning = 0;
        let mut critical = 0;
        let mut unknown = 0;
        for subcheck in &self.subchecks {
            match subcheck.computed_state() {
                State::Ok => ok += 1,
                State::Warning => warning += 1,
                State::Critical => critical += 1,
                State::Unknown | State::Dependent => unknown += 1,
            }
        }
        format!(
            "ok={}, warning={}, critical={}, unknown={}",
            ok, warning, critical, unknown
        )
    }

    fn all_perfdata(&self) -> Vec<&Perfdata> {
        let mut collected = Vec::new();
        for subcheck in &self.subchecks {
            subcheck.collect_perfdata(&mut collected);
        }
        collected
    }

    /// Render the check in its configured format. Two trees with equal
    /// contents render to equal text.
    pub fn render(&self) -> String {
        match self.format {
            OutputFormat::MultiLine => self.render_multi_line(),
            OutputFormat::OneLine => self.render_one_line(),
            OutputFormat::SummaryOnly => {
                format!("[{}] - {}", self.computed_state(), self.summary_line())
            }
            OutputFormat::TestJson => self.render_test_json(),
        }
    }

    fn render_multi_line(&self) -> String {
        let mut out = format!("[{}] - {}\n", self.computed_state(), self.summary_line());
        for subcheck in &self.subchecks {
            subcheck.render_multi_line(1, &mut out);
        }
        let perfdata = self.all_perfdata();
        if !perfdata.is_empty() {
            out.push('|');
            for record in perfdata {
                out.push_str(&format!("{} ", record));
            }
            out.push('\n');
        }
        out
    }

    fn render_one_line(&self) -> String {
        let mut out = format!("[{}] - {}", self.computed_state(), self.summary_line());
        for subcheck in &self.subchecks {
            subcheck.render_one_line(&mut out);
        }
        let perfdata = self.all_perfdata();
        if !perfdata.is_empty() {
            out.push('|');
            let rendered: Vec<String> = perfdata.iter().map(|pd| pd.to_string()).collect();
            out.push_str(&rendered.join(" "));
        }
        out
    }

    fn render_test_json(&self) -> String {
        #[derive(Serialize)]
        struct JsonCheck {
            state: State,
            output: String,
            perfdata: Vec<String>,
            subchecks: Vec<JsonSubcheck>,
        }

        let rendering = JsonCheck {
            state: self.computed_state(),
            output: self.summary_line(),
            perfdata: Vec::new(),
            subchecks: self.subchecks.iter().map(JsonSubcheck::from).collect(),
        };
        // Serialization of this shape cannot fail.
        serde_json::to_string(&rendering).unwrap_or_default()
    }

    /// Print the rendered check and terminate with its exit code.
    pub fn exit(self) -> ! {
        let state = self.computed_state();
        debug!("Final check state: {}", state);
        let rendered = self.render();
        if rendered.ends_with('\n') {
            print!("{}", rendered);
        } else {
            println!("{}", rendered);
        }
        process::exit(state.exit_code());
    }
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}




#[cfg(test)]
mod format_parse_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_known_formats() {
        assert_eq!("one-line".parse(), Ok(OutputFormat::OneLine));
        assert_eq!("multi-line".parse(), Ok(OutputFormat::MultiLine));
        assert_eq!("summary-only".parse(), Ok(OutputFormat::SummaryOnly));
        assert_eq!("test-json".parse(), Ok(OutputFormat::TestJson));
    }

    #[test]
    fn test_unknown_format() {
        assert!("yaml".parse::<OutputFormat>().is_err());
    }
}
