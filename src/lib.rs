//! The shared runtime of a monitoring plugin, with a multi-target ICMP
//! prober built on top of it.
//!
//! A probe composes a [`output::Check`] tree out of
//! [`output::Subcheck`]s, classifies numeric observations against
//! [`thresholds::Thresholds`], attaches [`perfdata::Perfdata`] records,
//! optionally memoizes counters between runs through [`statefile`], and
//! finally exits through [`output::Check::exit`] with the rolled-up
//! state. Child commands run through [`runcmd`], never through a shell.

pub mod icmp;
pub mod output;
pub mod perfdata;
pub mod range;
pub mod runcmd;
pub mod statefile;
pub mod states;
pub mod thresholds;

pub use output::{Check, OutputFormat, Subcheck};
pub use perfdata::{PerfValue, Perfdata};
pub use range::Range;
pub use states::State;
pub use thresholds::Thresholds;
