//! Multi-target ICMP echo prober.
//!
//! Single threaded and cooperative: one loop owns all per-target state
//! and alternates between sending the next eligible probe and waiting
//! on the socket until the nearest deadline. The deadlines are the
//! global timeout, the per-target and global send pacing gates, and the
//! per-probe response timeouts.

pub mod packet;
pub mod socket;
pub mod target;

use crate::output::{Check, OutputFormat, Subcheck};
use crate::perfdata::Perfdata;
use crate::range::Range;
use crate::states::State;
use log::{debug, info};
use socket::{Datagram, DatagramKind, PacketChannel};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use target::{ErrorReply, GroupPolicy, HostGroup, PingTarget, ReplyOutcome, TargetLifecycle};
use thiserror::Error;

#[non_exhaustive]
#[derive(Error, Debug)]
pub enum IcmpError {
    #[error(
        "failed to obtain an ICMP socket: {0}. Raw ICMP needs elevated privileges; \
         unprivileged pings need net.ipv4.ping_group_range to cover this group"
    )]
    Privilege(String),

    #[error("socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error("no targets to probe")]
    NoTargets,
}

/// Which per-target checks are enabled.
#[derive(Copy, Clone, Debug)]
pub struct ModeSwitches {
    pub rta: bool,
    pub pl: bool,
    pub jitter: bool,
    pub mos: bool,
    pub score: bool,
    pub order: bool,
}

impl Default for ModeSwitches {
    fn default() -> Self {
        ModeSwitches {
            rta: true,
            pl: true,
            jitter: false,
            mos: false,
            score: false,
            order: false,
        }
    }
}

/// Threshold values per mode. rta and pl alert upward, mos and score
/// downward.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct ModeThresholds {
    pub rta_ms: f64,
    pub pl: f64,
    pub jitter_ms: f64,
    pub mos: f64,
    pub score: f64,
}

impl ModeThresholds {
    pub fn warning_defaults() -> Self {
        ModeThresholds {
            rta_ms: 200.0,
            pl: 40.0,
            jitter_ms: 40.0,
            mos: 3.5,
            score: 80.0,
        }
    }

    pub fn critical_defaults() -> Self {
        ModeThresholds {
            rta_ms: 500.0,
            pl: 80.0,
            jitter_ms: 50.0,
            mos: 3.0,
            score: 70.0,
        }
    }
}

#[derive(Clone, Debug)]
pub struct IcmpConfig {
    pub packets_per_target: u32,
    /// ICMP payload bytes, timestamp and ping id included.
    pub data_size: usize,
    pub ttl: u32,
    /// Minimum gap between two sends to the same target.
    pub target_interval: Duration,
    /// Minimum gap between any two sends.
    pub packet_interval: Duration,
    /// After this, an unanswered probe is declared lost.
    pub packet_timeout: Duration,
    /// Upper bound for the whole invocation.
    pub timeout: Duration,
    pub warn: ModeThresholds,
    pub crit: ModeThresholds,
    pub modes: ModeSwitches,
    pub min_hosts_alive: Option<u32>,
    pub policy: GroupPolicy,
    /// Echo identifier; the low 16 bits of the PID.
    pub sender_id: u16,
    pub source: Option<IpAddr>,
}

impl Default for IcmpConfig {
    fn default() -> Self {
        IcmpConfig {
            packets_per_target: 5,
            data_size: packet::DEFAULT_PING_DATA_SIZE,
            ttl: 64,
            target_interval: Duration::ZERO,
            packet_interval: Duration::from_millis(80),
            packet_timeout: Duration::from_millis(1000),
            timeout: Duration::from_secs(10),
            warn: ModeThresholds::warning_defaults(),
            crit: ModeThresholds::critical_defaults(),
            modes: ModeSwitches::default(),
            min_hosts_alive: None,
            policy: GroupPolicy::default(),
            sender_id: (std::process::id() & 0xffff) as u16,
            source: None,
        }
    }
}

/// Per-mode classification of one finished target.
#[derive(Clone, Debug)]
pub struct TargetReport {
    pub name: String,
    pub address: IpAddr,
    pub sent: u32,
    pub received: u32,
    pub lost: u32,
    pub duplicates: u32,
    pub metrics: target::TargetMetrics,
    pub rta_state: Option<State>,
    pub pl_state: Option<State>,
    pub jitter_state: Option<State>,
    pub mos_state: Option<State>,
    pub score_state: Option<State>,
    pub order_state: Option<State>,
    pub responded: bool,
    pub last_error: Option<ErrorReply>,
    /// Rollup over the enabled modes.
    pub state: State,
}

#[derive(Clone, Debug)]
pub struct GroupReport {
    pub name: String,
    pub state: State,
    pub target_indices: Vec<usize>,
}

/// Everything the loop learned, fixed after it exits.
#[derive(Clone, Debug)]
pub struct IcmpRunSummary {
    pub targets: Vec<TargetReport>,
    pub groups: Vec<GroupReport>,
    pub failed_hosts: Vec<String>,
    pub hosts_alive: u32,
    pub timed_out: bool,
    pub overall: State,
}

/// Value alerts upward: at or past the threshold is bad.
fn classify_high(value: f64, warn: f64, crit: f64) -> State {
    if value >= crit {
        State::Critical
    } else if value >= warn {
        State::Warning
    } else {
        State::Ok
    }
}

/// Value alerts downward (mos, score): at or below the threshold is bad.
fn classify_low(value: f64, warn: f64, crit: f64) -> State {
    if value <= crit {
        State::Critical
    } else if value <= warn {
        State::Warning
    } else {
        State::Ok
    }
}

/// The less severe of two states under the rollup ordering.
fn min_state(a: State, b: State) -> State {
    if a.max(b) == a {
        b
    } else {
        a
    }
}

pub struct IcmpProber<C: PacketChannel> {
    config: IcmpConfig,
    channel: C,
    targets: Vec<PingTarget>,
    groups: Vec<HostGroup>,
    failed_hosts: Vec<String>,
    /// Global sequence to target mapping for attributing ICMP errors.
    seq_owner: HashMap<u16, usize>,
    next_seq: u16,
    next_global_send: Option<Instant>,
    round_robin: usize,
}

impl<C: PacketChannel> IcmpProber<C> {
    pub fn new(config: IcmpConfig, channel: C) -> Self {
        IcmpProber {
            config,
            channel,
            targets: Vec::new(),
            groups: Vec::new(),
            failed_hosts: Vec::new(),
            seq_owner: HashMap::new(),
            next_seq: 0,
            next_global_send: None,
            round_robin: 0,
        }
    }

    /// Register a host and the addresses it resolved to. Duplicate
    /// addresses are probed once; the first group keeps them.
    pub fn add_host(&mut self, name: &str, addresses: &[IpAddr]) {
        let mut indices = Vec::with_capacity(addresses.len());
        for &address in addresses {
            let index = match self.targets.iter().position(|t| t.address == address) {
                Some(existing) => existing,
                None => {
                    self.targets.push(PingTarget::new(name, address));
                    self.targets.len() - 1
                }
            };
            if !indices.contains(&index) {
                indices.push(index);
            }
        }
        self.groups.push(HostGroup {
            name: name.to_string(),
            target_indices: indices,
        });
    }

    /// Name resolution failed for this host; it is reported Critical
    /// while the remaining hosts proceed.
    pub fn add_unresolved_host(&mut self, name: &str) {
        self.failed_hosts.push(name.to_string());
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    fn all_done(&self) -> bool {
        self.targets
            .iter()
            .all(|t| t.lifecycle() == TargetLifecycle::Done)
    }

    fn next_sendable(&mut self, now: Instant) -> Option<usize> {
        if self.next_global_send.is_some_and(|gate| gate > now) {
            return None;
        }
        let count = self.targets.len();
        for offset in 0..count {
            let index = (self.round_robin + offset) % count;
            let target = &self.targets[index];
            if target.lifecycle() == TargetLifecycle::Pending
                && target.next_send_at.map_or(true, |at| at <= now)
            {
                self.round_robin = (index + 1) % count;
                return Some(index);
            }
        }
        None
    }

    fn send_probe(&mut self, index: usize, now: Instant) -> Result<(), IcmpError> {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let address = self.targets[index].address;
        let ping_id = self.targets[index].sent as u16;
        let timestamp_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        let buf = packet::build_echo_request(
            address.is_ipv6(),
            self.config.sender_id,
            seq,
            ping_id,
            timestamp_us,
            self.config.data_size,
        );

        let mut delivered = false;
        for attempt in 1..=3 {
            match self.channel.send(address, &buf) {
                Ok(n) if n == buf.len() => {
                    delivered = true;
                    break;
                }
                Ok(short) => {
                    debug!(
                        "Short send to {} ({} of {} bytes), attempt {}",
                        address,
                        short,
                        buf.len(),
                        attempt
                    );
                }
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    return Err(IcmpError::Privilege(e.to_string()));
                }
                Err(e) => {
                    debug!("Send to {} failed ({}), attempt {}", address, e, attempt);
                }
            }
        }

        let budget = self.config.packets_per_target;
        let target = &mut self.targets[index];
        if delivered {
            target.record_sent(seq, ping_id, now, budget);
            self.seq_owner.insert(seq, index);
        } else {
            target.record_send_failure(budget);
        }
        target.next_send_at = Some(now + self.config.target_interval);
        self.next_global_send = Some(now + self.config.packet_interval);
        Ok(())
    }

    fn handle_datagram(&mut self, datagram: Datagram, now: Instant) {
        let message = match datagram.kind {
            DatagramKind::V4Raw => packet::parse_v4(&datagram.buf, true),
            DatagramKind::V4Dgram => packet::parse_v4(&datagram.buf, false),
            DatagramKind::V6Raw | DatagramKind::V6Dgram => packet::parse_v6(&datagram.buf),
        };
        let message = match message {
            Some(message) => message,
            None => {
                debug!("Ignoring unparseable frame from {}", datagram.from);
                return;
            }
        };

        let budget = self.config.packets_per_target;
        match message {
            packet::IcmpMessage::EchoReply { ident, seq, .. } => {
                if !datagram.kind.ident_rewritten() && ident != self.config.sender_id {
                    debug!("Ignoring echo reply with foreign identifier {}", ident);
                    return;
                }
                match self
                    .targets
                    .iter_mut()
                    .find(|target| target.address == datagram.from)
                {
                    Some(target) => match target.record_reply(seq, now, budget) {
                        ReplyOutcome::Fresh(rtt_us) => {
                            debug!(
                                "{}: seq {} answered in {:.3}ms",
                                target.name,
                                seq,
                                rtt_us / 1000.0
                            );
                        }
                        ReplyOutcome::Late => {
                            debug!("{}: late reply for seq {}", target.name, seq);
                        }
                        ReplyOutcome::Duplicate | ReplyOutcome::UnknownSequence => {}
                    },
                    None => {
                        debug!("Echo reply from unknown address {}", datagram.from);
                    }
                }
            }
            packet::IcmpMessage::Error {
                icmp_type,
                icmp_code,
                original,
            } => {
                let original = match original {
                    Some(original) => original,
                    None => return,
                };
                if !datagram.kind.ident_rewritten() && original.ident != self.config.sender_id {
                    return;
                }
                if let Some(&owner) = self.seq_owner.get(&original.seq) {
                    self.targets[owner].record_error(
                        ErrorReply {
                            icmp_type,
                            icmp_code,
                            from: datagram.from,
                        },
                        Some(original.seq),
                        budget,
                    );
                }
            }
            packet::IcmpMessage::Other { icmp_type } => {
                debug!("Ignoring ICMP type {} from {}", icmp_type, datagram.from);
            }
        }
    }

    /// The instant the loop next has something to do.
    fn next_wakeup(&self, now: Instant, deadline: Instant) -> Instant {
        let mut wakeup = deadline;
        for target in &self.targets {
            if target.lifecycle() == TargetLifecycle::Done {
                continue;
            }
            if target.lifecycle() == TargetLifecycle::Pending {
                let mut eligible = target.next_send_at.unwrap_or(now);
                if let Some(gate) = self.next_global_send {
                    eligible = eligible.max(gate);
                }
                wakeup = wakeup.min(eligible);
            }
            // Pending targets can have probes in flight too.
            if let Some(expiry) = target.earliest_expiry(self.config.packet_timeout) {
                wakeup = wakeup.min(expiry);
            }
        }
        wakeup
    }

    /// Run the probe loop to completion or the global timeout and
    /// produce the run summary.
    pub fn run(&mut self) -> Result<IcmpRunSummary, IcmpError> {
        if self.targets.is_empty() && self.failed_hosts.is_empty() {
            return Err(IcmpError::NoTargets);
        }

        let started = Instant::now();
        let deadline = started + self.config.timeout;
        let mut timed_out = false;

        info!(
            "Probing {} target(s) with {} packet(s) each",
            self.targets.len(),
            self.config.packets_per_target
        );

        loop {
            let now = Instant::now();
            if now >= deadline {
                timed_out = !self.all_done();
                debug!("Global timeout reached, finishing with current data");
                break;
            }

            for target in &mut self.targets {
                target.expire(now, self.config.packet_timeout, self.config.packets_per_target);
            }
            if self.all_done() {
                break;
            }

            if let Some(index) = self.next_sendable(now) {
                self.send_probe(index, now)?;
                continue;
            }

            let wakeup = self.next_wakeup(now, deadline);
            let wait = wakeup
                .saturating_duration_since(now)
                .max(Duration::from_millis(1));
            match self.channel.wait(wait) {
                Ok(Some(datagram)) => self.handle_datagram(datagram, Instant::now()),
                Ok(None) => {}
                Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                    return Err(IcmpError::Privilege(e.to_string()));
                }
                Err(e) => return Err(IcmpError::Socket(e)),
            }
        }

        for target in &mut self.targets {
            target.finalize();
        }
        Ok(self.summarize(timed_out))
    }

    fn evaluate_target(&self, target: &PingTarget) -> TargetReport {
        let modes = self.config.modes;
        let warn = self.config.warn;
        let crit = self.config.crit;
        let metrics = target.metrics(crit.pl, crit.jitter_ms);

        let rta_state = modes
            .rta
            .then(|| classify_high(metrics.rta_ms, warn.rta_ms, crit.rta_ms));
        let pl_state = modes
            .pl
            .then(|| classify_high(metrics.packet_loss, warn.pl, crit.pl));
        let jitter_state = modes
            .jitter
            .then(|| classify_high(metrics.jitter_ms, warn.jitter_ms, crit.jitter_ms));
        let mos_state = modes
            .mos
            .then(|| classify_low(metrics.mos, warn.mos, crit.mos));
        let score_state = modes
            .score
            .then(|| classify_low(metrics.score, warn.score, crit.score));
        let order_state = modes.order.then(|| {
            if target.found_out_of_order {
                State::Critical
            } else {
                State::Ok
            }
        });

        let state = [
            rta_state,
            pl_state,
            jitter_state,
            mos_state,
            score_state,
            order_state,
        ]
        .into_iter()
        .flatten()
        .reduce(State::max)
        .unwrap_or(State::Ok);

        TargetReport {
            name: target.name.clone(),
            address: target.address,
            sent: target.sent,
            received: target.received,
            lost: target.lost,
            duplicates: target.duplicates,
            metrics,
            rta_state,
            pl_state,
            jitter_state,
            mos_state,
            score_state,
            order_state,
            responded: target.responded,
            last_error: target.last_error.clone(),
            state,
        }
    }

    fn summarize(&self, timed_out: bool) -> IcmpRunSummary {
        let reports: Vec<TargetReport> =
            self.targets.iter().map(|t| self.evaluate_target(t)).collect();

        let groups: Vec<GroupReport> = self
            .groups
            .iter()
            .map(|group| {
                let members: Vec<&TargetReport> = group
                    .target_indices
                    .iter()
                    .map(|&index| &reports[index])
                    .collect();
                let state = match self.config.policy {
                    GroupPolicy::IcmpDefault | GroupPolicy::All => members
                        .iter()
                        .map(|m| m.state)
                        .reduce(State::max)
                        .unwrap_or(State::Critical),
                    GroupPolicy::Any => members
                        .iter()
                        .map(|m| m.state)
                        .reduce(min_state)
                        .unwrap_or(State::Critical),
                    GroupPolicy::Hostcheck => {
                        if members.iter().any(|m| m.responded) {
                            State::Ok
                        } else {
                            State::Critical
                        }
                    }
                };
                GroupReport {
                    name: group.name.clone(),
                    state,
                    target_indices: group.target_indices.clone(),
                }
            })
            .collect();

        let hosts_alive = reports.iter().filter(|r| r.received > 0).count() as u32;

        let overall = if let Some(min_alive) = self.config.min_hosts_alive {
            if hosts_alive >= min_alive {
                State::Ok
            } else {
                State::Critical
            }
        } else {
            let mut overall = groups
                .iter()
                .map(|g| g.state)
                .reduce(State::max)
                .unwrap_or(State::Unknown);
            if !self.failed_hosts.is_empty() {
                overall = overall.max(State::Critical);
            }
            overall
        };

        IcmpRunSummary {
            targets: reports,
            groups,
            failed_hosts: self.failed_hosts.clone(),
            hosts_alive,
            timed_out,
            overall,
        }
    }
}

fn high_range(warn: f64) -> Option<Range> {
    Range::parse(&format!("0:{}", warn)).ok()
}

fn low_range(warn: f64) -> Option<Range> {
    Range::parse(&format!("{}:", warn)).ok()
}

fn target_subcheck(
    report: &TargetReport,
    config: &IcmpConfig,
    label_prefix: &str,
) -> Subcheck {
    let metrics = &report.metrics;
    let mut text = format!(
        "{} ({}): rta {:.3}ms, lost {:.0}%",
        report.name, report.address, metrics.rta_ms, metrics.packet_loss
    );
    if config.modes.jitter {
        text.push_str(&format!(", jitter {:.3}ms", metrics.jitter_ms));
    }
    if config.modes.mos {
        text.push_str(&format!(", mos {:.1}", metrics.mos));
    }
    if config.modes.score {
        text.push_str(&format!(", score {:.0}", metrics.score));
    }
    if config.modes.order && report.order_state == Some(State::Critical) {
        text.push_str(", packets out of order");
    }
    if let Some(error) = &report.last_error {
        text.push_str(&format!(
            ", last error type {} code {} from {}",
            error.icmp_type, error.icmp_code, error.from
        ));
    }

    let mut subcheck = Subcheck::new(text).with_state(report.state);
    let label = |metric: &str| format!("{}{}", label_prefix, metric);

    if config.modes.rta {
        let mut pd = Perfdata::new(label("rta"), metrics.rta_ms).with_uom("ms").with_min(0);
        pd.warn = high_range(config.warn.rta_ms);
        pd.crit = high_range(config.crit.rta_ms);
        let _ = subcheck.add_perfdata(pd);
    }
    if config.modes.pl {
        let mut pd = Perfdata::new(label("pl"), metrics.packet_loss.round() as u64)
            .with_uom("%")
            .with_min(0)
            .with_max(100u64);
        pd.warn = high_range(config.warn.pl);
        pd.crit = high_range(config.crit.pl);
        let _ = subcheck.add_perfdata(pd);
    }
    if config.modes.jitter {
        let mut pd = Perfdata::new(label("jitter"), metrics.jitter_ms)
            .with_uom("ms")
            .with_min(0);
        pd.warn = high_range(config.warn.jitter_ms);
        pd.crit = high_range(config.crit.jitter_ms);
        let _ = subcheck.add_perfdata(pd);
    }
    if config.modes.mos {
        let mut pd = Perfdata::new(label("mos"), metrics.mos)
            .with_min(0)
            .with_max(4.5);
        pd.warn = low_range(config.warn.mos);
        pd.crit = low_range(config.crit.mos);
        let _ = subcheck.add_perfdata(pd);
    }
    if config.modes.score {
        let mut pd = Perfdata::new(label("score"), metrics.score)
            .with_min(0)
            .with_max(100u64);
        pd.warn = low_range(config.warn.score);
        pd.crit = low_range(config.crit.score);
        let _ = subcheck.add_perfdata(pd);
    }
    subcheck
}

/// Turn a run summary into the output tree. The tree's rolled-up state
/// equals the summary's overall state.
pub fn report(summary: &IcmpRunSummary, config: &IcmpConfig, format: OutputFormat) -> Check {
    let mut check = Check::new().with_format(format);
    let multiple = summary.targets.len() > 1;
    let mut name_counts: HashMap<&str, usize> = HashMap::new();
    for target in &summary.targets {
        *name_counts.entry(target.name.as_str()).or_default() += 1;
    }
    let prefix_for = |report: &TargetReport| {
        if !multiple {
            return String::new();
        }
        // Host names land in perfdata labels; a quote there would make
        // the record unrepresentable, and a name resolving to several
        // addresses would repeat the label.
        let base = report.name.replace('\'', "_");
        if name_counts.get(report.name.as_str()).copied().unwrap_or(0) > 1 {
            format!("{}_{}_", base, report.address)
        } else {
            format!("{}_", base)
        }
    };

    let mut top_level: Vec<Subcheck> = Vec::new();

    match config.policy {
        GroupPolicy::IcmpDefault => {
            for report in &summary.targets {
                top_level.push(target_subcheck(report, config, &prefix_for(report)));
            }
        }
        _ => {
            for group in &summary.groups {
                let mut group_subcheck = Subcheck::new(format!(
                    "{}: {} of {} address(es) answered",
                    group.name,
                    group
                        .target_indices
                        .iter()
                        .filter(|&&index| summary.targets[index].received > 0)
                        .count(),
                    group.target_indices.len()
                ))
                .with_state(group.state);
                for &index in &group.target_indices {
                    let report = &summary.targets[index];
                    let _ = group_subcheck
                        .add_subcheck(target_subcheck(report, config, &prefix_for(report)));
                }
                top_level.push(group_subcheck);
            }
        }
    }

    for failed in &summary.failed_hosts {
        top_level.push(
            Subcheck::new(format!("{}: name resolution failed", failed))
                .with_state(State::Critical),
        );
    }

    if let Some(min_alive) = config.min_hosts_alive {
        let mut wrapper = Subcheck::new(format!(
            "{} of {} host(s) alive (minimum {})",
            summary.hosts_alive,
            summary.targets.len(),
            min_alive
        ))
        .with_state(summary.overall);
        for subcheck in top_level {
            let _ = wrapper.add_subcheck(subcheck);
        }
        let _ = check.add_subcheck(wrapper);
    } else {
        for subcheck in top_level {
            let _ = check.add_subcheck(subcheck);
        }
    }

    if summary.timed_out {
        check.set_summary(format!(
            "timeout after {:.1}s with incomplete results, {} of {} host(s) alive",
            config.timeout.as_secs_f64(),
            summary.hosts_alive,
            summary.targets.len()
        ));
    }

    check
}
