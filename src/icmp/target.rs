use log::debug;
use std::collections::HashSet;
use std::net::IpAddr;
use std::time::Instant;

/// Sequence wrap heuristic: a reply whose sequence is this far below
/// the last seen one is a 2^16 wrap, not reordering.
const SEQUENCE_WRAP_GAP: u16 = 32768;

/// Lifecycle of one target, driven only by the probe loop's time and
/// events.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum TargetLifecycle {
    /// Packets left to send.
    Pending,
    /// Everything sent, responses or their timeouts outstanding.
    Draining,
    Done,
}

/// The last ICMP error a target answered with.
#[derive(Clone, Debug, PartialEq)]
pub struct ErrorReply {
    pub icmp_type: u8,
    pub icmp_code: u8,
    pub from: IpAddr,
}

/// A sent probe awaiting its reply or timeout.
#[derive(Copy, Clone, Debug)]
pub struct PendingProbe {
    pub seq: u16,
    pub ping_id: u16,
    pub sent_at: Instant,
}

/// What a reply turned out to be once matched against the send ring.
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum ReplyOutcome {
    /// Matched a pending probe; carries the RTT in microseconds.
    Fresh(f64),
    /// Arrived after its probe was already declared lost. Counts as
    /// received, contributes no RTT.
    Late,
    /// Already answered; ignored.
    Duplicate,
    /// No record of this sequence at all.
    UnknownSequence,
}

/// One probed address with all its counters.
#[derive(Debug)]
pub struct PingTarget {
    /// The user-supplied name this address resolved from.
    pub name: String,
    pub address: IpAddr,

    pub sent: u32,
    pub received: u32,
    pub lost: u32,

    time_waited_us: u64,
    rtmin_us: f64,
    rtmax_us: f64,
    last_rtt_us: Option<f64>,
    jitter_sum_us: f64,
    jitter_samples: u32,

    last_seq: Option<u16>,
    pub found_out_of_order: bool,

    pub last_error: Option<ErrorReply>,
    /// Any sign of life, including ICMP errors. Hostcheck mode keys on
    /// this.
    pub responded: bool,

    pending: Vec<PendingProbe>,
    replied: HashSet<u16>,
    expired: HashSet<u16>,
    pub duplicates: u32,

    pub next_send_at: Option<Instant>,
    lifecycle: TargetLifecycle,
}

impl PingTarget {
    pub fn new(name: impl Into<String>, address: IpAddr) -> Self {
        PingTarget {
            name: name.into(),
            address,
            sent: 0,
            received: 0,
            lost: 0,
            time_waited_us: 0,
            rtmin_us: f64::INFINITY,
            rtmax_us: 0.0,
            last_rtt_us: None,
            jitter_sum_us: 0.0,
            jitter_samples: 0,
            last_seq: None,
            found_out_of_order: false,
            last_error: None,
            responded: false,
            pending: Vec::new(),
            replied: HashSet::new(),
            expired: HashSet::new(),
            duplicates: 0,
            next_send_at: None,
            lifecycle: TargetLifecycle::Pending,
        }
    }

    pub fn lifecycle(&self) -> TargetLifecycle {
        self.lifecycle
    }

    fn refresh_lifecycle(&mut self, budget: u32) {
        self.lifecycle = if self.sent < budget {
            TargetLifecycle::Pending
        } else if self.pending.is_empty() {
            TargetLifecycle::Done
        } else {
            TargetLifecycle::Draining
        };
    }

    pub fn record_sent(&mut self, seq: u16, ping_id: u16, now: Instant, budget: u32) {
        self.sent += 1;
        self.pending.push(PendingProbe {
            seq,
            ping_id,
            sent_at: now,
        });
        self.refresh_lifecycle(budget);
    }

    /// A probe that could not be handed to the kernel after retries.
    pub fn record_send_failure(&mut self, budget: u32) {
        self.sent += 1;
        self.lost += 1;
        self.refresh_lifecycle(budget);
    }

    fn note_sequence(&mut self, seq: u16) {
        if let Some(last) = self.last_seq {
            if seq < last && last - seq < SEQUENCE_WRAP_GAP {
                debug!(
                    "{}: sequence {} arrived after {}, marking out of order",
                    self.name, seq, last
                );
                self.found_out_of_order = true;
            }
        }
        self.last_seq = Some(seq);
    }

    /// Match an echo reply against the send ring and update the RTT and
    /// jitter accounting.
    pub fn record_reply(&mut self, seq: u16, now: Instant, budget: u32) -> ReplyOutcome {
        if self.replied.contains(&seq) {
            self.duplicates += 1;
            debug!("{}: duplicate reply for sequence {}", self.name, seq);
            return ReplyOutcome::Duplicate;
        }

        if let Some(position) = self.pending.iter().position(|probe| probe.seq == seq) {
            let probe = self.pending.swap_remove(position);
            let rtt_us = now.duration_since(probe.sent_at).as_secs_f64() * 1_000_000.0;

            self.received += 1;
            self.responded = true;
            self.time_waited_us += rtt_us as u64;
            self.rtmin_us = self.rtmin_us.min(rtt_us);
            self.rtmax_us = self.rtmax_us.max(rtt_us);
            if let Some(previous) = self.last_rtt_us {
                self.jitter_sum_us += (rtt_us - previous).abs();
                self.jitter_samples += 1;
            }
            self.last_rtt_us = Some(rtt_us);

            self.note_sequence(seq);
            self.replied.insert(seq);
            self.refresh_lifecycle(budget);
            return ReplyOutcome::Fresh(rtt_us);
        }

        if self.expired.remove(&seq) {
            // Its send time is gone from the ring; no RTT contribution.
            self.received += 1;
            self.lost = self.lost.saturating_sub(1);
            self.responded = true;
            self.note_sequence(seq);
            self.replied.insert(seq);
            self.refresh_lifecycle(budget);
            return ReplyOutcome::Late;
        }

        ReplyOutcome::UnknownSequence
    }

    /// An ICMP error answering one of our probes: counted as lost, not
    /// as received, but it is still a sign of life.
    pub fn record_error(&mut self, error: ErrorReply, seq: Option<u16>, budget: u32) {
        if let Some(seq) = seq {
            if let Some(position) = self.pending.iter().position(|probe| probe.seq == seq) {
                self.pending.swap_remove(position);
                self.lost += 1;
                self.expired.insert(seq);
            }
        }
        debug!(
            "{}: ICMP error type {} code {} from {}",
            self.name, error.icmp_type, error.icmp_code, error.from
        );
        self.last_error = Some(error);
        self.responded = true;
        self.refresh_lifecycle(budget);
    }

    /// Declare probes older than the per-packet timeout lost.
    pub fn expire(&mut self, now: Instant, packet_timeout: std::time::Duration, budget: u32) {
        let mut index = 0;
        while index < self.pending.len() {
            if now.duration_since(self.pending[index].sent_at) >= packet_timeout {
                let probe = self.pending.swap_remove(index);
                debug!(
                    "{}: probe seq {} timed out, counting as lost",
                    self.name, probe.seq
                );
                self.lost += 1;
                self.expired.insert(probe.seq);
            } else {
                index += 1;
            }
        }
        self.refresh_lifecycle(budget);
    }

    /// The global alarm fired: everything still in flight is lost.
    pub fn finalize(&mut self) {
        for probe in self.pending.drain(..) {
            self.lost += 1;
            self.expired.insert(probe.seq);
        }
        self.lifecycle = TargetLifecycle::Done;
    }

    pub fn earliest_expiry(&self, packet_timeout: std::time::Duration) -> Option<Instant> {
        self.pending
            .iter()
            .map(|probe| probe.sent_at + packet_timeout)
            .min()
    }

    /// Derived per-target figures, computed once after the loop exits.
    pub fn metrics(&self, crit_pl: f64, crit_jitter_ms: f64) -> TargetMetrics {
        let packet_loss = if self.sent == 0 {
            100.0
        } else {
            100.0 * f64::from(self.sent - self.received.min(self.sent)) / f64::from(self.sent)
        };

        let rta_ms = if self.received == 0 {
            0.0
        } else {
            self.time_waited_us as f64 / f64::from(self.received) / 1000.0
        };
        let jitter_ms = if self.jitter_samples == 0 {
            0.0
        } else {
            self.jitter_sum_us / f64::from(self.jitter_samples) / 1000.0
        };

        let effective_latency = rta_ms + 2.0 * jitter_ms + 10.0;
        let divisor = if effective_latency < 160.0 { 40.0 } else { 120.0 };
        let rfactor =
            (93.2 - effective_latency / divisor - packet_loss * 2.5).clamp(0.0, 100.0);
        let mos = (1.0
            + 0.035 * rfactor
            + rfactor * (rfactor - 60.0) * (100.0 - rfactor) * 7e-6)
            .clamp(1.0, 4.5);

        let mut score = 100.0;
        if crit_pl > 0.0 {
            score -= packet_loss * 100.0 / crit_pl;
        }
        if crit_jitter_ms > 0.0 {
            score -= jitter_ms * 100.0 / crit_jitter_ms;
        }
        let score = score.clamp(0.0, 100.0);

        TargetMetrics {
            rta_ms,
            rtmin_ms: if self.rtmin_us.is_finite() {
                self.rtmin_us / 1000.0
            } else {
                0.0
            },
            rtmax_ms: self.rtmax_us / 1000.0,
            jitter_ms,
            packet_loss,
            effective_latency,
            rfactor,
            mos,
            score,
        }
    }
}

/// Derived per-target metrics in output units.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct TargetMetrics {
    pub rta_ms: f64,
    pub rtmin_ms: f64,
    pub rtmax_ms: f64,
    pub jitter_ms: f64,
    pub packet_loss: f64,
    pub effective_latency: f64,
    pub rfactor: f64,
    pub mos: f64,
    pub score: f64,
}

/// How a multi-address host rolls its targets together.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
pub enum GroupPolicy {
    /// Worst target wins (the plain check_icmp behavior).
    #[default]
    IcmpDefault,
    /// Every address must be fine.
    All,
    /// The best target's state counts.
    Any,
    /// Any sign of life, even an ICMP error, is Ok.
    Hostcheck,
}

impl std::str::FromStr for GroupPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rta" | "icmp" | "default" => Ok(GroupPolicy::IcmpDefault),
            "all" => Ok(GroupPolicy::All),
            "any" => Ok(GroupPolicy::Any),
            "hostcheck" | "host" => Ok(GroupPolicy::Hostcheck),
            _ => Err(format!("'{}' is not a valid group mode", s)),
        }
    }
}

/// One user-supplied host name and the targets it resolved to.
#[derive(Clone, Debug)]
pub struct HostGroup {
    pub name: String,
    pub target_indices: Vec<usize>,
}

#[cfg(test)]
mod sequence_tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    fn target() -> PingTarget {
        PingTarget::new("test", IpAddr::V4(Ipv4Addr::new(192, 0, 2, 1)))
    }

    #[test]
    fn test_in_order_replies() {
        let mut t = target();
        let now = Instant::now();
        for seq in 0..3u16 {
            t.record_sent(seq, seq, now, 3);
        }
        for seq in 0..3u16 {
            t.record_reply(seq, now, 3);
        }
        assert!(!t.found_out_of_order);
        assert_eq!(t.lifecycle(), TargetLifecycle::Done);
    }

    #[test]
    fn test_out_of_order_detected() {
        let mut t = target();
        let now = Instant::now();
        t.record_sent(0, 0, now, 2);
        t.record_sent(1, 1, now, 2);
        t.record_reply(1, now, 2);
        t.record_reply(0, now, 2);
        assert!(t.found_out_of_order);
    }

    #[test]
    fn test_sequence_wrap_is_in_order() {
        let mut t = target();
        let now = Instant::now();
        t.record_sent(65535, 0, now, 2);
        t.record_sent(0, 1, now, 2);
        t.record_reply(65535, now, 2);
        t.record_reply(0, now, 2);
        assert!(!t.found_out_of_order);
    }

    #[test]
    fn test_duplicate_counted_once() {
        let mut t = target();
        let now = Instant::now();
        t.record_sent(7, 0, now, 1);
        assert!(matches!(t.record_reply(7, now, 1), ReplyOutcome::Fresh(_)));
        assert_eq!(t.record_reply(7, now, 1), ReplyOutcome::Duplicate);
        assert_eq!(t.received, 1);
        assert_eq!(t.duplicates, 1);
    }

    #[test]
    fn test_late_reply_counts_as_received() {
        let mut t = target();
        let now = Instant::now();
        t.record_sent(3, 0, now, 1);
        t.expire(now + Duration::from_secs(5), Duration::from_secs(1), 1);
        assert_eq!(t.lost, 1);

        let outcome = t.record_reply(3, now + Duration::from_secs(6), 1);
        assert_eq!(outcome, ReplyOutcome::Late);
        assert_eq!(t.received, 1);
        assert_eq!(t.lost, 0);
        // No RTT was recorded for the late reply.
        assert_eq!(t.time_waited_us, 0);
    }

    #[test]
    fn test_unknown_sequence() {
        let mut t = target();
        assert_eq!(
            t.record_reply(99, Instant::now(), 1),
            ReplyOutcome::UnknownSequence
        );
        assert_eq!(t.received, 0);
    }

    #[test]
    fn test_error_counts_as_lost_but_responded() {
        let mut t = target();
        let now = Instant::now();
        t.record_sent(0, 0, now, 1);
        t.record_error(
            ErrorReply {
                icmp_type: 11,
                icmp_code: 0,
                from: IpAddr::V4(Ipv4Addr::new(192, 0, 2, 254)),
            },
            Some(0),
            1,
        );
        assert_eq!(t.received, 0);
        assert_eq!(t.lost, 1);
        assert!(t.responded);
        assert_eq!(t.last_error.as_ref().unwrap().icmp_type, 11);
        assert_eq!(t.lifecycle(), TargetLifecycle::Done);
    }
}
