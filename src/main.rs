use check_icmp::icmp::{self, IcmpConfig, IcmpProber, ModeSwitches};
use check_icmp::icmp::socket::KernelChannel;
use check_icmp::icmp::target::GroupPolicy;
use check_icmp::{OutputFormat, State};
use chrono::Utc;
use clap::{value_parser, ArgAction::Count, Parser};
use log::{info, LevelFilter};
use std::net::{IpAddr, ToSocketAddrs};
use std::process;
use std::time::Duration;

const ABOUT_TEXT: &str = r#"
check_icmp - A monitoring plugin that measures reachability, round trip
time, packet loss, jitter, MOS and a composite score over ICMP echo.

TARGETS

Every positional argument and every -H option adds one host. A host name
resolving to multiple addresses probes all of them; how the addresses
roll up into one result is selected with --mode:
- rta: worst address wins (default)
- all: same as rta, spelled like the historic option
- any: best address wins
- hostcheck: any reply at all, even an ICMP error, counts as alive

THRESHOLD SYNTAX

-w and -c take a pair: round trip average in milliseconds and packet
loss in percent, e.g. '-w 200,40%'. The jitter, MOS and score modes take
'warning,critical' pairs and are enabled by passing the option at all.
MOS and score alert downwards: lower is worse.

SOCKETS

An unprivileged datagram ICMP socket is tried first; if the kernel
refuses (see net.ipv4.ping_group_range), a raw socket is opened, which
needs elevated privileges or the setuid bit."#;

#[derive(Parser, Debug)]
#[command(author, version, long_about = None, about = ABOUT_TEXT)]
struct Args {
    /// Hosts to check
    targets: Vec<String>,

    /// Additional host to check (repeatable)
    #[arg(long = "host", short = 'H')]
    hosts: Vec<String>,

    /// Warning threshold as rta,pl% (default 200,40%)
    #[arg(short, long)]
    warning: Option<String>,

    /// Critical threshold as rta,pl% (default 500,80%)
    #[arg(short, long)]
    critical: Option<String>,

    /// Enable jitter checking with warning,critical in milliseconds
    #[arg(short = 'J', long)]
    jitter: Option<String>,

    /// Enable MOS checking with warning,critical (lower is worse)
    #[arg(short = 'M', long)]
    mos: Option<String>,

    /// Enable score checking with warning,critical (lower is worse)
    #[arg(short = 'S', long)]
    score: Option<String>,

    /// Alert on out-of-order replies
    #[arg(short = 'o', long)]
    order: bool,

    /// Minimum number of alive hosts for an OK result
    #[arg(short = 'm', long)]
    min_hosts_alive: Option<u32>,

    /// How multiple addresses of one host combine: rta, all, any, hostcheck
    #[arg(long, default_value = "rta")]
    mode: GroupPolicy,

    /// Number of packets per target
    #[arg(short = 'n', long, default_value = "5", value_parser = value_parser!(u32).range(1..=65535))]
    packets: u32,

    /// Minimum gap between any two packets in milliseconds
    #[arg(short = 'i', long, default_value = "80")]
    packet_interval: u64,

    /// Minimum gap between packets to the same target in milliseconds
    #[arg(short = 'I', long, default_value = "0")]
    target_interval: u64,

    /// Time to wait for a single reply in milliseconds
    #[arg(short = 'r', long, default_value = "1000")]
    reply_timeout: u64,

    /// Time to live on outgoing packets
    #[arg(short = 'l', long, default_value = "64")]
    ttl: u32,

    /// ICMP payload size in bytes
    #[arg(short = 'b', long, default_value = "54")]
    data_size: usize,

    /// Source address to send from
    #[arg(short = 's', long)]
    source: Option<String>,

    /// Overall timeout in seconds
    #[arg(short, long, default_value = "10")]
    timeout: u64,

    /// Output format: one-line, multi-line, summary-only or test-json
    #[arg(long, default_value = "multi-line")]
    output_format: OutputFormat,

    /// Only use IPv4 addresses
    #[arg(short = '4', long)]
    ipv4: bool,

    /// Only use IPv6 addresses
    #[arg(short = '6', long)]
    ipv6: bool,

    /// Enable verbose output. Use multiple times to increase verbosity (e.g. -vvv)
    #[arg(short, long, action = Count, value_parser = value_parser!(u8).range(0..=3))]
    verbose: u8,
}

fn exit_unknown(message: impl std::fmt::Display) -> ! {
    println!("UNKNOWN - {}", message);
    process::exit(State::Unknown.exit_code());
}

fn validate_host(s: &str) -> Result<(), String> {
    if s.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    match url::Host::parse(s) {
        Ok(url::Host::Domain(_)) | Ok(url::Host::Ipv4(_)) | Ok(url::Host::Ipv6(_)) => Ok(()),
        _ => Err(format!("invalid address or hostname: {}", s)),
    }
}

/// Parse an 'rta,pl%' pair; the units are optional.
fn parse_rta_pl(input: &str) -> Result<(f64, f64), String> {
    let (rta, pl) = input
        .split_once(',')
        .ok_or_else(|| format!("'{}' is not an rta,pl% pair", input))?;
    let rta: f64 = rta
        .trim()
        .trim_end_matches("ms")
        .parse()
        .map_err(|_| format!("'{}' is not a round trip time in milliseconds", rta))?;
    let pl: f64 = pl
        .trim()
        .trim_end_matches('%')
        .parse()
        .map_err(|_| format!("'{}' is not a packet loss percentage", pl))?;
    if !(0.0..=100.0).contains(&pl) {
        return Err(format!("packet loss '{}' is not within 0..100", pl));
    }
    Ok((rta, pl))
}

/// Parse a 'warning,critical' pair for the jitter, mos and score modes.
fn parse_pair(input: &str, what: &str) -> Result<(f64, f64), String> {
    let (warn, crit) = input
        .split_once(',')
        .ok_or_else(|| format!("'{}' is not a warning,critical {} pair", input, what))?;
    let warn: f64 = warn
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a {} warning threshold", warn, what))?;
    let crit: f64 = crit
        .trim()
        .parse()
        .map_err(|_| format!("'{}' is not a {} critical threshold", crit, what))?;
    Ok((warn, crit))
}

fn resolve_host(name: &str, only_v4: bool, only_v6: bool) -> Result<Vec<IpAddr>, String> {
    let wanted = |addr: &IpAddr| {
        if only_v4 {
            addr.is_ipv4()
        } else if only_v6 {
            addr.is_ipv6()
        } else {
            true
        }
    };

    if let Ok(addr) = name.parse::<IpAddr>() {
        if wanted(&addr) {
            return Ok(vec![addr]);
        }
        return Err(format!(
            "address {} does not match the requested address family",
            addr
        ));
    }

    match (name, 0u16).to_socket_addrs() {
        Ok(addrs) => {
            let mut resolved: Vec<IpAddr> = Vec::new();
            for addr in addrs.map(|sockaddr| sockaddr.ip()).filter(wanted) {
                if !resolved.contains(&addr) {
                    resolved.push(addr);
                }
            }
            if resolved.is_empty() {
                Err(format!("DNS lookup returned no usable address for {}", name))
            } else {
                Ok(resolved)
            }
        }
        Err(e) => Err(format!("DNS resolution failed for {}: {}", name, e)),
    }
}

fn select_and_init_logger(verbosity: u8) -> Result<(), fern::InitError> {
    setup_logger(match verbosity {
        3 => (LevelFilter::Debug, true),
        2 => (LevelFilter::Info, false),
        _ => (LevelFilter::Error, false),
    })
}

fn setup_logger((level, include_file_info): (LevelFilter, bool)) -> Result<(), fern::InitError> {
    let dispatch = fern::Dispatch::new()
        .format(move |out, message, record| {
            let base_format = format!(
                "{} [{}] [{}]",
                Utc::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.target(),
                record.level()
            );

            let full_format = if include_file_info {
                format!(
                    "{} [{}:{}] {}",
                    base_format,
                    record.file().unwrap_or("unknown"),
                    record.line().unwrap_or(0),
                    message
                )
            } else {
                format!("{} {}", base_format, message)
            };

            out.finish(format_args!("{}", full_format))
        })
        .level(level)
        .chain(std::io::stderr());

    dispatch.apply()?;
    Ok(())
}

fn build_config(args: &Args) -> IcmpConfig {
    let mut config = IcmpConfig {
        packets_per_target: args.packets,
        data_size: args.data_size,
        ttl: args.ttl,
        target_interval: Duration::from_millis(args.target_interval),
        packet_interval: Duration::from_millis(args.packet_interval),
        packet_timeout: Duration::from_millis(args.reply_timeout),
        timeout: Duration::from_secs(args.timeout),
        min_hosts_alive: args.min_hosts_alive,
        policy: args.mode,
        modes: ModeSwitches {
            order: args.order,
            ..ModeSwitches::default()
        },
        ..IcmpConfig::default()
    };

    if let Some(warning) = &args.warning {
        match parse_rta_pl(warning) {
            Ok((rta, pl)) => {
                config.warn.rta_ms = rta;
                config.warn.pl = pl;
            }
            Err(e) => exit_unknown(e),
        }
    }
    if let Some(critical) = &args.critical {
        match parse_rta_pl(critical) {
            Ok((rta, pl)) => {
                config.crit.rta_ms = rta;
                config.crit.pl = pl;
            }
            Err(e) => exit_unknown(e),
        }
    }
    if let Some(jitter) = &args.jitter {
        match parse_pair(jitter, "jitter") {
            Ok((warn, crit)) => {
                config.modes.jitter = true;
                config.warn.jitter_ms = warn;
                config.crit.jitter_ms = crit;
            }
            Err(e) => exit_unknown(e),
        }
    }
    if let Some(mos) = &args.mos {
        match parse_pair(mos, "MOS") {
            Ok((warn, crit)) => {
                config.modes.mos = true;
                config.warn.mos = warn;
                config.crit.mos = crit;
            }
            Err(e) => exit_unknown(e),
        }
    }
    if let Some(score) = &args.score {
        match parse_pair(score, "score") {
            Ok((warn, crit)) => {
                config.modes.score = true;
                config.warn.score = warn;
                config.crit.score = crit;
            }
            Err(e) => exit_unknown(e),
        }
    }

    if let Some(source) = &args.source {
        match source.parse::<IpAddr>() {
            Ok(addr) => config.source = Some(addr),
            Err(_) => exit_unknown(format!("'{}' is not a valid source address", source)),
        }
    }

    config
}

/// Stand-in channel for the nothing-resolved path; it is never polled.
struct NullChannel;

impl icmp::socket::PacketChannel for NullChannel {
    fn send(&mut self, _target: IpAddr, _buf: &[u8]) -> std::io::Result<usize> {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            "no channel",
        ))
    }

    fn wait(
        &mut self,
        _timeout: Duration,
    ) -> std::io::Result<Option<icmp::socket::Datagram>> {
        Ok(None)
    }
}

/// Check reachability and link quality over ICMP echo.
fn main() {
    // According to monitoring-plugins guidelines, exit code 3 is used for "UNKNOWN" and
    // should be used for the --help and --version flags.
    let args = Args::try_parse().unwrap_or_else(|e| match e.kind() {
        clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion => {
            print!("{}", e);
            process::exit(3);
        }
        _ => {
            let text = e.to_string();
            let trimmed = text.trim_end().trim_start_matches("error: ");
            exit_unknown(format!(
                "command line parsing produced an error: {}",
                trimmed
            ))
        }
    });

    if let Err(e) = select_and_init_logger(args.verbose) {
        exit_unknown(format!("failed to initialize logger: {}", e));
    }

    if args.ipv4 && args.ipv6 {
        exit_unknown("-4 and -6 are mutually exclusive");
    }

    let mut hosts: Vec<String> = args.targets.clone();
    hosts.extend(args.hosts.iter().cloned());
    if hosts.is_empty() {
        exit_unknown("no hosts to check. Give at least one target or -H");
    }
    for host in &hosts {
        if let Err(e) = validate_host(host) {
            exit_unknown(e);
        }
    }

    let config = build_config(&args);

    info!("{:<34}{}", "Hosts to check:", hosts.join(", "));
    info!("{:<34}{}", "Packets per target:", config.packets_per_target);
    info!("{:<34}{:?}", "Group mode:", config.policy);
    info!("{:<34}{}ms", "Packet interval:", args.packet_interval);
    info!("{:<34}{}ms", "Reply timeout:", args.reply_timeout);
    info!("{:<34}{}s", "Overall timeout:", args.timeout);
    info!(
        "{:<34}{}ms / {}%",
        "Warning rta / pl:", config.warn.rta_ms, config.warn.pl
    );
    info!(
        "{:<34}{}ms / {}%",
        "Critical rta / pl:", config.crit.rta_ms, config.crit.pl
    );

    let mut resolved: Vec<(String, Vec<IpAddr>)> = Vec::new();
    let mut unresolved: Vec<String> = Vec::new();
    for host in &hosts {
        match resolve_host(host, args.ipv4, args.ipv6) {
            Ok(addresses) => {
                info!("{:<34}{:?}", format!("Resolved {}:", host), addresses);
                resolved.push((host.clone(), addresses));
            }
            Err(e) => {
                info!("{}", e);
                unresolved.push(host.clone());
            }
        }
    }

    if resolved.is_empty() {
        // Nothing to probe: report the resolution failures and leave.
        let mut prober = IcmpProber::new(config.clone(), NullChannel);
        for host in &unresolved {
            prober.add_unresolved_host(host);
        }
        match prober.run() {
            Ok(summary) => icmp::report(&summary, &config, args.output_format).exit(),
            Err(e) => exit_unknown(e),
        }
    }

    let need_v4 = resolved
        .iter()
        .any(|(_, addrs)| addrs.iter().any(|a| a.is_ipv4()));
    let need_v6 = resolved
        .iter()
        .any(|(_, addrs)| addrs.iter().any(|a| a.is_ipv6()));

    let channel = match KernelChannel::open(need_v4, need_v6, config.ttl, config.source) {
        Ok(channel) => channel,
        Err(e) => exit_unknown(e),
    };

    let mut prober = IcmpProber::new(config.clone(), channel);
    for (name, addresses) in &resolved {
        prober.add_host(name, addresses);
    }
    for host in &unresolved {
        prober.add_unresolved_host(host);
    }

    match prober.run() {
        Ok(summary) => icmp::report(&summary, &config, args.output_format).exit(),
        // Privilege problems and internal socket failures both surface
        // as Unknown: an unrecoverable error never produces OK.
        Err(e) => exit_unknown(e),
    }
}

#[cfg(test)]
mod pair_parsing_tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rta_pl_pair() {
        assert_eq!(parse_rta_pl("200,40%"), Ok((200.0, 40.0)));
        assert_eq!(parse_rta_pl("200.5ms, 40"), Ok((200.5, 40.0)));
    }

    #[test]
    fn test_rta_pl_rejects_garbage() {
        assert!(parse_rta_pl("200").is_err());
        assert!(parse_rta_pl("abc,40%").is_err());
        assert!(parse_rta_pl("200,140%").is_err());
    }

    #[test]
    fn test_generic_pair() {
        assert_eq!(parse_pair("40,50", "jitter"), Ok((40.0, 50.0)));
        assert_eq!(parse_pair("3.5, 3.0", "MOS"), Ok((3.5, 3.0)));
        assert!(parse_pair("fast", "jitter").is_err());
    }

    #[test]
    fn test_validate_host() {
        assert!(validate_host("192.0.2.1").is_ok());
        assert!(validate_host("2001:db8::1").is_ok());
        assert!(validate_host("example.com").is_ok());
        assert!(validate_host("not a host").is_err());
    }

    #[test]
    fn test_resolve_literal_address() {
        assert_eq!(
            resolve_host("192.0.2.7", false, false),
            Ok(vec!["192.0.2.7".parse().unwrap()])
        );
        assert!(resolve_host("192.0.2.7", false, true).is_err());
    }
}
