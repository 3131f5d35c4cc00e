use clap::{Arg, ArgAction, ArgMatches, Command};
use std::net::Ipv4Addr;

#[derive(Debug, Clone)]
pub struct ProbeArgs {
    pub target: Option<String>,
    pub gateway: Option<Ipv4Addr>,
    pub continuous: bool,
    pub count: Option<u32>,
    pub timeout: Option<u32>,
    pub interval: Option<u32>,
    pub ttl: Option<u32>,
}

impl Default for ProbeArgs {
    fn default() -> Self {
        Self {
            target: None,
            gateway: None,
            continuous: false,
            count: Some(4),
            timeout: Some(1000),
            interval: Some(1000),
            ttl: None,
        }
    }
}

impl ProbeArgs {
    /// Host to probe: the explicit target, otherwise the configured gateway.
    pub fn destination(&self) -> Option<String> {
        self.target
            .clone()
            .or_else(|| self.gateway.map(|gateway| gateway.to_string()))
    }
}

pub fn build_cli() -> Command {
    Command::new("echoprobe")
        .version("0.1.0")
        .about("Keep-alive style ICMP echo probe")
        .arg(
            Arg::new("target")
                .help("Target hostname or IPv4 address")
                .required_unless_present("gateway")
                .index(1)
        )
        .arg(
            Arg::new("gateway")
                .long("gateway")
                .help("Gateway address to probe when no target is given")
                .value_name("addr")
                .value_parser(clap::value_parser!(Ipv4Addr))
        )
        .arg(
            Arg::new("continuous")
                .short('t')
                .help("Probe the host until stopped")
                .action(ArgAction::SetTrue)
        )
        .arg(
            Arg::new("count")
                .short('n')
                .help("Number of echo requests to send")
                .value_name("count")
                .value_parser(clap::value_parser!(u32))
        )
        .arg(
            Arg::new("timeout")
                .short('w')
                .help("Timeout in milliseconds to wait for each reply")
                .value_name("timeout")
                .value_parser(clap::value_parser!(u32))
        )
        .arg(
            Arg::new("interval")
                .long("interval")
                .help("Milliseconds between consecutive requests")
                .value_name("interval")
                .value_parser(clap::value_parser!(u32))
        )
        .arg(
            Arg::new("ttl")
                .short('i')
                .help("Time To Live")
                .value_name("TTL")
                .value_parser(clap::value_parser!(u32))
        )
}

pub fn parse_args() -> anyhow::Result<ProbeArgs> {
    args_from_matches(&build_cli().get_matches())
}

fn args_from_matches(matches: &ArgMatches) -> anyhow::Result<ProbeArgs> {
    let mut args = ProbeArgs::default();

    args.target = matches.get_one::<String>("target").cloned();
    args.gateway = matches.get_one::<Ipv4Addr>("gateway").copied();
    args.continuous = matches.get_flag("continuous");

    if let Some(count) = matches.get_one::<u32>("count") {
        args.count = Some(*count);
    }

    if let Some(timeout) = matches.get_one::<u32>("timeout") {
        args.timeout = Some(*timeout);
    }

    if let Some(interval) = matches.get_one::<u32>("interval") {
        args.interval = Some(*interval);
    }

    if let Some(ttl) = matches.get_one::<u32>("ttl") {
        args.ttl = Some(*ttl);
    }

    if args.continuous {
        args.count = None; // Continuous mode overrides count
    }

    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> anyhow::Result<ProbeArgs> {
        args_from_matches(&build_cli().try_get_matches_from(argv)?)
    }

    #[test]
    fn test_defaults() {
        let args = parse(&["echoprobe", "example.com"]).unwrap();
        assert_eq!(args.destination().as_deref(), Some("example.com"));
        assert_eq!(args.count, Some(4));
        assert_eq!(args.timeout, Some(1000));
        assert_eq!(args.ttl, None);
    }

    #[test]
    fn test_gateway_used_without_target() {
        let args = parse(&["echoprobe", "--gateway", "192.168.1.1"]).unwrap();
        assert_eq!(args.destination().as_deref(), Some("192.168.1.1"));

        let args = parse(&["echoprobe", "10.0.0.5", "--gateway", "192.168.1.1"]).unwrap();
        assert_eq!(args.destination().as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn test_target_or_gateway_required() {
        assert!(parse(&["echoprobe"]).is_err());
        assert!(parse(&["echoprobe", "--gateway", "not-an-ip"]).is_err());
    }

    #[test]
    fn test_continuous_overrides_count() {
        let args = parse(&["echoprobe", "-t", "-n", "10", "-w", "250", "-i", "32", "10.0.0.1"]).unwrap();
        assert!(args.continuous);
        assert_eq!(args.count, None);
        assert_eq!(args.timeout, Some(250));
        assert_eq!(args.ttl, Some(32));
    }
}
