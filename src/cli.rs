//! Command-line interface, parsed with `clap`'s derive API.
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;
use std::str::FromStr;

use clap::Parser;

use crate::error::{RelayError, RelayResult};

const DEFAULT_UPSTREAM: &str = "10.3.9.5";
const DEFAULT_CONFIG: &str = "dnsrelay.txt";
const DNS_PORT: u16 = 53;

#[derive(Parser, Debug)]
#[command(name = "dnsrelay", version, about = "A recursive DNS relay with a static host table and an LRU cache")]
pub struct Cli {
    /// Print one line per query: transaction id, qtype, and domain.
    #[arg(short = 'd', long = "trace")]
    pub trace: bool,

    /// Also log cache/forward bookkeeping at debug level (buffer dumps, sweeps, evictions).
    #[arg(short, long)]
    pub verbose: bool,

    /// Upstream resolver to forward unanswered queries to.
    #[arg(default_value = DEFAULT_UPSTREAM)]
    pub upstream: String,

    /// Host table file (`IP DOMAIN` per line, `#` comments, `0.0.0.0` blocks).
    #[arg(default_value = DEFAULT_CONFIG)]
    pub config: PathBuf,
}

impl Cli {
    /// Parse argv and validate the upstream address, rejecting anything that
    /// would have this relay forward queries to itself.
    pub fn parse_and_validate() -> RelayResult<(Cli, SocketAddrV4)> {
        let cli = Cli::parse();
        let addr = validate_upstream(&cli.upstream)?;
        Ok((cli, addr))
    }
}

/// Reject loopback and `0.0.0.0`: forwarding there would either loop the
/// relay back on itself or go nowhere.
fn validate_upstream(upstream: &str) -> RelayResult<SocketAddrV4> {
    let upstream_ip = IpAddr::from_str(upstream)
        .map_err(|_| RelayError::Config(format!("not a valid IP address: {upstream}")))?;

    let upstream_v4 = match upstream_ip {
        IpAddr::V4(v4) => v4,
        IpAddr::V6(_) => {
            return Err(RelayError::Config(
                "upstream resolver must be an IPv4 address".to_string(),
            ))
        }
    };

    if upstream_v4.is_loopback() || upstream_v4 == Ipv4Addr::UNSPECIFIED {
        return Err(RelayError::DisallowedUpstream(upstream.to_string()));
    }

    Ok(SocketAddrV4::new(upstream_v4, DNS_PORT))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_parse_to_expected_upstream_and_config() {
        let cli = Cli::parse_from(["dnsrelay"]);
        assert_eq!(cli.upstream, DEFAULT_UPSTREAM);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG));
        assert!(!cli.trace);
        assert!(!cli.verbose);
    }

    #[test]
    fn trace_and_verbose_flags_parse() {
        let cli = Cli::parse_from(["dnsrelay", "-d", "--verbose"]);
        assert!(cli.trace);
        assert!(cli.verbose);
    }

    #[test]
    fn positional_args_override_defaults() {
        let cli = Cli::parse_from(["dnsrelay", "8.8.8.8", "hosts.txt"]);
        assert_eq!(cli.upstream, "8.8.8.8");
        assert_eq!(cli.config, PathBuf::from("hosts.txt"));
    }

    #[test]
    fn loopback_upstream_is_rejected() {
        assert!(matches!(
            validate_upstream("127.0.0.1"),
            Err(RelayError::DisallowedUpstream(_))
        ));
    }

    #[test]
    fn unspecified_upstream_is_rejected() {
        assert!(matches!(
            validate_upstream("0.0.0.0"),
            Err(RelayError::DisallowedUpstream(_))
        ));
    }

    #[test]
    fn garbage_upstream_is_a_config_error() {
        assert!(matches!(validate_upstream("not-an-ip"), Err(RelayError::Config(_))));
    }

    #[test]
    fn valid_upstream_resolves_to_port_53() {
        let addr = validate_upstream("10.3.9.5").unwrap();
        assert_eq!(addr.port(), 53);
    }
}
