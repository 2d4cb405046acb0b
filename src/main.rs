use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{error, info, warn};

use dnsrelay::cache::Cache;
use dnsrelay::cli::Cli;
use dnsrelay::dispatcher::Dispatcher;
use dnsrelay::error::RelayResult;
use dnsrelay::hosts::HostTable;

const CLIENT_PORT: u16 = 53;
const CACHE_MAX_ENTRIES: usize = 256;

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> RelayResult<()> {
    let (cli, upstream_addr) = Cli::parse_and_validate()?;

    let hosts = HostTable::load(&cli.config)?;
    if hosts.is_empty() {
        warn!("host table at {} has no records; every query will miss to cache/upstream", cli.config.display());
    } else {
        info!(
            "loaded {} host record(s) from {}",
            hosts.len(),
            cli.config.display()
        );
    }

    let client_sock = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, CLIENT_PORT))?;
    let upstream_sock = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))?;
    info!("listening on {CLIENT_PORT}/udp, forwarding to {upstream_addr}");

    let cache = Cache::new(CACHE_MAX_ENTRIES);
    let mut dispatcher = Dispatcher::new(
        client_sock,
        upstream_sock,
        upstream_addr,
        hosts,
        cache,
        cli.trace,
        cli.verbose,
    )?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&shutdown);
    ctrlc::set_handler(move || {
        info!("shutdown signal received");
        handler_flag.store(true, Ordering::Relaxed);
    })
    .map_err(|e| dnsrelay::error::RelayError::Config(format!("failed to install signal handler: {e}")))?;

    dispatcher.run(shutdown);
    info!("relay stopped");
    Ok(())
}
