use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use fastlane::config::{
    DEFAULT_ANSWER_TTL, DEFAULT_CACHE_CAPACITY, DEFAULT_PROBE_PORTS, DEFAULT_PROBE_SOURCE_PORT,
    DEFAULT_RESOLV_CONF, DEFAULT_TTL, DEFAULT_TTL_MULTIPLIER, DEFAULT_UPSTREAMS, DNS_PORT,
    ProbeConfig, ProxyConfig, parse_upstream,
};

#[derive(Parser)]
#[command(name = "fastlane")]
#[command(about = "Caching DNS proxy that races resolvers and prefers the lowest-RTT address", long_about = None)]
struct Args {
    /// Local port to listen on
    #[arg(short, long, default_value_t = DNS_PORT)]
    port: u16,

    /// Bind address
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Upstream DNS server (ip or ip:port), can be repeated
    #[arg(short, long)]
    upstream: Vec<String>,

    /// Resolver file whose nameserver lines are added to the upstreams
    #[arg(long, default_value = DEFAULT_RESOLV_CONF)]
    resolv_conf: PathBuf,

    /// Maximum number of cached answers
    #[arg(long, default_value_t = DEFAULT_CACHE_CAPACITY)]
    cache_capacity: usize,

    /// Delay between the first usable upstream reply and the client answer
    #[arg(long, default_value_t = 40)]
    response_delay_ms: u64,

    /// Give up on an upstream race after this long
    #[arg(long, default_value_t = 2000)]
    race_timeout_ms: u64,

    /// Cache TTL in seconds for raced answers
    #[arg(long, default_value_t = DEFAULT_TTL)]
    default_ttl: u32,

    /// TTL written into answers sent to clients
    #[arg(long, default_value_t = DEFAULT_ANSWER_TTL)]
    answer_ttl: u32,

    /// Cache entries live for TTL times this factor
    #[arg(long, default_value_t = DEFAULT_TTL_MULTIPLIER)]
    ttl_multiplier: u32,

    /// TCP port to SYN-probe on every candidate, can be repeated
    #[arg(long)]
    probe_port: Vec<u16>,

    /// Source port of SYN probes
    #[arg(long, default_value_t = DEFAULT_PROBE_SOURCE_PORT)]
    probe_source_port: u16,

    /// Source address of SYN probes (discovered when omitted)
    #[arg(long)]
    probe_source: Option<Ipv4Addr>,

    /// How long to wait for a candidate's SYN reply
    #[arg(long, default_value_t = 1000)]
    probe_timeout_ms: u64,

    /// Disable SYN probing (no raw socket needed)
    #[arg(long)]
    no_probe: bool,

    /// Seconds between stats lines, 0 disables them
    #[arg(long, default_value_t = 60)]
    stats_interval_secs: u64,

    /// Log every query
    #[arg(short, long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    quiet: bool,
}

/// `RUST_LOG` wins; otherwise info, debug with `-v`, error with `-q`.
fn setup_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("error"))
    } else if verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

fn build_config(args: Args) -> anyhow::Result<ProxyConfig> {
    let upstreams = if args.upstream.is_empty() {
        DEFAULT_UPSTREAMS
            .iter()
            .map(|&ip| SocketAddr::new(IpAddr::V4(ip), DNS_PORT))
            .collect()
    } else {
        args.upstream
            .iter()
            .map(|s| parse_upstream(s))
            .collect::<Result<Vec<_>, _>>()?
    };

    let mut config = ProxyConfig::new(SocketAddr::new(args.bind, args.port), upstreams);
    config.add_system_resolvers(&args.resolv_conf);
    config.cache_capacity = args.cache_capacity;
    config.response_delay = Duration::from_millis(args.response_delay_ms);
    config.race_timeout = Duration::from_millis(args.race_timeout_ms);
    config.default_ttl = args.default_ttl;
    config.answer_ttl = args.answer_ttl;
    config.ttl_multiplier = args.ttl_multiplier;
    config.stats_interval =
        (args.stats_interval_secs > 0).then(|| Duration::from_secs(args.stats_interval_secs));

    config.probe = (!args.no_probe).then(|| ProbeConfig {
        source: args.probe_source,
        source_port: args.probe_source_port,
        ports: if args.probe_port.is_empty() {
            DEFAULT_PROBE_PORTS.to_vec()
        } else {
            args.probe_port
        },
        timeout: Duration::from_millis(args.probe_timeout_ms),
    });

    Ok(config)
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging(args.verbose, args.quiet);

    let config = build_config(args)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    rt.block_on(fastlane::proxy::run(config))?;
    Ok(())
}
