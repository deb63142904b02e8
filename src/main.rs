//! rust-divert: split-horizon traffic diversion daemon
//!
//! # Usage
//!
//! ```bash
//! # Run with default configuration
//! sudo ./rust-divert
//!
//! # Run with custom configuration
//! sudo ./rust-divert -c /path/to/config.json
//!
//! # Run with environment overrides
//! DIVERT_LOG_LEVEL=debug sudo ./rust-divert
//! ```

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

use rust_divert::config::{interface_addr, interface_subnet, load_config_with_env, Config};
use rust_divert::dns::{spawn_refresh_worker, AnswerCache, DirectResolver, DnsServer, RemoteResolver, SplitResolver};
use rust_divert::firewall::Firewall;
use rust_divert::flow::{EventSender, FlowFilter, FlowTracker};
use rust_divert::proxy::{run_acceptor, run_proxy, TcpSession};
use rust_divert::rules::{build_snapshot, Classifier};

/// Answer cache capacity; entries beyond this are evicted by the cache's
/// own policy before their TTL
const DNS_CACHE_MAX_ENTRIES: u64 = 65_536;

/// Command-line arguments
struct Args {
    /// Configuration file path
    config_path: PathBuf,
    /// Check configuration only
    check_config: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut config_path = PathBuf::from("/etc/rust-divert/config.json");
        let mut check_config = false;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-c" | "--config" => {
                    if let Some(path) = args.next() {
                        config_path = PathBuf::from(path);
                    }
                }
                "--check" => {
                    check_config = true;
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => {
                    println!("rust-divert v{}", rust_divert::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {arg}");
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        Self {
            config_path,
            check_config,
        }
    }
}

fn print_help() {
    println!(
        r#"rust-divert v{}

Split-horizon traffic diversion daemon: classifies destinations against
gfwlist-style rule documents and steers matched traffic into a local
tunnel transport.

USAGE:
    rust-divert [OPTIONS]

OPTIONS:
    -c, --config <PATH>    Configuration file path [default: /etc/rust-divert/config.json]
    --check                Check configuration and exit
    -h, --help             Print help information
    -v, --version          Print version information

ENVIRONMENT:
    DIVERT_LOG_LEVEL       Override log level (trace, debug, info, warn, error)
    DIVERT_DNS_LISTEN      Override the DNS listener address
    DIVERT_PROXY_LISTEN    Override the proxy listener address

REQUIREMENTS:
    - Linux kernel with conntrack event support (nf_conntrack loaded,
      net.netfilter.nf_conntrack_acct not required)
    - CAP_NET_ADMIN capability (or root) for the netlink event socket
    - iptables and ipset binaries when firewall management is enabled
"#,
        rust_divert::VERSION
    );
}

/// Initialize logging
fn init_logging(config: &Config) {
    let level = match config.log.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "tokio=warn"] {
        if let Ok(parsed) = directive.parse() {
            filter = filter.add_directive(parsed);
        }
    }

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    if config.log.json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }
}

/// Build the flow filters: only TCP flows from the local subnet matter,
/// and DNS itself is never proxied.
fn build_flow_filters(subnet: Option<ipnet::Ipv4Net>) -> Vec<FlowFilter> {
    let mut filters: Vec<FlowFilter> = vec![Box::new(|key| key.proto != 6 || key.port == 53)];

    if let Some(subnet) = subnet {
        filters.push(Box::new(move |key| match key.addr {
            IpAddr::V4(addr) => !subnet.contains(&addr),
            IpAddr::V6(_) => true,
        }));
    }

    filters
}

/// Main application entry point
#[tokio::main]
async fn main() -> Result<()> {
    let start_time = Instant::now();
    let args = Args::parse();

    let config = load_config_with_env(&args.config_path).map_err(|e| {
        anyhow::anyhow!(
            "Failed to load configuration from {:?}: {}",
            args.config_path,
            e
        )
    })?;

    if args.check_config {
        println!("Configuration is valid");
        return Ok(());
    }

    init_logging(&config);

    info!("rust-divert v{}", rust_divert::VERSION);
    info!("Configuration loaded from {:?}", args.config_path);

    // Classifier: the initial rule snapshot must load, reloads may fail.
    let snapshot = build_snapshot(&config.rules)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to build rule snapshot: {}", e))?;
    info!(
        tunnel_rules = snapshot.tunnel.len(),
        block_rules = snapshot.user_block.len(),
        "Rule snapshot loaded"
    );
    let classifier = Arc::new(Classifier::new(snapshot));

    // Interface discovery, needed for firewall rules and the subnet filter.
    let (subnet, local_ip) = if config.firewall.enabled {
        let subnet = interface_subnet(&config.firewall.interface)
            .map_err(|e| anyhow::anyhow!("Interface discovery failed: {}", e))?;
        let addr = interface_addr(&config.firewall.interface)
            .map_err(|e| anyhow::anyhow!("Interface discovery failed: {}", e))?;
        info!(interface = %config.firewall.interface, %subnet, %addr, "Egress interface discovered");
        (Some(subnet), Some(addr))
    } else {
        (None, None)
    };

    // Flow tracking: conntrack events feed the destination table the proxy
    // consults for each intercepted connection.
    let tracker = Arc::new(FlowTracker::new(
        build_flow_filters(subnet),
        Duration::from_secs(config.flow.fallback_ttl_secs),
    ));
    let (event_tx, event_rx) = EventSender::channel(config.flow.event_capacity);
    Arc::clone(&tracker).spawn_consumer(event_rx);
    Arc::clone(&tracker).spawn_sweeper(Duration::from_secs(config.flow.sweep_interval_secs));

    let conntrack_running = start_conntrack(event_tx, config.firewall.enabled)?;
    let proxy_tracker = conntrack_running.then(|| Arc::clone(&tracker));

    // Firewall: install before any answer provisioning can happen.
    let firewall = if config.firewall.enabled {
        let ip = local_ip.ok_or_else(|| anyhow::anyhow!("No interface address"))?;
        let fw = Arc::new(Firewall::new(
            &config.firewall,
            subnet.ok_or_else(|| anyhow::anyhow!("No interface subnet"))?,
            std::net::SocketAddr::new(IpAddr::V4(ip), config.dns.listen.port()),
            std::net::SocketAddr::new(IpAddr::V4(ip), config.proxy.listen.port()),
        ));
        fw.install()
            .await
            .map_err(|e| anyhow::anyhow!("Firewall install failed: {}", e))?;
        Some(fw)
    } else {
        None
    };

    // DNS: answer cache with eviction-driven refresh, direct and tunneled
    // upstreams behind the split resolver.
    let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
    let cache = AnswerCache::new(config.dns.cache_ttl(), DNS_CACHE_MAX_ENTRIES, refresh_tx);
    let forward = DirectResolver::new(config.dns.forward_resolver, config.dns.exchange_timeout());
    let remote = Arc::new(RemoteResolver::new(
        config.dns.remote_resolver,
        config.dns.pool_size,
        config.dns.effective_qps(),
        config.dns.burst,
        config.dns.exchange_timeout(),
    ));
    let resolver = Arc::new(SplitResolver::new(
        Arc::clone(&classifier),
        cache,
        forward,
        Arc::clone(&remote),
        firewall.clone(),
        config.dns.listener_only,
    ));

    let dns_server = DnsServer::bind(config.dns.listen, Arc::clone(&resolver))
        .await
        .map_err(|e| anyhow::anyhow!("DNS listener failed: {}", e))?;
    spawn_refresh_worker(Arc::clone(&resolver), refresh_rx);
    tokio::spawn(dns_server.run());
    info!(addr = %config.dns.listen, "DNS server started");

    // Proxy: the DNAT target for intercepted connections.
    let proxy_listener = TcpListener::bind(config.proxy.listen)
        .await
        .map_err(|e| anyhow::anyhow!("Proxy listener failed: {}", e))?;
    let session = Arc::new(TcpSession::new(config.proxy.tunnel_addr));
    tokio::spawn(run_proxy(proxy_listener, proxy_tracker, session));

    // Optional far-side acceptor for single-host setups.
    if let Some(addr) = config.proxy.acceptor_listen {
        let acceptor_listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Acceptor listener failed: {}", e))?;
        tokio::spawn(run_acceptor(acceptor_listener, config.proxy.udp_associate));
    }

    spawn_reload_handler(Arc::clone(&classifier), config.rules.clone());

    info!(
        "Startup complete in {:.2}ms",
        start_time.elapsed().as_secs_f64() * 1000.0
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received SIGINT, initiating shutdown...");
        }
        () = wait_for_sigterm() => {
            info!("Received SIGTERM, initiating shutdown...");
        }
    }

    if let Some(fw) = firewall {
        fw.teardown().await;
    }

    let flow_stats = tracker.stats();
    info!(
        inserted = flow_stats.inserted,
        destroyed = flow_stats.destroyed,
        lookups = flow_stats.lookups,
        hits = flow_stats.hits,
        "Final flow stats"
    );
    let cache_stats = resolver.cache().stats();
    info!(
        hits = cache_stats.hits,
        misses = cache_stats.misses,
        refreshes = cache_stats.refreshes_queued,
        "Final cache stats"
    );
    let pool_stats = remote.stats();
    info!(
        dialed = pool_stats.dialed,
        reused = pool_stats.reused,
        discarded = pool_stats.discarded,
        exhausted = pool_stats.exhausted,
        "Final remote pool stats"
    );

    info!("Shutdown complete");
    Ok(())
}

/// Start the conntrack event source; returns whether events are flowing.
///
/// Without events the destination table stays empty and the proxy relays
/// without signaling, so a failure is fatal only when the firewall is
/// actually steering traffic here.
#[cfg(target_os = "linux")]
fn start_conntrack(sender: EventSender, firewall_enabled: bool) -> Result<bool> {
    use rust_divert::flow::ConntrackSource;

    let result = ConntrackSource::open().and_then(|source| source.spawn(sender));
    match result {
        Ok(_) => Ok(true),
        Err(e) if firewall_enabled => Err(anyhow::anyhow!("Conntrack source failed: {}", e)),
        Err(e) => {
            warn!(error = %e, "Conntrack unavailable, relaying without destination recovery");
            Ok(false)
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn start_conntrack(_sender: EventSender, _firewall_enabled: bool) -> Result<bool> {
    warn!("Conntrack events are only supported on Linux");
    Ok(false)
}

/// Reload the rule snapshot on SIGHUP, keeping the old one on failure
#[cfg(unix)]
fn spawn_reload_handler(classifier: Arc<Classifier>, rules: rust_divert::config::RulesConfig) {
    use tokio::signal::unix::{signal, SignalKind};

    tokio::spawn(async move {
        let Ok(mut sighup) = signal(SignalKind::hangup()) else {
            error!("Failed to register SIGHUP handler");
            return;
        };
        while sighup.recv().await.is_some() {
            info!("Received SIGHUP, reloading rule lists");
            match build_snapshot(&rules).await {
                Ok(snapshot) => classifier.replace(snapshot),
                Err(e) => {
                    warn!(error = %e, "Rule reload failed, keeping current snapshot");
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_reload_handler(_classifier: Arc<Classifier>, _rules: rust_divert::config::RulesConfig) {}

/// Wait for SIGTERM
#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(e) => {
            error!(error = %e, "Failed to register SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
