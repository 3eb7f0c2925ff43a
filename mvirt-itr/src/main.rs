use std::collections::BTreeMap;
use std::net::Ipv6Addr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, bail};
use clap::Parser;
use ipnet::Ipv6Net;
use mvirt_itr::punt::PuntMessage;
use mvirt_itr::{
    InterfaceRegistry, ItrConfig, MapCache, Rloc, StaticMapping, WorkerContext, punt_channel,
    spawn_af_packet,
};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(version, about = "LISP ingress tunnel router", long_about = None)]
struct Args {
    /// Capture interface bound to an instance ID (format: ifname=iid, can be repeated)
    #[arg(short, long = "interface", value_parser = parse_binding, required = true)]
    interfaces: Vec<(String, u32)>,

    /// Local EID of an instance (format: iid=address, can be repeated)
    #[arg(short, long = "eid", value_parser = parse_eid)]
    eids: Vec<(u32, Ipv6Addr)>,

    /// Static map-cache entry (format: iid/prefix=rloc[,priority[,weight]], can be repeated)
    #[arg(short, long = "map")]
    maps: Vec<StaticMapping>,

    /// Source address of outer IPv6 headers
    #[arg(long)]
    ipv6_source: Option<Ipv6Addr>,

    /// Capture poll deadline in milliseconds
    #[arg(long, default_value_t = 100)]
    poll_interval_ms: u64,

    /// Wait between EID lookups at startup in milliseconds
    #[arg(long, default_value_t = 2000)]
    eid_retry_ms: u64,

    /// Minimum time between punts for one unresolved entry in milliseconds
    #[arg(long, default_value_t = 1000)]
    punt_interval_ms: u64,

    /// Drop unresolved entries older than this many seconds (0 disables)
    #[arg(long, default_value_t = 60)]
    purge_after_secs: u64,
}

fn parse_binding(s: &str) -> Result<(String, u32), String> {
    let (ifname, iid) = s
        .split_once('=')
        .ok_or("Expected format: ifname=iid".to_string())?;
    let iid: u32 = iid.parse().map_err(|_| "Invalid instance ID".to_string())?;
    if iid == 0 || iid > 0x00ff_ffff {
        return Err("Instance ID must be within 1..=16777215".to_string());
    }
    Ok((ifname.to_string(), iid))
}

fn parse_eid(s: &str) -> Result<(u32, Ipv6Addr), String> {
    let (iid, addr) = s
        .split_once('=')
        .ok_or("Expected format: iid=address".to_string())?;
    let iid: u32 = iid.parse().map_err(|_| "Invalid instance ID".to_string())?;
    let addr: Ipv6Addr = addr.parse().map_err(|_| "Invalid EID".to_string())?;
    Ok((iid, addr))
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = ItrConfig {
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        eid_retry_interval: Duration::from_millis(args.eid_retry_ms),
        punt_interval: Duration::from_millis(args.punt_interval_ms),
        ipv6_source: args.ipv6_source,
        ..Default::default()
    };
    if config.ipv6_source.is_none() && args.maps.iter().any(|m| m.rloc.is_ipv6()) {
        warn!("IPv6 RLOCs configured without --ipv6-source; outer source will be ::");
    }

    let registry = Arc::new(InterfaceRegistry::new());
    for (ifname, iid) in &args.interfaces {
        registry.bind(ifname, *iid);
    }
    for (iid, eid) in &args.eids {
        registry.add_eid(*iid, *eid);
    }

    let map_cache = Arc::new(MapCache::with_config(config.map_cache_config()));
    let mut static_maps: BTreeMap<(u32, Ipv6Net), Vec<Rloc>> = BTreeMap::new();
    for mapping in &args.maps {
        static_maps
            .entry((mapping.iid, mapping.prefix))
            .or_default()
            .push(mapping.to_rloc());
    }
    for ((iid, prefix), rlocs) in static_maps {
        map_cache
            .install(iid, prefix, rlocs)
            .with_context(|| format!("Failed to install static mapping {iid}/{prefix}"))?;
    }

    let (punt, punt_rx) = punt_channel(config.punt_capacity);
    let ctx = WorkerContext {
        map_cache: Arc::clone(&map_cache),
        registry,
        punt,
        config,
    };

    let mut workers = Vec::new();
    for (ifname, _) in &args.interfaces {
        match spawn_af_packet(ifname, ctx.clone()) {
            Ok(handle) => workers.push(handle),
            Err(e) => {
                error!(ifname = %ifname, error = %e, "Failed to start ITR worker");
                error!("Do you have root privileges? Try running with 'sudo'.");
            }
        }
    }
    drop(ctx);
    if workers.is_empty() {
        bail!("No ITR worker could be started");
    }

    // Punts go to the log until a control plane consumes them
    let punt_logger = thread::Builder::new()
        .name("itr-punt".to_string())
        .spawn(move || {
            for bytes in punt_rx.iter() {
                match PuntMessage::from_json(&bytes) {
                    Ok(msg) => info!(
                        iface = %msg.iface,
                        deid = %msg.dst_eid,
                        seid = %msg.src_eid,
                        "Map-cache miss"
                    ),
                    Err(e) => warn!(error = %e, "Malformed punt message"),
                }
            }
        })
        .context("Failed to spawn punt logger")?;

    let mut sigint = signal(SignalKind::interrupt()).context("Failed to set up SIGINT handler")?;
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to set up SIGTERM handler")?;

    let purge_after = Duration::from_secs(args.purge_after_secs);
    let mut purge_tick = tokio::time::interval(purge_after.max(Duration::from_secs(1)));

    info!(workers = workers.len(), "ITR running");
    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = purge_tick.tick(), if !purge_after.is_zero() => {
                map_cache.purge_unresolved(Instant::now(), purge_after);
            }
        }
    }

    for worker in &workers {
        worker.terminate();
    }
    for worker in workers {
        let ifname = worker.ifname.clone();
        let (stats, result) = worker.shutdown();
        if let Err(e) = result {
            warn!(ifname = %ifname, error = %e, "ITR worker exited with error");
        }
        info!(ifname = %ifname, ?stats, "ITR worker stopped");
    }

    if punt_logger.join().is_err() {
        warn!("Punt logger panicked");
    }

    info!(entries = map_cache.len(), "ITR stopped");
    Ok(())
}
