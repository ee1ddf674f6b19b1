use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;

use fabricmon::channel::CommandChannel;
use fabricmon::kv::{KvStore, sanitize_endpoints};
use fabricmon::packet::build_icmp_probe;
use fabricmon::store::Topology;
use fabricmon::sync::Synchronizer;
use fabricmon::trace::TraceRunner;

/// Inject a probe packet at a logical port and print the hop-by-hop
/// logical path it takes across the fabric.
#[derive(Parser)]
#[command(name = "fabric-trace")]
#[command(about = "Trace a probe packet through the logical fabric", long_about = None)]
struct Cli {
    /// Comma-delimited list of config-store endpoints
    #[arg(long, default_value = "localhost:2379")]
    endpoints: String,

    /// Key prefix of the fabric state (must end with '/')
    #[arg(short = 'p', long, default_value = "/fabric/")]
    prefix: String,

    /// Logical port to inject the packet at
    #[arg(short = 'j', long = "port")]
    port: Option<String>,

    /// Raw packet header and payload, hex encoded
    #[arg(short = 'd', long = "header")]
    packet: Option<String>,

    /// Source mac address of the synthesized packet
    #[arg(long)]
    src_mac: Option<String>,

    /// Destination mac address of the synthesized packet
    #[arg(long)]
    dst_mac: Option<String>,

    /// Source ip address of the synthesized packet
    #[arg(long)]
    src_ip: Option<Ipv4Addr>,

    /// Destination ip address of the synthesized packet
    #[arg(long)]
    dst_ip: Option<Ipv4Addr>,

    /// Seconds to wait for agents to report back before collecting
    #[arg(long, default_value = "3")]
    wait: u64,
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Diagnostics go to stderr; stdout carries only the trace lines.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run(Cli::parse()).await {
        eprintln!("fabric-trace: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let Some(port) = cli.port else {
        bail!("an ingress port is required (-j/--port)");
    };
    if !cli.prefix.ends_with('/') {
        bail!("prefix should end with '/': {}", cli.prefix);
    }

    let packet = match cli.packet {
        Some(hex) => {
            if hex.is_empty()
                || hex.len() % 2 != 0
                || !hex.chars().all(|c| c.is_ascii_hexdigit())
            {
                bail!("packet header must be an even-length hex string");
            }
            hex
        }
        None => {
            let (Some(src_mac), Some(dst_mac), Some(src_ip), Some(dst_ip)) =
                (&cli.src_mac, &cli.dst_mac, cli.src_ip, cli.dst_ip)
            else {
                bail!(
                    "specify either --header or all of --src-mac/--dst-mac/--src-ip/--dst-ip"
                );
            };
            build_icmp_probe(src_mac, dst_mac, src_ip, dst_ip)
                .context("failed to synthesize probe packet")?
        }
    };

    let endpoints = sanitize_endpoints(&cli.endpoints);
    let store = KvStore::connect(&endpoints, &cli.prefix)
        .await
        .context("failed to connect to config store")?;

    let topo = Arc::new(Topology::new());
    Synchronizer::new(Arc::clone(&topo), store.clone())
        .bootstrap()
        .await
        .context("failed to read entity view")?;

    let runner = TraceRunner::new(topo, CommandChannel::new(store))
        .with_wait(std::time::Duration::from_secs(cli.wait));
    let hops = runner.run(&port, &packet).await?;
    if hops.is_empty() {
        eprintln!("fabric-trace: no trace results collected (agents may be down or slow)");
    }
    for hop in &hops {
        println!("{hop}");
    }
    Ok(())
}
