//! bpcat: pipe stdin into bundles toward a destination IPN address over a
//! UDP convergence layer, and write delivered payloads to stdout.

use bp7_core::codec::crc::CrcType;
use bp7_core::events::HostProxies;
use bp7_core::time::SystemMonotonic;
use bp7_core::{IpnAddress, PoolConfig};
use bp7_node::{Node, NodeConfig, RouteEntry, SendOptions, UdpCla, UdpClaConfig};
use clap::Parser;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info};

/// Size of one application data unit read from stdin.
const ADU_CHUNK_SIZE: usize = 4096;

#[derive(Parser, Debug)]
#[command(author, version, about = "stdin/stdout bundle pipe over a UDP CLA")]
struct Args {
    /// Local endpoint as node.service
    #[arg(long, default_value = "100.1")]
    local: String,
    /// Destination endpoint as node.service
    #[arg(long, default_value = "200.1")]
    dest: String,
    /// UDP address bundles are sent to
    #[arg(long, default_value = "127.0.0.1:4551")]
    egress: SocketAddr,
    /// UDP address bundles are received on
    #[arg(long, default_value = "127.0.0.1:4501")]
    ingress: SocketAddr,
    /// Bundle lifetime in milliseconds
    #[arg(long, default_value_t = 3_600_000)]
    lifetime: u64,
    /// Request custody transfer with DACS acknowledgement
    #[arg(long, default_value_t = false)]
    custody: bool,
    /// Use CRC-32C instead of CRC-16/X.25
    #[arg(long, default_value_t = false)]
    crc32: bool,
    /// Pool size in blocks
    #[arg(long, default_value_t = 4096)]
    pool_blocks: u32,
    /// Only send; do not wait for inbound bundles
    #[arg(long, default_value_t = false)]
    send_only: bool,
}

fn parse_ipn(text: &str) -> Option<IpnAddress> {
    let (node, service) = text.split_once('.')?;
    Some(IpnAddress::new(node.parse().ok()?, service.parse().ok()?))
}

fn main() -> ExitCode {
    let _ = tracing_subscriber::fmt::try_init();
    let args = Args::parse();

    let (Some(local), Some(dest)) = (parse_ipn(&args.local), parse_ipn(&args.dest)) else {
        error!("endpoints must be given as node.service");
        return ExitCode::FAILURE;
    };

    match run(args, local, dest) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(?err, "bpcat failed to start");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args, local: IpnAddress, dest: IpnAddress) -> Result<(), bp7_node::NodeError> {
    let node = Arc::new(Node::new(
        NodeConfig {
            local_addr: local,
            pool_blocks: args.pool_blocks,
            pool: PoolConfig::default(),
            time_file: None,
        },
        Arc::new(SystemMonotonic::new()),
        HostProxies::default(),
    )?);

    let service = node.attach_service(local)?;
    node.attach_storage()?;
    let cla_intf = node.attach_cla(64, 64)?;
    node.add_route(RouteEntry {
        dest: 0,
        mask: 0,
        intf: cla_intf,
        local_retx_interval_ms: 15_000,
    });

    let running = node.running();
    let cla = UdpCla::spawn(
        node.pool(),
        HostProxies::default(),
        cla_intf,
        UdpClaConfig {
            egress_addr: args.egress,
            ingress_bind: args.ingress,
        },
        Arc::clone(&running),
    )?;
    info!(%local, %dest, "bpcat running");

    // main-loop ticks
    let ticker = {
        let node = Arc::clone(&node);
        std::thread::spawn(move || {
            let mut last_maintenance = Instant::now();
            while node.is_running() {
                node.tick();
                if last_maintenance.elapsed() >= Duration::from_secs(1) {
                    let _ = node.maintenance();
                    last_maintenance = Instant::now();
                }
                std::thread::sleep(Duration::from_millis(20));
            }
        })
    };

    // delivered payloads to stdout
    let receiver = if args.send_only {
        None
    } else {
        let node = Arc::clone(&node);
        Some(std::thread::spawn(move || {
            let mut stdout = std::io::stdout();
            while node.is_running() {
                let deadline = Instant::now() + Duration::from_millis(100);
                if let Some(payload) = node.receive(service, Some(deadline)) {
                    if stdout.write_all(&payload).and_then(|()| stdout.flush()).is_err() {
                        break;
                    }
                }
            }
        }))
    };

    // stdin to bundles until EOF
    let opts = SendOptions {
        lifetime_ms: args.lifetime,
        custody: args.custody,
        crc_type: if args.crc32 {
            CrcType::Crc32Castagnoli
        } else {
            CrcType::Crc16X25
        },
    };
    let mut stdin = std::io::stdin();
    let mut chunk = [0u8; ADU_CHUNK_SIZE];
    loop {
        match stdin.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                if let Err(err) = node.send(local, dest, &chunk[..n], opts) {
                    error!(?err, "send failed, dropping ADU");
                }
            }
            Err(err) => {
                error!(?err, "stdin read failed");
                break;
            }
        }
    }

    // linger briefly so queued bundles drain, then stop cleanly
    std::thread::sleep(Duration::from_millis(500));
    running.store(false, Ordering::SeqCst);
    let _ = ticker.join();
    if let Some(r) = receiver {
        let _ = r.join();
    }
    cla.join();
    info!("bpcat exiting");
    Ok(())
}
