//! UDP convergence-layer adapter: one egress thread pulling references from
//! the interface's flow with a 100 ms timeout and sending encoded bundles,
//! one ingress thread polling the socket with a 100 ms timeout and decoding
//! received datagrams into the pool.

use crate::error::NodeResult;
use bp7_core::codec::bundle;
use bp7_core::events::{EventId, HostProxies};
use bp7_core::pool::flow::FLOW_FLAG_OPER_UP;
use bp7_core::pool::FlowDir;
use bp7_core::{BlockId, IntfId, SharedPool};
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Poll interval for both directions.
pub const CLA_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Largest datagram accepted or produced.
pub const CLA_MAX_BUNDLE_SIZE: usize = 65_000;

#[derive(Debug, Clone)]
pub struct UdpClaConfig {
    /// Peer address encoded bundles are sent to.
    pub egress_addr: SocketAddr,
    /// Local address the ingress socket binds.
    pub ingress_bind: SocketAddr,
}

impl Default for UdpClaConfig {
    fn default() -> Self {
        Self {
            egress_addr: "127.0.0.1:4551".parse().unwrap(),
            ingress_bind: "127.0.0.1:4501".parse().unwrap(),
        }
    }
}

/// A running UDP CLA bound to one interface flow.
pub struct UdpCla {
    intf: IntfId,
    ingress_addr: SocketAddr,
    threads: Vec<JoinHandle<()>>,
}

impl UdpCla {
    /// Spawns the egress and ingress threads for `intf`. The CLA runs until
    /// `running` clears or a socket error downs the interface.
    pub fn spawn(
        pool: Arc<SharedPool>,
        proxies: HostProxies,
        intf: IntfId,
        cfg: UdpClaConfig,
        running: Arc<AtomicBool>,
    ) -> NodeResult<UdpCla> {
        let egress_socket = UdpSocket::bind("127.0.0.1:0")?;
        egress_socket.connect(cfg.egress_addr)?;
        let ingress_socket = UdpSocket::bind(cfg.ingress_bind)?;
        ingress_socket.set_read_timeout(Some(CLA_POLL_TIMEOUT))?;
        let ingress_addr = ingress_socket.local_addr()?;

        let _ = proxies.report_event(EventId::ContactSetupSuccess, "udp");
        info!(%intf, egress = %cfg.egress_addr, ingress = %ingress_addr, "udp cla up");

        let mut threads = Vec::new();
        {
            let pool = Arc::clone(&pool);
            let running = Arc::clone(&running);
            let proxies = proxies.clone();
            threads.push(std::thread::spawn(move || {
                egress_loop(pool, proxies, intf, egress_socket, running);
            }));
        }
        {
            let running = Arc::clone(&running);
            threads.push(std::thread::spawn(move || {
                ingress_loop(pool, proxies, intf, ingress_socket, running);
            }));
        }
        Ok(UdpCla {
            intf,
            ingress_addr,
            threads,
        })
    }

    pub fn intf(&self) -> IntfId {
        self.intf
    }

    /// The bound ingress address (useful when binding to an ephemeral port).
    pub fn ingress_addr(&self) -> SocketAddr {
        self.ingress_addr
    }

    /// Waits for both threads to finish (after `running` clears).
    pub fn join(self) {
        for t in self.threads {
            let _ = t.join();
        }
    }
}

fn egress_loop(
    pool: Arc<SharedPool>,
    proxies: HostProxies,
    intf: IntfId,
    socket: UdpSocket,
    running: Arc<AtomicBool>,
) {
    let flow = intf.block();
    while running.load(Ordering::SeqCst) {
        let deadline = Instant::now() + CLA_POLL_TIMEOUT;
        let Some(rblk) = pool.flow_pull(flow, FlowDir::Egress, Some(deadline)) else {
            continue;
        };
        let wire = pool.with(|p| encode_for_send(p, intf, rblk));
        let Some(wire) = wire else { continue };
        if let Err(err) = socket.send(&wire) {
            warn!(?err, %intf, "udp send failed, downing interface");
            proxies.record_error(bp7_core::BpError::InterfaceDown);
            let _ = proxies.report_event(EventId::IntfDown, "udp egress");
            pool.with(|p| p.flow_modify_flags(flow, 0, FLOW_FLAG_OPER_UP));
            break;
        }
        debug!(%intf, bytes = wire.len(), "bundle sent");
    }
}

/// Encodes the referenced bundle, stamps the delivery record with the egress
/// interface and time, and recycles the reference.
fn encode_for_send(pool: &mut bp7_core::Pool, intf: IntfId, rblk: BlockId) -> Option<Vec<u8>> {
    let pri_id = pool.ref_target(rblk);
    let mut wire = None;
    if let Some(pri_id) = pri_id {
        let mut buf = Vec::new();
        match bundle::encode_bundle(pool, pri_id, &mut buf) {
            Ok(size) if size <= CLA_MAX_BUNDLE_SIZE => {
                // completion marker; the forwarding pass already stamped the
                // egress time
                if let Some(p) = pool.primary_mut(pri_id) {
                    p.delivery.egress_intf = intf;
                }
                wire = Some(buf);
            }
            Ok(size) => warn!(size, "bundle exceeds CLA datagram limit, dropping"),
            Err(err) => warn!(?err, "bundle encode failed, dropping"),
        }
    }
    pool.recycle_block(rblk);
    wire
}

fn ingress_loop(
    pool: Arc<SharedPool>,
    proxies: HostProxies,
    intf: IntfId,
    socket: UdpSocket,
    running: Arc<AtomicBool>,
) {
    let flow = intf.block();
    let mut buf = vec![0u8; CLA_MAX_BUNDLE_SIZE];
    while running.load(Ordering::SeqCst) {
        let len = match socket.recv(&mut buf) {
            Ok(len) => len,
            Err(err)
                if err.kind() == std::io::ErrorKind::WouldBlock
                    || err.kind() == std::io::ErrorKind::TimedOut =>
            {
                continue;
            }
            Err(err) => {
                warn!(?err, %intf, "udp receive failed, downing interface");
                proxies.record_error(bp7_core::BpError::InterfaceDown);
                let _ = proxies.report_event(EventId::IntfDown, "udp ingress");
                pool.with(|p| p.flow_modify_flags(flow, 0, FLOW_FLAG_OPER_UP));
                break;
            }
        };
        ingress(&pool, intf, &buf[..len]);
    }
}

/// Decodes one received datagram and queues it toward the router.
pub fn ingress(pool: &SharedPool, intf: IntfId, data: &[u8]) {
    pool.with(|p| {
        let pri_id = match bundle::decode_bundle(p, data) {
            Ok(id) => id,
            Err(err) => {
                debug!(?err, %intf, "dropping undecodable datagram");
                return;
            }
        };
        if let Some(pri) = p.primary_mut(pri_id) {
            pri.delivery.ingress_intf = intf;
        }
        match p.make_ref_block(pri_id, BlockId::INVALID) {
            Ok(rblk) => {
                if !p.flow_try_push(intf.block(), FlowDir::Ingress, rblk) {
                    debug!(%intf, "ingress queue full, dropping bundle");
                    p.recycle_block(rblk);
                }
            }
            Err(_) => p.recycle_block(pri_id),
        }
    });
}
