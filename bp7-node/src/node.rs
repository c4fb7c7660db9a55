//! Node assembly: owns the shared pool, the routing table, and the time
//! keeper, builds outbound bundles for local applications, and runs the
//! forwarding pass that moves bundle references between interface flows.

use crate::error::{NodeError, NodeResult};
use crate::route::{RouteEntry, RouteTable};
use bp7_core::cache::{self, ServiceEvent};
use bp7_core::codec::canonical;
use bp7_core::codec::crc::CrcType;
use bp7_core::codec::types::{
    BlockType, CanonicalBlock, CanonicalPayload, CreationTimestamp, DeliveryPolicy, EndpointId,
    PrimaryBlock,
};
use bp7_core::events::HostProxies;
use bp7_core::pool::FlowDir;
use bp7_core::time::MonotonicSource;
use bp7_core::{
    BlockId, IntfId, IpnAddress, Pool, PoolConfig, SharedPool, TimeKeeper,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub local_addr: IpnAddress,
    pub pool_blocks: u32,
    pub pool: PoolConfig,
    pub time_file: Option<PathBuf>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            local_addr: IpnAddress::new(1, 1),
            pool_blocks: 4096,
            pool: PoolConfig::default(),
            time_file: None,
        }
    }
}

/// Per-send knobs for locally originated bundles.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    pub lifetime_ms: u64,
    pub custody: bool,
    pub crc_type: CrcType,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            lifetime_ms: 3_600_000,
            custody: false,
            crc_type: CrcType::Crc16X25,
        }
    }
}

pub struct Node {
    pool: Arc<SharedPool>,
    table: Mutex<RouteTable>,
    timekeeper: Mutex<TimeKeeper>,
    proxies: HostProxies,
    local_addr: IpnAddress,
    send_seq: AtomicU64,
    running: Arc<AtomicBool>,
}

impl Node {
    pub fn new(
        cfg: NodeConfig,
        source: Arc<dyn MonotonicSource>,
        proxies: HostProxies,
    ) -> NodeResult<Node> {
        let pool = Pool::with_block_count(cfg.pool_blocks, cfg.pool)?;
        let timekeeper = TimeKeeper::init(source, cfg.time_file.as_deref())?;
        Ok(Node {
            pool: SharedPool::new(pool),
            table: Mutex::new(RouteTable::new()),
            timekeeper: Mutex::new(timekeeper),
            proxies,
            local_addr: cfg.local_addr,
            send_seq: AtomicU64::new(0),
            running: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn pool(&self) -> Arc<SharedPool> {
        Arc::clone(&self.pool)
    }

    pub fn proxies(&self) -> &HostProxies {
        &self.proxies
    }

    pub fn local_addr(&self) -> IpnAddress {
        self.local_addr
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn attach_service(&self, addr: IpnAddress) -> NodeResult<IntfId> {
        self.pool.with(|pool| self.table.lock().attach(pool, addr))
    }

    pub fn detach_service(&self, addr: IpnAddress) -> NodeResult<()> {
        self.pool.with(|pool| self.table.lock().detach(pool, addr))
    }

    /// Attaches the custody cache for the local address and records it as
    /// the storage interface.
    pub fn attach_storage(&self) -> NodeResult<IntfId> {
        self.pool.with(|pool| {
            let intf = cache::attach(pool, self.local_addr)?;
            self.table.lock().set_storage(intf);
            Ok(intf)
        })
    }

    pub fn register_offload(
        &self,
        store: Box<dyn cache::OffloadStore>,
    ) -> NodeResult<()> {
        self.pool.with(|pool| {
            let storage = self
                .table
                .lock()
                .storage()
                .ok_or(NodeError::Core(bp7_core::BpError::NullPointer))?;
            cache::register_module_service(pool, storage, store).map_err(NodeError::from)
        })
    }

    /// Allocates a CLA-facing flow (up, no owner) and returns its handle.
    pub fn attach_cla(&self, ingress_depth: u32, egress_depth: u32) -> NodeResult<IntfId> {
        use bp7_core::pool::flow::{FLOW_FLAG_ADMIN_UP, FLOW_FLAG_OPER_UP};
        self.pool.with(|pool| {
            let flow = pool.alloc_flow(ingress_depth, egress_depth)?;
            if let Some(f) = pool.flow_mut(flow) {
                f.pending_state_flags = FLOW_FLAG_ADMIN_UP | FLOW_FLAG_OPER_UP;
                f.current_state_flags = f.pending_state_flags;
            }
            Ok(IntfId::from_block(flow))
        })
    }

    pub fn add_route(&self, entry: RouteEntry) {
        self.table.lock().add_route(entry);
    }

    /// Builds a bundle from an ADU and hands it to the router via the
    /// sending service's flow.
    pub fn send(
        &self,
        from: IpnAddress,
        dest: IpnAddress,
        data: &[u8],
        opts: SendOptions,
    ) -> NodeResult<()> {
        let dtn_now = self.timekeeper.lock().cache_time();
        let seq = self.send_seq.fetch_add(1, Ordering::SeqCst);

        self.pool.with(|pool| {
            let svc = self
                .table
                .lock()
                .service_intf(from)
                .ok_or(NodeError::InUse)?;

            let mut pri = PrimaryBlock::new();
            pri.flags.must_not_fragment = true;
            pri.crc_type = opts.crc_type;
            pri.destination = EndpointId::Ipn(dest);
            pri.source = EndpointId::Ipn(from);
            pri.report_to = EndpointId::Ipn(from);
            pri.timestamp = CreationTimestamp {
                dtn_time_ms: dtn_now,
                sequence: seq,
            };
            pri.lifetime_ms = opts.lifetime_ms;
            pri.delivery.policy = if opts.custody {
                DeliveryPolicy::CustodyTracking
            } else {
                DeliveryPolicy::None
            };
            pri.delivery.ingress_intf = svc;
            pri.delivery.ingress_time_ms = dtn_now;

            let pri_id = pool.alloc_primary(pri)?;
            let mut pay = CanonicalBlock::new(BlockType::Payload, 1, CanonicalPayload::Opaque);
            pay.crc_type = opts.crc_type;
            canonical::encode_payload(&mut pay, data)?;
            let pay_id = match pool.alloc_canonical(pay) {
                Ok(id) => id,
                Err(err) => {
                    pool.recycle_block(pri_id);
                    return Err(NodeError::from(err));
                }
            };
            if let Some(p) = pool.primary_mut(pri_id) {
                p.canonicals.push(pay_id);
            }

            let rblk = match pool.make_ref_block(pri_id, BlockId::INVALID) {
                Ok(id) => id,
                Err(err) => {
                    pool.recycle_block(pri_id);
                    return Err(NodeError::from(err));
                }
            };
            if !pool.flow_try_push(svc.block(), FlowDir::Ingress, rblk) {
                pool.recycle_block(rblk);
                return Err(NodeError::Core(bp7_core::BpError::InterfaceDown));
            }
            Ok(())
        })
    }

    /// Pulls one delivered bundle for the service and returns its payload.
    pub fn receive(&self, intf: IntfId, deadline: Option<Instant>) -> Option<Vec<u8>> {
        let rblk = self.pool.flow_pull(intf.block(), FlowDir::Egress, deadline)?;
        self.pool.with(|pool| {
            let payload = pool
                .ref_target(rblk)
                .and_then(|pri_id| take_payload(pool, pri_id));
            pool.recycle_block(rblk);
            payload
        })
    }

    /// One main-loop pass: jobs, forwarding, cache poll, collection.
    pub fn tick(&self) {
        let now = self.timekeeper.lock().cache_time();
        self.pool.with(|pool| {
            pool.run_all_jobs();
            let table = self.table.lock();
            forward_pass(pool, &table, now);
            if let Some(storage) = table.storage() {
                cache::service_event(pool, storage, ServiceEvent::Poll { now });
                // the cache may have queued retransmits for the router
                forward_pass(pool, &table, now);
            }
            drop(table);
            pool.maintain_recycle(64);
        });
    }

    /// Periodic housekeeping: recompute the time correlation factor.
    pub fn maintenance(&self) -> NodeResult<bool> {
        Ok(self.timekeeper.lock().maintenance()?)
    }

    pub fn cache_counters(&self) -> Option<cache::CacheCounters> {
        self.pool.with(|pool| {
            let storage = self.table.lock().storage()?;
            cache::counters(pool, storage).ok()
        })
    }
}

/// Extracts the payload bytes of the bundle's payload block.
fn take_payload(pool: &Pool, pri_id: BlockId) -> Option<Vec<u8>> {
    let pri = pool.primary(pri_id)?;
    for cid in &pri.canonicals {
        if let Some(cb) = pool.canonical(*cid) {
            if matches!(
                cb.block_type,
                BlockType::Payload | BlockType::CiphertextPayload
            ) {
                return Some(cb.content_bytes().to_vec());
            }
        }
    }
    None
}

/// Moves every reference waiting on an interface's ingress to where it goes
/// next: the storage cache, a local service, or the next-hop CLA egress.
pub fn forward_pass(pool: &mut Pool, table: &RouteTable, now: u64) -> u32 {
    let mut sources: Vec<IntfId> = Vec::new();
    for (_, intf) in table.services() {
        sources.push(intf);
    }
    if let Some(storage) = table.storage() {
        if !sources.contains(&storage) {
            sources.push(storage);
        }
    }
    for intf in table.route_intfs() {
        if !sources.contains(&intf) {
            sources.push(intf);
        }
    }

    let mut moved = 0;
    for intf in sources {
        while let Some(rblk) = pool.flow_try_pull(intf.block(), FlowDir::Ingress) {
            dispatch_one(pool, table, now, rblk);
            moved += 1;
        }
    }
    moved
}

fn dispatch_one(pool: &mut Pool, table: &RouteTable, now: u64, rblk: BlockId) {
    let Some(pri_id) = pool.ref_target(rblk) else {
        pool.recycle_block(rblk);
        return;
    };
    let Some((dest, policy, committed, is_admin)) = pool.primary(pri_id).map(|p| {
        (
            p.destination,
            p.delivery.policy,
            p.delivery.committed_storage_id,
            p.flags.is_admin_record,
        )
    }) else {
        pool.recycle_block(rblk);
        return;
    };
    let Some(dest_addr) = dest.as_ipn() else {
        debug!("dropping bundle with non-ipn destination");
        pool.recycle_block(rblk);
        return;
    };

    let storage = table.storage();
    let needs_store = committed == 0 && policy != DeliveryPolicy::None;

    if let Some(svc) = table.service_intf(dest_addr) {
        // custody signalling and custody-required bundles go through the
        // cache before (or instead of) local delivery
        if let Some(storage) = storage {
            if is_admin || needs_store {
                if !pool.flow_try_push(storage.block(), FlowDir::Egress, rblk) {
                    pool.recycle_block(rblk);
                }
                return;
            }
        }
        // deliver locally; the application is the final custodian
        if let Some(p) = pool.primary_mut(pri_id) {
            p.delivery.egress_intf = svc;
            p.delivery.egress_time_ms = now;
            if p.delivery.policy == DeliveryPolicy::CustodyTracking {
                p.delivery.policy = DeliveryPolicy::LocalAck;
            }
        }
        if !pool.flow_try_push(svc.block(), FlowDir::Egress, rblk) {
            pool.recycle_block(rblk);
        }
        return;
    }

    if let Some(storage) = storage {
        if needs_store {
            if !pool.flow_try_push(storage.block(), FlowDir::Egress, rblk) {
                pool.recycle_block(rblk);
            }
            return;
        }
    }

    match table.lookup(dest_addr.node) {
        Some(route) => {
            if let Some(p) = pool.primary_mut(pri_id) {
                if p.delivery.local_retx_interval_ms == 0 {
                    p.delivery.local_retx_interval_ms = route.local_retx_interval_ms;
                }
                p.delivery.egress_time_ms = now;
            }
            trace!(dest = %dest_addr, intf = %route.intf, "forwarding");
            if !pool.flow_try_push(route.intf.block(), FlowDir::Egress, rblk) {
                pool.recycle_block(rblk);
            }
        }
        None => {
            debug!(dest = %dest_addr, "no route, dropping reference");
            pool.recycle_block(rblk);
        }
    }
}
