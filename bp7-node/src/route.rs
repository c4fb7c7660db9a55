//! Static routing table: one next-hop interface per destination IPN prefix,
//! plus the local service registrations and the storage interface bundles
//! with a delivery policy pass through.

use crate::error::{NodeError, NodeResult};
use bp7_core::pool::flow::{FLOW_FLAG_ADMIN_UP, FLOW_FLAG_ENDPOINT, FLOW_FLAG_OPER_UP};
use bp7_core::{IntfId, IpnAddress, Pool};
use tracing::info;

/// Queue depths for application endpoint flows.
const SERVICE_INGRESS_DEPTH: u32 = 32;
const SERVICE_EGRESS_DEPTH: u32 = 32;

/// A next-hop: destination node numbers matching `dest & mask` leave through
/// `intf`. `local_retx_interval_ms` is the custody retransmit interval for
/// bundles handed to this interface.
#[derive(Debug, Clone, Copy)]
pub struct RouteEntry {
    pub dest: u64,
    pub mask: u64,
    pub intf: IntfId,
    pub local_retx_interval_ms: u64,
}

#[derive(Debug, Default)]
pub struct RouteTable {
    routes: Vec<RouteEntry>,
    services: Vec<(IpnAddress, IntfId)>,
    storage: Option<IntfId>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a local application endpoint, allocating its flow.
    pub fn attach(&mut self, pool: &mut Pool, addr: IpnAddress) -> NodeResult<IntfId> {
        if self.services.iter().any(|(a, _)| *a == addr) {
            return Err(NodeError::InUse);
        }
        let flow = pool.alloc_flow(SERVICE_INGRESS_DEPTH, SERVICE_EGRESS_DEPTH)?;
        if let Some(f) = pool.flow_mut(flow) {
            f.pending_state_flags = FLOW_FLAG_ADMIN_UP | FLOW_FLAG_OPER_UP | FLOW_FLAG_ENDPOINT;
            f.current_state_flags = f.pending_state_flags;
        }
        let intf = IntfId::from_block(flow);
        self.services.push((addr, intf));
        info!(%addr, %intf, "service attached");
        Ok(intf)
    }

    /// Deregisters a local endpoint and tears its flow down.
    pub fn detach(&mut self, pool: &mut Pool, addr: IpnAddress) -> NodeResult<()> {
        let pos = self
            .services
            .iter()
            .position(|(a, _)| *a == addr)
            .ok_or(NodeError::InUse)?;
        let (_, intf) = self.services.remove(pos);
        pool.recycle_block(intf.block());
        info!(%addr, %intf, "service detached");
        Ok(())
    }

    pub fn service_intf(&self, addr: IpnAddress) -> Option<IntfId> {
        self.services
            .iter()
            .find(|(a, _)| *a == addr)
            .map(|(_, i)| *i)
    }

    pub fn services(&self) -> impl Iterator<Item = (IpnAddress, IntfId)> + '_ {
        self.services.iter().copied()
    }

    pub fn add_route(&mut self, entry: RouteEntry) {
        info!(dest = entry.dest, mask = entry.mask, intf = %entry.intf, "route added");
        self.routes.push(entry);
    }

    /// First matching next-hop for a destination node number.
    pub fn lookup(&self, dest_node: u64) -> Option<RouteEntry> {
        self.routes
            .iter()
            .find(|r| dest_node & r.mask == r.dest & r.mask)
            .copied()
    }

    /// Distinct next-hop interfaces named by the route set.
    pub fn route_intfs(&self) -> Vec<IntfId> {
        let mut out: Vec<IntfId> = Vec::new();
        for r in &self.routes {
            if !out.contains(&r.intf) {
                out.push(r.intf);
            }
        }
        out
    }

    pub fn set_storage(&mut self, intf: IntfId) {
        self.storage = Some(intf);
    }

    pub fn storage(&self) -> Option<IntfId> {
        self.storage
    }
}
