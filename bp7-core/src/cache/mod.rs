//! Cache top-level: attaching a custody cache to a service address, driving
//! it from poll/up/down events, registering an offload module, and the debug
//! scan.

pub mod custody;
pub mod entry;
pub mod fsm;
pub mod offload;
pub mod state;

pub use entry::{CacheEntry, EntryState};
pub use offload::{ModuleType, OffloadStore};
pub use state::CacheState;

use crate::codec::types::IpnAddress;
use crate::error::{BpError, BpResult};
use crate::pool::flow::{FLOW_FLAG_ADMIN_UP, FLOW_FLAG_OPER_UP, FLOW_FLAG_STORAGE};
use crate::pool::{BlockId, FlowDir, IntfId, Pool};
use tracing::{debug, info, warn};

/// Default queue depths for a cache's flow.
pub const CACHE_INGRESS_DEPTH: u32 = 64;
pub const CACHE_EGRESS_DEPTH: u32 = 64;

/// Events a cache interface reacts to.
#[derive(Debug, Clone, Copy)]
pub enum ServiceEvent {
    /// Advance the action-time snapshot, drain the intake queue, and drive
    /// the FSM over everything due.
    Poll { now: u64 },
    /// A next-hop covering `dest & mask` became reachable; replay affected
    /// entries.
    RouteUp { dest: u64, mask: u64 },
    /// The egress path went away; drop undelivered intake.
    RouteDown,
}

/// Creates a cache bound to `self_addr`, returning its interface handle.
pub fn attach(pool: &mut Pool, self_addr: IpnAddress) -> BpResult<IntfId> {
    let flow = pool.alloc_flow(CACHE_INGRESS_DEPTH, CACHE_EGRESS_DEPTH)?;
    let pending = match pool.alloc_listhead() {
        Ok(b) => b,
        Err(err) => {
            pool.recycle_block(flow);
            return Err(err);
        }
    };
    let idle = match pool.alloc_listhead() {
        Ok(b) => b,
        Err(err) => {
            pool.recycle_block(flow);
            pool.recycle_block(pending);
            return Err(err);
        }
    };

    let state = Box::new(CacheState::new(self_addr, flow, pending, idle));
    let intf = state.self_intf;
    if let Some(f) = pool.flow_mut(flow) {
        f.owner = crate::pool::FlowOwner::Cache(state);
        f.pending_state_flags = FLOW_FLAG_ADMIN_UP | FLOW_FLAG_OPER_UP | FLOW_FLAG_STORAGE;
        f.current_state_flags = f.pending_state_flags;
    }
    info!(%self_addr, %intf, "cache attached");
    Ok(intf)
}

/// Detaches and tears down a cache; in-flight bundles are drained and
/// recycled by the flow destructor.
pub fn detach(pool: &mut Pool, intf: IntfId) -> BpResult<()> {
    let flow = intf.block();
    if pool.flow(flow).is_none() {
        return Err(BpError::NullPointer);
    }
    pool.recycle_block(flow);
    info!(%intf, "cache detached");
    Ok(())
}

/// Dispatches an event to the cache behind `intf`.
pub fn service_event(pool: &mut Pool, intf: IntfId, event: ServiceEvent) {
    let flow = intf.block();
    let Some(mut state) = pool.take_cache_state(flow) else {
        warn!(%intf, "event for a non-cache interface");
        return;
    };

    match event {
        ServiceEvent::Poll { now } => {
            state.action_time = now;
            // intake: everything the router handed us since the last tick
            while let Some(qblk) = pool.flow_try_pull(flow, FlowDir::Egress) {
                custody::ingest(pool, &mut state, qblk);
            }
            fsm::process_pending(pool, &mut state);
        }
        ServiceEvent::RouteUp { dest, mask } => {
            route_up(pool, &mut state, dest, mask);
        }
        ServiceEvent::RouteDown => {
            let subq = pool.flow(flow).map(|f| f.egress.subq);
            if let Some(subq) = subq {
                while let Some(blk) = pool.subq_pull(subq) {
                    pool.recycle_block(blk);
                }
            }
        }
    }

    pool.put_cache_state(flow, state);
}

/// One-shot poll raised through the flow's state-change job.
pub(crate) fn notify_poll(pool: &mut Pool, flow: BlockId) {
    let now = match pool.flow(flow) {
        Some(_) => match pool.take_cache_state(flow) {
            Some(state) => {
                let now = state.action_time;
                pool.put_cache_state(flow, state);
                now
            }
            None => return,
        },
        None => return,
    };
    service_event(pool, IntfId::from_block(flow), ServiceEvent::Poll { now });
}

/// Replays every stored entry whose destination matches the now-reachable
/// prefix by pulling its timer in to "now".
fn route_up(pool: &mut Pool, state: &mut CacheState, dest: u64, mask: u64) {
    let lo = dest & mask;
    let hi = lo | !mask;
    let mut matched = 0u32;
    let mut h = state.dest_eid_index.lower_bound(lo);
    let mut due = Vec::new();
    while let Some(hh) = h {
        if state.dest_eid_index.key(hh) > hi {
            break;
        }
        due.push(*state.dest_eid_index.value(hh));
        h = state.dest_eid_index.next(hh);
    }
    for entry_blk in due {
        if let Some(e) = pool.cache_entry_mut(entry_blk) {
            e.flags |= entry::ENTRY_FLAG_ACTIVITY;
            // collapse any pending retransmit timer so the revisit can act
            // immediately now that the path exists
            if e.flags & entry::ENTRY_FLAG_ACTION_TIME_WAIT != 0 {
                e.action_time = state.action_time;
            }
        }
        let link = pool
            .cache_entry(entry_blk)
            .map(|e| e.time_link)
            .unwrap_or_default();
        if state.time_index.is_member(link) && *state.time_index.value(link) == entry_blk {
            state.time_index.extract(link);
        }
        let now = state.action_time;
        let new_link = state.time_index.insert(now, entry_blk);
        if let Some(e) = pool.cache_entry_mut(entry_blk) {
            e.time_link = new_link;
        }
        matched += 1;
    }
    debug!(dest, mask, matched, "route up replay");
}

/// Registers an offload (or other) module on the cache. Only one offload
/// module may be attached at a time.
pub fn register_module_service(
    pool: &mut Pool,
    intf: IntfId,
    mut module: Box<dyn OffloadStore>,
) -> BpResult<()> {
    let flow = intf.block();
    let Some(mut state) = pool.take_cache_state(flow) else {
        return Err(BpError::NullPointer);
    };
    let out = match module.module_type() {
        ModuleType::Offload => {
            if state.offload.is_some() {
                Err(BpError::Duplicate)
            } else {
                module.start().map(|()| {
                    state.offload = Some(module);
                })
            }
        }
        ModuleType::Other => module.start(),
    };
    pool.put_cache_state(flow, state);
    out
}

/// Routes a configure call through to the registered offload module.
pub fn module_configure(pool: &mut Pool, intf: IntfId, key: u32, value: u64) -> BpResult<()> {
    with_offload(pool, intf, |store| store.configure(key, value))
}

/// Routes a query call through to the registered offload module.
pub fn module_query(pool: &mut Pool, intf: IntfId, key: u32) -> BpResult<u64> {
    with_offload(pool, intf, |store| store.query(key))
}

fn with_offload<R>(
    pool: &mut Pool,
    intf: IntfId,
    f: impl FnOnce(&mut Box<dyn OffloadStore>) -> BpResult<R>,
) -> BpResult<R> {
    let flow = intf.block();
    let Some(mut state) = pool.take_cache_state(flow) else {
        return Err(BpError::NullPointer);
    };
    let out = match state.offload.as_mut() {
        Some(store) => f(store),
        None => Err(BpError::NullCallback),
    };
    pool.put_cache_state(flow, state);
    out
}

/// Counter snapshot for telemetry.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheCounters {
    pub stored: usize,
    pub open_dacs: usize,
    pub timed: usize,
    pub discards: u64,
    pub state_enter_count: [u64; entry::ENTRY_STATE_COUNT],
    pub state_exit_count: [u64; entry::ENTRY_STATE_COUNT],
}

pub fn counters(pool: &mut Pool, intf: IntfId) -> BpResult<CacheCounters> {
    let flow = intf.block();
    let Some(state) = pool.take_cache_state(flow) else {
        return Err(BpError::NullPointer);
    };
    let snapshot = CacheCounters {
        stored: state.bundle_index.len(),
        open_dacs: state.dacs_index.len(),
        timed: state.time_index.len(),
        discards: state.discard_count,
        state_enter_count: state.state_enter_count,
        state_exit_count: state.state_exit_count,
    };
    pool.put_cache_state(flow, state);
    Ok(snapshot)
}

/// Logs the state of every entry under this cache.
pub fn debug_scan(pool: &mut Pool, intf: IntfId) {
    let flow = intf.block();
    let Some(state) = pool.take_cache_state(flow) else {
        return;
    };
    info!(cache = ?state, "cache scan");
    for list in [state.pending_list, state.idle_list] {
        let mut cur = pool.next_block(list);
        while cur != list {
            if let Some(e) = pool.cache_entry(cur) {
                info!(
                    entry = %cur,
                    state = ?e.state,
                    flags = e.flags,
                    source = %e.source_copy,
                    sequence = e.sequence_copy,
                    expire = e.expire_time,
                    "cache entry"
                );
            }
            cur = pool.next_block(cur);
        }
    }
    pool.put_cache_state(flow, state);
}

/// Cache-state destructor, run when the owning flow block is collected:
/// recycles every entry still parked on the cache's lists.
pub(crate) fn destruct_state(pool: &mut Pool, mut state: CacheState) {
    if let Some(store) = state.offload.as_mut() {
        if let Err(err) = store.stop() {
            warn!(?err, "offload stop failed during detach");
        }
    }
    for list in [state.pending_list, state.idle_list] {
        while pool.next_block(list) != list {
            let member = pool.next_block(list);
            pool.extract_node(member);
            pool.recycle_block(member);
        }
        pool.recycle_block(list);
    }
}
