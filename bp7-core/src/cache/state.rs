//! Per-service cache state: the lists and secondary indices every stored
//! bundle participates in, the action-time snapshot, and the optional
//! offload delegate.

use crate::cache::entry::ENTRY_STATE_COUNT;
use crate::cache::offload::OffloadStore;
use crate::codec::types::IpnAddress;
use crate::pool::rbtree::RbTree;
use crate::pool::{BlockId, IntfId};
use std::fmt;

/// Holdover before a dead entry's metadata is finally discarded.
pub const CACHE_AGE_OUT_TIME_MS: u64 = 10_000;
/// Retry interval for entries blocked on a temporary external condition.
pub const CACHE_FAST_RETRY_TIME_MS: u64 = 1_000;
/// Revisit interval for entries parked in a wait state.
pub const CACHE_IDLE_RETRY_TIME_MS: u64 = 5_000;
/// How long a DACS stays open to aggregate further acknowledgements.
pub const CACHE_DACS_OPEN_TIME_MS: u64 = 1_000;
/// Lifetime given to generated DACS bundles.
pub const CACHE_DACS_LIFETIME_MS: u64 = 86_400_000;
/// Default local retransmit interval for custody-tracked bundles.
pub const CACHE_LOCAL_RETX_INTERVAL_MS: u64 = 15_000;

/// Key for the bundle-id index: (source node, source service, sequence).
pub type BundleKey = (u64, u64, u64);

pub struct CacheState {
    pub self_addr: IpnAddress,
    pub self_intf: IntfId,
    pub flow_blk: BlockId,

    /// Entries awaiting an immediate FSM pass.
    pub pending_list: BlockId,
    /// Entries parked between scheduled visits.
    pub idle_list: BlockId,

    /// Deduplication and DACS correlation by bundle id triple.
    pub bundle_index: RbTree<BundleKey, BlockId>,
    /// Open DACS entries keyed by custodian node number.
    pub dacs_index: RbTree<u64, BlockId>,
    /// Stored entries keyed by destination node number, for route-up replay.
    pub dest_eid_index: RbTree<u64, BlockId>,
    /// Entries keyed by next action time; ties break by insertion order.
    pub time_index: RbTree<u64, BlockId>,

    /// "Now" snapshot taken at tick start.
    pub action_time: u64,
    /// Creation-timestamp sequence counter for locally generated bundles.
    pub creation_seq: u64,

    pub offload: Option<Box<dyn OffloadStore>>,

    pub state_enter_count: [u64; ENTRY_STATE_COUNT],
    pub state_exit_count: [u64; ENTRY_STATE_COUNT],
    pub discard_count: u64,
}

impl CacheState {
    pub fn new(
        self_addr: IpnAddress,
        flow_blk: BlockId,
        pending_list: BlockId,
        idle_list: BlockId,
    ) -> Self {
        Self {
            self_addr,
            self_intf: IntfId::from_block(flow_blk),
            flow_blk,
            pending_list,
            idle_list,
            bundle_index: RbTree::new(),
            dacs_index: RbTree::new(),
            dest_eid_index: RbTree::new(),
            time_index: RbTree::new(),
            action_time: 0,
            creation_seq: 0,
            offload: None,
            state_enter_count: [0; ENTRY_STATE_COUNT],
            state_exit_count: [0; ENTRY_STATE_COUNT],
            discard_count: 0,
        }
    }

    pub fn stored_count(&self) -> usize {
        self.bundle_index.len()
    }
}

impl fmt::Debug for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheState")
            .field("self_addr", &self.self_addr)
            .field("stored", &self.bundle_index.len())
            .field("open_dacs", &self.dacs_index.len())
            .field("timed", &self.time_index.len())
            .field("action_time", &self.action_time)
            .field("discards", &self.discard_count)
            .field("offload", &self.offload.is_some())
            .finish()
    }
}
