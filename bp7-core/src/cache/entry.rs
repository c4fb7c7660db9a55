//! A cache entry: the per-bundle record that survives reference drops and
//! carries the FSM state, activity flags, timers, and index memberships.

use crate::codec::types::{EndpointId, IpnAddress};
use crate::pool::block::{BlockContent, SIG_CACHE_ENTRY};
use crate::pool::rbtree::NodeHandle;
use crate::pool::{BlockId, Pool};
use crate::error::BpResult;

/// This node currently holds custody of the bundle.
pub const ENTRY_FLAG_LOCAL_CUSTODY: u32 = 0x01;
/// A reference block for this bundle sits in (or is bound for) a local queue.
pub const ENTRY_FLAG_LOCALLY_QUEUED: u32 = 0x02;
/// The entry sleeps until its scheduled action time.
pub const ENTRY_FLAG_ACTION_TIME_WAIT: u32 = 0x04;
/// Something touched this entry since the delete state last looked.
pub const ENTRY_FLAG_ACTIVITY: u32 = 0x08;
/// Handed to egress, completion not yet recorded.
pub const ENTRY_FLAG_PENDING_FORWARD: u32 = 0x10;

/// The entry is waiting on a timer or on a queued copy; retried lazily.
pub const ENTRY_FLAGS_WAIT_STATE: u32 =
    ENTRY_FLAG_ACTION_TIME_WAIT | ENTRY_FLAG_LOCALLY_QUEUED | ENTRY_FLAG_PENDING_FORWARD;

/// Sentinel action time meaning "not scheduled".
pub const TIME_INFINITE: u64 = u64::MAX;

/// Per-bundle FSM state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryState {
    /// Terminal sink; the entry is recycled on the next driver visit.
    #[default]
    Undefined,
    Idle,
    Queue,
    Delete,
    GenerateDacs,
}

pub const ENTRY_STATE_COUNT: usize = 5;

impl EntryState {
    pub fn index(self) -> usize {
        match self {
            EntryState::Undefined => 0,
            EntryState::Idle => 1,
            EntryState::Queue => 2,
            EntryState::Delete => 3,
            EntryState::GenerateDacs => 4,
        }
    }
}

/// Role-specific entry data: a stored bundle, or an open DACS under
/// construction for a peer custodian.
#[derive(Debug, Default)]
pub enum EntryData {
    #[default]
    Normal,
    Dacs {
        /// The DACS payload canonical block, whose sequence list is appended
        /// to while the DACS is open.
        payload_blk: BlockId,
        /// The custodian this DACS will be sent to.
        custodian: IpnAddress,
        /// Source endpoint of the bundles being acknowledged.
        flow_source: EndpointId,
    },
}

#[derive(Debug)]
pub struct CacheEntry {
    pub parent_flow: BlockId,
    pub state: EntryState,
    pub flags: u32,
    /// Copy of the bundle id triple so the entry survives reference drop.
    pub source_copy: IpnAddress,
    pub sequence_copy: u64,
    /// DTN time at which the bundle's useful life ends.
    pub expire_time: u64,
    /// Scheduled action time; `TIME_INFINITE` when unscheduled.
    pub action_time: u64,
    /// Counted reference to the primary block; `None` while offloaded.
    pub refptr: Option<BlockId>,
    /// Offload storage id; 0 when not offloaded.
    pub offload_sid: u64,
    pub hash_link: NodeHandle,
    pub time_link: NodeHandle,
    pub dest_link: NodeHandle,
    pub dacs_link: NodeHandle,
    pub data: EntryData,
}

impl CacheEntry {
    pub fn new(parent_flow: BlockId) -> Self {
        Self {
            parent_flow,
            state: EntryState::Undefined,
            flags: 0,
            source_copy: IpnAddress::default(),
            sequence_copy: 0,
            expire_time: 0,
            action_time: TIME_INFINITE,
            refptr: None,
            offload_sid: 0,
            hash_link: NodeHandle::NIL,
            time_link: NodeHandle::NIL,
            dest_link: NodeHandle::NIL,
            dacs_link: NodeHandle::NIL,
            data: EntryData::Normal,
        }
    }
}

impl Pool {
    pub fn alloc_cache_entry(&mut self, entry: CacheEntry) -> BpResult<BlockId> {
        self.alloc_internal(SIG_CACHE_ENTRY, BlockContent::Entry(Box::new(entry)))
    }

    pub fn cache_entry(&self, id: BlockId) -> Option<&CacheEntry> {
        match self.content(id) {
            BlockContent::Entry(e) => Some(e),
            _ => None,
        }
    }

    pub fn cache_entry_mut(&mut self, id: BlockId) -> Option<&mut CacheEntry> {
        match self.content_mut(id) {
            BlockContent::Entry(e) => Some(e),
            _ => None,
        }
    }
}

/// Called by the collector when a reference block naming this entry is
/// destroyed: the queued copy is gone, so the queue state can advance.
pub(crate) fn notify_ref_recycled(pool: &mut Pool, entry_blk: BlockId) {
    if let Some(e) = pool.cache_entry_mut(entry_blk) {
        e.flags &= !ENTRY_FLAG_LOCALLY_QUEUED;
        e.flags |= ENTRY_FLAG_ACTIVITY;
    }
}

/// Entry destructor: removes the entry from every index it participates in
/// and releases its bundle reference.
pub(crate) fn destruct_entry(pool: &mut Pool, entry_blk: BlockId, mut entry: CacheEntry) {
    if let Some(mut state) = pool.take_cache_state(entry.parent_flow) {
        if state.bundle_index.is_member(entry.hash_link)
            && *state.bundle_index.value(entry.hash_link) == entry_blk
        {
            state.bundle_index.extract(entry.hash_link);
        }
        if state.time_index.is_member(entry.time_link)
            && *state.time_index.value(entry.time_link) == entry_blk
        {
            state.time_index.extract(entry.time_link);
        }
        if state.dest_eid_index.is_member(entry.dest_link)
            && *state.dest_eid_index.value(entry.dest_link) == entry_blk
        {
            state.dest_eid_index.extract(entry.dest_link);
        }
        if state.dacs_index.is_member(entry.dacs_link)
            && *state.dacs_index.value(entry.dacs_link) == entry_blk
        {
            state.dacs_index.extract(entry.dacs_link);
        }
        pool.put_cache_state(entry.parent_flow, state);
    }
    if let Some(target) = entry.refptr.take() {
        pool.ref_release(target);
    }
}
