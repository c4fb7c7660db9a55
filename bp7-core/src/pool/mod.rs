//! The memory pool: a fixed number of tagged block slots from which every
//! runtime object is carved. Provides the free/recycle sub-queues, the
//! garbage collector, reference counting, the blocktype registry, and the
//! process-wide lock with condition signalling for blocking flow operations.

pub mod block;
pub mod flow;
pub mod job;
pub mod list;
pub mod rbtree;

pub use block::{BlockContent, BlockId, BlockKind, BlocktypeApi, GenericData, IntfId};
pub use flow::{FlowDir, FlowOwner};
pub use rbtree::{NodeHandle, RbTree};

use crate::error::{BpError, BpResult};
use block::{
    BlockHeader, RefContent, Slot, SIG_BLOCKREF, SIG_CACHE_ENTRY, SIG_CACHE_STATE, SIG_CANONICAL,
    SIG_FLOW, SIG_JOB, SIG_LISTHEAD, SIG_PRIMARY,
};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace, warn};

/// Thresholds guarding the free list: bundle-block allocation stops first to
/// keep room for the internal blocks needed to finish work in progress.
#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub bblock_alloc_threshold: u32,
    pub internal_alloc_threshold: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            bblock_alloc_threshold: 8,
            internal_alloc_threshold: 2,
        }
    }
}

/// Reserved slot layout: the admin block, then the three built-in list heads.
const ADMIN_SLOT: u32 = 0;
const FREE_SUBQ_SLOT: u32 = 1;
const RECYCLE_SUBQ_SLOT: u32 = 2;
const ACTIVE_JOBS_SLOT: u32 = 3;
const RESERVED_SLOTS: u32 = 4;

pub struct Pool {
    slots: Vec<Slot>,
    pub(crate) free_subq: BlockId,
    pub(crate) recycle_subq: BlockId,
    pub(crate) active_jobs: BlockId,
    registry: RbTree<u32, BlocktypeApi>,
    bblock_alloc_threshold: u32,
    internal_alloc_threshold: u32,
    max_alloc_watermark: u32,
}

impl Pool {
    /// Builds a pool from a buffer size in bytes, carving it into
    /// `buffer_size / block_size()` slots.
    pub fn with_buffer_size(buffer_size: usize, cfg: PoolConfig) -> BpResult<Pool> {
        let num_blocks = (buffer_size / Self::block_size()) as u32;
        Self::with_block_count(num_blocks, cfg)
    }

    pub fn with_block_count(num_blocks: u32, cfg: PoolConfig) -> BpResult<Pool> {
        if num_blocks <= RESERVED_SLOTS + cfg.bblock_alloc_threshold {
            return Err(BpError::OutOfMemory);
        }
        let mut pool = Pool {
            slots: (0..num_blocks).map(|i| Slot::vacant(BlockId(i))).collect(),
            free_subq: BlockId(FREE_SUBQ_SLOT),
            recycle_subq: BlockId(RECYCLE_SUBQ_SLOT),
            active_jobs: BlockId(ACTIVE_JOBS_SLOT),
            registry: RbTree::new(),
            bblock_alloc_threshold: cfg.bblock_alloc_threshold,
            internal_alloc_threshold: cfg.internal_alloc_threshold,
            max_alloc_watermark: 0,
        };

        pool.slots[ADMIN_SLOT as usize].header.kind = BlockKind::Admin;
        pool.slots[ADMIN_SLOT as usize].content = BlockContent::Admin;
        for head in [FREE_SUBQ_SLOT, RECYCLE_SUBQ_SLOT, ACTIVE_JOBS_SLOT] {
            pool.slots[head as usize].header.kind = BlockKind::ListHead;
            pool.slots[head as usize].header.signature = SIG_LISTHEAD;
            pool.slots[head as usize].content =
                BlockContent::ListHead(block::SubqCounters::default());
        }
        for i in RESERVED_SLOTS..num_blocks {
            let free = pool.free_subq;
            pool.subq_push(free, BlockId(i));
        }

        for sig in [
            SIG_LISTHEAD,
            SIG_PRIMARY,
            SIG_CANONICAL,
            SIG_FLOW,
            SIG_JOB,
            SIG_BLOCKREF,
            SIG_CACHE_STATE,
            SIG_CACHE_ENTRY,
        ] {
            pool.registry
                .insert_unique(sig, BlocktypeApi::default())
                .map_err(|_| BpError::Fatal("built-in signature registered twice"))?;
        }
        Ok(pool)
    }

    /// Size of one slot; what the buffer-size constructor divides by.
    pub fn block_size() -> usize {
        std::mem::size_of::<Slot>()
    }

    pub fn num_blocks(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn free_count(&self) -> u32 {
        self.subq_depth(self.free_subq)
    }

    pub fn recycle_count(&self) -> u32 {
        self.subq_depth(self.recycle_subq)
    }

    pub fn max_alloc_watermark(&self) -> u32 {
        self.max_alloc_watermark
    }

    pub(crate) fn slot(&self, id: BlockId) -> &Slot {
        &self.slots[id.index()]
    }

    pub(crate) fn slot_mut(&mut self, id: BlockId) -> &mut Slot {
        &mut self.slots[id.index()]
    }

    pub fn kind_of(&self, id: BlockId) -> BlockKind {
        self.slot(id).header.kind
    }

    pub fn refcount_of(&self, id: BlockId) -> u16 {
        self.slot(id).header.refcount
    }

    pub fn content(&self, id: BlockId) -> &BlockContent {
        &self.slot(id).content
    }

    pub fn content_mut(&mut self, id: BlockId) -> &mut BlockContent {
        &mut self.slot_mut(id).content
    }

    pub fn primary(&self, id: BlockId) -> Option<&crate::codec::types::PrimaryBlock> {
        match self.content(id) {
            BlockContent::Primary(p) => Some(p),
            _ => None,
        }
    }

    pub fn primary_mut(&mut self, id: BlockId) -> Option<&mut crate::codec::types::PrimaryBlock> {
        match self.content_mut(id) {
            BlockContent::Primary(p) => Some(p),
            _ => None,
        }
    }

    pub fn canonical(&self, id: BlockId) -> Option<&crate::codec::types::CanonicalBlock> {
        match self.content(id) {
            BlockContent::Canonical(c) => Some(c),
            _ => None,
        }
    }

    pub fn canonical_mut(
        &mut self,
        id: BlockId,
    ) -> Option<&mut crate::codec::types::CanonicalBlock> {
        match self.content_mut(id) {
            BlockContent::Canonical(c) => Some(c),
            _ => None,
        }
    }

    // -- blocktype registry ------------------------------------------------

    /// Registers a user content signature. Allocation by an unregistered
    /// signature fails with `UnknownType`.
    pub fn register_blocktype(&mut self, signature: u32, api: BlocktypeApi) -> BpResult<()> {
        self.registry.insert_unique(signature, api).map(|_| ())
    }

    fn registry_lookup(&self, signature: u32) -> BpResult<BlocktypeApi> {
        self.registry
            .find(signature)
            .map(|h| *self.registry.value(h))
            .ok_or(BpError::UnknownType(signature))
    }

    // -- allocation --------------------------------------------------------

    fn alloc_block(
        &mut self,
        signature: u32,
        threshold: u32,
        content: BlockContent,
    ) -> BpResult<BlockId> {
        self.registry_lookup(signature)?;
        if self.free_count() <= threshold {
            return Err(BpError::OutOfMemory);
        }
        let free = self.free_subq;
        let id = self.subq_pull(free).ok_or(BpError::OutOfMemory)?;
        let slot = self.slot_mut(id);
        slot.header.kind = content.kind();
        slot.header.signature = signature;
        slot.header.refcount = 0;
        slot.content = content;
        let in_use = self.num_blocks() - RESERVED_SLOTS - self.free_count();
        self.max_alloc_watermark = self.max_alloc_watermark.max(in_use);
        Ok(id)
    }

    /// Allocation path for bundle blocks (primary/canonical); refused first
    /// under memory pressure to keep overhead room.
    fn alloc_bundle(&mut self, signature: u32, content: BlockContent) -> BpResult<BlockId> {
        let threshold = self.bblock_alloc_threshold;
        self.alloc_block(signature, threshold, content)
    }

    /// Allocation path for everything else; only the admin block survives
    /// past this threshold.
    pub(crate) fn alloc_internal(
        &mut self,
        signature: u32,
        content: BlockContent,
    ) -> BpResult<BlockId> {
        let threshold = self.internal_alloc_threshold;
        self.alloc_block(signature, threshold, content)
    }

    pub fn alloc_primary(
        &mut self,
        pri: crate::codec::types::PrimaryBlock,
    ) -> BpResult<BlockId> {
        self.alloc_bundle(SIG_PRIMARY, BlockContent::Primary(Box::new(pri)))
    }

    pub fn alloc_canonical(
        &mut self,
        cb: crate::codec::types::CanonicalBlock,
    ) -> BpResult<BlockId> {
        self.alloc_bundle(SIG_CANONICAL, BlockContent::Canonical(Box::new(cb)))
    }

    pub fn generic_data_alloc(&mut self, signature: u32, bytes: Vec<u8>) -> BpResult<BlockId> {
        let api = self.registry_lookup(signature)?;
        let mut data = GenericData { signature, bytes };
        if let Some(construct) = api.construct {
            construct(&mut data);
        }
        let threshold = self.internal_alloc_threshold;
        self.alloc_block(signature, threshold, BlockContent::Generic(data))
    }

    // -- references --------------------------------------------------------

    /// Takes one counted reference on `target`.
    pub fn ref_retain(&mut self, target: BlockId) {
        self.slot_mut(target).header.refcount += 1;
    }

    /// Releases one counted reference; recycles the target when the count
    /// reaches zero and the block is not owned by any list.
    pub fn ref_release(&mut self, target: BlockId) {
        let remaining = {
            let header = &mut self.slot_mut(target).header;
            header.refcount = header.refcount.saturating_sub(1);
            header.refcount
        };
        if remaining == 0 && !self.is_linked(target) {
            self.recycle_block(target);
        }
    }

    /// Allocates a reference block standing in for `target` on a queue.
    /// Bumps the target's refcount; recycling the reference releases it.
    pub fn make_ref_block(&mut self, target: BlockId, notify: BlockId) -> BpResult<BlockId> {
        let id = self.alloc_internal(SIG_BLOCKREF, BlockContent::Ref(RefContent { target, notify }))?;
        self.ref_retain(target);
        Ok(id)
    }

    /// The content block a reference block stands for.
    pub fn ref_target(&self, ref_blk: BlockId) -> Option<BlockId> {
        match self.content(ref_blk) {
            BlockContent::Ref(r) => Some(r.target),
            _ => None,
        }
    }

    // -- recycle and collection --------------------------------------------

    /// Detaches the block from any list and queues it for collection.
    pub fn recycle_block(&mut self, id: BlockId) {
        if id.index() < RESERVED_SLOTS as usize {
            warn!(%id, "refusing to recycle a reserved block");
            return;
        }
        if matches!(self.slot(id).content, BlockContent::Undefined)
            && self.is_linked(id)
            && self.kind_of(id) == BlockKind::Undefined
        {
            // already awaiting collection or free
            return;
        }
        if self.is_linked(id) {
            self.extract_node(id);
        }
        let recycle = self.recycle_subq;
        self.subq_push(recycle, id);
    }

    /// Drains up to `limit` blocks from the recycle queue, running each
    /// variant's destructor and returning the slot to the free queue.
    /// Destructors may queue further blocks; those are collected within the
    /// same call while the limit allows.
    pub fn maintain_recycle(&mut self, limit: u32) -> u32 {
        let mut collected = 0;
        while collected < limit {
            let recycle = self.recycle_subq;
            let Some(id) = self.subq_pull(recycle) else {
                break;
            };
            let content = std::mem::take(&mut self.slot_mut(id).content);
            self.destruct(id, content);
            let slot = self.slot_mut(id);
            slot.header = BlockHeader::detached(id);
            let free = self.free_subq;
            self.subq_push(free, id);
            collected += 1;
        }
        if collected > 0 {
            trace!(collected, free = self.free_count(), "collector pass");
        }
        collected
    }

    fn destruct(&mut self, id: BlockId, content: BlockContent) {
        match content {
            BlockContent::Ref(r) => {
                if r.notify.is_valid() {
                    crate::cache::entry::notify_ref_recycled(self, r.notify);
                }
                self.ref_release(r.target);
            }
            BlockContent::Primary(pri) => {
                for cid in pri.canonicals {
                    self.recycle_block(cid);
                }
            }
            BlockContent::Flow(f) => {
                for w in [&f.ingress, &f.egress] {
                    while let Some(blk) = self.subq_pull(w.subq) {
                        self.recycle_block(blk);
                    }
                    self.recycle_block(w.subq);
                    if w.job.is_valid() {
                        self.recycle_block(w.job);
                    }
                }
                if f.statechange_job.is_valid() {
                    self.recycle_block(f.statechange_job);
                }
                if let FlowOwner::Cache(state) = f.owner {
                    crate::cache::destruct_state(self, *state);
                }
            }
            BlockContent::Entry(entry) => {
                crate::cache::entry::destruct_entry(self, id, *entry);
            }
            BlockContent::ListHead(_) => {
                // recycle any stragglers still linked under this head
                while self.next_block(id) != id {
                    let member = self.next_block(id);
                    self.recycle_block(member);
                }
            }
            BlockContent::Generic(mut data) => {
                if let Ok(api) = self.registry_lookup(data.signature) {
                    if let Some(destruct) = api.destruct {
                        destruct(&mut data);
                    }
                }
            }
            BlockContent::Canonical(_)
            | BlockContent::Job(_)
            | BlockContent::Undefined
            | BlockContent::Admin => {}
        }
        debug!(%id, "block collected");
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("num_blocks", &self.num_blocks())
            .field("free", &self.free_count())
            .field("recycle", &self.recycle_count())
            .field("watermark", &self.max_alloc_watermark)
            .finish()
    }
}

/// The pool behind the process-wide mutex, with the condition variable that
/// flow push/pull deadline waits block on. Every successful push or pull
/// broadcasts so producers blocked on full and consumers blocked on empty
/// both wake.
pub struct SharedPool {
    inner: Mutex<Pool>,
    cond: Condvar,
}

impl SharedPool {
    pub fn new(pool: Pool) -> Arc<SharedPool> {
        Arc::new(SharedPool {
            inner: Mutex::new(pool),
            cond: Condvar::new(),
        })
    }

    pub fn lock(&self) -> MutexGuard<'_, Pool> {
        self.inner.lock()
    }

    /// Runs `f` under the pool lock and wakes any flow waiters afterward.
    pub fn with<R>(&self, f: impl FnOnce(&mut Pool) -> R) -> R {
        let mut guard = self.inner.lock();
        let out = f(&mut guard);
        drop(guard);
        self.cond.notify_all();
        out
    }

    /// Pushes onto a flow queue, waiting until `deadline` for room.
    /// `None` means non-blocking. Returns false on a down flow, a full queue
    /// at the deadline, or a vanished flow.
    pub fn flow_push(
        &self,
        flow: BlockId,
        dir: FlowDir,
        blk: BlockId,
        deadline: Option<Instant>,
    ) -> bool {
        let mut guard = self.inner.lock();
        loop {
            if guard.flow_try_push(flow, dir, blk) {
                drop(guard);
                self.cond.notify_all();
                return true;
            }
            if !guard.flow_is_up(flow) {
                return false;
            }
            let Some(deadline) = deadline else {
                return false;
            };
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                // one last attempt after the deadline race
                let pushed = guard.flow_try_push(flow, dir, blk);
                if pushed {
                    drop(guard);
                    self.cond.notify_all();
                }
                return pushed;
            }
        }
    }

    /// Pulls from a flow queue, waiting until `deadline` for content.
    pub fn flow_pull(&self, flow: BlockId, dir: FlowDir, deadline: Option<Instant>) -> Option<BlockId> {
        let mut guard = self.inner.lock();
        loop {
            if let Some(blk) = guard.flow_try_pull(flow, dir) {
                drop(guard);
                self.cond.notify_all();
                return Some(blk);
            }
            let deadline = deadline?;
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                let pulled = guard.flow_try_pull(flow, dir);
                if pulled.is_some() {
                    drop(guard);
                    self.cond.notify_all();
                }
                return pulled;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::types::PrimaryBlock;

    fn small_pool() -> Pool {
        Pool::with_block_count(64, PoolConfig::default()).unwrap()
    }

    #[test]
    fn pool_creation_links_free_blocks() {
        let pool = small_pool();
        assert_eq!(pool.num_blocks(), 64);
        assert_eq!(pool.free_count(), 60);
        assert_eq!(pool.kind_of(BlockId(0)), BlockKind::Admin);
    }

    #[test]
    fn pool_conservation_over_alloc_recycle_collect() {
        let mut pool = small_pool();
        let initial_free = pool.free_count();
        let mut held = Vec::new();
        for _ in 0..10 {
            held.push(pool.alloc_primary(PrimaryBlock::new()).unwrap());
        }
        assert_eq!(pool.free_count() + 10, initial_free);
        for id in held {
            pool.recycle_block(id);
        }
        assert_eq!(pool.free_count() + 10, initial_free);
        assert_eq!(pool.recycle_count(), 10);
        pool.maintain_recycle(u32::MAX);
        assert_eq!(pool.free_count(), initial_free);
        assert_eq!(pool.recycle_count(), 0);
    }

    #[test]
    fn bundle_threshold_blocks_primaries_before_internals() {
        let cfg = PoolConfig {
            bblock_alloc_threshold: 8,
            internal_alloc_threshold: 2,
        };
        let mut pool = Pool::with_block_count(32, cfg).unwrap();
        pool.register_blocktype(0xAB12_34CD, BlocktypeApi::default()).unwrap();
        // Drain free list down to the bundle threshold.
        while pool.free_count() > 8 {
            pool.alloc_primary(PrimaryBlock::new()).unwrap();
        }
        assert_eq!(
            pool.alloc_primary(PrimaryBlock::new()),
            Err(BpError::OutOfMemory)
        );
        // Internal allocation still succeeds down to its own threshold.
        while pool.free_count() > 2 {
            pool.generic_data_alloc(0xAB12_34CD, Vec::new()).unwrap();
        }
        assert_eq!(
            pool.generic_data_alloc(0xAB12_34CD, Vec::new()),
            Err(BpError::OutOfMemory)
        );
    }

    #[test]
    fn unregistered_signature_is_unknown_type() {
        let mut pool = small_pool();
        assert_eq!(
            pool.generic_data_alloc(0xDEAD_BEEF, Vec::new()),
            Err(BpError::UnknownType(0xDEAD_BEEF))
        );
    }

    #[test]
    fn refcount_tracks_retain_release() {
        let mut pool = small_pool();
        let pri = pool.alloc_primary(PrimaryBlock::new()).unwrap();
        pool.ref_retain(pri);
        pool.ref_retain(pri);
        assert_eq!(pool.refcount_of(pri), 2);
        pool.ref_release(pri);
        assert_eq!(pool.refcount_of(pri), 1);
        assert_eq!(pool.recycle_count(), 0);
        pool.ref_release(pri);
        // zero refs, not on any list: queued for collection
        assert_eq!(pool.recycle_count(), 1);
    }

    #[test]
    fn ref_block_release_cascades_to_target() {
        let mut pool = small_pool();
        let free0 = pool.free_count();
        let pri = pool.alloc_primary(PrimaryBlock::new()).unwrap();
        pool.ref_retain(pri); // owner reference
        let rb = pool.make_ref_block(pri, BlockId::INVALID).unwrap();
        assert_eq!(pool.refcount_of(pri), 2);
        pool.recycle_block(rb);
        pool.maintain_recycle(u32::MAX);
        assert_eq!(pool.refcount_of(pri), 1);
        pool.ref_release(pri);
        pool.maintain_recycle(u32::MAX);
        assert_eq!(pool.free_count(), free0);
    }

    #[test]
    fn generic_destructor_callback_runs() {
        use std::sync::atomic::{AtomicU32, Ordering};
        static DESTRUCTS: AtomicU32 = AtomicU32::new(0);
        fn count_destruct(_data: &mut GenericData) {
            DESTRUCTS.fetch_add(1, Ordering::SeqCst);
        }
        let mut pool = small_pool();
        pool.register_blocktype(
            0x0101_0101,
            BlocktypeApi {
                user_content_size: 16,
                construct: None,
                destruct: Some(count_destruct),
            },
        )
        .unwrap();
        let id = pool.generic_data_alloc(0x0101_0101, vec![1, 2, 3]).unwrap();
        pool.recycle_block(id);
        pool.maintain_recycle(u32::MAX);
        assert_eq!(DESTRUCTS.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn collector_respects_limit() {
        let mut pool = small_pool();
        for _ in 0..6 {
            let id = pool.alloc_primary(PrimaryBlock::new()).unwrap();
            pool.recycle_block(id);
        }
        assert_eq!(pool.maintain_recycle(4), 4);
        assert_eq!(pool.recycle_count(), 2);
        assert_eq!(pool.maintain_recycle(4), 2);
    }
}
