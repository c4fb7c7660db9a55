//! Flows (ducts): a bidirectional pair of depth-limited FIFO sub-queue
//! work-items plus pending/current state flags and a state-change job.
//! A flow is up when both the admin-up and oper-up bits are set.

use crate::cache::CacheState;
use crate::error::BpResult;
use crate::pool::block::{BlockContent, BlockId, SubqCounters, SIG_FLOW, SIG_LISTHEAD};
use crate::pool::job::JobHandler;
use crate::pool::Pool;
use tracing::debug;

pub const FLOW_FLAG_ADMIN_UP: u32 = 0x01;
pub const FLOW_FLAG_OPER_UP: u32 = 0x02;
pub const FLOW_FLAG_STORAGE: u32 = 0x04;
pub const FLOW_FLAG_ENDPOINT: u32 = 0x08;
pub const FLOW_FLAG_POLL: u32 = 0x10;

const FLOW_FLAGS_UP: u32 = FLOW_FLAG_ADMIN_UP | FLOW_FLAG_OPER_UP;

/// Queue direction, named from the router's point of view: `Ingress` carries
/// blocks from the interface into the router, `Egress` from the router out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDir {
    Ingress,
    Egress,
}

/// One direction of a flow: a counted sub-queue, its depth limit, and a job
/// that is marked active whenever the sub-queue gains content.
#[derive(Debug)]
pub struct SubqWorkitem {
    pub subq: BlockId,
    pub depth_limit: u32,
    pub job: BlockId,
}

/// What owns a flow and receives its poll events.
#[derive(Debug, Default)]
pub enum FlowOwner {
    #[default]
    None,
    Cache(Box<CacheState>),
}

#[derive(Debug)]
pub struct FlowBlock {
    pub pending_state_flags: u32,
    pub current_state_flags: u32,
    pub statechange_job: BlockId,
    pub ingress: SubqWorkitem,
    pub egress: SubqWorkitem,
    pub owner: FlowOwner,
}

impl FlowBlock {
    pub fn is_up(&self) -> bool {
        self.current_state_flags & FLOW_FLAGS_UP == FLOW_FLAGS_UP
    }

    pub fn workitem(&self, dir: FlowDir) -> &SubqWorkitem {
        match dir {
            FlowDir::Ingress => &self.ingress,
            FlowDir::Egress => &self.egress,
        }
    }
}

impl Pool {
    /// Allocates a flow and its subsidiary sub-queue and job blocks.
    /// The flow starts with all state flags clear (down).
    pub fn alloc_flow(&mut self, ingress_limit: u32, egress_limit: u32) -> BpResult<BlockId> {
        let ingress_subq = self.alloc_listhead()?;
        let egress_subq = match self.alloc_listhead() {
            Ok(b) => b,
            Err(err) => {
                self.recycle_block(ingress_subq);
                return Err(err);
            }
        };
        let flow = match self.alloc_internal(
            SIG_FLOW,
            BlockContent::Flow(Box::new(FlowBlock {
                pending_state_flags: 0,
                current_state_flags: 0,
                statechange_job: BlockId::INVALID,
                ingress: SubqWorkitem {
                    subq: ingress_subq,
                    depth_limit: ingress_limit,
                    job: BlockId::INVALID,
                },
                egress: SubqWorkitem {
                    subq: egress_subq,
                    depth_limit: egress_limit,
                    job: BlockId::INVALID,
                },
                owner: FlowOwner::None,
            })),
        ) {
            Ok(b) => b,
            Err(err) => {
                self.recycle_block(ingress_subq);
                self.recycle_block(egress_subq);
                return Err(err);
            }
        };
        // The flow destructor owns the subsidiary blocks from here on, so a
        // failed job allocation is cleaned up by recycling the flow itself.
        let statechange = self.alloc_job(Some(flow_statechange_handler), flow);
        let ingress_job = self.alloc_job(None, flow);
        let egress_job = self.alloc_job(None, flow);
        match (statechange, ingress_job, egress_job) {
            (Ok(statechange), Ok(ingress_job), Ok(egress_job)) => {
                if let BlockContent::Flow(f) = &mut self.slot_mut(flow).content {
                    f.statechange_job = statechange;
                    f.ingress.job = ingress_job;
                    f.egress.job = egress_job;
                }
                Ok(flow)
            }
            (a, b, c) => {
                for job in [a, b, c].into_iter().flatten() {
                    self.recycle_block(job);
                }
                self.recycle_block(flow);
                Err(crate::error::BpError::OutOfMemory)
            }
        }
    }

    pub(crate) fn alloc_listhead(&mut self) -> BpResult<BlockId> {
        self.alloc_internal(
            SIG_LISTHEAD,
            BlockContent::ListHead(SubqCounters::default()),
        )
    }

    pub fn flow(&self, flow: BlockId) -> Option<&FlowBlock> {
        match &self.slot(flow).content {
            BlockContent::Flow(f) => Some(f),
            _ => None,
        }
    }

    pub fn flow_mut(&mut self, flow: BlockId) -> Option<&mut FlowBlock> {
        match &mut self.slot_mut(flow).content {
            BlockContent::Flow(f) => Some(f),
            _ => None,
        }
    }

    pub fn flow_is_up(&self, flow: BlockId) -> bool {
        self.flow(flow).is_some_and(|f| f.is_up())
    }

    /// Updates the pending state flags and marks the state-change job active;
    /// the change takes effect when the job runner next executes.
    pub fn flow_modify_flags(&mut self, flow: BlockId, set: u32, clear: u32) {
        let job = match self.flow_mut(flow) {
            Some(f) => {
                f.pending_state_flags = (f.pending_state_flags | set) & !clear;
                f.statechange_job
            }
            None => return,
        };
        self.job_mark_active(job);
    }

    /// Installs the handler run when the given direction's sub-queue gains
    /// content (e.g. the router's forwarding pass).
    pub fn flow_set_work_handler(
        &mut self,
        flow: BlockId,
        dir: FlowDir,
        handler: Option<JobHandler>,
    ) {
        if let Some(job) = self.flow(flow).map(|f| f.workitem(dir).job) {
            self.job_set_handler(job, handler);
        }
    }

    /// Non-blocking push honoring the depth limit; marks the direction's work
    /// job active on success. Fails when the flow is down.
    pub fn flow_try_push(&mut self, flow: BlockId, dir: FlowDir, blk: BlockId) -> bool {
        let (subq, limit, job, up) = match self.flow(flow) {
            Some(f) => {
                let w = f.workitem(dir);
                (w.subq, w.depth_limit, w.job, f.is_up())
            }
            None => return false,
        };
        if !up || self.subq_depth(subq) >= limit {
            return false;
        }
        self.subq_push(subq, blk);
        self.job_mark_active(job);
        true
    }

    /// Non-blocking pull from the given direction.
    pub fn flow_try_pull(&mut self, flow: BlockId, dir: FlowDir) -> Option<BlockId> {
        let subq = self.flow(flow).map(|f| f.workitem(dir).subq)?;
        self.subq_pull(subq)
    }

    pub fn flow_depth(&self, flow: BlockId, dir: FlowDir) -> u32 {
        self.flow(flow)
            .map(|f| self.subq_depth(f.workitem(dir).subq))
            .unwrap_or(0)
    }

    /// Drops and recycles everything queued in both directions.
    pub fn flow_drop_queues(&mut self, flow: BlockId) -> u32 {
        let subqs = match self.flow(flow) {
            Some(f) => [f.ingress.subq, f.egress.subq],
            None => return 0,
        };
        let mut dropped = 0;
        for subq in subqs {
            while let Some(blk) = self.subq_pull(subq) {
                self.recycle_block(blk);
                dropped += 1;
            }
        }
        dropped
    }

    pub(crate) fn take_cache_state(&mut self, flow: BlockId) -> Option<Box<CacheState>> {
        let f = self.flow_mut(flow)?;
        match std::mem::take(&mut f.owner) {
            FlowOwner::Cache(state) => Some(state),
            other => {
                f.owner = other;
                None
            }
        }
    }

    pub(crate) fn put_cache_state(&mut self, flow: BlockId, state: Box<CacheState>) {
        if let Some(f) = self.flow_mut(flow) {
            f.owner = FlowOwner::Cache(state);
        }
    }
}

/// Applies a pending state change: copies pending flags to current, drops
/// both queues on a down transition, and forwards a one-shot poll request to
/// the flow's owner.
fn flow_statechange_handler(pool: &mut Pool, flow: BlockId) {
    let (was_up, now_up, poll) = match pool.flow_mut(flow) {
        Some(f) => {
            let was_up = f.is_up();
            let poll = f.pending_state_flags & FLOW_FLAG_POLL != 0;
            f.pending_state_flags &= !FLOW_FLAG_POLL;
            f.current_state_flags = f.pending_state_flags;
            (was_up, f.is_up(), poll)
        }
        None => return,
    };

    if was_up && !now_up {
        let dropped = pool.flow_drop_queues(flow);
        debug!(%flow, dropped, "flow down, queues dropped");
    }

    if poll {
        crate::cache::notify_poll(pool, flow);
    }
}
