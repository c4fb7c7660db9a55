//! Jobs: a callback plus a list link. Work that should run on the next main
//! loop tick is marked active; the runner walks the active list once,
//! detaching each job before its handler runs so the handler may re-mark it.

use crate::error::BpResult;
use crate::pool::block::{BlockContent, BlockId, SIG_JOB};
use crate::pool::Pool;

/// Job callback. Receives the pool and the job's owner block.
pub type JobHandler = fn(&mut Pool, BlockId);

#[derive(Debug)]
pub struct JobContent {
    pub handler: Option<JobHandler>,
    pub owner: BlockId,
}

impl Pool {
    pub fn alloc_job(&mut self, handler: Option<JobHandler>, owner: BlockId) -> BpResult<BlockId> {
        self.alloc_internal(SIG_JOB, BlockContent::Job(JobContent { handler, owner }))
    }

    pub fn job_set_handler(&mut self, job: BlockId, handler: Option<JobHandler>) {
        if let BlockContent::Job(j) = &mut self.slot_mut(job).content {
            j.handler = handler;
        }
    }

    /// Appends the job to the active list if it has a handler and is not
    /// already queued.
    pub fn job_mark_active(&mut self, job: BlockId) {
        let has_handler = matches!(
            &self.slot(job).content,
            BlockContent::Job(j) if j.handler.is_some()
        );
        if has_handler && !self.is_linked(job) {
            let active = self.active_jobs;
            self.insert_before(active, job);
        }
    }

    /// Runs every job currently on the active list. Each job is detached
    /// before its handler runs; jobs marked during the walk (including
    /// re-marks by their own handler) wait for the next call.
    pub fn run_all_jobs(&mut self) -> u32 {
        let active = self.active_jobs;
        let mut walk = {
            let mut n = 0u32;
            let mut cur = self.next_block(active);
            while cur != active {
                n += 1;
                cur = self.next_block(cur);
            }
            n
        };
        let mut ran = 0;
        while walk > 0 {
            walk -= 1;
            let job = self.next_block(active);
            if job == active {
                break;
            }
            self.extract_node(job);
            let dispatch = match &self.slot(job).content {
                BlockContent::Job(j) => j.handler.map(|h| (h, j.owner)),
                _ => None,
            };
            if let Some((handler, owner)) = dispatch {
                handler(self, owner);
                ran += 1;
            }
        }
        ran
    }
}
