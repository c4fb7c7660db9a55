//! Offload module contract: an attached cache may delegate bulk bundle bytes
//! to an external store, keeping only the entry and a storage id in memory.

use crate::error::{BpError, BpResult};
use crate::pool::{BlockId, Pool};

/// Role a registered module plays for the cache it is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleType {
    Offload,
    Other,
}

/// Bulk-store delegate. `offload` consumes the in-memory primary block chain
/// and yields a storage id; `restore` rebuilds the chain in the pool.
pub trait OffloadStore: Send {
    fn module_type(&self) -> ModuleType {
        ModuleType::Offload
    }

    fn start(&mut self) -> BpResult<()> {
        Ok(())
    }

    fn stop(&mut self) -> BpResult<()> {
        Ok(())
    }

    fn configure(&mut self, _key: u32, _value: u64) -> BpResult<()> {
        Err(BpError::NullCallback)
    }

    fn query(&self, _key: u32) -> BpResult<u64> {
        Err(BpError::NullCallback)
    }

    /// Persists the bundle rooted at `pri` and writes its storage id to
    /// `sid`. The caller drops its in-memory reference afterward.
    fn offload(&mut self, pool: &mut Pool, sid: &mut u64, pri: BlockId) -> BpResult<()>;

    /// Rebuilds the bundle for `sid` in the pool and returns the primary
    /// block, with no references taken.
    fn restore(&mut self, pool: &mut Pool, sid: u64) -> BpResult<BlockId>;

    /// Discards the stored copy for `sid`.
    fn release(&mut self, pool: &mut Pool, sid: u64) -> BpResult<()>;
}
