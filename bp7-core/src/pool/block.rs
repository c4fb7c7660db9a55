//! Block identity, the tagged header every pool slot carries, and the content
//! variants runtime objects are carved into.

use crate::cache::entry::CacheEntry;
use crate::codec::types::{CanonicalBlock, PrimaryBlock};
use crate::pool::flow::FlowBlock;
use crate::pool::job::JobContent;
use std::fmt;

/// Index of a block slot within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(pub u32);

impl BlockId {
    pub const INVALID: BlockId = BlockId(u32::MAX);

    pub fn is_valid(self) -> bool {
        self != BlockId::INVALID
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Default for BlockId {
    fn default() -> Self {
        BlockId::INVALID
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "blk#{}", self.0)
        } else {
            write!(f, "blk#-")
        }
    }
}

/// Opaque handle to an attached interface (a flow block). Zero is invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct IntfId(pub u32);

impl IntfId {
    pub const INVALID: IntfId = IntfId(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    pub fn from_block(blk: BlockId) -> Self {
        IntfId(blk.0.wrapping_add(1))
    }

    pub fn block(self) -> BlockId {
        if self.is_valid() {
            BlockId(self.0 - 1)
        } else {
            BlockId::INVALID
        }
    }
}

impl fmt::Display for IntfId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "intf#{}", self.0)
    }
}

/// The block tag. Determines which [`BlockContent`] variant the slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockKind {
    #[default]
    Undefined,
    Admin,
    ListHead,
    Primary,
    Canonical,
    Flow,
    Ref,
    Job,
    Entry,
    Generic,
}

/// Content-type signatures; a sanity check stored next to the tag and the key
/// into the blocktype registry.
pub const SIG_LISTHEAD: u32 = 0xA40F_1B63;
pub const SIG_PRIMARY: u32 = 0x1D96_C2A4;
pub const SIG_CANONICAL: u32 = 0x5E2B_8F07;
pub const SIG_FLOW: u32 = 0x30A1_77D5;
pub const SIG_JOB: u32 = 0x88BC_4E19;
pub const SIG_BLOCKREF: u32 = 0x77E9_61B1;
pub const SIG_CACHE_STATE: u32 = 0x6833_597A;
pub const SIG_CACHE_ENTRY: u32 = 0xF223_FF9F;

/// Fixed header present on every slot: tag, signature, reference count, and
/// the intrusive list links (a detached block is self-linked).
#[derive(Debug)]
pub struct BlockHeader {
    pub kind: BlockKind,
    pub signature: u32,
    pub refcount: u16,
    pub next: BlockId,
    pub prev: BlockId,
}

impl BlockHeader {
    pub fn detached(at: BlockId) -> Self {
        Self {
            kind: BlockKind::Undefined,
            signature: 0,
            refcount: 0,
            next: at,
            prev: at,
        }
    }
}

/// Counters carried by a list-head slot when it backs a FIFO sub-queue.
/// Depth is the difference; both wrap.
#[derive(Debug, Clone, Copy, Default)]
pub struct SubqCounters {
    pub push_count: u32,
    pub pull_count: u32,
}

impl SubqCounters {
    pub fn depth(&self) -> u32 {
        self.push_count.wrapping_sub(self.pull_count)
    }
}

/// A reference block: one counted reference to a content block, able to sit
/// on a queue in the target's place. `notify` names a cache entry to poke
/// when this reference is destroyed.
#[derive(Debug, Clone, Copy)]
pub struct RefContent {
    pub target: BlockId,
    pub notify: BlockId,
}

/// User-defined content for generic data blocks allocated by signature.
#[derive(Debug, Default)]
pub struct GenericData {
    pub signature: u32,
    pub bytes: Vec<u8>,
}

/// Constructor/destructor pair and size registered for a content signature.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlocktypeApi {
    pub user_content_size: usize,
    pub construct: Option<fn(&mut GenericData)>,
    pub destruct: Option<fn(&mut GenericData)>,
}

/// Tagged union of everything a pool slot can hold.
#[derive(Debug, Default)]
pub enum BlockContent {
    #[default]
    Undefined,
    /// Slot 0 only; the pool's own fields play the admin role.
    Admin,
    ListHead(SubqCounters),
    Primary(Box<PrimaryBlock>),
    Canonical(Box<CanonicalBlock>),
    Flow(Box<FlowBlock>),
    Ref(RefContent),
    Job(JobContent),
    Entry(Box<CacheEntry>),
    Generic(GenericData),
}

impl BlockContent {
    pub fn kind(&self) -> BlockKind {
        match self {
            BlockContent::Undefined => BlockKind::Undefined,
            BlockContent::Admin => BlockKind::Admin,
            BlockContent::ListHead(_) => BlockKind::ListHead,
            BlockContent::Primary(_) => BlockKind::Primary,
            BlockContent::Canonical(_) => BlockKind::Canonical,
            BlockContent::Flow(_) => BlockKind::Flow,
            BlockContent::Ref(_) => BlockKind::Ref,
            BlockContent::Job(_) => BlockKind::Job,
            BlockContent::Entry(_) => BlockKind::Entry,
            BlockContent::Generic(_) => BlockKind::Generic,
        }
    }
}

/// One pool slot: fixed header plus the tagged content.
#[derive(Debug)]
pub struct Slot {
    pub header: BlockHeader,
    pub content: BlockContent,
}

impl Slot {
    pub fn vacant(at: BlockId) -> Self {
        Self {
            header: BlockHeader::detached(at),
            content: BlockContent::Undefined,
        }
    }
}
