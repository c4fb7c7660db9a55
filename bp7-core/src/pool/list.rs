//! Intrusive doubly-linked lists over the slot headers, and the counted FIFO
//! sub-queue built on them. A list head is a real block whose links act as
//! the sentinel, so extraction never needs to know the owning list.

use crate::pool::block::{BlockContent, BlockId, SubqCounters};
use crate::pool::Pool;

impl Pool {
    /// Whether the block sits on some list (a detached block is self-linked).
    pub fn is_linked(&self, id: BlockId) -> bool {
        self.slot(id).header.next != id
    }

    pub fn next_block(&self, id: BlockId) -> BlockId {
        self.slot(id).header.next
    }

    pub fn prev_block(&self, id: BlockId) -> BlockId {
        self.slot(id).header.prev
    }

    pub fn list_is_empty(&self, head: BlockId) -> bool {
        self.next_block(head) == head
    }

    /// Links `node` immediately before `at` (before the head = at the tail).
    /// `node` must be detached.
    pub fn insert_before(&mut self, at: BlockId, node: BlockId) {
        debug_assert!(!self.is_linked(node));
        let prev = self.slot(at).header.prev;
        self.slot_mut(node).header.next = at;
        self.slot_mut(node).header.prev = prev;
        self.slot_mut(prev).header.next = node;
        self.slot_mut(at).header.prev = node;
    }

    /// Links `node` immediately after `at` (after the head = at the front).
    pub fn insert_after(&mut self, at: BlockId, node: BlockId) {
        debug_assert!(!self.is_linked(node));
        let next = self.slot(at).header.next;
        self.slot_mut(node).header.prev = at;
        self.slot_mut(node).header.next = next;
        self.slot_mut(next).header.prev = node;
        self.slot_mut(at).header.next = node;
    }

    /// Unlinks `node` from whatever list holds it, leaving it self-linked.
    pub fn extract_node(&mut self, node: BlockId) {
        let next = self.slot(node).header.next;
        let prev = self.slot(node).header.prev;
        self.slot_mut(prev).header.next = next;
        self.slot_mut(next).header.prev = prev;
        let h = &mut self.slot_mut(node).header;
        h.next = node;
        h.prev = node;
    }

    fn counters_mut(&mut self, subq: BlockId) -> &mut SubqCounters {
        match &mut self.slot_mut(subq).content {
            BlockContent::ListHead(c) => c,
            _ => panic!("subq operation on a non-list-head block"),
        }
    }

    /// Appends to the sub-queue tail and bumps the push counter.
    pub fn subq_push(&mut self, subq: BlockId, blk: BlockId) {
        self.insert_before(subq, blk);
        let c = self.counters_mut(subq);
        c.push_count = c.push_count.wrapping_add(1);
    }

    /// Removes the sub-queue head and bumps the pull counter.
    pub fn subq_pull(&mut self, subq: BlockId) -> Option<BlockId> {
        let first = self.next_block(subq);
        if first == subq {
            return None;
        }
        self.extract_node(first);
        let c = self.counters_mut(subq);
        c.pull_count = c.pull_count.wrapping_add(1);
        Some(first)
    }

    pub fn subq_depth(&self, subq: BlockId) -> u32 {
        match &self.slot(subq).content {
            BlockContent::ListHead(c) => c.depth(),
            _ => 0,
        }
    }

    /// Splices the entire contents of `src` onto the tail of `dst` in O(1),
    /// adjusting both counter pairs by the moved depth.
    pub fn subq_move_all(&mut self, dst: BlockId, src: BlockId) -> u32 {
        let moved = self.subq_depth(src);
        if moved == 0 {
            return 0;
        }
        let src_first = self.next_block(src);
        let src_last = self.prev_block(src);
        // close the source ring
        {
            let h = &mut self.slot_mut(src).header;
            h.next = src;
            h.prev = src;
        }
        let dst_last = self.prev_block(dst);
        self.slot_mut(dst_last).header.next = src_first;
        self.slot_mut(src_first).header.prev = dst_last;
        self.slot_mut(src_last).header.next = dst;
        self.slot_mut(dst).header.prev = src_last;

        let src_c = self.counters_mut(src);
        src_c.pull_count = src_c.pull_count.wrapping_add(moved);
        let dst_c = self.counters_mut(dst);
        dst_c.push_count = dst_c.push_count.wrapping_add(moved);
        moved
    }

    /// Adopts a free-standing list (rooted at `head`, not a sub-queue) onto
    /// the tail of `dst`, counting its length first.
    pub fn subq_merge_list(&mut self, dst: BlockId, head: BlockId) -> u32 {
        let mut moved = 0;
        while self.next_block(head) != head {
            let node = self.next_block(head);
            self.extract_node(node);
            self.subq_push(dst, node);
            moved += 1;
        }
        moved
    }
}
