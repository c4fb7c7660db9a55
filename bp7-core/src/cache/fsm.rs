//! The per-entry state machine: idle / queue / delete / generate-dacs, with
//! undefined as the terminal sink. One driver visits entries whose action
//! time has elapsed, evaluates the next state, runs exit/enter actions, and
//! reschedules or recycles.

use crate::cache::custody;
use crate::cache::entry::{
    EntryState, ENTRY_FLAGS_WAIT_STATE, ENTRY_FLAG_ACTION_TIME_WAIT, ENTRY_FLAG_ACTIVITY,
    ENTRY_FLAG_LOCALLY_QUEUED, ENTRY_FLAG_LOCAL_CUSTODY, ENTRY_FLAG_PENDING_FORWARD,
    TIME_INFINITE,
};
use crate::cache::state::{
    CacheState, CACHE_AGE_OUT_TIME_MS, CACHE_FAST_RETRY_TIME_MS, CACHE_IDLE_RETRY_TIME_MS,
};
use crate::codec::types::DeliveryPolicy;
use crate::pool::{BlockId, FlowDir, Pool};
use tracing::{debug, trace, warn};

fn idle_eval(pool: &mut Pool, state: &mut CacheState, entry_blk: BlockId) -> EntryState {
    let (flags, expire, refptr, sid) = match pool.cache_entry(entry_blk) {
        Some(e) => (e.flags, e.expire_time, e.refptr, e.offload_sid),
        None => return EntryState::Undefined,
    };

    if state.action_time >= expire {
        // end of useful life
        return EntryState::Undefined;
    }

    if flags & ENTRY_FLAG_LOCAL_CUSTODY == 0 {
        // content can go; metadata is held over in case the previous
        // custodian sends it again
        return EntryState::Delete;
    }

    if flags & ENTRY_FLAGS_WAIT_STATE == 0 {
        // due for [re]transmit
        let mut refptr = refptr;
        if refptr.is_none() && sid != 0 {
            if let Some(store) = state.offload.as_mut() {
                match store.restore(pool, sid) {
                    Ok(pblk) => {
                        pool.ref_retain(pblk);
                        if let Some(p) = pool.primary_mut(pblk) {
                            // restored copies stay marked as committed so the
                            // router does not hand them back for storage
                            p.delivery.committed_storage_id = sid;
                            p.delivery.storage_intf = state.self_intf;
                        }
                        if let Some(e) = pool.cache_entry_mut(entry_blk) {
                            e.refptr = Some(pblk);
                        }
                        refptr = Some(pblk);
                    }
                    Err(err) => warn!(?err, sid, "offload restore failed"),
                }
            }
        }
        if refptr.is_some() {
            return EntryState::Queue;
        }
    }

    EntryState::Idle
}

fn queue_eval(pool: &Pool, entry_blk: BlockId) -> EntryState {
    match pool.cache_entry(entry_blk) {
        Some(e) if e.flags & ENTRY_FLAG_LOCALLY_QUEUED == 0 => EntryState::Idle,
        Some(_) => EntryState::Queue,
        None => EntryState::Undefined,
    }
}

fn queue_enter(pool: &mut Pool, state: &mut CacheState, entry_blk: BlockId) {
    let target = match pool.cache_entry_mut(entry_blk) {
        Some(e) => {
            e.flags |= ENTRY_FLAG_PENDING_FORWARD;
            e.refptr
        }
        None => return,
    };
    let Some(target) = target else { return };

    if let Ok(rblk) = pool.make_ref_block(target, entry_blk) {
        // The flag is set even if the push fails: the failed reference is
        // recycled, and its destructor clears the flag again, so the entry
        // cannot slip back to idle while a referring block still exists.
        if let Some(e) = pool.cache_entry_mut(entry_blk) {
            e.flags |= ENTRY_FLAG_LOCALLY_QUEUED;
        }
        if !pool.flow_try_push(state.flow_blk, FlowDir::Ingress, rblk) {
            pool.recycle_block(rblk);
        }
    }
}

fn queue_exit(pool: &mut Pool, entry_blk: BlockId) {
    let (refptr, sid) = match pool.cache_entry(entry_blk) {
        Some(e) => (e.refptr, e.offload_sid),
        None => return,
    };

    if let Some(pri_id) = refptr {
        let delivery = pool.primary(pri_id).map(|p| {
            (
                p.delivery.egress_intf,
                p.delivery.egress_time_ms,
                p.delivery.policy,
                p.delivery.local_retx_interval_ms,
            )
        });
        if let Some((egress_intf, egress_time, policy, retx)) = delivery {
            if egress_intf.is_valid() {
                if let Some(e) = pool.cache_entry_mut(entry_blk) {
                    e.flags &= !ENTRY_FLAG_PENDING_FORWARD;
                    if policy != DeliveryPolicy::CustodyTracking {
                        // the egress CLA is the implicit custodian
                        e.flags &= !ENTRY_FLAG_LOCAL_CUSTODY;
                    } else {
                        e.action_time = egress_time.saturating_add(retx);
                        e.flags |= ENTRY_FLAG_ACTION_TIME_WAIT;
                    }
                }
            }
        }
    }

    if sid != 0 {
        // bulk bytes live in the offload store; drop the in-memory copy
        if let Some(target) = pool.cache_entry_mut(entry_blk).and_then(|e| e.refptr.take()) {
            pool.ref_release(target);
        }
    }
}

fn delete_eval(pool: &mut Pool, state: &CacheState, entry_blk: BlockId) -> EntryState {
    let flags = match pool.cache_entry(entry_blk) {
        Some(e) => e.flags,
        None => return EntryState::Undefined,
    };
    if flags & ENTRY_FLAG_ACTION_TIME_WAIT == 0 {
        if flags & ENTRY_FLAG_ACTIVITY == 0 {
            // nothing looked at this since the last check
            return EntryState::Undefined;
        }
        if let Some(e) = pool.cache_entry_mut(entry_blk) {
            e.flags &= !ENTRY_FLAG_ACTIVITY;
            e.flags |= ENTRY_FLAG_ACTION_TIME_WAIT;
            e.action_time = state.action_time.saturating_add(CACHE_AGE_OUT_TIME_MS);
        }
    }
    EntryState::Delete
}

fn delete_enter(pool: &mut Pool, state: &mut CacheState, entry_blk: BlockId) {
    let (refptr, sid) = match pool.cache_entry_mut(entry_blk) {
        Some(e) => (e.refptr.take(), e.offload_sid),
        None => return,
    };
    if let Some(target) = refptr {
        pool.ref_release(target);
    }
    if sid != 0 {
        if let Some(store) = state.offload.as_mut() {
            if let Err(err) = store.release(pool, sid) {
                warn!(?err, sid, "offload release failed");
            }
        }
        if let Some(e) = pool.cache_entry_mut(entry_blk) {
            e.offload_sid = 0;
        }
    }
    if let Some(e) = pool.cache_entry_mut(entry_blk) {
        e.flags |= ENTRY_FLAG_ACTION_TIME_WAIT;
        e.action_time = state.action_time.saturating_add(CACHE_AGE_OUT_TIME_MS);
    }
}

fn generate_dacs_eval(pool: &Pool, entry_blk: BlockId) -> EntryState {
    match pool.cache_entry(entry_blk) {
        Some(e) if e.flags & ENTRY_FLAG_ACTION_TIME_WAIT == 0 => EntryState::Idle,
        Some(_) => EntryState::GenerateDacs,
        None => EntryState::Undefined,
    }
}

/// Evaluates the entry's current state for its successor.
pub fn get_next_state(pool: &mut Pool, state: &mut CacheState, entry_blk: BlockId) -> EntryState {
    let current = match pool.cache_entry(entry_blk) {
        Some(e) => e.state,
        None => return EntryState::Undefined,
    };
    match current {
        EntryState::Undefined => EntryState::Undefined,
        EntryState::Idle => idle_eval(pool, state, entry_blk),
        EntryState::Queue => queue_eval(pool, entry_blk),
        EntryState::Delete => delete_eval(pool, state, entry_blk),
        EntryState::GenerateDacs => generate_dacs_eval(pool, entry_blk),
    }
}

/// Runs the exit action of the state being left, then the enter action of the
/// state being entered, then records the new state.
pub fn transition(
    pool: &mut Pool,
    state: &mut CacheState,
    entry_blk: BlockId,
    next: EntryState,
) {
    let current = match pool.cache_entry(entry_blk) {
        Some(e) => e.state,
        None => return,
    };

    match current {
        EntryState::Queue => queue_exit(pool, entry_blk),
        EntryState::GenerateDacs => custody::finalize_dacs(pool, state, entry_blk),
        _ => {}
    }
    match next {
        EntryState::Queue => queue_enter(pool, state, entry_blk),
        EntryState::Delete => delete_enter(pool, state, entry_blk),
        _ => {}
    }

    if let Some(e) = pool.cache_entry_mut(entry_blk) {
        trace!(%entry_blk, ?current, ?next, "entry transition");
        e.state = next;
    }
}

/// Computes the next visit time and re-inserts the entry's time-index node,
/// leaving exactly one node per entry.
pub fn reschedule(pool: &mut Pool, state: &mut CacheState, entry_blk: BlockId) {
    let (flags, scheduled) = match pool.cache_entry(entry_blk) {
        Some(e) => (e.flags, e.action_time),
        None => return,
    };

    let mut ref_time = if flags & ENTRY_FLAGS_WAIT_STATE == 0 {
        // actionable but blocked on something external; retry aggressively
        state.action_time.saturating_add(CACHE_FAST_RETRY_TIME_MS)
    } else {
        // parked, but never leave it unexamined forever
        state.action_time.saturating_add(CACHE_IDLE_RETRY_TIME_MS)
    };
    if flags & ENTRY_FLAG_ACTION_TIME_WAIT != 0 && scheduled < ref_time {
        ref_time = scheduled;
    }

    let old_link = pool.cache_entry(entry_blk).map(|e| e.time_link).unwrap_or_default();
    if state.time_index.is_member(old_link) && *state.time_index.value(old_link) == entry_blk {
        if state.time_index.key(old_link) == ref_time {
            return;
        }
        state.time_index.extract(old_link);
    }
    let link = state.time_index.insert(ref_time, entry_blk);
    if let Some(e) = pool.cache_entry_mut(entry_blk) {
        e.time_link = link;
    }
}

/// One driver visit: clear an elapsed timer, evaluate, transition, then
/// recycle (undefined) or reschedule onto the idle list.
pub fn execute(pool: &mut Pool, state: &mut CacheState, entry_blk: BlockId) {
    let due = match pool.cache_entry(entry_blk) {
        Some(e) => {
            e.flags & ENTRY_FLAG_ACTION_TIME_WAIT != 0 && state.action_time >= e.action_time
        }
        None => return,
    };
    if due {
        // Once handed to an egress queue, the action time stays infinite
        // until the referring block is confirmed recycled, so a
        // non-collecting CLA cannot cause duplicate retransmits. A CLA that
        // cannot fetch data is expected to declare itself down, which purges
        // its egress queue.
        if let Some(e) = pool.cache_entry_mut(entry_blk) {
            e.flags &= !ENTRY_FLAG_ACTION_TIME_WAIT;
            e.action_time = TIME_INFINITE;
        }
    }

    let current = match pool.cache_entry(entry_blk) {
        Some(e) => e.state,
        None => return,
    };
    let next = get_next_state(pool, state, entry_blk);
    if next != current {
        state.state_exit_count[current.index()] += 1;
        transition(pool, state, entry_blk, next);
        state.state_enter_count[next.index()] += 1;
    }

    if next == EntryState::Undefined {
        // Pull any live time-index node now so the driver cannot visit the
        // entry again while it waits for collection.
        let link = pool
            .cache_entry_mut(entry_blk)
            .map(|e| std::mem::take(&mut e.time_link))
            .unwrap_or_default();
        if state.time_index.is_member(link) && *state.time_index.value(link) == entry_blk {
            state.time_index.extract(link);
        }
        state.discard_count += 1;
        if let Some(e) = pool.cache_entry(entry_blk) {
            debug!(
                source = %e.source_copy,
                sequence = e.sequence_copy,
                "discarding bundle"
            );
        }
        pool.recycle_block(entry_blk);
    } else {
        reschedule(pool, state, entry_blk);
        if pool.is_linked(entry_blk) {
            pool.extract_node(entry_blk);
        }
        let idle = state.idle_list;
        pool.insert_before(idle, entry_blk);
    }
}

/// Drives every entry whose action time has elapsed, then everything parked
/// on the pending list.
pub fn process_pending(pool: &mut Pool, state: &mut CacheState) {
    loop {
        let Some(h) = state.time_index.first() else { break };
        if state.time_index.key(h) > state.action_time {
            break;
        }
        let (_, entry_blk) = state.time_index.extract(h);
        if let Some(e) = pool.cache_entry_mut(entry_blk) {
            e.time_link = Default::default();
        }
        execute(pool, state, entry_blk);
    }

    loop {
        let first = pool.next_block(state.pending_list);
        if first == state.pending_list {
            break;
        }
        pool.extract_node(first);
        execute(pool, state, first);
    }
}
