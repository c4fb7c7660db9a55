//! The custody engine: admitting custody-required bundles, rewriting the
//! custody-tracking block to the local node, aggregating acknowledgements
//! into deferred-ack custody signals (DACS), and consuming DACS addressed to
//! this node.

use crate::cache::entry::{
    CacheEntry, EntryData, EntryState, ENTRY_FLAG_ACTION_TIME_WAIT, ENTRY_FLAG_ACTIVITY,
    ENTRY_FLAG_LOCAL_CUSTODY,
};
use crate::cache::state::{
    CacheState, CACHE_DACS_LIFETIME_MS, CACHE_DACS_OPEN_TIME_MS, CACHE_LOCAL_RETX_INTERVAL_MS,
};
use crate::codec::crc::CrcType;
use crate::codec::types::{
    BlockType, CanonicalBlock, CanonicalPayload, CreationTimestamp, DacsPayload, EndpointId,
    IpnAddress, PrimaryBlock,
};
use crate::pool::{BlockId, Pool};
use tracing::{debug, trace, warn};

/// Dispatches one block pulled from the cache's intake queue: a DACS
/// addressed to this node is consumed, anything else is stored.
pub fn ingest(pool: &mut Pool, state: &mut CacheState, qblk: BlockId) {
    let Some(pri_id) = pool.ref_target(qblk) else {
        pool.recycle_block(qblk);
        return;
    };
    let (is_admin, dest) = match pool.primary(pri_id) {
        Some(p) => (p.flags.is_admin_record, p.destination),
        None => {
            pool.recycle_block(qblk);
            return;
        }
    };
    if is_admin && dest == EndpointId::Ipn(state.self_addr) {
        process_remote_dacs(pool, state, qblk);
    } else {
        store_bundle(pool, state, qblk);
    }
}

/// Admits a bundle into the cache: allocates an entry, takes custody when the
/// bundle requests it, rewrites the tracking block, offloads the bulk bytes
/// if a store is registered, and queues a DACS for the previous custodian.
pub fn store_bundle(pool: &mut Pool, state: &mut CacheState, qblk: BlockId) {
    let Some(pri_id) = pool.ref_target(qblk) else {
        pool.recycle_block(qblk);
        return;
    };
    let Some((src, seq, dest_node, custody, expire)) = pool.primary(pri_id).and_then(|p| {
        let src = p.source.as_ipn()?;
        let dest_node = p.destination.as_ipn()?.node;
        Some((
            src,
            p.timestamp.sequence,
            dest_node,
            p.delivery.policy == crate::codec::types::DeliveryPolicy::CustodyTracking,
            p.expire_time_ms(),
        ))
    }) else {
        debug!("dropping bundle with non-ipn addressing");
        pool.recycle_block(qblk);
        return;
    };

    let key = (src.node, src.service, seq);
    if state.bundle_index.find(key).is_some() {
        // already have this bundle; the previous custodian just needs the ack
        trace!(source = %src, seq, "duplicate bundle, acknowledging only");
        if custody {
            let custodian = insert_tracking_block(pool, state, pri_id);
            ack_custodian(pool, state, custodian, EndpointId::Ipn(src), seq);
        }
        pool.recycle_block(qblk);
        return;
    }

    let mut entry = CacheEntry::new(state.flow_blk);
    entry.state = EntryState::Idle;
    entry.flags = ENTRY_FLAG_LOCAL_CUSTODY;
    entry.source_copy = src;
    entry.sequence_copy = seq;
    entry.expire_time = expire;
    let entry_blk = match pool.alloc_cache_entry(entry) {
        Ok(b) => b,
        Err(err) => {
            warn!(?err, "no room for cache entry, dropping bundle");
            pool.recycle_block(qblk);
            return;
        }
    };

    pool.ref_retain(pri_id);
    if let Some(e) = pool.cache_entry_mut(entry_blk) {
        e.refptr = Some(pri_id);
    }
    if let Some(p) = pool.primary_mut(pri_id) {
        p.delivery.storage_intf = state.self_intf;
        p.delivery.committed_storage_id = u64::from(entry_blk.0) + 1;
        if p.delivery.local_retx_interval_ms == 0 {
            p.delivery.local_retx_interval_ms = CACHE_LOCAL_RETX_INTERVAL_MS;
        }
    }

    if let Ok(h) = state.bundle_index.insert_unique(key, entry_blk) {
        if let Some(e) = pool.cache_entry_mut(entry_blk) {
            e.hash_link = h;
        }
    }
    let dest_h = state.dest_eid_index.insert(dest_node, entry_blk);
    if let Some(e) = pool.cache_entry_mut(entry_blk) {
        e.dest_link = dest_h;
    }
    let pending = state.pending_list;
    pool.insert_before(pending, entry_blk);

    if custody {
        let custodian = insert_tracking_block(pool, state, pri_id);
        if let Some(store) = state.offload.as_mut() {
            let mut sid = 0u64;
            match store.offload(pool, &mut sid, pri_id) {
                Ok(()) => {
                    if let Some(p) = pool.primary_mut(pri_id) {
                        p.delivery.committed_storage_id = sid;
                    }
                    if let Some(e) = pool.cache_entry_mut(entry_blk) {
                        e.offload_sid = sid;
                        e.refptr = None;
                    }
                    pool.ref_release(pri_id);
                }
                Err(err) => warn!(?err, "offload failed, keeping bundle in memory"),
            }
        }
        ack_custodian(pool, state, custodian, EndpointId::Ipn(src), seq);
    }

    debug!(source = %src, seq, dest_node, custody, "bundle stored");
    pool.recycle_block(qblk);
}

/// Rewrites (or inserts) the bundle's custody-tracking block to name this
/// node, returning the custodian it previously named.
pub fn insert_tracking_block(
    pool: &mut Pool,
    state: &CacheState,
    pri_id: BlockId,
) -> EndpointId {
    let self_eid = EndpointId::Ipn(state.self_addr);
    let (canonicals, source) = match pool.primary(pri_id) {
        Some(p) => (p.canonicals.clone(), p.source),
        None => return EndpointId::Undefined,
    };

    for cid in &canonicals {
        let Some(cb) = pool.canonical_mut(*cid) else { continue };
        if let CanonicalPayload::CustodyTracking(custodian) = &mut cb.payload {
            let previous = *custodian;
            if previous == self_eid {
                return previous;
            }
            *custodian = self_eid;
            cb.drop_encode();
            if let Some(p) = pool.primary_mut(pri_id) {
                p.drop_bundle_encode();
            }
            return previous;
        }
    }

    // no tracking block yet: this node is taking first custody from the
    // bundle's source
    let mut num = 2;
    for cid in &canonicals {
        if let Some(cb) = pool.canonical(*cid) {
            if cb.block_type != BlockType::Payload {
                num = num.max(cb.block_num + 1);
            }
        }
    }
    let mut ct = CanonicalBlock::new(
        BlockType::CustodyTracking,
        num,
        CanonicalPayload::CustodyTracking(self_eid),
    );
    ct.crc_type = CrcType::Crc16X25;
    match pool.alloc_canonical(ct) {
        Ok(cid) => {
            if let Some(p) = pool.primary_mut(pri_id) {
                p.canonicals.insert(0, cid);
                p.drop_bundle_encode();
            }
        }
        Err(err) => warn!(?err, "no room for custody tracking block"),
    }
    source
}

/// Records one acknowledgement owed to `custodian` for (`flow_source`,
/// `seq`), opening a new DACS when no open one matches, and expiring the
/// DACS early when its payload fills.
pub fn ack_custodian(
    pool: &mut Pool,
    state: &mut CacheState,
    custodian: EndpointId,
    flow_source: EndpointId,
    seq: u64,
) {
    let Some(custodian_addr) = custodian.as_ipn() else {
        // originator or dtn:none custodian; nothing to acknowledge
        return;
    };
    if custodian_addr == state.self_addr {
        return;
    }

    let entry_blk = match find_pending_dacs(pool, state, custodian_addr, flow_source) {
        Some(b) => b,
        None => match open_dacs(pool, state, custodian, custodian_addr, flow_source) {
            Some(b) => b,
            None => return,
        },
    };

    let payload_blk = match pool.cache_entry(entry_blk) {
        Some(CacheEntry {
            data: EntryData::Dacs { payload_blk, .. },
            ..
        }) => *payload_blk,
        _ => return,
    };

    let mut full = false;
    if let Some(cb) = pool.canonical_mut(payload_blk) {
        let mut pushed = false;
        if let CanonicalPayload::DacsAccept(dacs) = &mut cb.payload {
            if !dacs.sequence_nums.contains(&seq) {
                dacs.sequence_nums.push(seq);
                pushed = true;
            }
            full = dacs.is_full();
        }
        if pushed {
            cb.drop_encode();
        }
    }
    let pri = pool.cache_entry(entry_blk).and_then(|e| e.refptr);
    if let Some(pri) = pri {
        if let Some(p) = pool.primary_mut(pri) {
            p.drop_bundle_encode();
        }
    }
    trace!(custodian = %custodian_addr, seq, full, "acknowledgement recorded");

    if full {
        // expire the open window so the next tick finalizes and forwards it
        let now = state.action_time;
        if let Some(e) = pool.cache_entry_mut(entry_blk) {
            e.action_time = now;
        }
        let link = pool
            .cache_entry(entry_blk)
            .map(|e| e.time_link)
            .unwrap_or_default();
        if state.time_index.is_member(link) && *state.time_index.value(link) == entry_blk {
            state.time_index.extract(link);
        }
        let new_link = state.time_index.insert(now, entry_blk);
        if let Some(e) = pool.cache_entry_mut(entry_blk) {
            e.time_link = new_link;
        }
    }
}

fn find_pending_dacs(
    pool: &Pool,
    state: &CacheState,
    custodian: IpnAddress,
    flow_source: EndpointId,
) -> Option<BlockId> {
    let mut h = state.dacs_index.lower_bound(custodian.node);
    while let Some(hh) = h {
        if state.dacs_index.key(hh) != custodian.node {
            break;
        }
        let entry_blk = *state.dacs_index.value(hh);
        if let Some(e) = pool.cache_entry(entry_blk) {
            if e.state == EntryState::GenerateDacs {
                if let EntryData::Dacs {
                    custodian: c,
                    flow_source: fs,
                    payload_blk,
                } = &e.data
                {
                    if *c == custodian && *fs == flow_source && !dacs_full(pool, *payload_blk) {
                        return Some(entry_blk);
                    }
                }
            }
        }
        h = state.dacs_index.next(hh);
    }
    None
}

fn dacs_full(pool: &Pool, payload_blk: BlockId) -> bool {
    match pool.canonical(payload_blk).map(|cb| &cb.payload) {
        Some(CanonicalPayload::DacsAccept(d)) => d.is_full(),
        _ => true,
    }
}

/// Builds a fresh DACS bundle (primary + payload block) and its cache entry
/// in the generate-dacs state.
fn open_dacs(
    pool: &mut Pool,
    state: &mut CacheState,
    custodian: EndpointId,
    custodian_addr: IpnAddress,
    flow_source: EndpointId,
) -> Option<BlockId> {
    state.creation_seq += 1;
    let creation_seq = state.creation_seq;

    let mut pri = PrimaryBlock::new();
    pri.flags.is_admin_record = true;
    pri.flags.must_not_fragment = true;
    pri.crc_type = CrcType::Crc16X25;
    pri.destination = custodian;
    pri.source = EndpointId::Ipn(state.self_addr);
    pri.report_to = EndpointId::DtnNone;
    pri.timestamp = CreationTimestamp {
        dtn_time_ms: state.action_time,
        sequence: creation_seq,
    };
    pri.lifetime_ms = CACHE_DACS_LIFETIME_MS;
    pri.delivery.storage_intf = state.self_intf;

    let pri_id = match pool.alloc_primary(pri) {
        Ok(id) => id,
        Err(err) => {
            warn!(?err, "no room for DACS primary block");
            return None;
        }
    };
    let mut payload = CanonicalBlock::new(
        BlockType::DacsPayload,
        1,
        CanonicalPayload::DacsAccept(DacsPayload {
            flow_source_eid: flow_source,
            ..Default::default()
        }),
    );
    payload.crc_type = CrcType::Crc16X25;
    let payload_blk = match pool.alloc_canonical(payload) {
        Ok(id) => id,
        Err(err) => {
            warn!(?err, "no room for DACS payload block");
            pool.recycle_block(pri_id);
            return None;
        }
    };
    if let Some(p) = pool.primary_mut(pri_id) {
        p.canonicals.push(payload_blk);
    }

    let mut entry = CacheEntry::new(state.flow_blk);
    entry.state = EntryState::GenerateDacs;
    entry.flags = ENTRY_FLAG_LOCAL_CUSTODY | ENTRY_FLAG_ACTION_TIME_WAIT;
    entry.source_copy = state.self_addr;
    entry.sequence_copy = creation_seq;
    entry.expire_time = state.action_time.saturating_add(CACHE_DACS_LIFETIME_MS);
    entry.action_time = state.action_time.saturating_add(CACHE_DACS_OPEN_TIME_MS);
    entry.data = EntryData::Dacs {
        payload_blk,
        custodian: custodian_addr,
        flow_source,
    };
    let entry_blk = match pool.alloc_cache_entry(entry) {
        Ok(id) => id,
        Err(err) => {
            warn!(?err, "no room for DACS entry");
            pool.recycle_block(pri_id);
            return None;
        }
    };
    pool.ref_retain(pri_id);
    if let Some(e) = pool.cache_entry_mut(entry_blk) {
        e.refptr = Some(pri_id);
    }
    if let Some(p) = pool.primary_mut(pri_id) {
        // already under cache management; the router must not store it again
        p.delivery.committed_storage_id = u64::from(entry_blk.0) + 1;
    }

    let dacs_h = state.dacs_index.insert(custodian_addr.node, entry_blk);
    let dest_h = state.dest_eid_index.insert(custodian_addr.node, entry_blk);
    let wake = state
        .action_time
        .saturating_add(CACHE_DACS_OPEN_TIME_MS);
    let time_h = state.time_index.insert(wake, entry_blk);
    if let Some(e) = pool.cache_entry_mut(entry_blk) {
        e.dacs_link = dacs_h;
        e.dest_link = dest_h;
        e.time_link = time_h;
    }
    let idle = state.idle_list;
    pool.insert_before(idle, entry_blk);

    debug!(custodian = %custodian_addr, "DACS opened");
    Some(entry_blk)
}

/// Exit action of the generate-dacs state: closes the aggregation window.
/// The entry then flows through idle and queue like any stored bundle.
pub fn finalize_dacs(pool: &mut Pool, state: &mut CacheState, entry_blk: BlockId) {
    let link = pool
        .cache_entry_mut(entry_blk)
        .map(|e| std::mem::take(&mut e.dacs_link))
        .unwrap_or_default();
    if state.dacs_index.is_member(link) && *state.dacs_index.value(link) == entry_blk {
        state.dacs_index.extract(link);
        debug!(%entry_blk, "DACS finalized");
    }
}

/// Consumes a DACS addressed to this node: each acknowledged sequence
/// releases local custody of the matching stored bundle.
pub fn process_remote_dacs(pool: &mut Pool, state: &mut CacheState, qblk: BlockId) {
    let Some(pri_id) = pool.ref_target(qblk) else {
        pool.recycle_block(qblk);
        return;
    };
    let canonicals = pool
        .primary(pri_id)
        .map(|p| p.canonicals.clone())
        .unwrap_or_default();

    let mut acked = Vec::new();
    for cid in canonicals {
        if let Some(CanonicalPayload::DacsAccept(d)) =
            pool.canonical(cid).map(|cb| &cb.payload)
        {
            if let Some(fs) = d.flow_source_eid.as_ipn() {
                for &seq in &d.sequence_nums {
                    acked.push((fs, seq));
                }
            }
        }
    }

    for (fs, seq) in acked {
        let key = (fs.node, fs.service, seq);
        let Some(h) = state.bundle_index.find(key) else {
            trace!(source = %fs, seq, "DACS names an unknown bundle");
            continue;
        };
        let entry_blk = *state.bundle_index.value(h);
        if let Some(e) = pool.cache_entry_mut(entry_blk) {
            e.flags &= !ENTRY_FLAG_LOCAL_CUSTODY;
            e.flags |= ENTRY_FLAG_ACTIVITY;
        }
        // revisit promptly so the delete path runs
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
        debug!(source = %fs, seq, "custody released by remote DACS");
    }

    pool.recycle_block(qblk);
}
