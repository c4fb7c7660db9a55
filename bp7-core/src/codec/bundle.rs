//! Whole-bundle wire form: a CBOR indefinite-length array (`0x9F` … `0xFF`)
//! containing the primary block followed by the canonical blocks in order.
//! Decoding builds the block chain in the pool; any failure recycles every
//! block allocated so far.

use crate::codec::canonical::{self, PayloadHint};
use crate::codec::cbor::{BREAK, INDEFINITE_ARRAY};
use crate::codec::primary;
use crate::codec::types::{BlockType, DeliveryPolicy};
use crate::error::{BpError, BpResult};
use crate::pool::{BlockId, Pool};
use tracing::debug;

/// Encodes any block that does not yet carry an encoded chunk and returns the
/// total wire size of the bundle, caching it on the primary.
pub fn compute_full_size(pool: &mut Pool, pri_id: BlockId) -> BpResult<usize> {
    let cached = pool
        .primary(pri_id)
        .ok_or(BpError::Fatal("not a primary block"))?
        .bundle_encode_size;
    if cached != 0 {
        return Ok(cached);
    }

    let canonicals = pool
        .primary(pri_id)
        .map(|p| p.canonicals.clone())
        .unwrap_or_default();

    let pri = pool.primary_mut(pri_id).ok_or(BpError::Fatal("not a primary block"))?;
    primary::encode(pri)?;
    let mut total = pri.block_encode_size;

    for cid in canonicals {
        let cb = pool
            .canonical_mut(cid)
            .ok_or(BpError::Fatal("canonical chain holds a non-canonical block"))?;
        canonical::encode(cb)?;
        total += cb.block_encode_size;
    }

    // indefinite-array start and break octets
    total += 2;
    if let Some(pri) = pool.primary_mut(pri_id) {
        pri.bundle_encode_size = total;
    }
    Ok(total)
}

/// Appends the full wire bundle to `out` and returns its size.
pub fn encode_bundle(pool: &mut Pool, pri_id: BlockId, out: &mut Vec<u8>) -> BpResult<usize> {
    let total = compute_full_size(pool, pri_id)?;
    out.reserve(total);
    let start = out.len();
    out.push(INDEFINITE_ARRAY);
    let pri = pool.primary(pri_id).ok_or(BpError::Fatal("not a primary block"))?;
    out.extend_from_slice(&pri.encoded);
    for cid in pri.canonicals.clone() {
        let cb = pool
            .canonical(cid)
            .ok_or(BpError::Fatal("canonical chain holds a non-canonical block"))?;
        out.extend_from_slice(&cb.encoded);
    }
    out.push(BREAK);
    debug_assert_eq!(out.len() - start, total);
    Ok(total)
}

/// Decodes a wire bundle into a primary block plus its canonical chain.
/// On failure every block allocated so far is recycled, so the net block
/// count change is zero once the collector runs.
pub fn decode_bundle(pool: &mut Pool, buf: &[u8]) -> BpResult<BlockId> {
    if buf.len() < 2 || buf[0] != INDEFINITE_ARRAY {
        return Err(BpError::Codec("bundle must start with an indefinite array"));
    }

    let pri = primary::decode(&buf[1..])?;
    let mut hint = if pri.flags.is_admin_record {
        PayloadHint::AdminRecord
    } else {
        PayloadHint::Plain
    };
    let mut pos = 1 + pri.block_encode_size;
    let pri_id = pool.alloc_primary(pri)?;

    loop {
        if pos >= buf.len() {
            pool.recycle_block(pri_id);
            return Err(BpError::Codec("bundle truncated before break code"));
        }
        if buf[pos] == BREAK {
            pos += 1;
            break;
        }
        let cb = match canonical::decode(&buf[pos..], hint) {
            Ok(cb) => cb,
            Err(err) => {
                debug!(?err, "canonical block decode failed, dropping bundle");
                pool.recycle_block(pri_id);
                return Err(err);
            }
        };
        pos += cb.block_encode_size;

        match cb.block_type {
            BlockType::PayloadConfidentiality => {
                if hint == PayloadHint::Plain {
                    hint = PayloadHint::Ciphertext;
                }
            }
            BlockType::CustodyTracking => {
                if let Some(p) = pool.primary_mut(pri_id) {
                    p.delivery.policy = DeliveryPolicy::CustodyTracking;
                }
            }
            _ => {}
        }

        let cid = match pool.alloc_canonical(cb) {
            Ok(cid) => cid,
            Err(err) => {
                pool.recycle_block(pri_id);
                return Err(err);
            }
        };
        if let Some(p) = pool.primary_mut(pri_id) {
            p.canonicals.push(cid);
        }
    }

    if let Some(p) = pool.primary_mut(pri_id) {
        p.bundle_encode_size = pos;
    }
    Ok(pri_id)
}
