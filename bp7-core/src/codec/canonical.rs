//! Canonical block encode/decode: `[block-type, block-number, flags,
//! crc-type, content-bytes]` plus an optional trailing CRC. The content byte
//! string's inner CBOR form depends on the block type; payload-block
//! interpretation on decode is steered by a hint derived from the blocks
//! decoded before it.

use crate::codec::cbor::{Reader, Writer};
use crate::codec::crc::CrcType;
use crate::codec::eid::{decode_eid, encode_eid};
use crate::codec::types::{
    BlockControlFlags, BlockType, CanonicalBlock, CanonicalPayload, DacsPayload,
    ADMIN_RECORD_CUSTODY_ACK, DACS_MAX_SEQ_PER_PAYLOAD,
};
use crate::error::{BpError, BpResult};

/// How to interpret a wire type-1 (payload) block, decided by blocks decoded
/// earlier in the same bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadHint {
    #[default]
    Plain,
    AdminRecord,
    Ciphertext,
}

/// Encodes a block whose logical payload is one of the known extension
/// forms. Opaque payload blocks are built with [`encode_payload`] instead.
pub fn encode(cb: &mut CanonicalBlock) -> BpResult<()> {
    if cb.block_encode_size != 0 && !cb.encoded.is_empty() {
        return Ok(());
    }
    let content = match &cb.payload {
        CanonicalPayload::PreviousNode(eid) => {
            let mut cw = Writer::new();
            encode_eid(&mut cw, eid)?;
            cw.into_inner()
        }
        CanonicalPayload::BundleAge { age_ms } => {
            let mut cw = Writer::new();
            cw.uint(*age_ms);
            cw.into_inner()
        }
        CanonicalPayload::HopCount { limit, count } => {
            let mut cw = Writer::new();
            cw.array(2);
            cw.uint(*limit);
            cw.uint(*count);
            cw.into_inner()
        }
        CanonicalPayload::CustodyTracking(eid) => {
            let mut cw = Writer::new();
            encode_eid(&mut cw, eid)?;
            cw.into_inner()
        }
        CanonicalPayload::DacsAccept(dacs) => {
            if dacs.sequence_nums.len() > DACS_MAX_SEQ_PER_PAYLOAD {
                return Err(BpError::Codec("DACS sequence list too long"));
            }
            let mut cw = Writer::new();
            cw.array(2);
            cw.uint(ADMIN_RECORD_CUSTODY_ACK);
            cw.array(2);
            encode_eid(&mut cw, &dacs.flow_source_eid)?;
            cw.array(dacs.sequence_nums.len() as u64);
            for &seq in &dacs.sequence_nums {
                cw.uint(seq);
            }
            cw.into_inner()
        }
        CanonicalPayload::Opaque => {
            return Err(BpError::Codec("opaque payload block has no encode"));
        }
    };
    encode_with_content(cb, &content)
}

/// Builds the encoded form of a payload block directly from the application
/// data bytes, streaming them into the block's chunk without an intermediate
/// logical representation.
pub fn encode_payload(cb: &mut CanonicalBlock, data: &[u8]) -> BpResult<()> {
    if !matches!(cb.payload, CanonicalPayload::Opaque) {
        return Err(BpError::Codec("payload encode on a non-payload block"));
    }
    encode_with_content(cb, data)
}

fn encode_with_content(cb: &mut CanonicalBlock, content: &[u8]) -> BpResult<()> {
    let crc_width = cb.crc_type.width();
    let mut w = Writer::new();
    w.array(5 + u64::from(crc_width > 0));
    w.uint(cb.block_type.wire_value());
    w.uint(cb.block_num);
    w.uint(cb.flags.to_bits());
    w.uint(cb.crc_type as u64);
    w.bytes_header(content.len() as u64);
    let content_offset = w.len();
    w.raw(content);

    if crc_width > 0 {
        w.bytes_header(crc_width as u64);
        w.raw(&[0u8; 4][..crc_width]);
        let crc = cb.crc_type.compute(w.as_slice());
        let len = w.len();
        w.as_mut_slice()[len - crc_width..]
            .copy_from_slice(&crc.to_be_bytes()[4 - crc_width..]);
        cb.crc_value = crc;
    } else {
        cb.crc_value = 0;
    }

    cb.content_offset = content_offset;
    cb.content_length = content.len();
    cb.block_encode_size = w.len();
    cb.encoded = w.into_inner();
    Ok(())
}

/// Decodes one canonical block from the front of `buf`.
pub fn decode(buf: &[u8], payload_hint: PayloadHint) -> BpResult<CanonicalBlock> {
    let mut r = Reader::new(buf);
    let count = r.array()?;
    if count != 5 && count != 6 {
        return Err(BpError::Codec("canonical block element count mismatch"));
    }

    let wire_type = r.uint()?;
    let block_num = r.uint()?;
    let flags = BlockControlFlags::from_bits(r.uint()?);
    let crc_type = CrcType::from_wire(r.uint()?)?;
    if (count == 6) != (crc_type != CrcType::None) {
        return Err(BpError::Codec("canonical block CRC presence mismatch"));
    }

    let content = r.bytes()?;
    let content_length = content.len();
    let content_offset = r.position() - content_length;

    let crc_width = crc_type.width();
    let mut crc_value = 0u32;
    if crc_width > 0 {
        let crc_bytes = r.bytes()?;
        if crc_bytes.len() != crc_width {
            return Err(BpError::Codec("CRC field width mismatch"));
        }
        let mut be = [0u8; 4];
        be[4 - crc_width..].copy_from_slice(crc_bytes);
        crc_value = u32::from_be_bytes(be);

        let mut scratch = buf[..r.position()].to_vec();
        let len = scratch.len();
        scratch[len - crc_width..].fill(0);
        if crc_type.compute(&scratch) != crc_value {
            return Err(BpError::InvalidCrc);
        }
    }

    let (block_type, payload) = decode_content(wire_type, content, payload_hint)?;

    let size = r.position();
    let mut cb = CanonicalBlock::new(block_type, block_num, payload);
    cb.flags = flags;
    cb.crc_type = crc_type;
    cb.crc_value = crc_value;
    cb.encoded = buf[..size].to_vec();
    cb.block_encode_size = size;
    cb.content_offset = content_offset;
    cb.content_length = content_length;
    Ok(cb)
}

fn decode_content(
    wire_type: u64,
    content: &[u8],
    hint: PayloadHint,
) -> BpResult<(BlockType, CanonicalPayload)> {
    let mut cr = Reader::new(content);
    match wire_type {
        1 => match hint {
            PayloadHint::AdminRecord => {
                let dacs = decode_custody_ack(&mut cr)?;
                Ok((BlockType::DacsPayload, CanonicalPayload::DacsAccept(dacs)))
            }
            PayloadHint::Ciphertext => {
                Ok((BlockType::CiphertextPayload, CanonicalPayload::Opaque))
            }
            PayloadHint::Plain => Ok((BlockType::Payload, CanonicalPayload::Opaque)),
        },
        4 => Ok((BlockType::PayloadConfidentiality, CanonicalPayload::Opaque)),
        6 => Ok((
            BlockType::PreviousNode,
            CanonicalPayload::PreviousNode(decode_eid(&mut cr)?),
        )),
        7 => Ok((
            BlockType::BundleAge,
            CanonicalPayload::BundleAge { age_ms: cr.uint()? },
        )),
        10 => {
            if cr.array()? != 2 {
                return Err(BpError::Codec("hop count must be a 2-array"));
            }
            Ok((
                BlockType::HopCount,
                CanonicalPayload::HopCount {
                    limit: cr.uint()?,
                    count: cr.uint()?,
                },
            ))
        }
        13 => Ok((
            BlockType::CustodyTracking,
            CanonicalPayload::CustodyTracking(decode_eid(&mut cr)?),
        )),
        _ => Err(BpError::Codec("unsupported canonical block type")),
    }
}

fn decode_custody_ack(cr: &mut Reader<'_>) -> BpResult<DacsPayload> {
    if cr.array()? != 2 {
        return Err(BpError::Codec("admin record must be a 2-array"));
    }
    if cr.uint()? != ADMIN_RECORD_CUSTODY_ACK {
        return Err(BpError::Codec("unsupported admin record type"));
    }
    if cr.array()? != 2 {
        return Err(BpError::Codec("custody ack must be a 2-array"));
    }
    let flow_source_eid = decode_eid(cr)?;
    let n = cr.array()?;
    if n as usize > DACS_MAX_SEQ_PER_PAYLOAD {
        return Err(BpError::Codec("DACS sequence list too long"));
    }
    let mut dacs = DacsPayload {
        flow_source_eid,
        ..Default::default()
    };
    for _ in 0..n {
        dacs.sequence_nums.push(cr.uint()?);
    }
    Ok(dacs)
}
