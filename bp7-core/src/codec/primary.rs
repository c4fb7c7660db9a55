//! Primary block encode/decode. The block is a definite-length CBOR array of
//! 8 elements, plus 2 when the bundle is a fragment, plus 1 when a CRC is
//! present. The CRC is computed over the whole array with the CRC field
//! zero-filled, then back-patched.

use crate::codec::cbor::{Reader, Writer};
use crate::codec::crc::CrcType;
use crate::codec::eid::{decode_eid, encode_eid};
use crate::codec::types::{BundleControlFlags, CreationTimestamp, PrimaryBlock};
use crate::error::{BpError, BpResult};

pub const BP_VERSION: u8 = 7;

fn element_count(flags: BundleControlFlags, crc_type: CrcType) -> u64 {
    let mut count = 8;
    if flags.is_fragment {
        count += 2;
    }
    if crc_type != CrcType::None {
        count += 1;
    }
    count
}

/// Encodes into `pri.encoded`, filling the CRC value and the cached block
/// size. A block already carrying an encode is left untouched.
pub fn encode(pri: &mut PrimaryBlock) -> BpResult<()> {
    if pri.block_encode_size != 0 && !pri.encoded.is_empty() {
        return Ok(());
    }
    if pri.version != BP_VERSION {
        return Err(BpError::Codec("unsupported bundle protocol version"));
    }

    let mut w = Writer::new();
    w.array(element_count(pri.flags, pri.crc_type));
    w.uint(u64::from(pri.version));
    w.uint(pri.flags.to_bits());
    w.uint(pri.crc_type as u64);
    encode_eid(&mut w, &pri.destination)?;
    encode_eid(&mut w, &pri.source)?;
    encode_eid(&mut w, &pri.report_to)?;
    w.array(2);
    w.uint(pri.timestamp.dtn_time_ms);
    w.uint(pri.timestamp.sequence);
    w.uint(pri.lifetime_ms);
    if pri.flags.is_fragment {
        w.uint(pri.fragment_offset);
        w.uint(pri.total_adu_length);
    }

    let crc_width = pri.crc_type.width();
    if crc_width > 0 {
        w.bytes_header(crc_width as u64);
        w.raw(&[0u8; 4][..crc_width]);
        let crc = pri.crc_type.compute(w.as_slice());
        let len = w.len();
        w.as_mut_slice()[len - crc_width..]
            .copy_from_slice(&crc.to_be_bytes()[4 - crc_width..]);
        pri.crc_value = crc;
    } else {
        pri.crc_value = 0;
    }

    pri.block_encode_size = w.len();
    pri.encoded = w.into_inner();
    Ok(())
}

/// Decodes one primary block from the front of `buf`, verifying the CRC and
/// retaining the consumed bytes as the block's encoded chunk.
pub fn decode(buf: &[u8]) -> BpResult<PrimaryBlock> {
    let mut r = Reader::new(buf);
    let count = r.array()?;

    let version = r.uint()?;
    if version != u64::from(BP_VERSION) {
        return Err(BpError::Codec("unsupported bundle protocol version"));
    }
    let flags = BundleControlFlags::from_bits(r.uint()?);
    let crc_type = CrcType::from_wire(r.uint()?)?;
    if count != element_count(flags, crc_type) {
        return Err(BpError::Codec("primary block element count mismatch"));
    }

    let destination = decode_eid(&mut r)?;
    let source = decode_eid(&mut r)?;
    let report_to = decode_eid(&mut r)?;

    if r.array()? != 2 {
        return Err(BpError::Codec("creation timestamp must be a 2-array"));
    }
    let timestamp = CreationTimestamp {
        dtn_time_ms: r.uint()?,
        sequence: r.uint()?,
    };
    let lifetime_ms = r.uint()?;
    let (fragment_offset, total_adu_length) = if flags.is_fragment {
        (r.uint()?, r.uint()?)
    } else {
        (0, 0)
    };

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

    let size = r.position();
    let mut pri = PrimaryBlock::new();
    pri.flags = flags;
    pri.crc_type = crc_type;
    pri.destination = destination;
    pri.source = source;
    pri.report_to = report_to;
    pri.timestamp = timestamp;
    pri.lifetime_ms = lifetime_ms;
    pri.fragment_offset = fragment_offset;
    pri.total_adu_length = total_adu_length;
    pri.crc_value = crc_value;
    pri.encoded = buf[..size].to_vec();
    pri.block_encode_size = size;
    Ok(pri)
}
