//! Logical bundle data types mirroring RFC 9171 section 4: endpoint IDs,
//! processing-control flags, the primary block, and canonical block payloads.

use crate::codec::crc::CrcType;
use crate::error::{BpError, BpResult};
use crate::pool::{BlockId, IntfId};
use smallvec::SmallVec;
use std::fmt;

/// Maximum sequence numbers carried by a single DACS payload.
pub const DACS_MAX_SEQ_PER_PAYLOAD: usize = 16;

/// Administrative record type for a deferred-ack custody signal.
pub const ADMIN_RECORD_CUSTODY_ACK: u64 = 4;

/// An `ipn` scheme endpoint: 64-bit node and service numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct IpnAddress {
    pub node: u64,
    pub service: u64,
}

impl IpnAddress {
    pub fn new(node: u64, service: u64) -> Self {
        Self { node, service }
    }
}

impl fmt::Display for IpnAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ipn:{}.{}", self.node, self.service)
    }
}

/// An endpoint identifier. Only the `ipn` scheme and the special `dtn:none`
/// endpoint are supported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EndpointId {
    /// Scheme not yet assigned; never valid on the wire.
    #[default]
    Undefined,
    /// The null endpoint `dtn:none`.
    DtnNone,
    Ipn(IpnAddress),
}

impl EndpointId {
    pub fn ipn(node: u64, service: u64) -> Self {
        EndpointId::Ipn(IpnAddress::new(node, service))
    }

    pub fn as_ipn(&self) -> Option<IpnAddress> {
        match self {
            EndpointId::Ipn(addr) => Some(*addr),
            _ => None,
        }
    }

    pub fn is_none_endpoint(&self) -> bool {
        matches!(self, EndpointId::DtnNone)
    }
}

impl From<IpnAddress> for EndpointId {
    fn from(addr: IpnAddress) -> Self {
        EndpointId::Ipn(addr)
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointId::Undefined => write!(f, "<undefined>"),
            EndpointId::DtnNone => write!(f, "dtn:none"),
            EndpointId::Ipn(addr) => write!(f, "{addr}"),
        }
    }
}

/// Bundle processing control flags, RFC 9171 section 4.2.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BundleControlFlags {
    pub is_fragment: bool,
    pub is_admin_record: bool,
    pub must_not_fragment: bool,
    pub ack_requested: bool,
    pub status_time_requested: bool,
    pub reception_report_requested: bool,
    pub forwarding_report_requested: bool,
    pub delivery_report_requested: bool,
    pub deletion_report_requested: bool,
}

impl BundleControlFlags {
    pub fn to_bits(self) -> u64 {
        let mut bits = 0u64;
        if self.is_fragment {
            bits |= 0x00_0001;
        }
        if self.is_admin_record {
            bits |= 0x00_0002;
        }
        if self.must_not_fragment {
            bits |= 0x00_0004;
        }
        if self.ack_requested {
            bits |= 0x00_0020;
        }
        if self.status_time_requested {
            bits |= 0x00_0040;
        }
        if self.reception_report_requested {
            bits |= 0x00_4000;
        }
        if self.forwarding_report_requested {
            bits |= 0x01_0000;
        }
        if self.delivery_report_requested {
            bits |= 0x02_0000;
        }
        if self.deletion_report_requested {
            bits |= 0x04_0000;
        }
        bits
    }

    pub fn from_bits(bits: u64) -> Self {
        Self {
            is_fragment: bits & 0x00_0001 != 0,
            is_admin_record: bits & 0x00_0002 != 0,
            must_not_fragment: bits & 0x00_0004 != 0,
            ack_requested: bits & 0x00_0020 != 0,
            status_time_requested: bits & 0x00_0040 != 0,
            reception_report_requested: bits & 0x00_4000 != 0,
            forwarding_report_requested: bits & 0x01_0000 != 0,
            delivery_report_requested: bits & 0x02_0000 != 0,
            deletion_report_requested: bits & 0x04_0000 != 0,
        }
    }
}

/// Block processing control flags, RFC 9171 section 4.2.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockControlFlags {
    pub must_replicate: bool,
    pub xmit_status: bool,
    pub must_delete: bool,
    pub must_remove: bool,
}

impl BlockControlFlags {
    pub fn to_bits(self) -> u64 {
        let mut bits = 0u64;
        if self.must_replicate {
            bits |= 0x01;
        }
        if self.xmit_status {
            bits |= 0x02;
        }
        if self.must_delete {
            bits |= 0x04;
        }
        if self.must_remove {
            bits |= 0x10;
        }
        bits
    }

    pub fn from_bits(bits: u64) -> Self {
        Self {
            must_replicate: bits & 0x01 != 0,
            xmit_status: bits & 0x02 != 0,
            must_delete: bits & 0x04 != 0,
            must_remove: bits & 0x10 != 0,
        }
    }
}

/// Bundle creation timestamp: DTN milliseconds plus a sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CreationTimestamp {
    pub dtn_time_ms: u64,
    pub sequence: u64,
}

/// How the local node handles a bundle after egress handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryPolicy {
    /// Best effort; the egress CLA is the implicit custodian.
    #[default]
    None,
    /// Store locally and acknowledge locally; no node-to-node custody signals.
    LocalAck,
    /// Full custody transfer with DACS acknowledgement.
    CustodyTracking,
}

/// Local delivery metadata attached to a primary block; never on the wire.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeliveryData {
    pub policy: DeliveryPolicy,
    pub ingress_intf: IntfId,
    pub ingress_time_ms: u64,
    pub egress_intf: IntfId,
    pub egress_time_ms: u64,
    pub storage_intf: IntfId,
    pub committed_storage_id: u64,
    pub local_retx_interval_ms: u64,
}

/// The primary bundle block (RFC 9171 section 4.3.1) plus local delivery
/// metadata and the cached encode of the block and of the whole bundle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrimaryBlock {
    pub version: u8,
    pub flags: BundleControlFlags,
    pub crc_type: CrcType,
    pub destination: EndpointId,
    pub source: EndpointId,
    pub report_to: EndpointId,
    pub timestamp: CreationTimestamp,
    pub lifetime_ms: u64,
    pub fragment_offset: u64,
    pub total_adu_length: u64,
    pub crc_value: u32,

    pub delivery: DeliveryData,

    /// Canonical blocks in wire order, the payload block last.
    pub canonicals: Vec<BlockId>,

    /// Encoded bytes of the primary block alone.
    pub encoded: Vec<u8>,
    /// Cached encoded size of the primary block alone (0 = not encoded).
    pub block_encode_size: usize,
    /// Cached encoded size of the whole bundle (0 = not computed).
    pub bundle_encode_size: usize,
}

impl PrimaryBlock {
    pub fn new() -> Self {
        Self {
            version: 7,
            ..Self::default()
        }
    }

    /// Unique-per-source bundle identity: (source node, service, sequence).
    pub fn bundle_id(&self) -> BpResult<(IpnAddress, u64)> {
        let src = self
            .source
            .as_ipn()
            .ok_or(BpError::Codec("bundle source is not an ipn endpoint"))?;
        Ok((src, self.timestamp.sequence))
    }

    pub fn expire_time_ms(&self) -> u64 {
        self.timestamp.dtn_time_ms.saturating_add(self.lifetime_ms)
    }

    /// Invalidate the cached whole-bundle encode (e.g. after a canonical
    /// block was added or rewritten).
    pub fn drop_bundle_encode(&mut self) {
        self.bundle_encode_size = 0;
    }

    pub fn drop_encode(&mut self) {
        self.encoded.clear();
        self.block_encode_size = 0;
        self.bundle_encode_size = 0;
    }
}

/// Canonical block types, wire values per the IANA registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    Payload,
    PayloadConfidentiality,
    PreviousNode,
    BundleAge,
    HopCount,
    CustodyTracking,
    /// Payload block carrying an administrative record (local-only type).
    AdminRecordPayload,
    /// Payload block carrying ciphertext (local-only type; bpsec data is
    /// recognized but never processed).
    CiphertextPayload,
    /// Payload block carrying a DACS custody-accept record (local-only type).
    DacsPayload,
}

impl BlockType {
    /// The block type emitted on the wire. The local-only payload variants
    /// all encode as type 1 to satisfy RFC 9171's payload-block requirement.
    pub fn wire_value(self) -> u64 {
        match self {
            BlockType::Payload
            | BlockType::AdminRecordPayload
            | BlockType::CiphertextPayload
            | BlockType::DacsPayload => 1,
            BlockType::PayloadConfidentiality => 4,
            BlockType::PreviousNode => 6,
            BlockType::BundleAge => 7,
            BlockType::HopCount => 10,
            BlockType::CustodyTracking => 13,
        }
    }
}

/// Custody-accept payload of a DACS bundle: the flow source endpoint plus the
/// creation sequence numbers being acknowledged.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DacsPayload {
    pub flow_source_eid: EndpointId,
    pub sequence_nums: SmallVec<[u64; DACS_MAX_SEQ_PER_PAYLOAD]>,
}

impl DacsPayload {
    pub fn is_full(&self) -> bool {
        self.sequence_nums.len() >= DACS_MAX_SEQ_PER_PAYLOAD
    }
}

/// Decoded logical content of a canonical block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanonicalPayload {
    PreviousNode(EndpointId),
    BundleAge { age_ms: u64 },
    HopCount { limit: u64, count: u64 },
    CustodyTracking(EndpointId),
    DacsAccept(DacsPayload),
    /// Opaque content; the bytes live in the block's encoded chunk at
    /// `content_offset..content_offset + content_length`.
    Opaque,
}

/// A canonical block: wire header, CRC, the logical payload, and the cached
/// encode with the content span's offset into it.
#[derive(Debug, Clone)]
pub struct CanonicalBlock {
    pub block_type: BlockType,
    pub block_num: u64,
    pub crc_type: CrcType,
    pub flags: BlockControlFlags,
    pub crc_value: u32,
    pub payload: CanonicalPayload,

    /// Encoded bytes of this block (outer CBOR array).
    pub encoded: Vec<u8>,
    /// Cached encoded size (0 = not encoded).
    pub block_encode_size: usize,
    /// Offset of the content byte string's contents within `encoded`.
    pub content_offset: usize,
    pub content_length: usize,
}

impl CanonicalBlock {
    pub fn new(block_type: BlockType, block_num: u64, payload: CanonicalPayload) -> Self {
        Self {
            block_type,
            block_num,
            crc_type: CrcType::None,
            flags: BlockControlFlags::default(),
            crc_value: 0,
            payload,
            encoded: Vec::new(),
            block_encode_size: 0,
            content_offset: 0,
            content_length: 0,
        }
    }

    /// The content bytes, valid only once encoded or decoded.
    pub fn content_bytes(&self) -> &[u8] {
        &self.encoded[self.content_offset..self.content_offset + self.content_length]
    }

    pub fn drop_encode(&mut self) {
        self.encoded.clear();
        self.block_encode_size = 0;
        self.content_offset = 0;
        self.content_length = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_flag_bits_round_trip() {
        let flags = BundleControlFlags {
            must_not_fragment: true,
            is_admin_record: true,
            delivery_report_requested: true,
            ..Default::default()
        };
        assert_eq!(flags.to_bits(), 0x02_0006);
        assert_eq!(BundleControlFlags::from_bits(flags.to_bits()), flags);
        assert_eq!(BundleControlFlags::from_bits(0x04).to_bits(), 0x04);
    }

    #[test]
    fn block_flag_bits_round_trip() {
        let flags = BlockControlFlags {
            must_remove: true,
            xmit_status: true,
            ..Default::default()
        };
        assert_eq!(flags.to_bits(), 0x12);
        assert_eq!(BlockControlFlags::from_bits(0x12), flags);
    }

    #[test]
    fn endpoint_display() {
        assert_eq!(EndpointId::ipn(100, 1).to_string(), "ipn:100.1");
        assert_eq!(EndpointId::DtnNone.to_string(), "dtn:none");
    }

    #[test]
    fn special_payload_types_encode_as_payload() {
        assert_eq!(BlockType::Payload.wire_value(), 1);
        assert_eq!(BlockType::AdminRecordPayload.wire_value(), 1);
        assert_eq!(BlockType::DacsPayload.wire_value(), 1);
        assert_eq!(BlockType::CustodyTracking.wire_value(), 13);
    }

    #[test]
    fn expire_time_saturates() {
        let mut pri = PrimaryBlock::new();
        pri.timestamp.dtn_time_ms = u64::MAX - 10;
        pri.lifetime_ms = 100;
        assert_eq!(pri.expire_time_ms(), u64::MAX);
    }
}
