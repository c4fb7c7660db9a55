//! Property laws: codec round-trips, CRC bit-flip detection, red-black tree
//! ordering and structural invariants, and pool conservation.

use bp7_core::codec::canonical::{self, PayloadHint};
use bp7_core::codec::crc::CrcType;
use bp7_core::codec::primary;
use bp7_core::codec::types::{
    BlockType, BundleControlFlags, CanonicalBlock, CanonicalPayload, CreationTimestamp,
    EndpointId, PrimaryBlock,
};
use bp7_core::pool::RbTree;
use bp7_core::{Pool, PoolConfig};
use proptest::prelude::*;

fn arb_eid() -> impl Strategy<Value = EndpointId> {
    prop_oneof![
        Just(EndpointId::DtnNone),
        (0u64..1 << 40, 0u64..1 << 20).prop_map(|(n, s)| EndpointId::ipn(n, s)),
    ]
}

fn arb_crc_type() -> impl Strategy<Value = CrcType> {
    prop_oneof![
        Just(CrcType::None),
        Just(CrcType::Crc16X25),
        Just(CrcType::Crc32Castagnoli),
    ]
}

fn arb_primary() -> impl Strategy<Value = PrimaryBlock> {
    (
        arb_eid(),
        arb_eid(),
        arb_eid(),
        arb_crc_type(),
        any::<u64>(),
        0u64..1 << 50,
        0u64..1 << 40,
        any::<bool>(),
        any::<bool>(),
    )
        .prop_map(
            |(dest, src, rpt, crc, seq, ts, lifetime, admin, no_frag)| {
                let mut pri = PrimaryBlock::new();
                pri.flags = BundleControlFlags {
                    is_admin_record: admin,
                    must_not_fragment: no_frag,
                    ..Default::default()
                };
                pri.crc_type = crc;
                pri.destination = dest;
                pri.source = src;
                pri.report_to = rpt;
                pri.timestamp = CreationTimestamp {
                    dtn_time_ms: ts,
                    sequence: seq,
                };
                pri.lifetime_ms = lifetime;
                pri
            },
        )
}

proptest! {
    #[test]
    fn primary_round_trip(pri in arb_primary()) {
        let mut encoded = pri.clone();
        primary::encode(&mut encoded).unwrap();
        let decoded = primary::decode(&encoded.encoded).unwrap();
        prop_assert_eq!(decoded.flags, pri.flags);
        prop_assert_eq!(decoded.crc_type, pri.crc_type);
        prop_assert_eq!(decoded.destination, pri.destination);
        prop_assert_eq!(decoded.source, pri.source);
        prop_assert_eq!(decoded.report_to, pri.report_to);
        prop_assert_eq!(decoded.timestamp, pri.timestamp);
        prop_assert_eq!(decoded.lifetime_ms, pri.lifetime_ms);

        // re-encoding the decoded block is byte-identical
        let mut again = decoded;
        again.drop_encode();
        primary::encode(&mut again).unwrap();
        prop_assert_eq!(again.encoded, encoded.encoded);
    }

    #[test]
    fn crc_protected_flips_never_pass(pri in arb_primary(), byte_frac in 0.0f64..1.0, bit in 0u8..8) {
        prop_assume!(pri.crc_type != CrcType::None);
        let mut encoded = pri;
        primary::encode(&mut encoded).unwrap();
        let mut wire = encoded.encoded.clone();
        let idx = ((wire.len() - 1) as f64 * byte_frac) as usize;
        wire[idx] ^= 1 << bit;
        prop_assert!(primary::decode(&wire).is_err());
    }

    #[test]
    fn payload_block_round_trip(data in proptest::collection::vec(any::<u8>(), 0..2048), crc in arb_crc_type()) {
        let mut cb = CanonicalBlock::new(BlockType::Payload, 1, CanonicalPayload::Opaque);
        cb.crc_type = crc;
        canonical::encode_payload(&mut cb, &data).unwrap();
        let decoded = canonical::decode(&cb.encoded, PayloadHint::Plain).unwrap();
        prop_assert_eq!(decoded.content_bytes(), &data[..]);
        prop_assert_eq!(decoded.encoded, cb.encoded);
    }

    #[test]
    fn rbtree_iteration_sorted_and_balanced(keys in proptest::collection::vec(0u64..256, 1..200)) {
        let mut tree = RbTree::new();
        let mut handles = Vec::new();
        for (i, &k) in keys.iter().enumerate() {
            handles.push((tree.insert(k, i as u32), k));
            tree.check_invariants();
        }
        // ascending scan
        let mut seen = Vec::new();
        let mut cur = tree.first();
        while let Some(h) = cur {
            seen.push(tree.key(h));
            cur = tree.next(h);
        }
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        prop_assert_eq!(&seen, &sorted);

        // extract half, in scrambled order, invariants preserved
        for (i, (h, k)) in handles.iter().enumerate() {
            if i % 2 == 0 {
                prop_assert!(tree.is_member(*h));
                let (got, _) = tree.extract(*h);
                prop_assert_eq!(got, *k);
                tree.check_invariants();
            }
        }
        prop_assert_eq!(tree.len(), keys.len() / 2);
    }

    #[test]
    fn pool_conservation(ops in proptest::collection::vec(any::<bool>(), 1..200)) {
        let mut pool = Pool::with_block_count(128, PoolConfig::default()).unwrap();
        let baseline = pool.free_count();
        let mut live: Vec<bp7_core::BlockId> = Vec::new();
        for alloc in ops {
            if alloc {
                if let Ok(id) = pool.alloc_primary(PrimaryBlock::new()) {
                    live.push(id);
                }
            } else if let Some(id) = live.pop() {
                pool.recycle_block(id);
            }
            // free + recycle + live always accounts for every block
            prop_assert_eq!(
                pool.free_count() + pool.recycle_count() + live.len() as u32,
                baseline
            );
        }
        for id in live.drain(..) {
            pool.recycle_block(id);
        }
        pool.maintain_recycle(u32::MAX);
        prop_assert_eq!(pool.free_count(), baseline);
    }
}
