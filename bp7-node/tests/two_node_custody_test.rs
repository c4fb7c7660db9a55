//! End-to-end custody convergence between two in-process nodes, with the
//! wire shuttled by hand instead of a UDP socket: the sender keeps custody
//! and retransmit state until the receiver's DACS arrives, then deletes.

use bp7_core::codec::bundle;
use bp7_core::events::HostProxies;
use bp7_core::pool::FlowDir;
use bp7_core::time::ManualMonotonic;
use bp7_core::{IntfId, IpnAddress, PoolConfig};
use bp7_node::{cla, Node, NodeConfig, RouteEntry, SendOptions};
use std::sync::Arc;

fn make_node(node_num: u64, clock: Arc<ManualMonotonic>) -> (Node, IntfId, IntfId) {
    let node = Node::new(
        NodeConfig {
            local_addr: IpnAddress::new(node_num, 1),
            pool_blocks: 1024,
            pool: PoolConfig::default(),
            time_file: None,
        },
        clock,
        HostProxies::default(),
    )
    .unwrap();
    let svc = node.attach_service(IpnAddress::new(node_num, 1)).unwrap();
    node.attach_storage().unwrap();
    let cla_intf = node.attach_cla(64, 64).unwrap();
    node.add_route(RouteEntry {
        dest: 0,
        mask: 0,
        intf: cla_intf,
        local_retx_interval_ms: 15_000,
    });
    (node, svc, cla_intf)
}

/// Pulls everything waiting on the CLA's egress and returns the encoded
/// bundles, stamping each send as complete.
fn shuttle_out(node: &Node, intf: IntfId) -> Vec<Vec<u8>> {
    let pool = node.pool();
    pool.with(|p| {
        let mut out = Vec::new();
        while let Some(rblk) = p.flow_try_pull(intf.block(), FlowDir::Egress) {
            if let Some(pri) = p.ref_target(rblk) {
                let mut wire = Vec::new();
                if bundle::encode_bundle(p, pri, &mut wire).is_ok() {
                    if let Some(pb) = p.primary_mut(pri) {
                        pb.delivery.egress_intf = intf;
                    }
                    out.push(wire);
                }
            }
            p.recycle_block(rblk);
        }
        p.maintain_recycle(u32::MAX);
        out
    })
}

#[test]
fn custody_transfer_converges_across_two_nodes() {
    let clock_a = Arc::new(ManualMonotonic::new(0, 1_700_000_000_000, true));
    let clock_b = Arc::new(ManualMonotonic::new(0, 1_700_000_000_000, true));
    let (node_a, _svc_a, cla_a) = make_node(100, clock_a.clone());
    let (node_b, svc_b, cla_b) = make_node(200, clock_b.clone());

    let advance = |ms: i64| {
        clock_a.advance(ms);
        clock_b.advance(ms);
    };

    node_a
        .send(
            IpnAddress::new(100, 1),
            IpnAddress::new(200, 1),
            b"hello world\n",
            SendOptions {
                custody: true,
                ..Default::default()
            },
        )
        .unwrap();

    // A stores under custody and queues it out its CLA
    node_a.tick();
    node_a.tick();
    let wires = shuttle_out(&node_a, cla_a);
    assert_eq!(wires.len(), 1, "one bundle leaves A");
    assert_eq!(node_a.cache_counters().unwrap().stored, 1);

    // B receives it, takes custody, opens a DACS, and delivers the payload
    cla::ingress(&node_b.pool(), cla_b, &wires[0]);
    node_b.tick();
    node_b.tick();
    let b_counters = node_b.cache_counters().unwrap();
    assert_eq!(b_counters.stored, 1, "B holds the bundle under custody");
    assert_eq!(b_counters.open_dacs, 1, "B owes A an acknowledgement");
    let payload = node_b.receive(svc_b, None).expect("payload delivered");
    assert_eq!(payload, b"hello world\n");

    // the aggregation window closes and the DACS flows back to A
    let mut dacs_wires = Vec::new();
    for _ in 0..6 {
        advance(1_200);
        node_b.tick();
        node_b.tick();
        dacs_wires.extend(shuttle_out(&node_b, cla_b));
        if !dacs_wires.is_empty() {
            break;
        }
    }
    assert_eq!(dacs_wires.len(), 1, "exactly one DACS emitted");

    cla::ingress(&node_a.pool(), cla_a, &dacs_wires[0]);
    node_a.tick();
    node_a.tick();

    // custody released; after the revisit and age-out, A discards the entry
    for _ in 0..6 {
        advance(11_000);
        node_a.tick();
        node_a.tick();
    }
    let a_counters = node_a.cache_counters().unwrap();
    assert_eq!(a_counters.stored, 0, "A's copy is gone");
    assert!(a_counters.discards >= 1, "A recycled the entry");
}

#[test]
fn non_custody_bundle_bypasses_storage() {
    let clock = Arc::new(ManualMonotonic::new(0, 1_700_000_000_000, true));
    let (node, _svc, cla_intf) = make_node(100, clock);

    node.send(
        IpnAddress::new(100, 1),
        IpnAddress::new(200, 1),
        b"best effort",
        SendOptions::default(),
    )
    .unwrap();
    node.tick();
    let wires = shuttle_out(&node, cla_intf);
    assert_eq!(wires.len(), 1);
    assert_eq!(
        node.cache_counters().unwrap().stored,
        0,
        "best-effort bundles never enter the cache"
    );
}

#[test]
fn local_loopback_delivery() {
    let clock = Arc::new(ManualMonotonic::new(0, 1_700_000_000_000, true));
    let (node, svc, _cla) = make_node(100, clock);

    node.send(
        IpnAddress::new(100, 1),
        IpnAddress::new(100, 1),
        b"to myself",
        SendOptions::default(),
    )
    .unwrap();
    node.tick();
    let payload = node.receive(svc, None).expect("loopback delivery");
    assert_eq!(payload, b"to myself");
}
