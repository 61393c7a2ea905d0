//! End-to-end routing scenarios with in-memory packet delivery.
//!
//! Each test builds real cores and shuttles their outbound packets between
//! them, so walks, relays and teardowns exercise the same code paths they
//! do in production.

use super::*;
use crate::config::RoutingConfig;
use crate::identity::{Key, TrailId, ID_SIZE};
use crate::wire::TrailPayload;
use rand::SeedableRng;
use std::cell::RefCell;
use std::rc::Rc;

const NOW: u64 = 1_000;

fn pid(v: u8) -> PeerId {
    PeerId::from_bytes([v; ID_SIZE])
}

fn key(v: u8) -> Key {
    Key::from_bytes([v; ID_SIZE])
}

// ------------------------------------------------------------------
// Mock collaborators
// ------------------------------------------------------------------

#[derive(Default)]
struct CacheLog {
    random_key: Option<Key>,
    find_successors: Vec<(TrailSerial, Key)>,
    gets: Vec<(TrailSerial, Key)>,
    puts: Vec<(Key, u64, Vec<PeerId>, Vec<u8>)>,
    results: Vec<(Key, u64, Vec<PeerId>, Vec<u8>)>,
}

struct MockCache(Rc<RefCell<CacheLog>>);

impl ContentCache for MockCache {
    fn get_random_key(&mut self) -> Option<Key> {
        self.0.borrow().random_key
    }

    fn find_successor(&mut self, trail: TrailSerial, key: Key) {
        self.0.borrow_mut().find_successors.push((trail, key));
    }

    fn handle_get(&mut self, trail: TrailSerial, key: Key) {
        self.0.borrow_mut().gets.push((trail, key));
    }

    fn handle_put(&mut self, key: Key, expiration_ms: u64, path: &[PeerId], value: &[u8]) {
        self.0
            .borrow_mut()
            .puts
            .push((key, expiration_ms, path.to_vec(), value.to_vec()));
    }

    fn deliver_result(&mut self, key: Key, expiration_ms: u64, put_path: &[PeerId], value: &[u8]) {
        self.0
            .borrow_mut()
            .results
            .push((key, expiration_ms, put_path.to_vec(), value.to_vec()));
    }
}

struct MockEstimator(u64);

impl SizeEstimator for MockEstimator {
    fn estimate(&self) -> u64 {
        self.0
    }
}

// ------------------------------------------------------------------
// Test network
// ------------------------------------------------------------------

struct Node {
    core: RoutingCore,
    rx: PacketRx,
    cache: Rc<RefCell<CacheLog>>,
}

fn node(id: u8, estimate: u64, config: RoutingConfig) -> Node {
    let (tx, rx) = packet_channel();
    let cache = Rc::new(RefCell::new(CacheLog::default()));
    let core = RoutingCore::with_rng(
        pid(id),
        config,
        tx,
        Box::new(MockCache(cache.clone())),
        Box::new(MockEstimator(estimate)),
        rand::rngs::StdRng::seed_from_u64(id as u64),
    );
    Node { core, rx, cache }
}

/// Deliver queued packets between nodes until the network is quiescent.
fn pump(nodes: &mut [&mut Node], now_ms: u64) {
    loop {
        let mut delivered = false;
        let mut in_flight = Vec::new();
        for node in nodes.iter_mut() {
            while let Ok(packet) = node.rx.try_recv() {
                in_flight.push((node.core.my_id(), packet));
            }
        }
        for (sender, packet) in in_flight {
            let dest = nodes
                .iter_mut()
                .find(|n| n.core.my_id() == packet.dest)
                .expect("packet to unknown node");
            dest.core
                .handle_datagram(sender, &packet.data, now_ms)
                .expect("delivery failed");
            delivered = true;
        }
        if !delivered {
            return;
        }
    }
}

fn linked_pair(estimate: u64, config: RoutingConfig) -> (Node, Node) {
    let mut a = node(1, estimate, config.clone());
    let mut b = node(2, estimate, config);
    a.core.on_peer_connect(pid(2), NOW);
    b.core.on_peer_connect(pid(1), NOW);
    (a, b)
}

// ------------------------------------------------------------------
// Walks and fingers
// ------------------------------------------------------------------

#[test]
fn test_walk_terminates_immediately_in_tiny_network() {
    // With a size estimate of 1 the hop budget is zero, so the first
    // recipient terminates the walk.
    let (mut a, mut b) = linked_pair(1, RoutingConfig::default());
    b.cache.borrow_mut().random_key = Some(key(42));

    a.core.process_timers(NOW);
    assert_eq!(a.core.stats().walks_launched, 1);
    pump(&mut [&mut a, &mut b], NOW);

    let ft = a.core.finger_table(0).unwrap();
    assert_eq!(ft.occupied(), 1);
    assert_eq!(ft.valid_count(), 1);
    assert_eq!(ft.get(0).unwrap().destination, Some(key(42)));
    assert_eq!(a.core.stats().fingers_completed, 1);
    // Both ends keep their segment alive for later routing.
    assert_eq!(a.core.trail_count(), 1);
    assert_eq!(b.core.trail_count(), 1);
}

#[test]
fn test_walk_extends_until_hop_budget() {
    // Estimate 4 gives a budget of 2 hops; in a two-node network the walk
    // bounces A -> B -> A -> B before terminating, and the response relays
    // back through every intermediate segment.
    let (mut a, mut b) = linked_pair(4, RoutingConfig::default());
    b.cache.borrow_mut().random_key = Some(key(9));

    a.core.process_timers(NOW);
    pump(&mut [&mut a, &mut b], NOW);

    assert_eq!(a.core.stats().fingers_completed, 1);
    assert_eq!(a.core.finger_table(0).unwrap().valid_count(), 1);
    // Origin segment plus one transit segment per node.
    assert_eq!(a.core.trail_count(), 2);
    assert_eq!(b.core.trail_count(), 2);
}

#[test]
fn test_walk_cycle_recycles_finger_slots() {
    let config = RoutingConfig {
        layers: Some(1),
        fingers_per_layer: Some(4),
        walk_interval_secs: Some(1),
        ..Default::default()
    };
    let (mut a, mut b) = linked_pair(1, config);
    b.cache.borrow_mut().random_key = Some(key(7));

    let mut now = NOW;
    for _ in 0..5 {
        a.core.process_timers(now);
        pump(&mut [&mut a, &mut b], now);
        now += 1_000;
    }

    assert_eq!(a.core.stats().walks_launched, 5);
    // The fifth walk wrapped around and replaced the slot-0 finger.
    let ft = a.core.finger_table(0).unwrap();
    assert_eq!(ft.occupied(), 4);
    assert_eq!(ft.valid_count(), 4);
    assert_eq!(a.core.trail_count(), 4);
    assert_eq!(a.core.stats().trails_destroyed, 1);
    // The teardown notification reached the far end too.
    assert_eq!(b.core.trail_count(), 4);
}

#[test]
fn test_walks_cycle_through_layers() {
    let config = RoutingConfig {
        layers: Some(3),
        walk_interval_secs: Some(1),
        ..Default::default()
    };
    let (mut a, mut b) = linked_pair(1, config);
    b.cache.borrow_mut().random_key = Some(key(5));

    let mut now = NOW;
    for _ in 0..3 {
        a.core.process_timers(now);
        pump(&mut [&mut a, &mut b], now);
        now += 1_000;
    }
    for layer in 0..3 {
        assert_eq!(a.core.finger_table(layer).unwrap().occupied(), 1);
    }
}

// ------------------------------------------------------------------
// Expiry and teardown
// ------------------------------------------------------------------

#[test]
fn test_trails_expire_and_notify_far_end() {
    let config = RoutingConfig {
        trail_timeout_secs: Some(10),
        walk_interval_secs: Some(3_600),
        ..Default::default()
    };
    let (mut a, mut b) = linked_pair(1, config);

    a.core.process_timers(NOW);
    pump(&mut [&mut a, &mut b], NOW);
    assert_eq!(a.core.trail_count(), 1);

    let late = NOW + 11_000;
    a.core.process_timers(late);
    assert_eq!(a.core.trail_count(), 0);
    assert_eq!(a.core.stats().trails_expired, 1);
    // B drops its segment when the destroy notification arrives (its own
    // expiry may race this; either way the trail is gone).
    pump(&mut [&mut a, &mut b], late);
    assert_eq!(b.core.trail_count(), 0);
}

#[test]
fn test_disconnect_tears_down_trails_without_notifying_lost_peer() {
    let (mut a, mut b) = linked_pair(1, RoutingConfig::default());
    a.core.process_timers(NOW);
    pump(&mut [&mut a, &mut b], NOW);
    assert_eq!(a.core.trail_count(), 1);

    a.core.on_peer_disconnect(pid(2));
    assert_eq!(a.core.friend_count(), 0);
    assert_eq!(a.core.trail_count(), 0);
    assert_eq!(a.core.finger_table(0).unwrap().occupied(), 0);
    // No friends left: the walk cycle stops and nothing is queued for the
    // departed peer.
    assert!(a.rx.try_recv().is_err());
    assert_eq!(a.core.next_wakeup_ms(), None);
}

#[test]
fn test_shutdown_drains_all_trails() {
    let (mut a, mut b) = linked_pair(1, RoutingConfig::default());
    a.core.process_timers(NOW);
    pump(&mut [&mut a, &mut b], NOW);

    b.core.shutdown();
    assert_eq!(b.core.trail_count(), 0);
    assert_eq!(b.core.friend_count(), 0);
    // A learns about the teardown.
    pump(&mut [&mut a, &mut b], NOW);
    assert_eq!(a.core.trail_count(), 0);
}

#[test]
fn test_concurrent_destroy_is_benign() {
    let (mut a, mut b) = linked_pair(1, RoutingConfig::default());
    a.core.process_timers(NOW);
    pump(&mut [&mut a, &mut b], NOW);

    // Both ends tear down at once; each receives a destroy for a trail it
    // no longer has.
    a.core.shutdown();
    b.core.shutdown();
    let mut undelivered = Vec::new();
    while let Ok(p) = a.rx.try_recv() {
        undelivered.push((pid(1), p));
    }
    while let Ok(p) = b.rx.try_recv() {
        undelivered.push((pid(2), p));
    }
    // Reconnect so delivery is accepted, then replay the stale destroys.
    a.core.on_peer_connect(pid(2), NOW);
    b.core.on_peer_connect(pid(1), NOW);
    for (sender, packet) in undelivered {
        let dest = if packet.dest == pid(1) { &mut a } else { &mut b };
        dest.core
            .handle_datagram(sender, &packet.data, NOW)
            .unwrap();
    }
    assert!(a.core.stats().benign_races + b.core.stats().benign_races >= 1);
}

// ------------------------------------------------------------------
// Payload routing
// ------------------------------------------------------------------

/// Build a linked pair with one completed finger and return its trail.
fn pair_with_finger() -> (Node, Node, TrailSerial) {
    let (mut a, mut b) = linked_pair(1, RoutingConfig::default());
    b.cache.borrow_mut().random_key = Some(key(42));
    a.core.process_timers(NOW);
    pump(&mut [&mut a, &mut b], NOW);
    let serial = a.core.closest_finger(0, &key(0)).unwrap();
    (a, b, serial)
}

#[test]
fn test_put_routed_to_trail_end_records_path() {
    let (mut a, mut b, serial) = pair_with_finger();
    let payload = TrailPayload::Put {
        key: key(3),
        expiration_ms: 9_999,
        value: b"hello".to_vec(),
    };
    a.core.route_on_trail(serial, true, &payload);
    pump(&mut [&mut a, &mut b], NOW);

    let log = b.cache.borrow();
    assert_eq!(log.puts.len(), 1);
    let (k, exp, path, value) = &log.puts[0];
    assert_eq!(*k, key(3));
    assert_eq!(*exp, 9_999);
    assert_eq!(path, &vec![pid(1)]);
    assert_eq!(value, b"hello");
}

#[test]
fn test_get_result_flows_back_to_origin() {
    let (mut a, mut b, serial) = pair_with_finger();
    a.core
        .route_on_trail(serial, false, &TrailPayload::Get { key: key(8) });
    pump(&mut [&mut a, &mut b], NOW);

    let (b_serial, k) = b.cache.borrow().gets[0];
    assert_eq!(k, key(8));

    b.core
        .send_get_result(b_serial, key(8), 5_000, &[pid(2)], b"value");
    pump(&mut [&mut a, &mut b], NOW);

    let log = a.cache.borrow();
    assert_eq!(log.results.len(), 1);
    let (k, exp, put_path, value) = &log.results[0];
    assert_eq!(*k, key(8));
    assert_eq!(*exp, 5_000);
    assert_eq!(put_path, &vec![pid(2)]);
    assert_eq!(value, b"value");
}

#[test]
fn test_find_successor_dispatched_at_trail_end() {
    let (mut a, mut b, serial) = pair_with_finger();
    a.core
        .route_on_trail(serial, false, &TrailPayload::FindSuccessor { key: key(6) });
    pump(&mut [&mut a, &mut b], NOW);
    assert_eq!(b.cache.borrow().find_successors[0].1, key(6));
    assert_eq!(b.core.stats().payloads_dispatched, 1);
}

#[test]
fn test_local_put_stores_with_empty_path() {
    let mut a = node(1, 1, RoutingConfig::default());
    a.core.handle_local_put(key(1), 100, b"local");
    let log = a.cache.borrow();
    assert_eq!(log.puts.len(), 1);
    assert!(log.puts[0].2.is_empty());
}

#[test]
fn test_get_result_without_pred_delivers_locally() {
    let (mut a, _b, serial) = pair_with_finger();
    // A is the origin of the trail; answering on it delivers to A itself.
    a.core.send_get_result(serial, key(4), 0, &[], b"mine");
    assert_eq!(a.cache.borrow().results.len(), 1);
}

// ------------------------------------------------------------------
// Hostile and racy input
// ------------------------------------------------------------------

#[test]
fn test_datagram_from_unknown_peer_rejected() {
    let mut a = node(1, 1, RoutingConfig::default());
    let msg = ControlMessage::TrailDestroy {
        trail_id: TrailId::from_bytes([1; 32]),
    };
    let err = a.core.handle_datagram(pid(9), &msg.encode(), NOW);
    assert!(matches!(err, Err(RoutingError::UnknownPeer(p)) if p == pid(9)));
}

#[test]
fn test_malformed_datagram_counted_as_violation() {
    let (mut a, _b) = linked_pair(1, RoutingConfig::default());
    let err = a.core.handle_datagram(pid(2), &[0xff, 0x00, 0x04, 0x00], NOW);
    assert!(matches!(err, Err(RoutingError::Wire { .. })));
    assert_eq!(a.core.stats().protocol_violations, 1);
}

#[test]
fn test_walk_with_out_of_range_layer_rejected() {
    let (mut a, _b) = linked_pair(1, RoutingConfig::default());
    let msg = ControlMessage::RandomWalk {
        hops_taken: 0,
        layer: 99,
        trail_id: TrailId::from_bytes([1; 32]),
    };
    let err = a.core.handle_datagram(pid(2), &msg.encode(), NOW);
    assert!(matches!(err, Err(RoutingError::ProtocolViolation { .. })));
    assert_eq!(a.core.trail_count(), 0);
}

#[test]
fn test_walk_reusing_live_id_rejected() {
    let (mut a, _b) = linked_pair(1, RoutingConfig::default());
    let msg = ControlMessage::RandomWalk {
        hops_taken: 9,
        layer: 0,
        trail_id: TrailId::from_bytes([1; 32]),
    };
    a.core.handle_datagram(pid(2), &msg.encode(), NOW).unwrap();
    assert_eq!(a.core.trail_count(), 1);
    let err = a.core.handle_datagram(pid(2), &msg.encode(), NOW);
    assert!(matches!(err, Err(RoutingError::ProtocolViolation { .. })));
}

#[test]
fn test_route_for_unknown_trail_is_benign() {
    let (mut a, _b) = linked_pair(1, RoutingConfig::default());
    let msg = ControlMessage::TrailRoute {
        record_path: false,
        path: vec![],
        trail_id: TrailId::from_bytes([5; 32]),
        payload: TrailPayload::Get { key: key(1) }.encode(),
    };
    a.core.handle_datagram(pid(2), &msg.encode(), NOW).unwrap();
    assert_eq!(a.core.stats().benign_races, 1);
}

#[test]
fn test_route_with_path_but_no_recording_rejected() {
    let (mut a, _b) = linked_pair(1, RoutingConfig::default());
    let msg = ControlMessage::TrailRoute {
        record_path: false,
        path: vec![pid(7)],
        trail_id: TrailId::from_bytes([5; 32]),
        payload: TrailPayload::Get { key: key(1) }.encode(),
    };
    let err = a.core.handle_datagram(pid(2), &msg.encode(), NOW);
    assert!(matches!(err, Err(RoutingError::ProtocolViolation { .. })));
}

fn walk_id(data: &[u8]) -> TrailId {
    match ControlMessage::decode(data).unwrap() {
        ControlMessage::RandomWalk { trail_id, .. } => trail_id,
        other => panic!("expected a walk, got {other:?}"),
    }
}

#[test]
fn test_transit_hop_relays_unrecognized_payload() {
    // Estimate 4: the walk extends through B, leaving B with a transit
    // segment. A payload type B does not recognize must still be relayed
    // untouched; only the trail ends inspect it.
    let (mut a, mut b) = linked_pair(4, RoutingConfig::default());
    a.core.process_timers(NOW);
    let walk = a.rx.try_recv().unwrap();
    let inbound_id = walk_id(&walk.data);
    b.core.handle_datagram(pid(1), &walk.data, NOW).unwrap();
    let onward_id = walk_id(&b.rx.try_recv().unwrap().data);

    let payload = vec![0x7f, 0x00, 0x04, 0x00];
    let msg = ControlMessage::TrailRoute {
        record_path: false,
        path: vec![],
        trail_id: inbound_id,
        payload: payload.clone(),
    };
    b.core.handle_datagram(pid(1), &msg.encode(), NOW).unwrap();

    let relayed = b.rx.try_recv().unwrap();
    assert_eq!(relayed.dest, pid(1));
    match ControlMessage::decode(&relayed.data).unwrap() {
        ControlMessage::TrailRoute {
            trail_id,
            payload: forwarded,
            ..
        } => {
            assert_eq!(trail_id, onward_id);
            assert_eq!(forwarded, payload);
        }
        other => panic!("expected a relayed route, got {other:?}"),
    }
    assert_eq!(b.core.stats().protocol_violations, 0);
    assert_eq!(b.core.stats().messages_forwarded, 1);
}

#[test]
fn test_unrecognized_payload_rejected_at_trail_end() {
    // Estimate 1: B terminates the walk, so its segment ends there and the
    // payload type finally matters.
    let (mut a, mut b) = linked_pair(1, RoutingConfig::default());
    a.core.process_timers(NOW);
    let walk = a.rx.try_recv().unwrap();
    let inbound_id = walk_id(&walk.data);
    b.core.handle_datagram(pid(1), &walk.data, NOW).unwrap();

    let msg = ControlMessage::TrailRoute {
        record_path: false,
        path: vec![],
        trail_id: inbound_id,
        payload: vec![0x7f, 0x00, 0x04, 0x00],
    };
    let err = b.core.handle_datagram(pid(1), &msg.encode(), NOW);
    assert!(matches!(err, Err(RoutingError::Wire { .. })));
    assert_eq!(b.core.stats().protocol_violations, 1);
    assert_eq!(b.core.stats().payloads_dispatched, 0);
}

#[test]
fn test_stale_walk_response_is_benign() {
    let (mut a, _b) = linked_pair(1, RoutingConfig::default());
    let msg = ControlMessage::RandomWalkResponse {
        trail_id: TrailId::from_bytes([3; 32]),
        location: key(1),
    };
    a.core.handle_datagram(pid(2), &msg.encode(), NOW).unwrap();
    assert_eq!(a.core.stats().benign_races, 1);
}

// ------------------------------------------------------------------
// Timers
// ------------------------------------------------------------------

#[test]
fn test_next_wakeup_tracks_walk_and_expiry() {
    let config = RoutingConfig {
        trail_timeout_secs: Some(100),
        walk_interval_secs: Some(60),
        ..Default::default()
    };
    let (mut a, mut b) = linked_pair(1, config);
    // Walk cycle armed at connect time.
    assert_eq!(a.core.next_wakeup_ms(), Some(NOW));

    a.core.process_timers(NOW);
    pump(&mut [&mut a, &mut b], NOW);
    // Next walk at NOW + 60s comes before trail expiry at NOW + 100s.
    assert_eq!(a.core.next_wakeup_ms(), Some(NOW + 60_000));
}

#[test]
fn test_walk_cycle_waits_for_first_friend() {
    let mut a = node(1, 1, RoutingConfig::default());
    assert_eq!(a.core.next_wakeup_ms(), None);
    a.core.process_timers(NOW);
    assert_eq!(a.core.stats().walks_launched, 0);

    a.core.on_peer_connect(pid(2), NOW);
    assert_eq!(a.core.next_wakeup_ms(), Some(NOW));
}
