//! End-to-end tests for the delivery engines.
//!
//! Each test drives real servers through a simulator or cluster and checks
//! the protocol invariants with the [`Checker`].

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::thread;
use std::time::Duration;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::protocol::{
    InFlightMessage, LoggedEvent, Message, ProtocolError, ServerId, SnapshotId, SnapshotStatus,
};

use super::*;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn id(s: &str) -> ServerId {
    ServerId::from(s)
}

const RING: &str = "\
3
A 10
B 0
C 0
A B
B C
C A
";

/// Four servers, every ordered pair linked.
const MESH: &str = "\
4
N1 25
N2 25
N3 25
N4 25
N1 N2
N1 N3
N1 N4
N2 N1
N2 N3
N2 N4
N3 N1
N3 N2
N3 N4
N4 N1
N4 N2
N4 N3
";

const MESH_EVENTS: &str = "\
send N1 N2 5
send N2 N3 10
tick
send N3 N4 7
snapshot N1
send N4 N1 3
tick 2
send N2 N1 4
send N1 N3 9
snapshot N3
tick
send N3 N2 11
send N4 N2 6
tick 3
send N2 N4 12
";

fn run_checked(sim: &Simulator, checker: &Checker, snapshot_ids: &[SnapshotId]) {
    let servers = sim.servers();
    let live = checker.verify_live(&servers);
    assert!(live.passed, "{:?}", live.violations);
    for &snapshot_id in snapshot_ids {
        let result = checker.verify_snapshot(snapshot_id, &servers);
        assert!(result.passed, "snapshot {}: {:?}", snapshot_id, result.violations);
    }
    let completions = checker.verify_completions(&sim.duplicate_completions());
    assert!(completions.passed, "{:?}", completions.violations);
}

/// Rebuild, from the event log, the channel state each server should have
/// recorded: transfers delivered after its local trigger and before the
/// marker on the same link.
fn expected_channel_state(
    events: &[LoggedEvent],
    snapshot_id: SnapshotId,
) -> BTreeMap<ServerId, Vec<InFlightMessage>> {
    let mut started: BTreeSet<ServerId> = BTreeSet::new();
    let mut markers: HashMap<ServerId, BTreeSet<ServerId>> = HashMap::new();
    let mut expected: BTreeMap<ServerId, Vec<InFlightMessage>> = BTreeMap::new();

    for event in events {
        match event {
            LoggedEvent::SnapshotStarted { server, snapshot_id: sid } if *sid == snapshot_id => {
                started.insert(server.clone());
            }
            LoggedEvent::Received {
                src,
                dest,
                message: Message::Marker { snapshot_id: sid },
            } if *sid == snapshot_id => {
                started.insert(dest.clone());
                markers.entry(dest.clone()).or_default().insert(src.clone());
            }
            LoggedEvent::Received {
                src,
                dest,
                message: message @ Message::Token { .. },
            } => {
                let marker_seen = markers.get(dest).map(|m| m.contains(src)).unwrap_or(false);
                if started.contains(dest) && !marker_seen {
                    expected.entry(dest.clone()).or_default().push(InFlightMessage {
                        src: src.clone(),
                        dest: dest.clone(),
                        message: *message,
                    });
                }
            }
            _ => {}
        }
    }
    expected
}

#[test]
fn test_ring_scenario_across_seeds() {
    init_logging();
    let topology = Topology::parse(RING).unwrap();
    let checker = Checker::for_topology(&topology);

    for seed in 0..50 {
        let config = SimConfig {
            seed,
            ..SimConfig::default()
        };
        let mut sim = Simulator::from_topology(&topology, config).unwrap();

        sim.send_tokens(&id("A"), &id("B"), 3).unwrap();
        let snapshot_id = sim.start_snapshot(&id("A")).unwrap();
        assert_eq!(snapshot_id, 0);

        while !sim.is_snapshot_complete(snapshot_id) {
            sim.tick();
            assert_eq!(sim.total_tokens(), 10, "seed {}", seed);
            assert!(sim.time() < 1_000, "seed {} stalled", seed);
        }
        run_checked(&sim, &checker, &[snapshot_id]);

        // The 3 tokens show up exactly once: in B's balance or on A -> B.
        let b = sim.server(&id("B")).unwrap().snapshot(snapshot_id).unwrap();
        let as_local = b.local_tokens() == 3;
        let as_channel = b.in_flight_tokens() == 3;
        assert!(as_local ^ as_channel, "seed {}: {:?}", seed, b);
    }
}

#[test]
fn test_mesh_script_snapshots_are_consistent() {
    init_logging();
    let topology = Topology::parse(MESH).unwrap();
    let script = Script::parse(MESH_EVENTS).unwrap();
    let checker = Checker::for_topology(&topology);

    let mut sim = Simulator::from_topology(&topology, SimConfig::default()).unwrap();
    sim.run_script(&script).unwrap();

    assert_eq!(sim.started_snapshots(), &[0, 1]);
    for &snapshot_id in sim.started_snapshots() {
        assert!(sim.is_snapshot_complete(snapshot_id));
        assert_eq!(sim.completed_servers(snapshot_id).len(), 4);
    }
    run_checked(&sim, &checker, &[0, 1]);

    sim.run_until_quiet().unwrap();
    assert_eq!(sim.total_tokens(), 100);
    assert_eq!(
        sim.servers().iter().map(|s| s.tokens()).sum::<u64>(),
        100
    );
}

#[test]
fn test_recorded_channel_state_matches_marker_boundary() {
    let topology = Topology::parse(MESH).unwrap();
    let script = Script::parse(MESH_EVENTS).unwrap();

    for seed in [1, 7, 42, 1234] {
        let config = SimConfig {
            seed,
            max_delay: 8,
            ..SimConfig::default()
        };
        let mut sim = Simulator::from_topology(&topology, config).unwrap();
        sim.run_script(&script).unwrap();

        let events = sim.log().events();
        for &snapshot_id in sim.started_snapshots() {
            let expected = expected_channel_state(&events, snapshot_id);
            for server in sim.servers() {
                let recorded = server.snapshot(snapshot_id).unwrap().messages;
                let wanted = expected.get(server.id()).cloned().unwrap_or_default();
                assert_eq!(
                    recorded, wanted,
                    "seed {} snapshot {} server {}",
                    seed, snapshot_id, server.id()
                );
            }
        }
    }
}

#[test]
fn test_same_seed_same_run() {
    let topology = Topology::parse(MESH).unwrap();
    let script = Script::parse(MESH_EVENTS).unwrap();

    let render = |seed| {
        let config = SimConfig {
            seed,
            ..SimConfig::default()
        };
        let mut sim = Simulator::from_topology(&topology, config).unwrap();
        sim.run_script(&script).unwrap();
        sim.log().render()
    };

    assert_eq!(render(99), render(99));
}

#[test]
fn test_fatal_send_halts_simulator() {
    let topology = Topology::parse("2\nA 2\nB 0\nA B\nB A\n").unwrap();
    let mut sim = Simulator::from_topology(&topology, SimConfig::default()).unwrap();

    let err = sim.send_tokens(&id("A"), &id("B"), 5).unwrap_err();
    assert!(err.is_fatal());
    assert!(matches!(
        err,
        SimError::Protocol(ProtocolError::InsufficientTokens { requested: 5, available: 2, .. })
    ));
    assert_eq!(sim.server(&id("A")).unwrap().tokens(), 2);
    assert!(sim.is_quiet());
    assert!(matches!(sim.status(), SimStatus::Halted(_)));

    // Nothing runs after a fatal error.
    assert!(matches!(
        sim.send_tokens(&id("A"), &id("B"), 1),
        Err(SimError::Halted(_))
    ));
    assert!(matches!(sim.start_snapshot(&id("B")), Err(SimError::Halted(_))));
}

#[test]
fn test_fatal_script_stops_before_later_events() {
    let topology = Topology::parse(RING).unwrap();
    let script = Script::parse("send A B 4\nsend B C 9\nsnapshot A\n").unwrap();
    let mut sim = Simulator::from_topology(&topology, SimConfig::default()).unwrap();

    let err = sim.run_script(&script).unwrap_err();
    assert!(err.is_fatal());
    assert!(sim.started_snapshots().is_empty());
    assert_eq!(sim.total_tokens(), 10);
}

#[test]
fn test_unknown_server_in_script() {
    let topology = Topology::parse(RING).unwrap();
    let mut sim = Simulator::from_topology(&topology, SimConfig::default()).unwrap();
    let err = sim.run_script(&Script::parse("snapshot Z\n").unwrap()).unwrap_err();
    assert!(matches!(err, SimError::UnknownServer(ref s) if s.as_str() == "Z"));
    assert!(!err.is_fatal());
}

#[test]
fn test_snapshot_stalls_on_unreachable_server() {
    // C has no inbound links, so no marker ever reaches it.
    let mut sim = Simulator::new(SimConfig {
        max_ticks: 50,
        ..SimConfig::default()
    });
    sim.add_server("A", 1).unwrap();
    sim.add_server("B", 1).unwrap();
    sim.add_server("C", 0).unwrap();
    sim.add_link(&id("A"), &id("B")).unwrap();
    sim.add_link(&id("B"), &id("A")).unwrap();

    let snapshot_id = sim.start_snapshot(&id("A")).unwrap();
    let err = sim.run_until_snapshot_complete(snapshot_id).unwrap_err();
    assert!(matches!(err, SimError::Stalled { ticks: 50, .. }));
    assert_eq!(sim.completed_servers(snapshot_id).len(), 2);
    assert!(sim.server(&id("C")).unwrap().snapshot(snapshot_id).is_none());

    let result = Checker::new(2).verify_snapshot(snapshot_id, &sim.servers());
    assert!(result.has(ViolationKind::SnapshotMissing));
}

#[test]
fn test_topology_helpers() {
    let mut sim = Simulator::new(SimConfig::default());
    sim.add_server("A", 0).unwrap();
    sim.add_server("B", 0).unwrap();
    assert!(matches!(sim.add_server("A", 1), Err(SimError::DuplicateServer(_))));

    assert!(sim.add_link(&id("A"), &id("B")).unwrap());
    assert!(!sim.add_link(&id("A"), &id("B")).unwrap());
    assert!(!sim.add_link(&id("A"), &id("A")).unwrap());
    assert!(matches!(
        sim.add_link(&id("A"), &id("Q")),
        Err(SimError::UnknownServer(_))
    ));
}

#[test]
fn test_log_records_traffic() {
    let topology = Topology::parse(RING).unwrap();
    let mut sim = Simulator::from_topology(&topology, SimConfig::default()).unwrap();
    sim.run_script(&Script::parse("send A B 3\nsnapshot A\n").unwrap())
        .unwrap();

    let rendered = sim.log().render();
    assert!(rendered.contains("A sent 3 tokens to B"));
    assert!(rendered.contains("B received 3 tokens from A"));
    assert!(rendered.contains("A startSnapshot(0)"));
    assert!(rendered.contains("C endSnapshot(0)"));

    let completions = sim
        .log()
        .events()
        .into_iter()
        .filter(|e| matches!(e, LoggedEvent::SnapshotCompleted { .. }))
        .count();
    assert_eq!(completions, 3);
}

// -----------------------------------------------------------------------------
// Randomized runs
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Op {
    Send { from: usize, to: usize, amount: u64 },
    Snapshot { at: usize },
    Tick(u64),
}

fn op_strategy(servers: usize) -> impl Strategy<Value = Op> {
    prop_oneof![
        5 => (0..servers, 0..servers, 0u64..20).prop_map(|(from, to, amount)| Op::Send { from, to, amount }),
        1 => (0..servers).prop_map(|at| Op::Snapshot { at }),
        3 => (1u64..4).prop_map(Op::Tick),
    ]
}

fn scenario_strategy() -> impl Strategy<Value = (Vec<u64>, Vec<Op>, u64)> {
    (2usize..6).prop_flat_map(|n| {
        (
            prop::collection::vec(0u64..50, n),
            prop::collection::vec(op_strategy(n), 1..40),
            any::<u64>(),
        )
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Random transfers and triggers over a full mesh: every snapshot
    /// completes, accounts for exactly the initial total, and is
    /// reported once per server.
    #[test]
    fn prop_snapshots_conserve_tokens((balances, ops, seed) in scenario_strategy()) {
        let mut sim = Simulator::new(SimConfig { seed, ..SimConfig::default() });
        let ids: Vec<ServerId> = (0..balances.len()).map(|i| ServerId::new(format!("S{}", i))).collect();
        for (sid, tokens) in ids.iter().zip(&balances) {
            sim.add_server(sid.clone(), *tokens).unwrap();
        }
        for src in &ids {
            for dest in &ids {
                sim.add_link(src, dest).unwrap();
            }
        }
        let checker = Checker::new(balances.iter().sum());

        for op in ops {
            match op {
                Op::Send { from, to, amount } => {
                    if from == to {
                        continue;
                    }
                    let available = sim.server(&ids[from]).unwrap().tokens();
                    sim.send_tokens(&ids[from], &ids[to], amount.min(available)).unwrap();
                }
                Op::Snapshot { at } => {
                    sim.start_snapshot(&ids[at]).unwrap();
                }
                Op::Tick(n) => sim.tick_n(n),
            }
            prop_assert!(checker.verify_live(&sim.servers()).passed);
        }

        sim.run_until_snapshots_complete().unwrap();
        let servers = sim.servers();
        for &snapshot_id in sim.started_snapshots() {
            let result = checker.verify_snapshot(snapshot_id, &servers);
            prop_assert!(result.passed, "{:?}", result.violations);
        }
        prop_assert!(sim.duplicate_completions().is_empty());
        prop_assert!(checker.verify_live(&servers).passed);
    }
}

// -----------------------------------------------------------------------------
// Threaded cluster
// -----------------------------------------------------------------------------

fn mesh_cluster(n: usize, tokens: u64, seed: u64) -> (Cluster, Vec<ServerId>) {
    let mut cluster = Cluster::new(ClusterConfig {
        latency_range: (Duration::ZERO, Duration::from_micros(500)),
        poll_interval: Duration::from_micros(50),
        seed: Some(seed),
    });
    let ids: Vec<ServerId> = (0..n).map(|i| ServerId::new(format!("S{}", i))).collect();
    for sid in &ids {
        cluster.add_server(sid.clone(), tokens).unwrap();
    }
    for src in &ids {
        for dest in &ids {
            cluster.add_link(src, dest).unwrap();
        }
    }
    (cluster, ids)
}

#[test]
fn test_cluster_snapshots_under_concurrent_traffic() {
    init_logging();
    const SERVERS: usize = 4;
    const TOKENS: u64 = 100;

    let (mut cluster, ids) = mesh_cluster(SERVERS, TOKENS, 7);
    let checker = Checker::new(SERVERS as u64 * TOKENS);
    cluster.start();

    // One sender thread per server; only it debits its own balance.
    let senders: Vec<_> = ids
        .iter()
        .enumerate()
        .map(|(i, sid)| {
            let server = cluster.server(sid).unwrap().clone();
            let neighbors: Vec<ServerId> = ids.iter().filter(|n| *n != sid).cloned().collect();
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(i as u64);
                for _ in 0..200 {
                    let dest = &neighbors[rng.gen_range(0..neighbors.len())];
                    let amount = rng.gen_range(0..10).min(server.tokens());
                    server.send_tokens(amount, dest).unwrap();
                    if rng.gen_bool(0.1) {
                        thread::sleep(Duration::from_micros(100));
                    }
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(2));
    let first = cluster.start_snapshot(&ids[0]).unwrap();
    thread::sleep(Duration::from_millis(2));
    let second = cluster.start_snapshot(&ids[2]).unwrap();

    for sender in senders {
        sender.join().unwrap();
    }

    assert!(cluster.wait_for_snapshot(first, Duration::from_secs(10)));
    assert!(cluster.wait_for_snapshot(second, Duration::from_secs(10)));
    assert!(cluster.wait_until_quiet(Duration::from_secs(10)));

    let servers = cluster.servers();
    for snapshot_id in [first, second] {
        let result = checker.verify_snapshot(snapshot_id, &servers);
        assert!(result.passed, "snapshot {}: {:?}", snapshot_id, result.violations);
        for server in &servers {
            assert_eq!(server.snapshot_status(snapshot_id), Some(SnapshotStatus::Complete));
        }
    }
    assert!(checker.verify_live(&servers).passed);
    assert!(cluster.duplicate_completions().is_empty());
    assert_eq!(cluster.completed_servers(first).len(), SERVERS);

    cluster.stop();
    assert!(!cluster.is_running());
}

#[test]
fn test_cluster_topology_frozen_after_start() {
    let (mut cluster, ids) = mesh_cluster(2, 1, 1);
    cluster.start();
    assert!(matches!(
        cluster.add_server("late", 0),
        Err(SimError::AlreadyStarted)
    ));
    assert!(matches!(
        cluster.add_link(&ids[0], &ids[1]),
        Err(SimError::AlreadyStarted)
    ));
}

#[test]
fn test_cluster_fatal_send_halts_cluster() {
    let (mut cluster, ids) = mesh_cluster(2, 3, 2);
    cluster.start();
    assert!(cluster.is_running());

    let err = cluster.send_tokens(&ids[0], &ids[1], 4).unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(cluster.server(&ids[0]).unwrap().tokens(), 3);
    assert!(matches!(cluster.status(), SimStatus::Halted(_)));
    assert!(!cluster.is_running());

    // Nothing is accepted after a fatal error, and the cluster stays down.
    assert!(matches!(
        cluster.send_tokens(&ids[0], &ids[1], 1),
        Err(SimError::Halted(_))
    ));
    assert!(matches!(cluster.start_snapshot(&ids[1]), Err(SimError::Halted(_))));
    assert!(matches!(cluster.add_server("late", 0), Err(SimError::Halted(_))));
    cluster.start();
    assert!(!cluster.is_running());
    assert_eq!(cluster.server(&ids[0]).unwrap().tokens(), 3);
    assert_eq!(cluster.total_tokens(), 6);
    assert!(cluster.wait_until_quiet(Duration::from_millis(10)));
}

#[test]
fn test_cluster_non_fatal_error_keeps_running() {
    let (mut cluster, ids) = mesh_cluster(2, 3, 4);
    cluster.start();
    assert!(matches!(
        cluster.send_tokens(&id("nobody"), &ids[1], 1),
        Err(SimError::UnknownServer(_))
    ));
    assert_eq!(cluster.status(), &SimStatus::Running);
    cluster.send_tokens(&ids[0], &ids[1], 2).unwrap();
    assert!(cluster.wait_until_quiet(Duration::from_secs(10)));
    assert_eq!(cluster.server(&ids[1]).unwrap().tokens(), 5);
}

#[test]
fn test_idle_ticks_do_not_grow_log() {
    let topology = Topology::parse(RING).unwrap();
    let mut sim = Simulator::from_topology(&topology, SimConfig::default()).unwrap();
    sim.run_script(&Script::parse("send A B 3\nsnapshot A\n").unwrap())
        .unwrap();
    sim.run_until_quiet().unwrap();
    let busy = sim.log().epochs().len();

    sim.tick_n(5_000);
    assert!(sim.log().epochs().len() <= busy + 1);
    assert!(sim.log().epochs().iter().all(|e| e.time <= sim.time()));
}

#[test]
fn test_cluster_wait_times_out_before_start() {
    let (mut cluster, ids) = mesh_cluster(3, 5, 3);
    let snapshot_id = cluster.start_snapshot(&ids[1]).unwrap();

    // No workers yet: markers sit on their links.
    assert!(!cluster.wait_for_snapshot(snapshot_id, Duration::from_millis(20)));

    cluster.start();
    assert!(cluster.wait_for_snapshot(snapshot_id, Duration::from_secs(10)));
    assert_eq!(cluster.total_tokens(), 15);
}
