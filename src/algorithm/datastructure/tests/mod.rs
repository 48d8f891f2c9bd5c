use std::iter::successors;

use mocks::{
    build_graph_detailed_example, build_graph_detailed_example_with_timestamps, build_graph_fork,
    build_graph_from_paper, build_graph_index_test, build_graph_some_chain, mock_signed, peer_id,
    TestGraph, TestSetup,
};
use rand::{seq::SliceRandom, Rng, SeedableRng};

use crate::algorithm::{IncrementalClock, MockSigner};

use super::*;


fn check_all<F, T>(setup: &TestSetup, property: &str, cases: &[(&str, usize)], expect: T, f: F)
where
    F: Fn(&TestGraph, &event::Hash) -> T,
    T: PartialEq + std::fmt::Debug,
{
    for (peer, i) in cases {
        let hash = &setup.events(peer)[*i];
        assert_eq!(
            f(&setup.graph, hash),
            expect,
            "{} of {}[{}] ({}) in '{}'",
            property,
            peer,
            i,
            setup.name(hash),
            setup.setup_name
        );
    }
}

fn check_pairs<F>(
    setup: &TestSetup,
    property: &str,
    cases: &[((&str, usize), (&str, usize))],
    expect: bool,
    f: F,
) where
    F: Fn(&TestGraph, &event::Hash, &event::Hash) -> bool,
{
    for ((p1, i1), (p2, i2)) in cases {
        let e1 = &setup.events(p1)[*i1];
        let e2 = &setup.events(p2)[*i2];
        assert_eq!(
            f(&setup.graph, e1, e2),
            expect,
            "{}({}, {}) in '{}'",
            property,
            setup.name(e1),
            setup.name(e2),
            setup.setup_name
        );
    }
}

/// `(peer, range)` into a list of `(peer, index)`
fn expand(ranges: &[(&'static str, std::ops::Range<usize>)]) -> Vec<(&'static str, usize)> {
    ranges
        .iter()
        .flat_map(|(peer, range)| range.clone().map(move |i| (*peer, i)))
        .collect()
}

fn four_peers_graph(own: u8) -> TestGraph {
    Graph::new(
        MockSigner::new(peer_id(own)),
        IncrementalClock::new(),
        (0..4).map(peer_id),
        999,
    )
}

// Test simple work + errors

#[test]
fn push_works() {
    let mut graph = four_peers_graph(0);
    let genesis = graph.create_event(vec![], None).unwrap();

    // first event of another peer
    let other = mock_signed(EventBody {
        transactions: vec![],
        parents: Parents::default(),
        creator: peer_id(1),
        index: 0,
        timestamp: 2,
    });
    let other_hash = graph.push_event(other).unwrap();

    // new event by the other peer
    let next = mock_signed(EventBody {
        transactions: vec![b"tx".to_vec()],
        parents: Parents {
            self_parent: Some(other_hash.clone()),
            other_parent: Some(genesis.clone()),
        },
        creator: peer_id(1),
        index: 1,
        timestamp: 3,
    });
    let next_hash = graph.push_event(next).unwrap();
    assert_eq!(graph.peer_latest_event(&peer_id(1)), Some(&next_hash));
    assert_eq!(graph.event_count(), 3);
    assert!(graph.is_ancestor(&next_hash, &genesis));
    assert!(!graph.is_ancestor(&genesis, &next_hash));
}

#[test]
fn create_works() {
    let mut graph = four_peers_graph(0);
    let first = graph.create_event(vec![], None).unwrap();
    assert_eq!(graph.head(), Some(&first));

    let second = graph.create_event(vec![b"Hello World!".to_vec()], None).unwrap();
    let event = graph.event(&second).unwrap();
    assert_eq!(event.index(), 1);
    assert_eq!(event.self_parent(), Some(&first));
    assert_eq!(event.author(), &peer_id(0));
    assert_eq!(event.transactions(), &[b"Hello World!".to_vec()]);
    assert_eq!(graph.head(), Some(&second));
    assert_eq!(graph.known_events().get(&peer_id(0)), Some(1));
}

#[test]
fn graph_builds() {
    build_graph_from_paper(999).unwrap();
    build_graph_some_chain(999).unwrap();
    build_graph_detailed_example(999).unwrap();
    build_graph_fork(999).unwrap();
    build_graph_index_test(999).unwrap();
}

#[test]
fn duplicate_push_fails() {
    let mut setup = build_graph_from_paper(999).unwrap();
    let genesis = setup.events("a")[0].clone();
    let same = setup.graph.event(&genesis).unwrap().to_wire();
    assert!(matches!(
        setup.graph.push_event(same),
        Err(PushError::EventAlreadyExists(hash)) if hash == genesis
    ));
}

#[test]
fn missing_parent_fails() {
    let mut graph = four_peers_graph(0);
    let own = graph.create_event(vec![], None).unwrap();
    let fake_parent = event::blake2_hash(b"fake");

    let unknown_self_parent = mock_signed(EventBody {
        transactions: vec![],
        parents: Parents {
            self_parent: Some(fake_parent.clone()),
            other_parent: Some(own.clone()),
        },
        creator: peer_id(1),
        index: 1,
        timestamp: 0,
    });
    assert!(matches!(
        graph.push_event(unknown_self_parent),
        Err(PushError::NoParent(hash)) if hash == fake_parent
    ));

    let unknown_other_parent = mock_signed(EventBody {
        transactions: vec![],
        parents: Parents {
            self_parent: Some(own),
            other_parent: Some(fake_parent.clone()),
        },
        creator: peer_id(0),
        index: 1,
        timestamp: 0,
    });
    assert!(matches!(
        graph.push_event(unknown_other_parent),
        Err(PushError::NoParent(hash)) if hash == fake_parent
    ));
    // nothing changed
    assert_eq!(graph.event_count(), 1);
}

#[test]
fn structurally_invalid_events_fail() {
    let mut graph = four_peers_graph(0);
    let own = graph.create_event(vec![], None).unwrap();

    let stranger = PeerId::from_bytes([200; 32]);
    let unknown_creator = mock_signed(EventBody {
        transactions: vec![],
        parents: Parents::default(),
        creator: stranger,
        index: 0,
        timestamp: 0,
    });
    assert!(matches!(
        graph.push_event(unknown_creator),
        Err(PushError::UnknownCreator(p)) if p == stranger
    ));

    let wrong_author = mock_signed(EventBody {
        transactions: vec![],
        parents: Parents {
            self_parent: Some(own.clone()),
            other_parent: None,
        },
        creator: peer_id(1),
        index: 1,
        timestamp: 0,
    });
    assert!(matches!(
        graph.push_event(wrong_author),
        Err(PushError::IncorrectAuthor(expected, provided))
            if expected == peer_id(0) && provided == peer_id(1)
    ));

    let wrong_index = mock_signed(EventBody {
        transactions: vec![],
        parents: Parents {
            self_parent: Some(own.clone()),
            other_parent: None,
        },
        creator: peer_id(0),
        index: 5,
        timestamp: 0,
    });
    assert!(matches!(
        graph.push_event(wrong_index),
        Err(PushError::IncorrectIndex(1, 5))
    ));

    let first_with_index = mock_signed(EventBody {
        transactions: vec![],
        parents: Parents::default(),
        creator: peer_id(2),
        index: 3,
        timestamp: 0,
    });
    assert!(matches!(
        graph.push_event(first_with_index),
        Err(PushError::IncorrectIndex(0, 3))
    ));

    let body = EventBody {
        transactions: vec![],
        parents: Parents::default(),
        creator: peer_id(3),
        index: 0,
        timestamp: 0,
    };
    let forged = SignedEvent::from_parts(body, event::Signature(event::blake2_hash(b"forged")));
    assert!(matches!(
        graph.push_event(forged),
        Err(PushError::InvalidSignature)
    ));
    assert_eq!(graph.event_count(), 1);
}

#[test]
fn test_ancestor() {
    let chain = build_graph_some_chain(999).unwrap();
    check_pairs(&chain, "ancestor", &[(("g1", 1), ("g1", 0))], true, |g, a, b| {
        g.is_ancestor(a, b)
    });

    let paper = build_graph_from_paper(999).unwrap();
    check_pairs(
        &paper,
        "ancestor",
        &[(("c", 5), ("b", 0)), (("a", 2), ("e", 1))],
        true,
        |g, a, b| g.is_ancestor(a, b),
    );

    let detailed = build_graph_detailed_example(999).unwrap();
    check_pairs(
        &detailed,
        "ancestor",
        &[
            (("c", 0), ("c", 1)),
            (("c", 0), ("c", 3)),
            (("c", 0), ("b", 2)),
            (("c", 1), ("d", 3)),
            (("a", 2), ("c", 1)),
        ],
        false,
        |g, a, b| g.is_ancestor(a, b),
    );
    check_pairs(
        &detailed,
        "ancestor",
        &[
            // Self parent
            (("d", 1), ("d", 0)),
            // Self ancestor
            (("d", 4), ("d", 0)),
            // Ancestry is reflexive
            (("c", 1), ("c", 1)),
            // Other parent
            (("b", 3), ("d", 3)),
            (("c", 2), ("a", 2)),
            (("b", 3), ("c", 0)),
            (("d", 3), ("c", 0)),
            (("d", 6), ("a", 2)),
            (("b", 6), ("a", 2)),
            (("a", 4), ("a", 2)),
        ],
        true,
        |g, a, b| g.is_ancestor(a, b),
    );
}

#[test]
fn test_strongly_see() {
    let chain = build_graph_some_chain(999).unwrap();
    check_pairs(&chain, "strongly_see", &[(("g1", 1), ("g1", 0))], false, |g, a, b| {
        g.strongly_see(a, b)
    });
    check_pairs(&chain, "strongly_see", &[(("g2", 2), ("g1", 0))], true, |g, a, b| {
        g.strongly_see(a, b)
    });

    let paper = build_graph_from_paper(999).unwrap();
    check_pairs(&paper, "strongly_see", &[(("c", 5), ("d", 0))], true, |g, a, b| {
        g.strongly_see(a, b)
    });
    check_pairs(&paper, "strongly_see", &[(("c", 4), ("d", 0))], false, |g, a, b| {
        g.strongly_see(a, b)
    });

    let detailed = build_graph_detailed_example(999).unwrap();
    check_pairs(
        &detailed,
        "strongly_see",
        &[
            (("d", 0), ("d", 0)),
            (("d", 3), ("d", 0)),
            (("d", 3), ("b", 0)),
            (("b", 2), ("c", 0)),
            (("a", 0), ("b", 0)),
            (("a", 1), ("c", 0)),
        ],
        false,
        |g, a, b| g.strongly_see(a, b),
    );
    check_pairs(
        &detailed,
        "strongly_see",
        &[
            (("d", 4), ("d", 0)),
            (("d", 4), ("b", 0)),
            (("b", 3), ("c", 0)),
            (("a", 1), ("b", 0)),
            (("a", 3), ("c", 0)),
            (("b", 6), ("a", 2)),
        ],
        true,
        |g, a, b| g.strongly_see(a, b),
    );
}

#[test]
fn test_determine_round() {
    let chain = build_graph_some_chain(999).unwrap();
    check_all(
        &chain,
        "round",
        &expand(&[("g1", 0..2), ("g2", 0..3), ("g3", 0..2)]),
        Some(0),
        |g, e| g.round_of(e),
    );
    check_all(
        &chain,
        "round",
        &expand(&[("g1", 2..3), ("g2", 3..4), ("g3", 2..3)]),
        Some(1),
        |g, e| g.round_of(e),
    );

    let paper = build_graph_from_paper(999).unwrap();
    check_all(
        &paper,
        "round",
        &expand(&[("a", 0..3), ("b", 0..3), ("c", 0..5), ("d", 0..2), ("e", 0..2)]),
        Some(0),
        |g, e| g.round_of(e),
    );
    check_all(&paper, "round", &[("c", 5)], Some(1), |g, e| g.round_of(e));

    let detailed = build_graph_detailed_example(999).unwrap();
    check_all(
        &detailed,
        "round",
        &expand(&[("a", 0..2), ("b", 0..4), ("c", 0..2), ("d", 0..4)]),
        Some(0),
        |g, e| g.round_of(e),
    );
    check_all(
        &detailed,
        "round",
        &expand(&[("a", 2..5), ("b", 4..6), ("c", 2..3), ("d", 4..7)]),
        Some(1),
        |g, e| g.round_of(e),
    );
    check_all(
        &detailed,
        "round",
        &expand(&[("a", 5..8), ("b", 6..11), ("c", 3..4), ("d", 7..10)]),
        Some(2),
        |g, e| g.round_of(e),
    );
    check_all(
        &detailed,
        "round",
        &[("b", 11), ("d", 10)],
        Some(3),
        |g, e| g.round_of(e),
    );
    assert_eq!(detailed.graph.last_round(), Some(3));

    let late = build_graph_index_test(999).unwrap();
    check_all(
        &late,
        "round",
        &expand(&[("a", 0..3), ("b", 0..2), ("c", 0..2), ("d", 0..5)]),
        Some(0),
        |g, e| g.round_of(e),
    );
    check_all(&late, "round", &[("c", 2)], Some(1), |g, e| g.round_of(e));
}

#[test]
fn test_determine_witness() {
    let chain = build_graph_some_chain(999).unwrap();
    check_all(
        &chain,
        "witness",
        &expand(&[("g1", 1..2), ("g2", 1..3), ("g3", 1..2)]),
        Some(false),
        |g, e| g.is_witness(e),
    );
    check_all(
        &chain,
        "witness",
        &[
            ("g1", 0),
            ("g2", 0),
            ("g3", 0),
            ("g1", 2),
            ("g2", 3),
            ("g3", 2),
        ],
        Some(true),
        |g, e| g.is_witness(e),
    );

    let detailed = build_graph_detailed_example(999).unwrap();
    check_all(
        &detailed,
        "witness",
        &expand(&[
            ("a", 1..2),
            ("a", 3..5),
            ("a", 6..8),
            ("b", 1..4),
            ("b", 5..6),
            ("b", 7..11),
            ("c", 1..2),
            ("d", 1..4),
            ("d", 5..7),
            ("d", 8..10),
        ]),
        Some(false),
        |g, e| g.is_witness(e),
    );
    check_all(
        &detailed,
        "witness",
        &[
            ("a", 0),
            ("a", 2),
            ("a", 5),
            ("b", 0),
            ("b", 4),
            ("b", 6),
            ("b", 11),
            ("c", 0),
            ("c", 2),
            ("c", 3),
            ("d", 0),
            ("d", 4),
            ("d", 7),
            ("d", 10),
        ],
        Some(true),
        |g, e| g.is_witness(e),
    );
}

#[test]
fn test_is_famous_witness() {
    let chain = build_graph_some_chain(999).unwrap();
    check_all(
        &chain,
        "fame",
        &[
            ("g1", 0),
            ("g1", 2),
            ("g2", 0),
            ("g2", 3),
            ("g3", 0),
            ("g3", 2),
        ],
        Some(WitnessFamousness::Undecided),
        |g, e| g.fame_of(e),
    );
    check_all(&chain, "fame", &[("g1", 1), ("g2", 2)], None, |g, e| {
        g.fame_of(e)
    });

    let detailed = build_graph_detailed_example(999).unwrap();
    check_all(
        &detailed,
        "fame",
        &[
            ("a", 0),
            ("a", 2),
            ("b", 0),
            ("b", 4),
            ("c", 0),
            ("d", 0),
            ("d", 4),
        ],
        Some(WitnessFamousness::Yes),
        |g, e| g.fame_of(e),
    );
    check_all(
        &detailed,
        "fame",
        &[("c", 2)],
        Some(WitnessFamousness::No),
        |g, e| g.fame_of(e),
    );
    check_all(
        &detailed,
        "fame",
        &[
            ("a", 5),
            ("b", 6),
            ("b", 11),
            ("c", 3),
            ("d", 7),
            ("d", 10),
        ],
        Some(WitnessFamousness::Undecided),
        |g, e| g.fame_of(e),
    );
}

#[test]
fn test_is_round_decided() {
    assert_eq!(
        build_graph_some_chain(999)
            .unwrap()
            .graph
            .last_decided_round(),
        None
    );
    assert_eq!(
        build_graph_from_paper(999).unwrap().graph.last_decided_round(),
        None
    );
    assert_eq!(
        build_graph_detailed_example(999)
            .unwrap()
            .graph
            .last_decided_round(),
        Some(1)
    );
}

#[test]
fn test_round_received() {
    let detailed = build_graph_detailed_example(999).unwrap();
    // seen by all famous witnesses of round 1
    let received_in_first = [
        ("a", 0),
        ("a", 1),
        ("b", 0),
        ("b", 1),
        ("b", 2),
        ("c", 0),
        ("d", 0),
        ("d", 1),
        ("d", 2),
        ("d", 3),
    ];
    check_all(&detailed, "round received", &received_in_first, Some(1), |g, e| {
        g.round_received_of(e)
    });
    // round 1 events can only be received by round 2 or later
    check_all(
        &detailed,
        "round received",
        &expand(&[("a", 2..8), ("b", 4..12), ("c", 2..4), ("d", 4..11)]),
        None,
        |g, e| g.round_received_of(e),
    );
}

#[test]
fn test_consensus_timestamps() {
    let detailed =
        build_graph_detailed_example_with_timestamps(999, successors(Some(1), |x| Some(x + 1)))
            .unwrap();
    let expected = [
        (("a", 0), 9),
        (("a", 1), 9),
        (("b", 0), 1),
        (("b", 1), 3),
        (("b", 2), 6),
        (("c", 0), 6),
        (("d", 0), 2),
        (("d", 1), 2),
        (("d", 2), 8),
        (("d", 3), 8),
    ];
    for ((peer, i), timestamp) in expected {
        let hash = &detailed.events(peer)[i];
        assert_eq!(
            detailed.graph.event(hash).unwrap().consensus_timestamp(),
            Some(timestamp),
            "consensus timestamp of {}",
            detailed.name(hash)
        );
    }
}

#[test]
fn test_event_order_correct() {
    let mut detailed =
        build_graph_detailed_example_with_timestamps(999, successors(Some(1), |x| Some(x + 1)))
            .unwrap();
    let order = detailed.graph.consensus_events().to_vec();
    assert!(order.len() >= 10);

    // sorted by consensus timestamp within the round
    let timestamps: Vec<_> = order
        .iter()
        .map(|h| detailed.graph.event(h).unwrap().consensus_timestamp().unwrap())
        .collect();
    assert!(timestamps.windows(2).all(|w| w[0] <= w[1]));

    // each event is handed out exactly once, in order
    let mut handed_out = vec![];
    while let Some(event) = detailed.graph.next_event() {
        handed_out.push(event.hash().clone());
    }
    assert_eq!(handed_out, order);
    assert!(detailed.graph.next_event().is_none());
}

/// Insert events into an empty graph in some topological order that differs
/// from the provided one.
fn insert_shuffled<R: Rng>(graph: &mut TestGraph, events: Vec<SignedEvent>, rng: &mut R) {
    let mut pending = events;
    while !pending.is_empty() {
        pending.shuffle(rng);
        let before = pending.len();
        pending.retain(|e| match graph.push_event(e.clone()) {
            Ok(_) => false,
            Err(PushError::NoParent(_)) => true,
            Err(e) => panic!("Unexpected error {}", e),
        });
        assert!(pending.len() < before, "Could not insert any event");
    }
}

#[test]
fn order_does_not_depend_on_insertion_order() {
    let reference = build_graph_detailed_example(999).unwrap();
    let all_events = reference.graph.events_unknown_to(&KnownEvents::new());
    assert_eq!(all_events.len(), reference.graph.event_count());

    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(1337);
    for _ in 0..5 {
        let mut copy = four_peers_graph(2);
        insert_shuffled(&mut copy, all_events.clone(), &mut rng);
        copy.process_known_events();
        assert_eq!(copy.last_decided_round(), reference.graph.last_decided_round());
        assert_eq!(copy.consensus_events(), reference.graph.consensus_events());
        for e in &all_events {
            let hash = e.body().hash().unwrap();
            assert_eq!(copy.round_of(&hash), reference.graph.round_of(&hash));
            assert_eq!(copy.fame_of(&hash), reference.graph.fame_of(&hash));
        }
    }
}

#[test]
fn test_sync_data_correct() {
    let setup = build_graph_detailed_example(999).unwrap();
    let graph = &setup.graph;
    let known = graph.known_events();
    for peer in ["a", "b", "c", "d"] {
        let events = setup.events(peer);
        assert_eq!(
            known.get(&setup.peers_events[peer].id),
            Some(events.len() as u64 - 1)
        );
    }
    assert!(graph.events_unknown_to(&known).is_empty());

    // knows events up to index 2 of `b` and nothing else
    let b_id = setup.peers_events["b"].id;
    let partial: KnownEvents = [(b_id, 2)].into_iter().collect();
    let diff = graph.events_unknown_to(&partial);
    assert_eq!(diff.len(), graph.event_count() - 3);
    assert!(diff
        .iter()
        .all(|e| e.body().creator != b_id || e.body().index > 2));

    // parents always come first
    let mut seen: std::collections::HashSet<event::Hash> = setup.events("b")[..3]
        .iter()
        .cloned()
        .collect();
    for e in &diff {
        let parents = &e.body().parents;
        for parent in [&parents.self_parent, &parents.other_parent].into_iter().flatten() {
            assert!(seen.contains(parent), "Parent of event comes after it");
        }
        seen.insert(e.body().hash().unwrap());
    }
}

#[test]
fn forks_are_detected() {
    let setup = build_graph_fork(999).unwrap();
    let graph = &setup.graph;
    let m_id = setup.peers_events["m"].id;
    assert_eq!(
        graph.detected_forks(),
        &[ForkDetected {
            creator: m_id,
            index: 1
        }]
    );
    assert_eq!(graph.forking_peers().collect::<Vec<_>>(), vec![&m_id]);

    let fork_a = setup.events("m")[1].clone();
    let fork_b = setup.events("m")[2].clone();
    let merged = setup.events("m")[3].clone();
    let a2 = setup.events("a")[2].clone();
    let a1 = setup.events("a")[1].clone();

    // before the merge each branch is a plain ancestor
    assert!(graph.see(&fork_a, &a1));
    // after it neither branch is seen
    assert!(graph.is_ancestor(&merged, &fork_b));
    assert!(!graph.see(&merged, &fork_a));
    assert!(!graph.see(&merged, &fork_b));
    assert!(!graph.see(&a2, &fork_a));
    // events of honest creators are still seen
    assert!(graph.see(&a2, &a1));
    assert!(graph.see(&a2, &setup.events("a")[0]));
}

#[test]
fn fork_does_not_break_known_events() {
    let setup = build_graph_fork(999).unwrap();
    let m_id = setup.peers_events["m"].id;
    // forked index counts once
    assert_eq!(
        setup.graph.known_events().get(&m_id),
        Some(setup.events("m").len() as u64 - 2)
    );
    // both branches are provided to someone who knows nothing
    let diff = setup.graph.events_unknown_to(&KnownEvents::new());
    assert_eq!(diff.len(), setup.graph.event_count());
}

/// Peers exchanging events at random, each graph is a separate node.
fn simulate_gossip(members: u8, steps: usize, coin_frequency: u64, seed: u64) -> Vec<TestGraph> {
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
    let mut graphs: Vec<TestGraph> = (0..members)
        .map(|own| {
            Graph::new(
                MockSigner::new(peer_id(own)),
                IncrementalClock::new(),
                (0..members).map(peer_id),
                coin_frequency,
            )
        })
        .collect();
    for graph in graphs.iter_mut() {
        graph.create_event(vec![], None).unwrap();
    }
    gossip_steps(&mut graphs, 0..steps, &mut rng);
    graphs
}

fn gossip_steps<R: Rng>(graphs: &mut [TestGraph], steps: std::ops::Range<usize>, rng: &mut R) {
    for step in steps {
        let receiver = rng.gen_range(0..graphs.len());
        let sender = (receiver + rng.gen_range(1..graphs.len())) % graphs.len();
        let missing = graphs[sender].events_unknown_to(&graphs[receiver].known_events());
        let sender_head = graphs[sender].head().cloned();
        let receiver_graph = &mut graphs[receiver];
        for event in missing {
            receiver_graph.push_event(event).unwrap();
        }
        receiver_graph
            .create_event(vec![step.to_be_bytes().to_vec()], sender_head)
            .unwrap();
        receiver_graph.process_known_events();
    }
}

/// Every graph ends up with every event, no new events are created
fn sync_all(graphs: &mut [TestGraph]) {
    for _ in 0..2 {
        for receiver in 0..graphs.len() {
            for sender in 0..graphs.len() {
                let missing = graphs[sender].events_unknown_to(&graphs[receiver].known_events());
                for event in missing {
                    graphs[receiver].push_event(event).unwrap();
                }
            }
        }
    }
    for graph in graphs.iter_mut() {
        graph.process_known_events();
    }
}

/// Overlapping parts of the consensus orders are equal, also for stores
/// that do not keep the start of the order
fn assert_prefix_agreement(graphs: &[TestGraph]) {
    for a in graphs {
        for b in graphs {
            let start = a.consensus_offset().max(b.consensus_offset());
            let end = a.consensus_len().min(b.consensus_len());
            if start >= end {
                continue;
            }
            assert_eq!(
                a.consensus_events()[start - a.consensus_offset()..end - a.consensus_offset()],
                b.consensus_events()[start - b.consensus_offset()..end - b.consensus_offset()]
            );
        }
    }
}

#[test]
fn gossiping_graphs_agree() {
    let graphs = simulate_gossip(4, 400, 999, 42);
    for graph in &graphs {
        assert!(graph.last_decided_round().is_some());
        assert!(!graph.consensus_events().is_empty());
    }
    assert_prefix_agreement(&graphs);
}

#[test]
fn gossiping_graphs_agree_with_frequent_coins() {
    let graphs = simulate_gossip(5, 400, 3, 7);
    assert_prefix_agreement(&graphs);
}

#[test]
fn incremental_processing_matches_batch() {
    let graphs = simulate_gossip(4, 200, 999, 3);
    let source = &graphs[0];
    let all_events = source.events_unknown_to(&KnownEvents::new());

    let mut incremental = four_peers_graph(1);
    for chunk in all_events.chunks(7) {
        let before: Vec<_> = incremental.consensus_events().to_vec();
        for event in chunk {
            incremental.push_event(event.clone()).unwrap();
        }
        incremental.process_known_events();
        // already ordered events keep their positions
        assert_eq!(incremental.consensus_events()[..before.len()], before[..]);
    }
    assert_eq!(incremental.consensus_events(), source.consensus_events());
}

#[test]
fn decided_rounds_drop_vote_tables() {
    let graphs = simulate_gossip(4, 400, 999, 42);
    for graph in &graphs {
        let last_decided = graph.last_decided_round().unwrap();
        for (round, info) in graph.rounds.iter().enumerate() {
            if round as RoundNum <= last_decided + 1 {
                assert!(info.votes.is_empty(), "votes kept in round {}", round);
            }
            for votes in info.votes.values() {
                assert!(votes
                    .keys()
                    .all(|candidate| graph.round_of(candidate).unwrap() > last_decided));
            }
        }
        assert!(graph
            .strongly_see_cache
            .borrow()
            .keys()
            .all(|(_, target)| graph.round_of(target).unwrap() > last_decided));
    }
}

fn forker_event(index: u64, self_parent: Option<&SignedEvent>, tag: u8) -> SignedEvent {
    mock_signed(EventBody {
        transactions: vec![vec![tag]],
        parents: Parents {
            self_parent: self_parent.map(|e| e.body().hash().unwrap()),
            other_parent: None,
        },
        creator: peer_id(0),
        index,
        timestamp: tag.into(),
    })
}

#[test]
fn diff_includes_second_branch_of_fork() {
    // f0 - a1
    //    \
    //     b1 - b2
    let f0 = forker_event(0, None, 0);
    let a1 = forker_event(1, Some(&f0), 1);
    let b1 = forker_event(1, Some(&f0), 2);
    let b2 = forker_event(2, Some(&b1), 3);

    let mut responder = four_peers_graph(2);
    for event in [&f0, &a1, &b1, &b2] {
        responder.push_event(event.clone()).unwrap();
    }
    let mut requester = four_peers_graph(1);
    requester.push_event(f0.clone()).unwrap();
    requester.push_event(a1.clone()).unwrap();

    // index 1 is known, but only one of its events
    let diff = responder.events_unknown_to(&requester.known_events());
    for event in diff {
        match requester.push_event(event) {
            Ok(_) | Err(PushError::EventAlreadyExists(_)) => {}
            Err(e) => panic!("Diff does not insert cleanly: {}", e),
        }
    }
    assert_eq!(requester.event_count(), 4);
    assert_eq!(
        requester.detected_forks(),
        &[ForkDetected {
            creator: peer_id(0),
            index: 1
        }]
    );
}

#[test]
fn snapshot_needs_decided_round() {
    let graph = four_peers_graph(0);
    assert!(graph.snapshot().is_none());
}

#[test]
fn snapshot_store_continues_consensus() {
    let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(11);
    let mut graphs = simulate_gossip(4, 300, 999, 5);
    sync_all(&mut graphs);

    let snapshot = graphs[0].snapshot().unwrap();
    assert_eq!(Some(snapshot.round), graphs[0].last_decided_round());
    assert!(snapshot.events.len() < graphs[0].event_count());
    let rebuilt = Graph::from_snapshot(
        MockSigner::new(peer_id(1)),
        IncrementalClock::new(),
        (0..4).map(peer_id),
        999,
        snapshot,
    )
    .unwrap();
    assert_eq!(rebuilt.consensus_offset(), graphs[0].consensus_len());
    assert_eq!(rebuilt.last_decided_round(), graphs[0].last_decided_round());
    assert_eq!(rebuilt.head(), graphs[1].head());
    assert_eq!(rebuilt.known_events(), graphs[1].known_events());
    assert!(rebuilt.can_serve(&graphs[2].known_events()));
    assert!(!rebuilt.can_serve(&KnownEvents::new()));
    // older transactions are gone with the events
    assert!(rebuilt.consensus_transactions(0).is_none());

    graphs[1] = rebuilt;
    gossip_steps(&mut graphs, 300..600, &mut rng);
    assert!(graphs[1].consensus_len() > graphs[1].consensus_offset());
    assert_prefix_agreement(&graphs);
}

#[test]
fn snapshot_with_forged_event_is_rejected() {
    let mut graphs = simulate_gossip(4, 200, 999, 5);
    sync_all(&mut graphs);
    let mut snapshot = graphs[0].snapshot().unwrap();
    let last = snapshot.events.last_mut().unwrap();
    let (mut body, signature) = last.event.clone().into_parts();
    body.transactions.push(b"forged".to_vec());
    last.event = SignedEvent::from_parts(body, signature);

    let result = Graph::from_snapshot(
        MockSigner::new(peer_id(1)),
        IncrementalClock::new(),
        (0..4).map(peer_id),
        999,
        snapshot,
    );
    assert!(matches!(
        result,
        Err(SnapshotError::InvalidEvent(PushError::InvalidSignature))
    ));
}
