mod common;

use std::collections::{HashMap, VecDeque};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use common::make_node_id;
use reload_ring::{
    NeighborView, NodeId, NodeState, RoutingTable, TopologyAction, TopologyConfig,
};

const CACHE: usize = 3;
const MAX_DELIVERIES: usize = 100_000;

/// In-memory overlay where updates are delivered instantly and in order.
struct Ring {
    tables: HashMap<NodeId, RoutingTable>,
    queue: VecDeque<(NodeId, NodeId, NeighborView)>,
}

impl Ring {
    fn new() -> Self {
        Self {
            tables: HashMap::new(),
            queue: VecDeque::new(),
        }
    }

    fn ids(&self) -> Vec<NodeId> {
        self.tables.keys().copied().collect()
    }

    fn table(&self, id: &NodeId) -> &RoutingTable {
        &self.tables[id]
    }

    fn handle(&mut self, from: NodeId, actions: Vec<TopologyAction>) {
        if !actions.contains(&TopologyAction::BroadcastUpdate) {
            return;
        }
        let rt = &self.tables[&from];
        let view = rt.neighbor_view();
        for to in rt.neighbors() {
            self.queue.push_back((from, to, view.clone()));
        }
    }

    fn settle(&mut self) {
        let mut delivered = 0;
        while let Some((from, to, view)) = self.queue.pop_front() {
            delivered += 1;
            assert!(delivered < MAX_DELIVERIES, "updates never settled");
            let Some(rt) = self.tables.get_mut(&to) else {
                continue;
            };
            let actions = rt.merge(from, &view.successors, &view.predecessors, false);
            self.handle(to, actions);
        }
    }

    /// Route toward `target` from `start` until some node answers for it.
    fn route(&self, start: NodeId, target: NodeId) -> (NodeId, usize) {
        let mut current = start;
        for hops in 0..=self.tables.len() {
            let next = self.table(&current).find_next_hop(target, false, false, &());
            match next {
                Some(hop) if hop == current => return (current, hops),
                Some(hop) => current = hop,
                None => panic!("{current} has no route to {target}"),
            }
        }
        panic!("routing to {target} from {start} did not terminate");
    }

    fn join(&mut self, joining: NodeId, bootstrap: Option<NodeId>) {
        let config = TopologyConfig::default().with_cache_size(CACHE);
        let mut rt = RoutingTable::new(joining, config);
        let Some(bootstrap) = bootstrap else {
            self.tables.insert(joining, rt);
            return;
        };

        let (admitting, _) = self.route(bootstrap, joining);
        let view = self.table(&admitting).neighbor_view();
        let joiner_actions = rt.merge(admitting, &view.successors, &view.predecessors, false);
        self.tables.insert(joining, rt);

        let admitting_actions = self
            .tables
            .get_mut(&admitting)
            .map(|rt| rt.merge(joining, &[], &[], true))
            .unwrap_or_default();

        self.handle(joining, joiner_actions);
        self.handle(admitting, admitting_actions);
        self.settle();
    }

    fn fail(&mut self, dead: NodeId) {
        self.tables.remove(&dead);
        let mut batches = Vec::new();
        for (id, rt) in self.tables.iter_mut() {
            if rt.is_neighbor(&dead) || rt.get_node(&dead).is_some() {
                batches.push((*id, rt.leave(dead)));
            }
        }
        for (id, actions) in batches {
            self.handle(id, actions);
        }
        self.settle();
    }

    /// Mark every known peer as confirmed so fingers take part in routing.
    fn confirm_all(&mut self) {
        let ids = self.ids();
        for rt in self.tables.values_mut() {
            for id in &ids {
                if rt.get_node(id).is_some() {
                    rt.set_node_state(*id, NodeState::Attached);
                    rt.set_node_state(*id, NodeState::UpdatesReceived);
                }
            }
        }
    }

    fn owner_of(&self, target: NodeId) -> NodeId {
        self.tables
            .keys()
            .copied()
            .min_by_key(|id| target.distance_to(*id))
            .unwrap()
    }
}

fn expected_neighbors(local: NodeId, all: &[NodeId]) -> (Vec<NodeId>, Vec<NodeId>) {
    let mut others: Vec<NodeId> = all.iter().copied().filter(|id| *id != local).collect();

    others.sort_by_key(|id| local.distance_to(*id));
    let successors: Vec<NodeId> = others.iter().copied().take(CACHE).collect();

    others.sort_by_key(|id| id.distance_to(local));
    let mut predecessors: Vec<NodeId> = others
        .iter()
        .copied()
        .filter(|id| !successors.contains(id))
        .take(CACHE)
        .collect();
    if predecessors.is_empty() {
        predecessors = others.iter().copied().take(CACHE).collect();
    }
    (successors, predecessors)
}

fn assert_converged(ring: &Ring) {
    let all = ring.ids();
    for id in &all {
        let (successors, predecessors) = expected_neighbors(*id, &all);
        let rt = ring.table(id);
        assert_eq!(
            rt.successors(),
            successors.as_slice(),
            "successors of {id} with {} nodes",
            all.len()
        );
        assert_eq!(
            rt.predecessors(),
            predecessors.as_slice(),
            "predecessors of {id} with {} nodes",
            all.len()
        );
    }
}

fn random_ids(seed: u64, count: usize) -> Vec<NodeId> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count).map(|_| NodeId::new(rng.gen())).collect()
}

#[test]
fn sequential_joins_converge_after_every_join() {
    let ids = random_ids(7, 24);
    let mut ring = Ring::new();
    ring.join(ids[0], None);
    for (i, id) in ids.iter().enumerate().skip(1) {
        let bootstrap = ids[i / 2];
        ring.join(*id, Some(bootstrap));
        assert_converged(&ring);
    }
}

#[test]
fn evenly_spaced_ring_converges() {
    let mut ring = Ring::new();
    ring.join(make_node_id(0), None);
    // join out of ring order
    for index in [8u32, 4, 12, 2, 10, 6, 14, 1, 9, 5, 13, 3, 11, 7, 15] {
        ring.join(make_node_id(index), Some(make_node_id(0)));
    }
    assert_converged(&ring);
    assert_eq!(
        ring.table(&make_node_id(4)).successors(),
        &[make_node_id(5), make_node_id(6), make_node_id(7)]
    );
}

#[test]
fn every_resource_routes_to_its_owner() {
    let ids = random_ids(11, 32);
    let mut ring = Ring::new();
    ring.join(ids[0], None);
    for id in &ids[1..] {
        ring.join(*id, Some(ids[0]));
    }
    assert_converged(&ring);
    ring.confirm_all();

    let mut rng = StdRng::seed_from_u64(99);
    for _ in 0..200 {
        let target = NodeId::new(rng.gen());
        let start = ids[rng.gen_range(0..ids.len())];
        let (owner, hops) = ring.route(start, target);
        assert_eq!(owner, ring.owner_of(target));
        assert!(ring.table(&owner).is_responsible(&target));
        assert!(hops <= ids.len());
    }
}

#[test]
fn ring_heals_after_failures() {
    let ids = random_ids(23, 20);
    let mut ring = Ring::new();
    ring.join(ids[0], None);
    for id in &ids[1..] {
        ring.join(*id, Some(ids[0]));
    }

    for dead in [ids[3], ids[11], ids[17]] {
        ring.fail(dead);
        for rt in ring.tables.values() {
            assert!(!rt.is_neighbor(&dead));
            assert!(rt.get_node(&dead).is_none());
        }
        assert_converged(&ring);
    }
}
