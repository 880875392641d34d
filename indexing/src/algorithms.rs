//! Graph algorithms over a borrowed, read-only graph view.
//!
//! The algorithms never touch storage directly: they consume a [`GraphView`]
//! whose implementations iterate the persistent adjacency tables (or an
//! in-memory snapshot). All of them are iterative, not recursive, so deep
//! graphs cannot blow the stack.

use common::{DbResult, EdgeId, NodeId};
use hashbrown::HashMap;
use ordered_float::OrderedFloat;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet, VecDeque};

/// Read-only view of a directed, weighted graph.
///
/// `neighbors` returns outgoing edges; `neighbors_incoming` the reverse
/// direction. Edge weights default to 1.0 where the underlying store has
/// none.
pub trait GraphView {
    /// Every node id in the view.
    fn node_ids(&self) -> DbResult<Vec<NodeId>>;

    /// Outgoing `(edge, target, weight)` triples of a node.
    fn neighbors(&self, node: &NodeId) -> DbResult<Vec<(EdgeId, NodeId, f32)>>;

    /// Incoming `(edge, source, weight)` triples of a node.
    fn neighbors_incoming(&self, node: &NodeId) -> DbResult<Vec<(EdgeId, NodeId, f32)>>;
}

/// An owned in-memory graph, useful for tests and for running algorithms
/// over a bounded subgraph extracted from storage.
#[derive(Default)]
pub struct MemGraph {
    nodes: Vec<NodeId>,
    outgoing: HashMap<NodeId, Vec<(EdgeId, NodeId, f32)>>,
    incoming: HashMap<NodeId, Vec<(EdgeId, NodeId, f32)>>,
}

impl MemGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, id: impl Into<NodeId>) {
        let id = id.into();
        if !self.nodes.contains(&id) {
            self.nodes.push(id);
        }
    }

    pub fn add_edge(
        &mut self,
        edge_id: impl Into<EdgeId>,
        from: impl Into<NodeId>,
        to: impl Into<NodeId>,
        weight: f32,
    ) {
        let edge_id = edge_id.into();
        let from = from.into();
        let to = to.into();
        self.add_node(from.clone());
        self.add_node(to.clone());
        self.outgoing
            .entry(from.clone())
            .or_default()
            .push((edge_id.clone(), to.clone(), weight));
        self.incoming
            .entry(to)
            .or_default()
            .push((edge_id, from, weight));
    }
}

impl GraphView for MemGraph {
    fn node_ids(&self) -> DbResult<Vec<NodeId>> {
        Ok(self.nodes.clone())
    }

    fn neighbors(&self, node: &NodeId) -> DbResult<Vec<(EdgeId, NodeId, f32)>> {
        Ok(self.outgoing.get(node).cloned().unwrap_or_default())
    }

    fn neighbors_incoming(&self, node: &NodeId) -> DbResult<Vec<(EdgeId, NodeId, f32)>> {
        Ok(self.incoming.get(node).cloned().unwrap_or_default())
    }
}

/// Shortest distances from `start` via Dijkstra.
///
/// Returns `node -> (distance, predecessor)`. Stops early when `goal` is
/// reached. Negative weights are clamped to zero.
pub fn dijkstra<G: GraphView>(
    graph: &G,
    start: &NodeId,
    goal: Option<&NodeId>,
) -> DbResult<HashMap<NodeId, (f32, Option<NodeId>)>> {
    let mut distances: HashMap<NodeId, (f32, Option<NodeId>)> = HashMap::new();
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut queue: BinaryHeap<Reverse<(OrderedFloat<f32>, NodeId)>> = BinaryHeap::new();

    distances.insert(start.clone(), (0.0, None));
    queue.push(Reverse((OrderedFloat(0.0), start.clone())));

    while let Some(Reverse((OrderedFloat(current_distance), current))) = queue.pop() {
        if !visited.insert(current.clone()) {
            continue;
        }
        if goal == Some(&current) {
            break;
        }

        for (_, neighbor, weight) in graph.neighbors(&current)? {
            if visited.contains(&neighbor) {
                continue;
            }
            let next = current_distance + weight.max(0.0);
            let better = match distances.get(&neighbor) {
                Some((existing, _)) => next < *existing,
                None => true,
            };
            if better {
                distances.insert(neighbor.clone(), (next, Some(current.clone())));
                queue.push(Reverse((OrderedFloat(next), neighbor)));
            }
        }
    }

    Ok(distances)
}

/// Reconstructs the path `start -> goal` out of a predecessor map.
pub fn reconstruct_path(
    distances: &HashMap<NodeId, (f32, Option<NodeId>)>,
    start: &NodeId,
    goal: &NodeId,
) -> Option<(Vec<NodeId>, f32)> {
    let (cost, _) = distances.get(goal)?;
    let mut path = vec![goal.clone()];
    let mut current = goal.clone();
    while &current != start {
        let (_, prev) = distances.get(&current)?;
        current = prev.clone()?;
        path.push(current.clone());
    }
    path.reverse();
    Some((path, *cost))
}

/// A* search from `start` to `goal` with an admissible heuristic.
pub fn astar<G, H>(
    graph: &G,
    start: &NodeId,
    goal: &NodeId,
    heuristic: H,
) -> DbResult<Option<(Vec<NodeId>, f32)>>
where
    G: GraphView,
    H: Fn(&NodeId) -> f32,
{
    let mut g_score: HashMap<NodeId, (f32, Option<NodeId>)> = HashMap::new();
    let mut closed: HashSet<NodeId> = HashSet::new();
    let mut open: BinaryHeap<Reverse<(OrderedFloat<f32>, NodeId)>> = BinaryHeap::new();

    g_score.insert(start.clone(), (0.0, None));
    open.push(Reverse((OrderedFloat(heuristic(start)), start.clone())));

    while let Some(Reverse((_, current))) = open.pop() {
        if &current == goal {
            return Ok(reconstruct_path(&g_score, start, goal));
        }
        if !closed.insert(current.clone()) {
            continue;
        }

        let current_g = g_score.get(&current).map(|(g, _)| *g).unwrap_or(f32::MAX);
        for (_, neighbor, weight) in graph.neighbors(&current)? {
            if closed.contains(&neighbor) {
                continue;
            }
            let tentative = current_g + weight.max(0.0);
            let better = match g_score.get(&neighbor) {
                Some((existing, _)) => tentative < *existing,
                None => true,
            };
            if better {
                g_score.insert(neighbor.clone(), (tentative, Some(current.clone())));
                open.push(Reverse((
                    OrderedFloat(tentative + heuristic(&neighbor)),
                    neighbor,
                )));
            }
        }
    }

    Ok(None)
}

/// Bellman-Ford shortest paths from `start`; handles negative weights.
///
/// # Errors
///
/// `Invalid` if a negative cycle is reachable from `start`.
pub fn bellman_ford<G: GraphView>(
    graph: &G,
    start: &NodeId,
) -> DbResult<HashMap<NodeId, (f32, Option<NodeId>)>> {
    let nodes = graph.node_ids()?;
    let mut distances: HashMap<NodeId, (f32, Option<NodeId>)> = HashMap::new();
    distances.insert(start.clone(), (0.0, None));

    for _ in 0..nodes.len().saturating_sub(1) {
        let mut changed = false;
        for node in &nodes {
            let Some((node_dist, _)) = distances.get(node).cloned() else {
                continue;
            };
            for (_, neighbor, weight) in graph.neighbors(node)? {
                let next = node_dist + weight;
                let better = match distances.get(&neighbor) {
                    Some((existing, _)) => next < *existing,
                    None => true,
                };
                if better {
                    distances.insert(neighbor, (next, Some(node.clone())));
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    // One more relaxation round detects negative cycles.
    for node in &nodes {
        let Some((node_dist, _)) = distances.get(node).cloned() else {
            continue;
        };
        for (_, neighbor, weight) in graph.neighbors(node)? {
            if let Some((existing, _)) = distances.get(&neighbor) {
                if node_dist + weight < *existing {
                    return Err(common::DbError::Invalid(
                        "negative cycle reachable from start".to_string(),
                    ));
                }
            }
        }
    }

    Ok(distances)
}

/// PageRank over the whole view.
///
/// Standard power iteration with damping; dangling mass is redistributed
/// uniformly. Returns `node -> rank`, summing to ~1.
pub fn page_rank<G: GraphView>(
    graph: &G,
    damping: f64,
    iterations: usize,
) -> DbResult<HashMap<NodeId, f64>> {
    let nodes = graph.node_ids()?;
    let n = nodes.len();
    if n == 0 {
        return Ok(HashMap::new());
    }

    let mut ranks: HashMap<NodeId, f64> = nodes.iter().map(|id| (id.clone(), 1.0 / n as f64)).collect();

    let out_degrees: HashMap<NodeId, usize> = {
        let mut degrees = HashMap::new();
        for node in &nodes {
            degrees.insert(node.clone(), graph.neighbors(node)?.len());
        }
        degrees
    };

    for _ in 0..iterations {
        let mut next: HashMap<NodeId, f64> =
            nodes.iter().map(|id| (id.clone(), (1.0 - damping) / n as f64)).collect();

        let mut dangling_mass = 0.0;
        for node in &nodes {
            let rank = ranks[node];
            let degree = out_degrees[node];
            if degree == 0 {
                dangling_mass += rank;
                continue;
            }
            let share = damping * rank / degree as f64;
            for (_, target, _) in graph.neighbors(node)? {
                if let Some(entry) = next.get_mut(&target) {
                    *entry += share;
                }
            }
        }

        let dangling_share = damping * dangling_mass / n as f64;
        for value in next.values_mut() {
            *value += dangling_share;
        }

        ranks = next;
    }

    Ok(ranks)
}

/// Strongly connected components via iterative Tarjan.
///
/// Components come out in reverse topological order.
pub fn tarjan_scc<G: GraphView>(graph: &G) -> DbResult<Vec<Vec<NodeId>>> {
    struct Frame {
        node: NodeId,
        neighbor_idx: usize,
    }

    let nodes = graph.node_ids()?;
    let mut index_of: HashMap<NodeId, usize> = HashMap::new();
    let mut lowlink: HashMap<NodeId, usize> = HashMap::new();
    let mut on_stack: HashSet<NodeId> = HashSet::new();
    let mut stack: Vec<NodeId> = Vec::new();
    let mut components: Vec<Vec<NodeId>> = Vec::new();
    let mut next_index = 0usize;

    for root in nodes {
        if index_of.contains_key(&root) {
            continue;
        }

        let mut call_stack = vec![Frame {
            node: root.clone(),
            neighbor_idx: 0,
        }];
        index_of.insert(root.clone(), next_index);
        lowlink.insert(root.clone(), next_index);
        next_index += 1;
        stack.push(root.clone());
        on_stack.insert(root);

        while let Some(frame) = call_stack.last_mut() {
            let node = frame.node.clone();
            let neighbors = graph.neighbors(&node)?;

            if frame.neighbor_idx < neighbors.len() {
                let (_, target, _) = neighbors[frame.neighbor_idx].clone();
                frame.neighbor_idx += 1;

                if !index_of.contains_key(&target) {
                    index_of.insert(target.clone(), next_index);
                    lowlink.insert(target.clone(), next_index);
                    next_index += 1;
                    stack.push(target.clone());
                    on_stack.insert(target.clone());
                    call_stack.push(Frame {
                        node: target,
                        neighbor_idx: 0,
                    });
                } else if on_stack.contains(&target) {
                    let target_index = index_of[&target];
                    let entry = lowlink.get_mut(&node).expect("visited node has lowlink");
                    *entry = (*entry).min(target_index);
                }
            } else {
                let finished = call_stack.pop().expect("frame exists");
                let node = finished.node;

                if lowlink[&node] == index_of[&node] {
                    let mut component = Vec::new();
                    while let Some(member) = stack.pop() {
                        on_stack.remove(&member);
                        let done = member == node;
                        component.push(member);
                        if done {
                            break;
                        }
                    }
                    components.push(component);
                }

                if let Some(parent) = call_stack.last() {
                    let child_low = lowlink[&node];
                    let entry = lowlink
                        .get_mut(&parent.node)
                        .expect("parent has lowlink");
                    *entry = (*entry).min(child_low);
                }
            }
        }
    }

    Ok(components)
}

/// Articulation points of the view treated as an undirected graph.
pub fn articulation_points<G: GraphView>(graph: &G) -> DbResult<Vec<NodeId>> {
    // Build an undirected adjacency snapshot once.
    let nodes = graph.node_ids()?;
    let mut adjacency: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for node in &nodes {
        let mut peers: Vec<NodeId> = Vec::new();
        for (_, target, _) in graph.neighbors(node)? {
            peers.push(target);
        }
        for (_, source, _) in graph.neighbors_incoming(node)? {
            peers.push(source);
        }
        peers.sort();
        peers.dedup();
        adjacency.insert(node.clone(), peers);
    }

    let mut disc: HashMap<NodeId, usize> = HashMap::new();
    let mut low: HashMap<NodeId, usize> = HashMap::new();
    let mut cut_points: HashSet<NodeId> = HashSet::new();
    let mut timer = 0usize;

    struct Frame {
        node: NodeId,
        parent: Option<NodeId>,
        child_idx: usize,
        dfs_children: usize,
    }

    for root in &nodes {
        if disc.contains_key(root) {
            continue;
        }

        disc.insert(root.clone(), timer);
        low.insert(root.clone(), timer);
        timer += 1;

        let mut stack = vec![Frame {
            node: root.clone(),
            parent: None,
            child_idx: 0,
            dfs_children: 0,
        }];

        while let Some(frame) = stack.last_mut() {
            let node = frame.node.clone();
            let peers = adjacency.get(&node).cloned().unwrap_or_default();

            if frame.child_idx < peers.len() {
                let peer = peers[frame.child_idx].clone();
                frame.child_idx += 1;

                if Some(&peer) == frame.parent.as_ref() {
                    continue;
                }

                if let Some(&peer_disc) = disc.get(&peer) {
                    let entry = low.get_mut(&node).expect("visited");
                    *entry = (*entry).min(peer_disc);
                } else {
                    frame.dfs_children += 1;
                    disc.insert(peer.clone(), timer);
                    low.insert(peer.clone(), timer);
                    timer += 1;
                    stack.push(Frame {
                        node: peer,
                        parent: Some(node),
                        child_idx: 0,
                        dfs_children: 0,
                    });
                }
            } else {
                let finished = stack.pop().expect("frame exists");

                if let Some(parent_frame) = stack.last() {
                    let child_low = low[&finished.node];
                    let parent = parent_frame.node.clone();
                    let entry = low.get_mut(&parent).expect("visited");
                    *entry = (*entry).min(child_low);

                    let parent_is_root = stack.len() == 1;
                    if !parent_is_root && child_low >= disc[&parent] {
                        cut_points.insert(parent);
                    }
                } else if finished.dfs_children > 1 {
                    // Root with two or more DFS children.
                    cut_points.insert(finished.node);
                }
            }
        }
    }

    let mut result: Vec<NodeId> = cut_points.into_iter().collect();
    result.sort();
    Ok(result)
}

/// Community detection by synchronous label propagation.
///
/// Every node adopts the most common label among its (undirected)
/// neighbors, ties broken by smallest label, until labels stabilize or
/// `max_iterations` passes. Returns `node -> community id`.
pub fn label_propagation<G: GraphView>(
    graph: &G,
    max_iterations: usize,
) -> DbResult<HashMap<NodeId, usize>> {
    let nodes = graph.node_ids()?;
    let mut labels: HashMap<NodeId, usize> = nodes
        .iter()
        .enumerate()
        .map(|(i, id)| (id.clone(), i))
        .collect();

    let mut adjacency: HashMap<NodeId, Vec<NodeId>> = HashMap::new();
    for node in &nodes {
        let mut peers: Vec<NodeId> = Vec::new();
        for (_, target, _) in graph.neighbors(node)? {
            peers.push(target);
        }
        for (_, source, _) in graph.neighbors_incoming(node)? {
            peers.push(source);
        }
        adjacency.insert(node.clone(), peers);
    }

    for _ in 0..max_iterations {
        let mut changed = false;
        let mut next = labels.clone();

        for node in &nodes {
            let peers = &adjacency[node];
            if peers.is_empty() {
                continue;
            }

            let mut counts: HashMap<usize, usize> = HashMap::new();
            for peer in peers {
                *counts.entry(labels[peer]).or_insert(0) += 1;
            }
            let best = counts
                .into_iter()
                .max_by(|a, b| a.1.cmp(&b.1).then(b.0.cmp(&a.0)))
                .map(|(label, _)| label)
                .expect("non-empty peers");

            if best != labels[node] {
                next.insert(node.clone(), best);
                changed = true;
            }
        }

        labels = next;
        if !changed {
            break;
        }
    }

    Ok(labels)
}

/// Breadth-first frontier expansion up to `max_depth` hops, bounded by
/// `frontier_cap` nodes total. The workhorse of query-stage graph
/// expansion.
pub fn bfs_expand<G: GraphView>(
    graph: &G,
    start: &NodeId,
    max_depth: usize,
    frontier_cap: usize,
) -> DbResult<Vec<(NodeId, usize)>> {
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut out: Vec<(NodeId, usize)> = Vec::new();
    let mut queue: VecDeque<(NodeId, usize)> = VecDeque::new();

    visited.insert(start.clone());
    queue.push_back((start.clone(), 0));

    while let Some((node, depth)) = queue.pop_front() {
        if depth >= max_depth {
            continue;
        }
        for (_, peer, _) in graph.neighbors(&node)? {
            if visited.len() >= frontier_cap {
                return Ok(out);
            }
            if visited.insert(peer.clone()) {
                out.push((peer.clone(), depth + 1));
                queue.push_back((peer, depth + 1));
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> MemGraph {
        // a -> b -> d, a -> c -> d; b path cheaper
        let mut g = MemGraph::new();
        g.add_edge("e1", "a", "b", 1.0);
        g.add_edge("e2", "a", "c", 4.0);
        g.add_edge("e3", "b", "d", 1.0);
        g.add_edge("e4", "c", "d", 1.0);
        g
    }

    #[test]
    fn test_dijkstra_shortest_path() {
        let g = diamond();
        let start = NodeId::new("a");
        let goal = NodeId::new("d");
        let distances = dijkstra(&g, &start, Some(&goal)).unwrap();
        let (path, cost) = reconstruct_path(&distances, &start, &goal).unwrap();

        assert_eq!(cost, 2.0);
        assert_eq!(
            path,
            vec![NodeId::new("a"), NodeId::new("b"), NodeId::new("d")]
        );
    }

    #[test]
    fn test_astar_matches_dijkstra_with_zero_heuristic() {
        let g = diamond();
        let result = astar(&g, &NodeId::new("a"), &NodeId::new("d"), |_| 0.0)
            .unwrap()
            .unwrap();
        assert_eq!(result.1, 2.0);
    }

    #[test]
    fn test_astar_unreachable() {
        let mut g = diamond();
        g.add_node("island");
        let result = astar(&g, &NodeId::new("a"), &NodeId::new("island"), |_| 0.0).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_bellman_ford_negative_edge() {
        let mut g = MemGraph::new();
        g.add_edge("e1", "a", "b", 2.0);
        g.add_edge("e2", "b", "c", -1.0);
        let distances = bellman_ford(&g, &NodeId::new("a")).unwrap();
        assert_eq!(distances[&NodeId::new("c")].0, 1.0);
    }

    #[test]
    fn test_bellman_ford_negative_cycle() {
        let mut g = MemGraph::new();
        g.add_edge("e1", "a", "b", 1.0);
        g.add_edge("e2", "b", "a", -3.0);
        let result = bellman_ford(&g, &NodeId::new("a"));
        assert!(result.is_err());
    }

    #[test]
    fn test_page_rank_sums_to_one_and_ranks_hub() {
        let mut g = MemGraph::new();
        g.add_edge("e1", "a", "hub", 1.0);
        g.add_edge("e2", "b", "hub", 1.0);
        g.add_edge("e3", "c", "hub", 1.0);
        g.add_edge("e4", "hub", "a", 1.0);

        let ranks = page_rank(&g, 0.85, 30).unwrap();
        let total: f64 = ranks.values().sum();
        assert!((total - 1.0).abs() < 1e-6);
        assert!(ranks[&NodeId::new("hub")] > ranks[&NodeId::new("b")]);
    }

    #[test]
    fn test_tarjan_scc() {
        let mut g = MemGraph::new();
        // cycle a <-> b, plus c hanging off
        g.add_edge("e1", "a", "b", 1.0);
        g.add_edge("e2", "b", "a", 1.0);
        g.add_edge("e3", "b", "c", 1.0);

        let mut components = tarjan_scc(&g).unwrap();
        for component in &mut components {
            component.sort();
        }
        components.sort_by_key(|c| c.len());

        assert_eq!(components.len(), 2);
        assert_eq!(components[0], vec![NodeId::new("c")]);
        assert_eq!(components[1], vec![NodeId::new("a"), NodeId::new("b")]);
    }

    #[test]
    fn test_articulation_points_chain() {
        let mut g = MemGraph::new();
        // a - b - c: b is the cut point
        g.add_edge("e1", "a", "b", 1.0);
        g.add_edge("e2", "b", "c", 1.0);

        let points = articulation_points(&g).unwrap();
        assert_eq!(points, vec![NodeId::new("b")]);
    }

    #[test]
    fn test_label_propagation_two_cliques() {
        let mut g = MemGraph::new();
        // two triangles joined by one weak edge
        g.add_edge("e1", "a1", "a2", 1.0);
        g.add_edge("e2", "a2", "a3", 1.0);
        g.add_edge("e3", "a3", "a1", 1.0);
        g.add_edge("e4", "b1", "b2", 1.0);
        g.add_edge("e5", "b2", "b3", 1.0);
        g.add_edge("e6", "b3", "b1", 1.0);
        g.add_edge("bridge", "a1", "b1", 1.0);

        let labels = label_propagation(&g, 20).unwrap();
        assert_eq!(labels[&NodeId::new("a1")], labels[&NodeId::new("a2")]);
        assert_eq!(labels[&NodeId::new("a2")], labels[&NodeId::new("a3")]);
        assert_eq!(labels[&NodeId::new("b1")], labels[&NodeId::new("b2")]);
        assert_eq!(labels[&NodeId::new("b2")], labels[&NodeId::new("b3")]);
    }

    #[test]
    fn test_bfs_expand_depth_and_cap() {
        let mut g = MemGraph::new();
        g.add_edge("e1", "a", "b", 1.0);
        g.add_edge("e2", "b", "c", 1.0);
        g.add_edge("e3", "c", "d", 1.0);

        let one_hop = bfs_expand(&g, &NodeId::new("a"), 1, 100).unwrap();
        assert_eq!(one_hop, vec![(NodeId::new("b"), 1)]);

        let deep = bfs_expand(&g, &NodeId::new("a"), 10, 100).unwrap();
        assert_eq!(deep.len(), 3);

        let capped = bfs_expand(&g, &NodeId::new("a"), 10, 2).unwrap();
        assert_eq!(capped.len(), 1);
    }
}
