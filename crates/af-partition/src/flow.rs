//! Edmonds-Karp maximum flow on a small directed graph.

use std::collections::VecDeque;

/// Capacity treated as uncuttable.
pub const INF: u64 = u64::MAX / 4;

#[derive(Debug, Clone)]
struct Edge {
    to: usize,
    capacity: u64,
    /// Index of the paired reverse edge in `adjacency[to]`.
    reverse: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FlowNetwork {
    adjacency: Vec<Vec<Edge>>,
}

impl FlowNetwork {
    #[must_use]
    pub fn new(vertices: usize) -> Self {
        Self {
            adjacency: vec![Vec::new(); vertices],
        }
    }

    pub fn add_vertex(&mut self) -> usize {
        self.adjacency.push(Vec::new());
        self.adjacency.len() - 1
    }

    #[must_use]
    pub fn vertex_count(&self) -> usize {
        self.adjacency.len()
    }

    pub fn add_edge(&mut self, from: usize, to: usize, capacity: u64) {
        let forward = self.adjacency[to].len() + usize::from(from == to);
        let reverse = self.adjacency[from].len();
        self.adjacency[from].push(Edge {
            to,
            capacity,
            reverse: forward,
        });
        self.adjacency[to].push(Edge {
            to: from,
            capacity: 0,
            reverse,
        });
    }

    /// Pushes flow until no augmenting path remains and returns its value.
    /// Residual capacities are left in place for `reachable_from`.
    pub fn max_flow(&mut self, source: usize, sink: usize) -> u64 {
        let mut total = 0_u64;
        loop {
            let mut parent: Vec<Option<(usize, usize)>> = vec![None; self.adjacency.len()];
            let mut queue = VecDeque::from([source]);
            let mut found = false;
            while let Some(vertex) = queue.pop_front() {
                for (index, edge) in self.adjacency[vertex].iter().enumerate() {
                    if edge.capacity > 0 && edge.to != source && parent[edge.to].is_none() {
                        parent[edge.to] = Some((vertex, index));
                        if edge.to == sink {
                            found = true;
                            break;
                        }
                        queue.push_back(edge.to);
                    }
                }
                if found {
                    break;
                }
            }
            if !found {
                return total;
            }

            let mut bottleneck = u64::MAX;
            let mut vertex = sink;
            while let Some((from, index)) = parent[vertex] {
                bottleneck = bottleneck.min(self.adjacency[from][index].capacity);
                vertex = from;
            }
            let mut vertex = sink;
            while let Some((from, index)) = parent[vertex] {
                let reverse = self.adjacency[from][index].reverse;
                self.adjacency[from][index].capacity -= bottleneck;
                self.adjacency[vertex][reverse].capacity += bottleneck;
                vertex = from;
            }
            total = total.saturating_add(bottleneck);
        }
    }

    /// Vertices reachable from `source` through edges with residual capacity.
    #[must_use]
    pub fn reachable_from(&self, source: usize) -> Vec<bool> {
        let mut seen = vec![false; self.adjacency.len()];
        seen[source] = true;
        let mut queue = VecDeque::from([source]);
        while let Some(vertex) = queue.pop_front() {
            for edge in &self.adjacency[vertex] {
                if edge.capacity > 0 && !seen[edge.to] {
                    seen[edge.to] = true;
                    queue.push_back(edge.to);
                }
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::{FlowNetwork, INF};

    #[test]
    fn classic_network() {
        let mut network = FlowNetwork::new(6);
        for (from, to, capacity) in [
            (0, 1, 16),
            (0, 2, 13),
            (1, 2, 10),
            (2, 1, 4),
            (1, 3, 12),
            (3, 2, 9),
            (2, 4, 14),
            (4, 3, 7),
            (3, 5, 20),
            (4, 5, 4),
        ] {
            network.add_edge(from, to, capacity);
        }
        assert_eq!(network.max_flow(0, 5), 23);
        let side = network.reachable_from(0);
        assert!(side[0] && !side[5]);
    }

    #[test]
    fn the_cheapest_edge_on_a_chain_is_cut() {
        let mut network = FlowNetwork::new(4);
        network.add_edge(0, 1, INF);
        network.add_edge(1, 2, 3);
        network.add_edge(2, 3, 8);
        assert_eq!(network.max_flow(0, 3), 3);
        assert_eq!(network.reachable_from(0), vec![true, true, false, false]);
    }

    #[test]
    fn disconnected_sink_carries_no_flow() {
        let mut network = FlowNetwork::new(3);
        network.add_edge(0, 1, 5);
        assert_eq!(network.max_flow(0, 2), 0);
    }
}
