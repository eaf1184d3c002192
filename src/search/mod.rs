//! Edge-based one-to-many Dijkstra.
//!
//! Search states are `(edge, vertex)` pairs: a visit records "this edge was
//! just traversed, landing at this vertex". That formulation makes u-turn
//! exclusion a single edge-id comparison and gives turn-cost callbacks the
//! full trailing edge list.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};

use smallvec::SmallVec;
use tracing::trace;

use crate::model::{EdgeId, Path, SnapPoint, VertexId, OFFSET_MAX};
use crate::network::{EdgeView, RoutingNetwork};

/// Safety cap on the number of visits appended per run.
pub const VISIT_CAP: usize = 1 << 20;

const NO_VISIT: u32 = u32::MAX;

/// Cost model driving the search.
///
/// `cost` returns `(edge_cost, turn_cost)` for traversing `edge` in the
/// view's direction, after having walked `previous` (most recent first).
/// An edge cost `<= 0` means the edge cannot be traversed, `>= f64::MAX`
/// means it must not be expanded; a turn cost `< 0` is infinite.
pub trait CostFunction {
    fn cost(&mut self, edge: &EdgeView, previous: PathTrace<'_>) -> (f64, f64);

    /// Veto settling a vertex; returning `true` also serves as cooperative
    /// cancellation.
    fn settled(&mut self, _vertex: VertexId) -> bool {
        false
    }

    /// Veto queueing expansions past a vertex.
    fn queued(&mut self, _vertex: VertexId) -> bool {
        false
    }
}

impl<F> CostFunction for F
where
    F: FnMut(&EdgeView, PathTrace<'_>) -> (f64, f64),
{
    fn cost(&mut self, edge: &EdgeView, previous: PathTrace<'_>) -> (f64, f64) {
        self(edge, previous)
    }
}

#[derive(Clone, Copy, Debug)]
struct Visit {
    edge: EdgeId,
    vertex: VertexId,
    forward: bool,
    previous: u32,
}

/// The trailing edge ids of a search branch, most recent first.
pub struct PathTrace<'a> {
    tree: &'a [Visit],
    next: u32,
}

impl<'a> PathTrace<'a> {
    fn empty() -> PathTrace<'static> {
        PathTrace {
            tree: &[],
            next: NO_VISIT,
        }
    }
}

impl Iterator for PathTrace<'_> {
    type Item = EdgeId;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next == NO_VISIT {
            return None;
        }
        let visit = self.tree[self.next as usize];
        self.next = visit.previous;
        Some(visit.edge)
    }
}

struct QueueEntry {
    cost: f64,
    sequence: u32,
    pointer: u32,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // BinaryHeap is a max-heap: invert so the cheapest pops first, with
    // ties broken by insertion order.
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .cost
            .total_cmp(&self.cost)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

struct TargetState {
    snap: SnapPoint,
    best_cost: f64,
    best_pointer: u32,
    direct: Option<Path>,
}

/// A reusable edge-based Dijkstra.
///
/// The heap, path tree and settled set persist across calls and are
/// cleared at entry, so a long-lived per-thread instance amortizes its
/// allocations. Instances are not shared between threads.
#[derive(Default)]
pub struct Dijkstra {
    tree: Vec<Visit>,
    heap: BinaryHeap<QueueEntry>,
    settled: HashSet<u64>,
    sequence: u32,
}

impl Dijkstra {
    pub fn new() -> Self {
        Self::default()
    }

    /// One-to-one convenience over [`Dijkstra::run`].
    pub fn run_one(
        &mut self,
        network: &RoutingNetwork,
        source: SnapPoint,
        target: SnapPoint,
        cost: &mut dyn CostFunction,
    ) -> Option<Path> {
        self.run(network, source, &[target], cost).pop().flatten()
    }

    /// One-to-many search, yielding one optional path per target in input
    /// order. Unreached targets come back as `None`; the search itself
    /// never errors.
    pub fn run(
        &mut self,
        network: &RoutingNetwork,
        source: SnapPoint,
        targets: &[SnapPoint],
        cost: &mut dyn CostFunction,
    ) -> Vec<Option<Path>> {
        self.tree.clear();
        self.heap.clear();
        self.settled.clear();
        self.sequence = 0;
        if targets.is_empty() {
            return Vec::new();
        }

        let Some((source_forward, source_backward)) = directed_views(network, source.edge_id)
        else {
            return vec![None; targets.len()];
        };

        // Injection: each admissible direction enters the search with the
        // cost of the unused portion of the source edge.
        let forward_cost = cost.cost(&source_forward, PathTrace::empty()).0;
        let backward_cost = cost.cost(&source_backward, PathTrace::empty()).0;
        let forward_ok = traversable(forward_cost);
        let backward_ok = traversable(backward_cost);
        if forward_ok {
            let pointer = self.append_visit(source.edge_id, source_forward.head(), true, NO_VISIT);
            self.push(forward_cost * (1.0 - source.offset_factor()), pointer);
        }
        if backward_ok {
            let pointer =
                self.append_visit(source.edge_id, source_backward.head(), false, NO_VISIT);
            self.push(backward_cost * source.offset_factor(), pointer);
        }

        let mut states: Vec<TargetState> = targets
            .iter()
            .map(|&snap| {
                let mut state = TargetState {
                    snap,
                    best_cost: f64::INFINITY,
                    best_pointer: NO_VISIT,
                    direct: None,
                };
                if snap.edge_id == source.edge_id {
                    self.short_circuit(
                        &mut state,
                        source,
                        forward_ok.then_some(forward_cost),
                        backward_ok.then_some(backward_cost),
                    );
                }
                state
            })
            .collect();

        let mut enumerator = network.get_edge_enumerator();
        while let Some(entry) = self.heap.pop() {
            if self.tree.len() >= VISIT_CAP {
                break;
            }
            let visit = self.tree[entry.pointer as usize];
            if self.settled.contains(&visit.vertex.encode()) {
                continue;
            }
            if cost.settled(visit.vertex) {
                continue;
            }
            let bound = states
                .iter()
                .map(|state| state.best_cost)
                .fold(f64::NEG_INFINITY, f64::max);
            if entry.cost >= bound {
                break;
            }
            self.settled.insert(visit.vertex.encode());

            if !enumerator.move_to(visit.vertex) {
                continue;
            }
            while let Some(view) = enumerator.next() {
                let edge = view.id();
                if edge == visit.edge {
                    continue;
                }
                let (edge_cost, turn_cost) = cost.cost(
                    &view,
                    PathTrace {
                        tree: &self.tree,
                        next: entry.pointer,
                    },
                );
                if !traversable(edge_cost) || turn_cost < 0.0 {
                    continue;
                }
                let forward = view.forward();

                let mut step_pointer = None;
                for state in states.iter_mut().filter(|state| state.snap.edge_id == edge) {
                    let fraction = if forward {
                        state.snap.offset_factor()
                    } else {
                        1.0 - state.snap.offset_factor()
                    };
                    let to_target = entry.cost + turn_cost + edge_cost * fraction;
                    if to_target < state.best_cost {
                        let pointer = *step_pointer.get_or_insert_with(|| {
                            self.append_visit(edge, view.head(), forward, entry.pointer)
                        });
                        state.best_cost = to_target;
                        state.best_pointer = pointer;
                        state.direct = None;
                    }
                }

                if cost.queued(view.head()) {
                    continue;
                }
                let pointer = step_pointer.unwrap_or_else(|| {
                    self.append_visit(edge, view.head(), forward, entry.pointer)
                });
                self.push(entry.cost + turn_cost + edge_cost, pointer);
            }
        }

        trace!(
            visits = self.tree.len(),
            settled = self.settled.len(),
            targets = targets.len(),
            "dijkstra finished"
        );
        states
            .into_iter()
            .map(|state| self.build_path(state, source))
            .collect()
    }

    /// Targets on the source edge can be answered without leaving it,
    /// provided the direction matches. Same-offset targets degenerate to a
    /// zero-cost path along the admissible direction, forward preferred.
    fn short_circuit(
        &self,
        state: &mut TargetState,
        source: SnapPoint,
        forward_cost: Option<f64>,
        backward_cost: Option<f64>,
    ) {
        let target = state.snap;
        if let Some(weight) = forward_cost {
            if target.offset >= source.offset {
                let cost = weight * (target.offset_factor() - source.offset_factor());
                if cost < state.best_cost {
                    state.best_cost = cost;
                    state.direct = Some(Path {
                        segments: SmallVec::from_slice(&[(source.edge_id, true)]),
                        offset1: source.offset,
                        offset2: target.offset,
                        cost,
                    });
                }
            }
        }
        if let Some(weight) = backward_cost {
            if target.offset <= source.offset {
                let cost = weight * (source.offset_factor() - target.offset_factor());
                if cost < state.best_cost {
                    state.best_cost = cost;
                    state.direct = Some(Path {
                        segments: SmallVec::from_slice(&[(source.edge_id, false)]),
                        offset1: OFFSET_MAX - source.offset,
                        offset2: OFFSET_MAX - target.offset,
                        cost,
                    });
                }
            }
        }
    }

    fn build_path(&self, state: TargetState, source: SnapPoint) -> Option<Path> {
        if state.best_pointer == NO_VISIT {
            return state.direct;
        }
        let mut segments: SmallVec<[(EdgeId, bool); 8]> = SmallVec::new();
        let mut pointer = state.best_pointer;
        while pointer != NO_VISIT {
            let visit = self.tree[pointer as usize];
            segments.push((visit.edge, visit.forward));
            pointer = visit.previous;
        }
        segments.reverse();
        let (_, first_forward) = segments[0];
        let (_, last_forward) = segments[segments.len() - 1];
        Some(Path {
            offset1: if first_forward {
                source.offset
            } else {
                OFFSET_MAX - source.offset
            },
            offset2: if last_forward {
                state.snap.offset
            } else {
                OFFSET_MAX - state.snap.offset
            },
            cost: state.best_cost,
            segments,
        })
    }

    fn append_visit(&mut self, edge: EdgeId, vertex: VertexId, forward: bool, previous: u32) -> u32 {
        let pointer = self.tree.len() as u32;
        self.tree.push(Visit {
            edge,
            vertex,
            forward,
            previous,
        });
        pointer
    }

    fn push(&mut self, cost: f64, pointer: u32) {
        let sequence = self.sequence;
        self.sequence += 1;
        self.heap.push(QueueEntry {
            cost,
            sequence,
            pointer,
        });
    }
}

fn traversable(edge_cost: f64) -> bool {
    edge_cost > 0.0 && edge_cost < f64::MAX
}

/// Both directed views of a canonical edge: traversal from `v1` and from
/// `v2`.
fn directed_views(network: &RoutingNetwork, edge: EdgeId) -> Option<(EdgeView, EdgeView)> {
    let tile = network.tile_snapshot(edge.tile_id)?;
    let record = tile.resolve(edge)?;
    let forward = EdgeView::new(std::sync::Arc::clone(&tile), record, record.vertex1);
    let backward = EdgeView::new(tile, record, record.vertex2);
    Some((forward, backward))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_pops_cheapest_then_oldest() {
        let mut heap = BinaryHeap::new();
        heap.push(QueueEntry {
            cost: 2.0,
            sequence: 0,
            pointer: 0,
        });
        heap.push(QueueEntry {
            cost: 1.0,
            sequence: 1,
            pointer: 1,
        });
        heap.push(QueueEntry {
            cost: 1.0,
            sequence: 2,
            pointer: 2,
        });
        assert_eq!(heap.pop().map(|e| e.pointer), Some(1));
        assert_eq!(heap.pop().map(|e| e.pointer), Some(2));
        assert_eq!(heap.pop().map(|e| e.pointer), Some(0));
    }

    #[test]
    fn path_trace_walks_most_recent_first() {
        let tree = vec![
            Visit {
                edge: EdgeId::new(0, 0),
                vertex: VertexId::new(0, 1),
                forward: true,
                previous: NO_VISIT,
            },
            Visit {
                edge: EdgeId::new(0, 1),
                vertex: VertexId::new(0, 2),
                forward: true,
                previous: 0,
            },
        ];
        let trace = PathTrace {
            tree: &tree,
            next: 1,
        };
        let edges: Vec<EdgeId> = trace.collect();
        assert_eq!(edges, vec![EdgeId::new(0, 1), EdgeId::new(0, 0)]);
    }

    #[test]
    fn empty_trace_is_empty() {
        assert_eq!(PathTrace::empty().count(), 0);
    }
}
