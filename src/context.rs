//! Shared matching state.
//!
//! The [`MatchingContext`] owns both sides' call graphs and flow-graph
//! vectors, the growing fixed-point registry, and the memoized feature
//! hashes that some discriminators are built from. Matching steps only ever
//! see the context plus candidate ids, so all cross-references go through
//! ids rather than pointers.

use log::debug;
use rustc_hash::FxHashMap;

use crate::call_graph::CallGraph;
use crate::fixed_points::{FixedPoint, FixedPoints, FlowGraphId};
use crate::flow_graph::FlowGraph;
use crate::hashing::hash64;
use crate::ingest::BuiltBinary;

/// Which binary a flow-graph id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Primary,
    Secondary,
}

/// One side of the diff: the call graph and the address-sorted flow graphs
/// it references.
#[derive(Debug, Default)]
pub struct BinaryGraphs {
    pub name: String,
    pub call_graph: CallGraph,
    pub flow_graphs: Vec<FlowGraph>,
}

impl BinaryGraphs {
    pub fn flow_graph(&self, id: FlowGraphId) -> &FlowGraph {
        &self.flow_graphs[id as usize]
    }

    /// Binary search by function entry address.
    pub fn flow_graph_by_address(&self, address: crate::Address) -> Option<FlowGraphId> {
        self.flow_graphs
            .binary_search_by_key(&address, |g| g.entry_point_address())
            .ok()
            .map(|i| i as FlowGraphId)
    }
}

impl From<BuiltBinary> for BinaryGraphs {
    fn from(built: BuiltBinary) -> Self {
        Self {
            name: built.name,
            call_graph: built.call_graph,
            flow_graphs: built.flow_graphs,
        }
    }
}

/// A detached function pair being block-matched; the graphs are temporarily
/// moved out of their arenas so each pair can be processed on its own
/// thread.
pub(crate) struct PairJob {
    pub fixed_point: FixedPoint,
    pub primary: FlowGraph,
    pub secondary: FlowGraph,
}

#[derive(Debug, Default)]
pub struct MatchingContext {
    pub primary: BinaryGraphs,
    pub secondary: BinaryGraphs,
    pub fixed_points: FixedPoints,
    call_sequence_cache: FxHashMap<(Side, FlowGraphId), u64>,
}

impl MatchingContext {
    pub fn new(primary: BinaryGraphs, secondary: BinaryGraphs) -> Self {
        Self {
            primary,
            secondary,
            fixed_points: FixedPoints::new(),
            call_sequence_cache: FxHashMap::default(),
        }
    }

    pub fn graphs(&self, side: Side) -> &BinaryGraphs {
        match side {
            Side::Primary => &self.primary,
            Side::Secondary => &self.secondary,
        }
    }

    pub fn flow_graph(&self, side: Side, id: FlowGraphId) -> &FlowGraph {
        self.graphs(side).flow_graph(id)
    }

    pub fn is_function_matched(&self, side: Side, id: FlowGraphId) -> bool {
        match side {
            Side::Primary => self.fixed_points.is_primary_matched(id),
            Side::Secondary => self.fixed_points.is_secondary_matched(id),
        }
    }

    /// Registers a function-level fixed point. Rejections (either side
    /// already matched) return `None`.
    pub fn add_function_fixed_point(
        &mut self,
        primary: FlowGraphId,
        secondary: FlowGraphId,
        step_name: &'static str,
        confidence: f64,
    ) -> Option<usize> {
        let index = self.fixed_points.add(primary, secondary, step_name, confidence)?;
        debug!(
            "{step_name}: {:#x} matched {:#x}",
            self.primary.flow_graph(primary).entry_point_address(),
            self.secondary.flow_graph(secondary).entry_point_address(),
        );
        Some(index)
    }

    /// Memoized hash over the function's address-ordered call-level
    /// sequence. Stable across the run since call levels are signatures.
    pub fn call_sequence_hash(&mut self, side: Side, id: FlowGraphId) -> u64 {
        if let Some(&h) = self.call_sequence_cache.get(&(side, id)) {
            return h;
        }
        let mut bytes = Vec::new();
        for &(_, (level, index)) in self.flow_graph(side, id).call_levels() {
            bytes.extend_from_slice(&level.to_le_bytes());
            bytes.extend_from_slice(&index.to_le_bytes());
        }
        let h = hash64(&bytes);
        self.call_sequence_cache.insert((side, id), h);
        h
    }

    /// The canonical id of a matched function is its primary-side flow
    /// graph id, which both sides of a fixed point agree on.
    pub fn canonical_match_id(&self, side: Side, id: FlowGraphId) -> Option<FlowGraphId> {
        match side {
            Side::Primary => self.fixed_points.primary_fixed_point(id).map(|f| f.primary()),
            Side::Secondary => self
                .fixed_points
                .secondary_fixed_point(id)
                .map(|f| f.primary()),
        }
    }

    /// Hash over the canonical ids of already-matched call-graph neighbors.
    /// `None` when no neighbor is matched yet; recomputed on demand because
    /// the value changes as matching progresses.
    pub fn matched_reference_key(&self, side: Side, id: FlowGraphId) -> Option<u64> {
        let graphs = self.graphs(side);
        let cg_vertex = graphs.flow_graph(id).call_graph_vertex()?;
        let mut features: Vec<(u8, FlowGraphId)> = Vec::new();
        for callee in graphs.call_graph.callees(cg_vertex) {
            if let Some(fid) = graphs.call_graph.vertex(callee).flow_graph {
                if let Some(canonical) = self.canonical_match_id(side, fid) {
                    features.push((0, canonical));
                }
            }
        }
        for caller in graphs.call_graph.callers(cg_vertex) {
            if let Some(fid) = graphs.call_graph.vertex(caller).flow_graph {
                if let Some(canonical) = self.canonical_match_id(side, fid) {
                    features.push((1, canonical));
                }
            }
        }
        if features.is_empty() {
            return None;
        }
        features.sort_unstable();
        let mut bytes = Vec::with_capacity(features.len() * 5);
        for (tag, canonical) in features {
            bytes.push(tag);
            bytes.extend_from_slice(&canonical.to_le_bytes());
        }
        Some(hash64(&bytes))
    }

    /// Unmatched flow graphs called by `id`, ascending.
    pub fn unmatched_callees(&self, side: Side, id: FlowGraphId) -> Vec<FlowGraphId> {
        self.unmatched_neighbors(side, id, true)
    }

    /// Unmatched flow graphs calling `id`, ascending.
    pub fn unmatched_callers(&self, side: Side, id: FlowGraphId) -> Vec<FlowGraphId> {
        self.unmatched_neighbors(side, id, false)
    }

    fn unmatched_neighbors(&self, side: Side, id: FlowGraphId, callees: bool) -> Vec<FlowGraphId> {
        let graphs = self.graphs(side);
        let Some(cg_vertex) = graphs.flow_graph(id).call_graph_vertex() else {
            return Vec::new();
        };
        let neighbors: Vec<u32> = if callees {
            graphs.call_graph.callees(cg_vertex).collect()
        } else {
            graphs.call_graph.callers(cg_vertex).collect()
        };
        let mut result: Vec<FlowGraphId> = neighbors
            .into_iter()
            .filter_map(|n| graphs.call_graph.vertex(n).flow_graph)
            .filter(|&fid| !self.is_function_matched(side, fid))
            .collect();
        result.sort_unstable();
        result.dedup();
        result
    }

    /// Drops every match while keeping all derived signatures intact.
    pub fn reset_matches(&mut self) {
        self.fixed_points.clear();
        for graph in &mut self.primary.flow_graphs {
            graph.reset_matches();
        }
        for graph in &mut self.secondary.flow_graphs {
            graph.reset_matches();
        }
    }

    pub(crate) fn detach_matched_pairs(&mut self) -> Vec<PairJob> {
        let fixed_points = self.fixed_points.detach();
        fixed_points
            .into_iter()
            .map(|fixed_point| {
                let primary =
                    std::mem::take(&mut self.primary.flow_graphs[fixed_point.primary() as usize]);
                let secondary = std::mem::take(
                    &mut self.secondary.flow_graphs[fixed_point.secondary() as usize],
                );
                PairJob {
                    fixed_point,
                    primary,
                    secondary,
                }
            })
            .collect()
    }

    pub(crate) fn restore_matched_pairs(&mut self, jobs: Vec<PairJob>) {
        let mut items = Vec::with_capacity(jobs.len());
        for job in jobs {
            self.primary.flow_graphs[job.fixed_point.primary() as usize] = job.primary;
            self.secondary.flow_graphs[job.fixed_point.secondary() as usize] = job.secondary;
            items.push(job.fixed_point);
        }
        self.fixed_points.restore(items);
    }
}
