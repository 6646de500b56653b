//! Per-function control-flow graph.
//!
//! Vertices are basic blocks ordered by ascending start address; edges are
//! control-flow transitions kept in CSR form (sorted by source, with an
//! auxiliary in-edge index). Instructions and call targets of all blocks live
//! in two flat vectors, each block owning a contiguous slice.
//!
//! After construction, [`FlowGraph::calculate_topology`] derives the two BFS
//! level assignments, the per-edge and per-graph MD indices, loop-entry
//! marks and the call-level table. Those signatures are stable for the rest
//! of the run; [`FlowGraph::reset_matches`] only clears match-related state.

use std::collections::{BTreeSet, VecDeque};

use petgraph::algo::dominators::simple_fast;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};

use crate::instruction::Instruction;
use crate::Address;

/// Vertex index within one flow graph.
pub type Vertex = u32;

/// Basic-block level, intra-block call index.
pub type CallLevel = (u16, u16);

pub const EDGE_UNCONDITIONAL: u8 = 1 << 0;
pub const EDGE_TRUE: u8 = 1 << 1;
pub const EDGE_FALSE: u8 = 1 << 2;
pub const EDGE_SWITCH: u8 = 1 << 3;
pub const EDGE_DOMINATED: u8 = 1 << 4;
/// Mask of the edge flag bits that survive [`FlowGraph::reset_matches`].
const EDGE_KIND_MASK: u8 = EDGE_UNCONDITIONAL | EDGE_TRUE | EDGE_FALSE | EDGE_SWITCH | EDGE_DOMINATED;

pub const VERTEX_LOOP_ENTRY: u32 = 1 << 31;

/// Per-basic-block payload.
#[derive(Debug, Clone, Default)]
pub struct VertexInfo {
    pub address: Address,
    /// Product (mod 2^64) of the block's instruction primes.
    pub prime: u64,
    /// High bit: loop entry. Low bits: diagnostic matching-step marks.
    pub flags: u32,
    pub string_hash: u32,
    pub basic_block_hash: u32,
    /// Start index of this block's slice in the instruction vector.
    pub instruction_start: u32,
    /// Start index of this block's slice in the call-target vector.
    pub call_target_start: u32,
    pub bfs_top_down: u16,
    pub bfs_bottom_up: u16,
}

/// Per-edge payload.
#[derive(Debug, Clone, Default)]
pub struct EdgeInfo {
    pub source: Vertex,
    pub target: Vertex,
    pub md_index_top_down: f64,
    pub md_index_bottom_up: f64,
    pub flags: u8,
}

impl EdgeInfo {
    /// A circular edge is a self loop.
    pub fn is_circular(&self) -> bool {
        self.source == self.target
    }
}

#[derive(Debug, Default)]
pub struct FlowGraph {
    entry_point_address: Address,
    call_graph_vertex: Option<u32>,
    vertices: Vec<VertexInfo>,
    /// Sorted by (source, target); contiguous per source.
    edges: Vec<EdgeInfo>,
    out_offsets: Vec<u32>,
    /// Edge indices grouped by target.
    in_edges: Vec<u32>,
    in_offsets: Vec<u32>,
    instructions: Vec<Instruction>,
    call_targets: Vec<Address>,
    /// (vertex, call-site instruction address) in code order.
    call_sites: Vec<(Vertex, Address)>,
    /// Address-sorted call-site levels, filled by `calculate_call_levels`.
    level_for_call: Vec<(Address, CallLevel)>,
    md_index: f64,
    md_index_inverted: f64,
    prime: u64,
    byte_hash: u32,
    string_hash: u32,
    num_loops: u16,
}

impl FlowGraph {
    /// Builds a flow graph from validated parts. `vertices` must be sorted
    /// by ascending address with strictly increasing instruction starts;
    /// ingestion guarantees this for accepted inputs.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        entry_point_address: Address,
        vertices: Vec<VertexInfo>,
        mut edges: Vec<EdgeInfo>,
        instructions: Vec<Instruction>,
        call_targets: Vec<Address>,
        call_sites: Vec<(Vertex, Address)>,
        byte_hash: u32,
        string_hash: u32,
    ) -> Self {
        debug_assert!(vertices.windows(2).all(|w| w[0].address < w[1].address));

        edges.sort_by_key(|e| (e.source, e.target));
        let n = vertices.len();

        let mut out_offsets = vec![0u32; n + 1];
        for e in &edges {
            out_offsets[e.source as usize + 1] += 1;
        }
        for i in 0..n {
            out_offsets[i + 1] += out_offsets[i];
        }

        let mut in_edges: Vec<u32> = (0..edges.len() as u32).collect();
        in_edges.sort_by_key(|&i| (edges[i as usize].target, edges[i as usize].source));
        let mut in_offsets = vec![0u32; n + 1];
        for e in &edges {
            in_offsets[e.target as usize + 1] += 1;
        }
        for i in 0..n {
            in_offsets[i + 1] += in_offsets[i];
        }

        let prime = vertices
            .iter()
            .fold(1u64, |acc, v| acc.wrapping_mul(v.prime));

        Self {
            entry_point_address,
            call_graph_vertex: None,
            vertices,
            edges,
            out_offsets,
            in_edges,
            in_offsets,
            instructions,
            call_targets,
            call_sites,
            level_for_call: Vec::new(),
            md_index: 0.0,
            md_index_inverted: 0.0,
            prime,
            byte_hash,
            string_hash,
            num_loops: 0,
        }
    }

    pub fn entry_point_address(&self) -> Address {
        self.entry_point_address
    }

    /// The entry vertex is the block starting at the function address.
    pub fn entry_vertex(&self) -> Option<Vertex> {
        self.get_vertex(self.entry_point_address)
    }

    pub fn call_graph_vertex(&self) -> Option<u32> {
        self.call_graph_vertex
    }

    pub fn set_call_graph_vertex(&mut self, vertex: u32) {
        self.call_graph_vertex = Some(vertex);
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Binary search for the vertex starting at `address`.
    pub fn get_vertex(&self, address: Address) -> Option<Vertex> {
        self.vertices
            .binary_search_by_key(&address, |v| v.address)
            .ok()
            .map(|i| i as Vertex)
    }

    pub fn address_of(&self, vertex: Vertex) -> Address {
        self.vertices[vertex as usize].address
    }

    pub fn vertex(&self, vertex: Vertex) -> &VertexInfo {
        &self.vertices[vertex as usize]
    }

    pub fn vertices(&self) -> &[VertexInfo] {
        &self.vertices
    }

    pub fn edges(&self) -> &[EdgeInfo] {
        &self.edges
    }

    pub fn edge(&self, index: usize) -> &EdgeInfo {
        &self.edges[index]
    }

    pub fn add_edge_flag(&mut self, index: usize, flag: u8) {
        self.edges[index].flags |= flag;
    }

    pub fn edge_flags(&self, index: usize) -> u8 {
        self.edges[index].flags
    }

    /// Indices of the edges leaving `vertex`; contiguous in the edge vector.
    pub fn out_edge_range(&self, vertex: Vertex) -> std::ops::Range<usize> {
        let v = vertex as usize;
        self.out_offsets[v] as usize..self.out_offsets[v + 1] as usize
    }

    pub fn out_edges(&self, vertex: Vertex) -> &[EdgeInfo] {
        &self.edges[self.out_edge_range(vertex)]
    }

    /// Indices of the edges entering `vertex`.
    pub fn in_edge_indices(&self, vertex: Vertex) -> &[u32] {
        let v = vertex as usize;
        &self.in_edges[self.in_offsets[v] as usize..self.in_offsets[v + 1] as usize]
    }

    pub fn out_degree(&self, vertex: Vertex) -> usize {
        self.out_edge_range(vertex).len()
    }

    pub fn in_degree(&self, vertex: Vertex) -> usize {
        self.in_edge_indices(vertex).len()
    }

    pub fn has_edge(&self, source: Vertex, target: Vertex) -> bool {
        self.edges
            .binary_search_by_key(&(source, target), |e| (e.source, e.target))
            .is_ok()
    }

    pub fn successors(&self, vertex: Vertex) -> impl Iterator<Item = Vertex> + '_ {
        self.out_edges(vertex).iter().map(|e| e.target)
    }

    pub fn predecessors(&self, vertex: Vertex) -> impl Iterator<Item = Vertex> + '_ {
        self.in_edge_indices(vertex)
            .iter()
            .map(move |&i| self.edges[i as usize].source)
    }

    /// The instruction slice of a basic block, in code order.
    pub fn instructions_of(&self, vertex: Vertex) -> &[Instruction] {
        let start = self.vertices[vertex as usize].instruction_start as usize;
        let end = self
            .vertices
            .get(vertex as usize + 1)
            .map_or(self.instructions.len(), |v| v.instruction_start as usize);
        &self.instructions[start..end]
    }

    pub fn instruction_count_of(&self, vertex: Vertex) -> usize {
        self.instructions_of(vertex).len()
    }

    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Global index of the first instruction of `vertex`.
    pub fn instruction_start_of(&self, vertex: Vertex) -> usize {
        self.vertices[vertex as usize].instruction_start as usize
    }

    /// Call targets of a basic block, in order of appearance.
    pub fn call_targets_of(&self, vertex: Vertex) -> &[Address] {
        let start = self.vertices[vertex as usize].call_target_start as usize;
        let end = self
            .vertices
            .get(vertex as usize + 1)
            .map_or(self.call_targets.len(), |v| v.call_target_start as usize);
        &self.call_targets[start..end]
    }

    pub fn call_count_of(&self, vertex: Vertex) -> usize {
        self.call_targets_of(vertex).len()
    }

    pub fn call_targets(&self) -> &[Address] {
        &self.call_targets
    }

    pub fn prime(&self) -> u64 {
        self.prime
    }

    pub fn prime_of(&self, vertex: Vertex) -> u64 {
        self.vertices[vertex as usize].prime
    }

    pub fn byte_hash(&self) -> u32 {
        self.byte_hash
    }

    pub fn byte_hash_of(&self, vertex: Vertex) -> u32 {
        self.vertices[vertex as usize].basic_block_hash
    }

    pub fn string_hash(&self) -> u32 {
        self.string_hash
    }

    pub fn string_hash_of(&self, vertex: Vertex) -> u32 {
        self.vertices[vertex as usize].string_hash
    }

    pub fn flags(&self, vertex: Vertex) -> u32 {
        self.vertices[vertex as usize].flags
    }

    pub fn set_flags(&mut self, vertex: Vertex, flags: u32) {
        self.vertices[vertex as usize].flags = flags;
    }

    pub fn add_vertex_flag(&mut self, vertex: Vertex, flag: u32) {
        self.vertices[vertex as usize].flags |= flag;
    }

    /// A graph is trivial if it consists of a single basic block.
    pub fn is_trivial(&self) -> bool {
        self.vertices.len() == 1
    }

    pub fn is_loop_entry(&self, vertex: Vertex) -> bool {
        self.vertices[vertex as usize].flags & VERTEX_LOOP_ENTRY != 0
    }

    pub fn loop_count(&self) -> u16 {
        self.num_loops
    }

    pub fn topology_level(&self, vertex: Vertex) -> u16 {
        self.vertices[vertex as usize].bfs_top_down
    }

    pub fn topology_level_inverted(&self, vertex: Vertex) -> u16 {
        self.vertices[vertex as usize].bfs_bottom_up
    }

    pub fn md_index(&self) -> f64 {
        self.md_index
    }

    pub fn md_index_inverted(&self) -> f64 {
        self.md_index_inverted
    }

    /// MD index of a vertex: the sum over its incident edges. A self loop
    /// contributes twice, once per incidence list.
    pub fn vertex_md_index(&self, vertex: Vertex) -> f64 {
        let mut sum = 0.0;
        for e in self.out_edges(vertex) {
            sum += e.md_index_top_down;
        }
        for &i in self.in_edge_indices(vertex) {
            sum += self.edges[i as usize].md_index_top_down;
        }
        sum
    }

    pub fn vertex_md_index_inverted(&self, vertex: Vertex) -> f64 {
        let mut sum = 0.0;
        for e in self.out_edges(vertex) {
            sum += e.md_index_bottom_up;
        }
        for &i in self.in_edge_indices(vertex) {
            sum += self.edges[i as usize].md_index_bottom_up;
        }
        sum
    }

    /// Derives BFS levels, MD indices, loop marks and call levels. Must run
    /// once after construction, before matching.
    pub fn calculate_topology(&mut self) {
        self.bfs_top_down();
        self.bfs_bottom_up();
        self.calculate_md_indices();
        self.mark_loops();
        self.calculate_call_levels();
    }

    /// Top-down BFS from the entry vertex. Entry gets level 1; unreachable
    /// vertices keep level 0.
    fn bfs_top_down(&mut self) {
        for v in &mut self.vertices {
            v.bfs_top_down = 0;
        }
        let Some(entry) = self.entry_vertex() else {
            return;
        };
        let mut queue = VecDeque::new();
        self.vertices[entry as usize].bfs_top_down = 1;
        queue.push_back(entry);
        while let Some(v) = queue.pop_front() {
            let level = self.vertices[v as usize].bfs_top_down;
            for i in self.out_edge_range(v) {
                let t = self.edges[i].target;
                if self.vertices[t as usize].bfs_top_down == 0 && t != entry {
                    self.vertices[t as usize].bfs_top_down = level.saturating_add(1);
                    queue.push_back(t);
                }
            }
        }
    }

    /// Bottom-up BFS from a virtual super-sink whose predecessors are the
    /// vertices without out edges. If the graph has no such vertex, every
    /// vertex of the sink strongly-connected components is seeded at level 1
    /// instead.
    fn bfs_bottom_up(&mut self) {
        for v in &mut self.vertices {
            v.bfs_bottom_up = 0;
        }
        let n = self.vertices.len();
        let mut seeds: Vec<Vertex> = (0..n as Vertex)
            .filter(|&v| self.out_degree(v) == 0)
            .collect();
        if seeds.is_empty() && n > 0 {
            seeds = self.sink_scc_vertices();
        }

        let mut queue = VecDeque::new();
        for &v in &seeds {
            self.vertices[v as usize].bfs_bottom_up = 1;
            queue.push_back(v);
        }
        while let Some(v) = queue.pop_front() {
            let level = self.vertices[v as usize].bfs_bottom_up;
            let preds: Vec<Vertex> = self.predecessors(v).collect();
            for p in preds {
                if self.vertices[p as usize].bfs_bottom_up == 0 {
                    self.vertices[p as usize].bfs_bottom_up = level.saturating_add(1);
                    queue.push_back(p);
                }
            }
        }
    }

    /// Vertices of the strongly-connected components with no outgoing edge,
    /// in ascending vertex order.
    fn sink_scc_vertices(&self) -> Vec<Vertex> {
        let graph = self.to_petgraph();
        let sccs = tarjan_scc(&graph);
        let mut component = vec![usize::MAX; self.vertices.len()];
        for (idx, scc) in sccs.iter().enumerate() {
            for &node in scc {
                component[node.index()] = idx;
            }
        }
        let mut is_sink = vec![true; sccs.len()];
        for e in &self.edges {
            if component[e.source as usize] != component[e.target as usize] {
                is_sink[component[e.source as usize]] = false;
            }
        }
        let mut result: Vec<Vertex> = (0..self.vertices.len() as Vertex)
            .filter(|&v| is_sink[component[v as usize]])
            .collect();
        result.sort_unstable();
        result
    }

    /// Per-edge MD terms and the cached per-graph sums.
    fn calculate_md_indices(&mut self) {
        let w_src = std::f64::consts::FRAC_1_SQRT_2;
        let w_dst = 1.0 / 3.0f64.sqrt();
        let w_out = 1.0 / 5.0f64.sqrt();
        let w_in = 1.0 / 7.0f64.sqrt();

        let mut sum_td = 0.0;
        let mut sum_bu = 0.0;
        for i in 0..self.edges.len() {
            let (s, t) = (self.edges[i].source, self.edges[i].target);
            let out_deg = self.out_degree(s) as f64;
            let in_deg = self.in_degree(t) as f64;
            let td = w_src * self.vertices[s as usize].bfs_top_down as f64
                + w_dst * self.vertices[t as usize].bfs_top_down as f64
                + w_out * out_deg
                + w_in * in_deg;
            let bu = w_src * self.vertices[s as usize].bfs_bottom_up as f64
                + w_dst * self.vertices[t as usize].bfs_bottom_up as f64
                + w_out * out_deg
                + w_in * in_deg;
            self.edges[i].md_index_top_down = td;
            self.edges[i].md_index_bottom_up = bu;
            sum_td += td;
            sum_bu += bu;
        }
        self.md_index = sum_td;
        self.md_index_inverted = sum_bu;
    }

    /// Loop detection via the dominator tree of the entry-rooted graph. An
    /// edge (u, v) is a back edge iff v dominates u; v becomes a loop entry
    /// and the edge gets the dominated flag.
    fn mark_loops(&mut self) {
        let Some(entry) = self.entry_vertex() else {
            return;
        };
        let graph = self.to_petgraph();
        let dominators = simple_fast(&graph, NodeIndex::new(entry as usize));
        let idom: Vec<Option<u32>> = (0..self.vertices.len())
            .map(|v| {
                dominators
                    .immediate_dominator(NodeIndex::new(v))
                    .map(|d| d.index() as u32)
            })
            .collect();

        let dominates = |dominator: u32, mut node: u32| -> bool {
            loop {
                if node == dominator {
                    return true;
                }
                match idom[node as usize] {
                    Some(d) if d != node => node = d,
                    _ => return false,
                }
            }
        };

        let mut loop_entries = BTreeSet::new();
        for i in 0..self.edges.len() {
            let (s, t) = (self.edges[i].source, self.edges[i].target);
            if dominates(t, s) {
                self.edges[i].flags |= EDGE_DOMINATED;
                self.vertices[t as usize].flags |= VERTEX_LOOP_ENTRY;
                loop_entries.insert(t);
            }
        }
        self.num_loops = loop_entries.len() as u16;
    }

    fn to_petgraph(&self) -> DiGraph<(), ()> {
        let mut graph = DiGraph::with_capacity(self.vertices.len(), self.edges.len());
        for _ in 0..self.vertices.len() {
            graph.add_node(());
        }
        for e in &self.edges {
            graph.add_edge(
                NodeIndex::new(e.source as usize),
                NodeIndex::new(e.target as usize),
                (),
            );
        }
        graph
    }

    /// Computes the level of every call site: the enclosing block's top-down
    /// BFS level plus the call's 0-based index within the block.
    pub fn calculate_call_levels(&mut self) {
        self.level_for_call.clear();
        let mut per_vertex_index = vec![0u16; self.vertices.len()];
        for &(v, addr) in &self.call_sites {
            let level = self.vertices[v as usize].bfs_top_down;
            let index = per_vertex_index[v as usize];
            per_vertex_index[v as usize] = index.saturating_add(1);
            self.level_for_call.push((addr, (level, index)));
        }
        self.level_for_call.sort_by_key(|e| e.0);
    }

    /// Level lookup for the call at `address`; logarithmic in the number of
    /// calls.
    pub fn get_level_for_call_address(&self, address: Address) -> Option<CallLevel> {
        self.level_for_call
            .binary_search_by_key(&address, |e| e.0)
            .ok()
            .map(|i| self.level_for_call[i].1)
    }

    /// Address-sorted call levels of the whole function.
    pub fn call_levels(&self) -> &[(Address, CallLevel)] {
        &self.level_for_call
    }

    /// Clears match state: the diagnostic step bits on vertices and edges.
    /// Signatures (levels, MD indices, loop marks, hashes) are untouched.
    /// The registry-side function and basic-block matches are dropped by the
    /// owning context.
    pub fn reset_matches(&mut self) {
        for v in &mut self.vertices {
            v.flags &= VERTEX_LOOP_ENTRY;
        }
        for e in &mut self.edges {
            e.flags &= EDGE_KIND_MASK;
        }
    }
}
