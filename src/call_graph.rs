//! Per-binary call graph.
//!
//! Vertices are functions, sorted by ascending address; edges are calls,
//! deduplicated per (caller, callee) pair. A vertex references its flow
//! graph by index into the owning side's flow-graph vector, so the
//! function ↔ flow-graph relation has no ownership cycle.

use crate::Address;

/// Index of a function vertex within one call graph.
pub type CallGraphVertexId = u32;

#[derive(Debug, Clone, Default)]
pub struct CallGraphVertex {
    pub address: Address,
    pub name: String,
    pub demangled_name: String,
    pub library: bool,
    /// Index into the owning side's flow-graph vector, if the function has
    /// a body.
    pub flow_graph: Option<u32>,
}

#[derive(Debug, Default)]
pub struct CallGraph {
    vertices: Vec<CallGraphVertex>,
    /// Sorted by (source, target), deduplicated.
    edges: Vec<(CallGraphVertexId, CallGraphVertexId)>,
    out_offsets: Vec<u32>,
    in_edges: Vec<u32>,
    in_offsets: Vec<u32>,
}

impl CallGraph {
    /// Builds a call graph from address-sorted vertices and raw call edges.
    pub fn new(
        vertices: Vec<CallGraphVertex>,
        mut edges: Vec<(CallGraphVertexId, CallGraphVertexId)>,
    ) -> Self {
        debug_assert!(vertices.windows(2).all(|w| w[0].address < w[1].address));

        edges.sort_unstable();
        edges.dedup();
        let n = vertices.len();

        let mut out_offsets = vec![0u32; n + 1];
        for &(s, _) in &edges {
            out_offsets[s as usize + 1] += 1;
        }
        for i in 0..n {
            out_offsets[i + 1] += out_offsets[i];
        }

        let mut in_edges: Vec<u32> = (0..edges.len() as u32).collect();
        in_edges.sort_by_key(|&i| (edges[i as usize].1, edges[i as usize].0));
        let mut in_offsets = vec![0u32; n + 1];
        for &(_, t) in &edges {
            in_offsets[t as usize + 1] += 1;
        }
        for i in 0..n {
            in_offsets[i + 1] += in_offsets[i];
        }

        Self {
            vertices,
            edges,
            out_offsets,
            in_edges,
            in_offsets,
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn vertex(&self, id: CallGraphVertexId) -> &CallGraphVertex {
        &self.vertices[id as usize]
    }

    pub fn vertices(&self) -> &[CallGraphVertex] {
        &self.vertices
    }

    /// Binary search for the function at `address`.
    pub fn get_vertex(&self, address: Address) -> Option<CallGraphVertexId> {
        self.vertices
            .binary_search_by_key(&address, |v| v.address)
            .ok()
            .map(|i| i as CallGraphVertexId)
    }

    /// Callee vertex ids, ascending.
    pub fn callees(&self, id: CallGraphVertexId) -> impl Iterator<Item = CallGraphVertexId> + '_ {
        let v = id as usize;
        self.edges[self.out_offsets[v] as usize..self.out_offsets[v + 1] as usize]
            .iter()
            .map(|&(_, t)| t)
    }

    /// Caller vertex ids, ascending.
    pub fn callers(&self, id: CallGraphVertexId) -> impl Iterator<Item = CallGraphVertexId> + '_ {
        let v = id as usize;
        self.in_edges[self.in_offsets[v] as usize..self.in_offsets[v + 1] as usize]
            .iter()
            .map(move |&i| self.edges[i as usize].0)
    }

    pub fn is_library(&self, id: CallGraphVertexId) -> bool {
        self.vertices[id as usize].library
    }

    /// Demangled name when present, raw name otherwise.
    pub fn good_name(&self, id: CallGraphVertexId) -> &str {
        let v = &self.vertices[id as usize];
        if v.demangled_name.is_empty() {
            &v.name
        } else {
            &v.demangled_name
        }
    }

    /// A name is "real" when it is present and not an auto-generated
    /// `sub_<address>` label.
    pub fn has_real_name(&self, id: CallGraphVertexId) -> bool {
        let v = &self.vertices[id as usize];
        !v.name.is_empty() && !v.name.eq_ignore_ascii_case(&format!("sub_{:x}", v.address))
    }
}
