//! Basic-block-level matching steps.
//!
//! These run within one matched function pair. Vertex-keyed steps partition
//! the unmatched blocks of both functions; edge-keyed steps partition the
//! edges whose endpoints are unmatched and recover vertices from edge
//! endpoints when a group stays ambiguous. The propagation step works off
//! the already-committed block pairs instead of a discriminator.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::context::Side;
use crate::fixed_points::{FixedPoint, FlowGraphId};
use crate::flow_graph::{EdgeInfo, FlowGraph, Vertex, EDGE_DOMINATED};
use crate::function_steps::MD_INDEX_SCALE;
use crate::hashing::hash64;
use crate::matching::{
    cascade_basic_block_candidates, cascade_basic_block_edge_candidates, BasicBlockStep,
    BasicBlockStepQueue, FunctionMatchIndex, KeyedCandidates,
};

fn collect_vertex_candidates(
    graph: &FlowGraph,
    vertices: &[Vertex],
    matched: impl Fn(Vertex) -> bool,
    key: impl Fn(&FlowGraph, Vertex) -> Option<u64>,
) -> KeyedCandidates<Vertex> {
    let mut map = KeyedCandidates::new();
    for &v in vertices {
        if matched(v) {
            continue;
        }
        if let Some(k) = key(graph, v) {
            map.entry(k).or_default().push(v);
        }
    }
    map
}

/// An edge is a candidate when both endpoints are unmatched and at least
/// one endpoint belongs to the candidate vertex set.
fn collect_edge_candidates(
    graph: &FlowGraph,
    vertices: &[Vertex],
    matched: impl Fn(Vertex) -> bool,
    key: impl Fn(&FlowGraph, &EdgeInfo) -> Option<u64>,
) -> KeyedCandidates<u32> {
    let set: FxHashSet<Vertex> = vertices.iter().copied().collect();
    let mut map = KeyedCandidates::new();
    for (i, e) in graph.edges().iter().enumerate() {
        if matched(e.source) || matched(e.target) {
            continue;
        }
        if !set.contains(&e.source) && !set.contains(&e.target) {
            continue;
        }
        if let Some(k) = key(graph, e) {
            map.entry(k).or_default().push(i as u32);
        }
    }
    map
}

#[allow(clippy::too_many_arguments)]
fn find_symmetric(
    primary: &mut FlowGraph,
    secondary: &mut FlowGraph,
    vertices1: &[Vertex],
    vertices2: &[Vertex],
    fixed_point: &mut FixedPoint,
    matches: &FunctionMatchIndex,
    remaining: &mut BasicBlockStepQueue,
    key: impl Fn(&FlowGraph, Vertex) -> Option<u64>,
) -> bool {
    let mut map1 =
        collect_vertex_candidates(primary, vertices1, |v| fixed_point.is_primary_matched(v), &key);
    let mut map2 = collect_vertex_candidates(
        secondary,
        vertices2,
        |v| fixed_point.is_secondary_matched(v),
        &key,
    );
    cascade_basic_block_candidates(
        &mut map1,
        &mut map2,
        primary,
        secondary,
        fixed_point,
        matches,
        remaining,
    )
}

#[allow(clippy::too_many_arguments)]
fn find_symmetric_edges(
    primary: &mut FlowGraph,
    secondary: &mut FlowGraph,
    vertices1: &[Vertex],
    vertices2: &[Vertex],
    fixed_point: &mut FixedPoint,
    matches: &FunctionMatchIndex,
    remaining: &mut BasicBlockStepQueue,
    key: impl Fn(&FlowGraph, &EdgeInfo) -> Option<u64>,
) -> bool {
    let mut map1 =
        collect_edge_candidates(primary, vertices1, |v| fixed_point.is_primary_matched(v), &key);
    let mut map2 = collect_edge_candidates(
        secondary,
        vertices2,
        |v| fixed_point.is_secondary_matched(v),
        &key,
    );
    cascade_basic_block_edge_candidates(
        &mut map1,
        &mut map2,
        primary,
        secondary,
        fixed_point,
        matches,
        remaining,
    )
}

/// Matches blocks by their byte hash.
pub struct BasicBlockStepHash {
    confidence: f64,
}

impl BasicBlockStepHash {
    pub const NAME: &'static str = "basicBlock: hash matching";
    pub const DEFAULT_CONFIDENCE: f64 = 1.0;

    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }
}

impl BasicBlockStep for BasicBlockStepHash {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn display_name(&self) -> &'static str {
        "Basic Block: Hash Matching"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        primary: &mut FlowGraph,
        secondary: &mut FlowGraph,
        vertices1: &[Vertex],
        vertices2: &[Vertex],
        fixed_point: &mut FixedPoint,
        matches: &FunctionMatchIndex,
        remaining: &mut BasicBlockStepQueue,
    ) -> bool {
        find_symmetric(
            primary, secondary, vertices1, vertices2, fixed_point, matches, remaining,
            |g, v| match g.byte_hash_of(v) {
                0 => None,
                h => Some(h as u64),
            },
        )
    }
}

/// Matches blocks by their instruction prime product.
pub struct BasicBlockStepPrime {
    confidence: f64,
}

impl BasicBlockStepPrime {
    pub const NAME: &'static str = "basicBlock: prime matching";
    pub const DEFAULT_CONFIDENCE: f64 = 0.9;

    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }
}

impl BasicBlockStep for BasicBlockStepPrime {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn display_name(&self) -> &'static str {
        "Basic Block: Prime Matching"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        primary: &mut FlowGraph,
        secondary: &mut FlowGraph,
        vertices1: &[Vertex],
        vertices2: &[Vertex],
        fixed_point: &mut FixedPoint,
        matches: &FunctionMatchIndex,
        remaining: &mut BasicBlockStepQueue,
    ) -> bool {
        find_symmetric(
            primary, secondary, vertices1, vertices2, fixed_point, matches, remaining,
            |g, v| Some(g.prime_of(v)),
        )
    }
}

/// Matches blocks through edges keyed by the product of both endpoint
/// primes.
pub struct BasicBlockStepEdgesPrimeProduct {
    confidence: f64,
}

impl BasicBlockStepEdgesPrimeProduct {
    pub const NAME: &'static str = "basicBlock: edges prime product";
    pub const DEFAULT_CONFIDENCE: f64 = 0.85;

    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }
}

impl BasicBlockStep for BasicBlockStepEdgesPrimeProduct {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn display_name(&self) -> &'static str {
        "Basic Block: Edges Prime Product"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn is_edge_matching(&self) -> bool {
        true
    }

    fn find_fixed_points(
        &self,
        primary: &mut FlowGraph,
        secondary: &mut FlowGraph,
        vertices1: &[Vertex],
        vertices2: &[Vertex],
        fixed_point: &mut FixedPoint,
        matches: &FunctionMatchIndex,
        remaining: &mut BasicBlockStepQueue,
    ) -> bool {
        find_symmetric_edges(
            primary, secondary, vertices1, vertices2, fixed_point, matches, remaining,
            |g, e| Some(g.prime_of(e.source).wrapping_mul(g.prime_of(e.target))),
        )
    }
}

/// Matches blocks by the canonical ids of their matched call targets.
pub struct BasicBlockStepCallReferences {
    confidence: f64,
}

impl BasicBlockStepCallReferences {
    pub const NAME: &'static str = "basicBlock: call reference matching";
    pub const DEFAULT_CONFIDENCE: f64 = 0.8;

    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }

    fn key(
        graph: &FlowGraph,
        vertex: Vertex,
        side: Side,
        matches: &FunctionMatchIndex,
    ) -> Option<u64> {
        let targets = graph.call_targets_of(vertex);
        if targets.is_empty() {
            return None;
        }
        let mut canonicals: Vec<FlowGraphId> = Vec::new();
        let mut unmatched: u64 = 0;
        for &target in targets {
            match matches.canonical_for_call_target(side, target) {
                Some(canonical) => canonicals.push(canonical),
                None => unmatched += 1,
            }
        }
        if canonicals.is_empty() {
            return None;
        }
        canonicals.sort_unstable();
        let mut bytes = Vec::with_capacity(canonicals.len() * 4 + 8);
        for canonical in canonicals {
            bytes.extend_from_slice(&canonical.to_le_bytes());
        }
        bytes.extend_from_slice(&unmatched.to_le_bytes());
        Some(hash64(&bytes))
    }
}

impl BasicBlockStep for BasicBlockStepCallReferences {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn display_name(&self) -> &'static str {
        "Basic Block: Call Reference Matching"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        primary: &mut FlowGraph,
        secondary: &mut FlowGraph,
        vertices1: &[Vertex],
        vertices2: &[Vertex],
        fixed_point: &mut FixedPoint,
        matches: &FunctionMatchIndex,
        remaining: &mut BasicBlockStepQueue,
    ) -> bool {
        let mut map1 = collect_vertex_candidates(
            primary,
            vertices1,
            |v| fixed_point.is_primary_matched(v),
            |g, v| Self::key(g, v, Side::Primary, matches),
        );
        let mut map2 = collect_vertex_candidates(
            secondary,
            vertices2,
            |v| fixed_point.is_secondary_matched(v),
            |g, v| Self::key(g, v, Side::Secondary, matches),
        );
        cascade_basic_block_candidates(
            &mut map1,
            &mut map2,
            primary,
            secondary,
            fixed_point,
            matches,
            remaining,
        )
    }
}

/// Matches blocks by their string-reference hash.
pub struct BasicBlockStepStringReferences {
    confidence: f64,
}

impl BasicBlockStepStringReferences {
    pub const NAME: &'static str = "basicBlock: string references matching";
    pub const DEFAULT_CONFIDENCE: f64 = 0.75;

    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }
}

impl BasicBlockStep for BasicBlockStepStringReferences {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn display_name(&self) -> &'static str {
        "Basic Block: String References Matching"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        primary: &mut FlowGraph,
        secondary: &mut FlowGraph,
        vertices1: &[Vertex],
        vertices2: &[Vertex],
        fixed_point: &mut FixedPoint,
        matches: &FunctionMatchIndex,
        remaining: &mut BasicBlockStepQueue,
    ) -> bool {
        find_symmetric(
            primary, secondary, vertices1, vertices2, fixed_point, matches, remaining,
            |g, v| match g.string_hash_of(v) {
                0 => None,
                h => Some(h as u64),
            },
        )
    }
}

/// Matches blocks through edges keyed by bucketed edge MD index.
pub struct BasicBlockStepEdgesMdIndex {
    name: &'static str,
    display_name: &'static str,
    confidence: f64,
    inverted: bool,
}

impl BasicBlockStepEdgesMdIndex {
    pub const NAME_TOP_DOWN: &'static str = "basicBlock: edges MD index (top down)";
    pub const NAME_BOTTOM_UP: &'static str = "basicBlock: edges MD index (bottom up)";
    pub const DEFAULT_CONFIDENCE_TOP_DOWN: f64 = 0.7;
    pub const DEFAULT_CONFIDENCE_BOTTOM_UP: f64 = 0.6;

    pub fn top_down(confidence: f64) -> Self {
        Self {
            name: Self::NAME_TOP_DOWN,
            display_name: "Basic Block: Edges MD Index (Top Down)",
            confidence,
            inverted: false,
        }
    }

    pub fn bottom_up(confidence: f64) -> Self {
        Self {
            name: Self::NAME_BOTTOM_UP,
            display_name: "Basic Block: Edges MD Index (Bottom Up)",
            confidence,
            inverted: true,
        }
    }
}

impl BasicBlockStep for BasicBlockStepEdgesMdIndex {
    fn name(&self) -> &'static str {
        self.name
    }

    fn display_name(&self) -> &'static str {
        self.display_name
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn is_edge_matching(&self) -> bool {
        true
    }

    fn find_fixed_points(
        &self,
        primary: &mut FlowGraph,
        secondary: &mut FlowGraph,
        vertices1: &[Vertex],
        vertices2: &[Vertex],
        fixed_point: &mut FixedPoint,
        matches: &FunctionMatchIndex,
        remaining: &mut BasicBlockStepQueue,
    ) -> bool {
        let inverted = self.inverted;
        find_symmetric_edges(
            primary, secondary, vertices1, vertices2, fixed_point, matches, remaining,
            move |_, e| {
                let md = if inverted {
                    e.md_index_bottom_up
                } else {
                    e.md_index_top_down
                };
                Some((md * MD_INDEX_SCALE) as u64)
            },
        )
    }
}

/// Matches blocks by bucketed vertex MD index plus instruction count. The
/// key is `(md_index * 10^18) as u64 + instruction_count`, kept exactly for
/// compatibility with historical outputs.
pub struct BasicBlockStepInstructionCount {
    confidence: f64,
}

impl BasicBlockStepInstructionCount {
    pub const NAME: &'static str = "basicBlock: instruction count matching";
    pub const DEFAULT_CONFIDENCE: f64 = 0.65;

    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }
}

impl BasicBlockStep for BasicBlockStepInstructionCount {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn display_name(&self) -> &'static str {
        "Basic Block: Instruction Count Matching"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        primary: &mut FlowGraph,
        secondary: &mut FlowGraph,
        vertices1: &[Vertex],
        vertices2: &[Vertex],
        fixed_point: &mut FixedPoint,
        matches: &FunctionMatchIndex,
        remaining: &mut BasicBlockStepQueue,
    ) -> bool {
        find_symmetric(
            primary, secondary, vertices1, vertices2, fixed_point, matches, remaining,
            |g, v| {
                let md = (g.vertex_md_index(v) * MD_INDEX_SCALE) as u64;
                Some(md.wrapping_add(g.instruction_count_of(v) as u64))
            },
        )
    }
}

/// Matches blocks through dominated edges keyed by bucketed edge MD index.
pub struct BasicBlockStepEdgesDominated {
    confidence: f64,
}

impl BasicBlockStepEdgesDominated {
    pub const NAME: &'static str = "basicBlock: edges Lengauer Tarjan dominated";
    pub const DEFAULT_CONFIDENCE: f64 = 0.5;

    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }
}

impl BasicBlockStep for BasicBlockStepEdgesDominated {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn display_name(&self) -> &'static str {
        "Basic Block: Edges Lengauer Tarjan Dominated"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn is_edge_matching(&self) -> bool {
        true
    }

    fn find_fixed_points(
        &self,
        primary: &mut FlowGraph,
        secondary: &mut FlowGraph,
        vertices1: &[Vertex],
        vertices2: &[Vertex],
        fixed_point: &mut FixedPoint,
        matches: &FunctionMatchIndex,
        remaining: &mut BasicBlockStepQueue,
    ) -> bool {
        find_symmetric_edges(
            primary, secondary, vertices1, vertices2, fixed_point, matches, remaining,
            |_, e| {
                if e.flags & EDGE_DOMINATED == 0 {
                    return None;
                }
                Some((e.md_index_top_down * MD_INDEX_SCALE) as u64)
            },
        )
    }
}

/// Matches loop-entry blocks; useful when each side has exactly one.
pub struct BasicBlockStepLoopEntry {
    confidence: f64,
}

impl BasicBlockStepLoopEntry {
    pub const NAME: &'static str = "basicBlock: loop entry matching";
    pub const DEFAULT_CONFIDENCE: f64 = 0.45;

    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }
}

impl BasicBlockStep for BasicBlockStepLoopEntry {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn display_name(&self) -> &'static str {
        "Basic Block: Loop Entry Matching"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        primary: &mut FlowGraph,
        secondary: &mut FlowGraph,
        vertices1: &[Vertex],
        vertices2: &[Vertex],
        fixed_point: &mut FixedPoint,
        matches: &FunctionMatchIndex,
        remaining: &mut BasicBlockStepQueue,
    ) -> bool {
        find_symmetric(
            primary, secondary, vertices1, vertices2, fixed_point, matches, remaining,
            |g, v| g.is_loop_entry(v).then_some(1),
        )
    }
}

/// Matches the two function entry blocks.
pub struct BasicBlockStepEntryPoint {
    confidence: f64,
}

impl BasicBlockStepEntryPoint {
    pub const NAME: &'static str = "basicBlock: entry point matching";
    pub const DEFAULT_CONFIDENCE: f64 = 0.4;

    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }
}

impl BasicBlockStep for BasicBlockStepEntryPoint {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn display_name(&self) -> &'static str {
        "Basic Block: Entry Point Matching"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        primary: &mut FlowGraph,
        secondary: &mut FlowGraph,
        vertices1: &[Vertex],
        vertices2: &[Vertex],
        fixed_point: &mut FixedPoint,
        matches: &FunctionMatchIndex,
        remaining: &mut BasicBlockStepQueue,
    ) -> bool {
        find_symmetric(
            primary, secondary, vertices1, vertices2, fixed_point, matches, remaining,
            |g, v| (g.entry_vertex() == Some(v)).then_some(1),
        )
    }
}

/// Matches blocks without out edges (function exits).
pub struct BasicBlockStepExitPoint {
    confidence: f64,
}

impl BasicBlockStepExitPoint {
    pub const NAME: &'static str = "basicBlock: exit point matching";
    pub const DEFAULT_CONFIDENCE: f64 = 0.35;

    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }
}

impl BasicBlockStep for BasicBlockStepExitPoint {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn display_name(&self) -> &'static str {
        "Basic Block: Exit Point Matching"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        primary: &mut FlowGraph,
        secondary: &mut FlowGraph,
        vertices1: &[Vertex],
        vertices2: &[Vertex],
        fixed_point: &mut FixedPoint,
        matches: &FunctionMatchIndex,
        remaining: &mut BasicBlockStepQueue,
    ) -> bool {
        find_symmetric(
            primary, secondary, vertices1, vertices2, fixed_point, matches, remaining,
            |g, v| (g.out_degree(v) == 0).then_some(1),
        )
    }
}

/// Propagates matches from committed block pairs: when a matched pair has
/// exactly one unmatched neighbor on each side, those two neighbors match.
pub struct BasicBlockStepPropagation {
    confidence: f64,
}

impl BasicBlockStepPropagation {
    pub const NAME: &'static str = "basicBlock: propagation (size==1)";
    pub const DEFAULT_CONFIDENCE: f64 = 0.3;

    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }

    fn unmatched_neighbors(
        graph: &FlowGraph,
        vertex: Vertex,
        matched: impl Fn(Vertex) -> bool,
        allowed: &FxHashSet<Vertex>,
    ) -> Vec<Vertex> {
        let mut neighbors = BTreeSet::new();
        for succ in graph.successors(vertex) {
            if !matched(succ) && allowed.contains(&succ) {
                neighbors.insert(succ);
            }
        }
        for pred in graph.predecessors(vertex) {
            if !matched(pred) && allowed.contains(&pred) {
                neighbors.insert(pred);
            }
        }
        neighbors.into_iter().collect()
    }
}

impl BasicBlockStep for BasicBlockStepPropagation {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn display_name(&self) -> &'static str {
        "Basic Block: Propagation (Size 1)"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        primary: &mut FlowGraph,
        secondary: &mut FlowGraph,
        vertices1: &[Vertex],
        vertices2: &[Vertex],
        fixed_point: &mut FixedPoint,
        _matches: &FunctionMatchIndex,
        _remaining: &mut BasicBlockStepQueue,
    ) -> bool {
        let allowed1: FxHashSet<Vertex> = vertices1.iter().copied().collect();
        let allowed2: FxHashSet<Vertex> = vertices2.iter().copied().collect();
        let mut queue: VecDeque<(Vertex, Vertex)> = fixed_point
            .basic_block_fixed_points()
            .map(|b| (b.primary_vertex, b.secondary_vertex))
            .collect();

        let mut found = false;
        while let Some((pv, sv)) = queue.pop_front() {
            let neighbors1 = Self::unmatched_neighbors(
                primary,
                pv,
                |v| fixed_point.is_primary_matched(v),
                &allowed1,
            );
            let neighbors2 = Self::unmatched_neighbors(
                secondary,
                sv,
                |v| fixed_point.is_secondary_matched(v),
                &allowed2,
            );
            if neighbors1.len() == 1 && neighbors2.len() == 1 {
                let (n1, n2) = (neighbors1[0], neighbors2[0]);
                if fixed_point
                    .add_basic_block_match(primary, secondary, n1, n2, Self::NAME)
                    .is_some()
                {
                    found = true;
                    queue.push_back((n1, n2));
                    queue.push_back((pv, sv));
                }
            }
        }
        found
    }
}

/// The default basic-block pipeline, ordered by decreasing confidence.
pub fn default_basic_block_steps() -> Vec<Arc<dyn BasicBlockStep>> {
    vec![
        Arc::new(BasicBlockStepHash::new(BasicBlockStepHash::DEFAULT_CONFIDENCE)),
        Arc::new(BasicBlockStepPrime::new(BasicBlockStepPrime::DEFAULT_CONFIDENCE)),
        Arc::new(BasicBlockStepEdgesPrimeProduct::new(
            BasicBlockStepEdgesPrimeProduct::DEFAULT_CONFIDENCE,
        )),
        Arc::new(BasicBlockStepCallReferences::new(
            BasicBlockStepCallReferences::DEFAULT_CONFIDENCE,
        )),
        Arc::new(BasicBlockStepStringReferences::new(
            BasicBlockStepStringReferences::DEFAULT_CONFIDENCE,
        )),
        Arc::new(BasicBlockStepEdgesMdIndex::top_down(
            BasicBlockStepEdgesMdIndex::DEFAULT_CONFIDENCE_TOP_DOWN,
        )),
        Arc::new(BasicBlockStepInstructionCount::new(
            BasicBlockStepInstructionCount::DEFAULT_CONFIDENCE,
        )),
        Arc::new(BasicBlockStepEdgesMdIndex::bottom_up(
            BasicBlockStepEdgesMdIndex::DEFAULT_CONFIDENCE_BOTTOM_UP,
        )),
        Arc::new(BasicBlockStepEdgesDominated::new(
            BasicBlockStepEdgesDominated::DEFAULT_CONFIDENCE,
        )),
        Arc::new(BasicBlockStepLoopEntry::new(
            BasicBlockStepLoopEntry::DEFAULT_CONFIDENCE,
        )),
        Arc::new(BasicBlockStepEntryPoint::new(
            BasicBlockStepEntryPoint::DEFAULT_CONFIDENCE,
        )),
        Arc::new(BasicBlockStepExitPoint::new(
            BasicBlockStepExitPoint::DEFAULT_CONFIDENCE,
        )),
        Arc::new(BasicBlockStepPropagation::new(
            BasicBlockStepPropagation::DEFAULT_CONFIDENCE,
        )),
    ]
}

/// Resolves a configured step by name, with an optional confidence override.
pub fn basic_block_step_by_name(
    name: &str,
    confidence: Option<f64>,
) -> Option<Arc<dyn BasicBlockStep>> {
    let step: Arc<dyn BasicBlockStep> = match name {
        BasicBlockStepHash::NAME => Arc::new(BasicBlockStepHash::new(
            confidence.unwrap_or(BasicBlockStepHash::DEFAULT_CONFIDENCE),
        )),
        BasicBlockStepPrime::NAME => Arc::new(BasicBlockStepPrime::new(
            confidence.unwrap_or(BasicBlockStepPrime::DEFAULT_CONFIDENCE),
        )),
        BasicBlockStepEdgesPrimeProduct::NAME => Arc::new(BasicBlockStepEdgesPrimeProduct::new(
            confidence.unwrap_or(BasicBlockStepEdgesPrimeProduct::DEFAULT_CONFIDENCE),
        )),
        BasicBlockStepCallReferences::NAME => Arc::new(BasicBlockStepCallReferences::new(
            confidence.unwrap_or(BasicBlockStepCallReferences::DEFAULT_CONFIDENCE),
        )),
        BasicBlockStepStringReferences::NAME => Arc::new(BasicBlockStepStringReferences::new(
            confidence.unwrap_or(BasicBlockStepStringReferences::DEFAULT_CONFIDENCE),
        )),
        BasicBlockStepEdgesMdIndex::NAME_TOP_DOWN => Arc::new(BasicBlockStepEdgesMdIndex::top_down(
            confidence.unwrap_or(BasicBlockStepEdgesMdIndex::DEFAULT_CONFIDENCE_TOP_DOWN),
        )),
        BasicBlockStepInstructionCount::NAME => Arc::new(BasicBlockStepInstructionCount::new(
            confidence.unwrap_or(BasicBlockStepInstructionCount::DEFAULT_CONFIDENCE),
        )),
        BasicBlockStepEdgesMdIndex::NAME_BOTTOM_UP => {
            Arc::new(BasicBlockStepEdgesMdIndex::bottom_up(
                confidence.unwrap_or(BasicBlockStepEdgesMdIndex::DEFAULT_CONFIDENCE_BOTTOM_UP),
            ))
        }
        BasicBlockStepEdgesDominated::NAME => Arc::new(BasicBlockStepEdgesDominated::new(
            confidence.unwrap_or(BasicBlockStepEdgesDominated::DEFAULT_CONFIDENCE),
        )),
        BasicBlockStepLoopEntry::NAME => Arc::new(BasicBlockStepLoopEntry::new(
            confidence.unwrap_or(BasicBlockStepLoopEntry::DEFAULT_CONFIDENCE),
        )),
        BasicBlockStepEntryPoint::NAME => Arc::new(BasicBlockStepEntryPoint::new(
            confidence.unwrap_or(BasicBlockStepEntryPoint::DEFAULT_CONFIDENCE),
        )),
        BasicBlockStepExitPoint::NAME => Arc::new(BasicBlockStepExitPoint::new(
            confidence.unwrap_or(BasicBlockStepExitPoint::DEFAULT_CONFIDENCE),
        )),
        BasicBlockStepPropagation::NAME => Arc::new(BasicBlockStepPropagation::new(
            confidence.unwrap_or(BasicBlockStepPropagation::DEFAULT_CONFIDENCE),
        )),
        _ => return None,
    };
    Some(step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow_graph::{VertexInfo, EDGE_UNCONDITIONAL};
    use crate::instruction::{Instruction, InstructionCache};

    fn chain_graph(base: crate::Address, mnemonics: &[&str]) -> FlowGraph {
        let cache = InstructionCache::new();
        let mut vertices = Vec::new();
        let mut instructions = Vec::new();
        for (i, m) in mnemonics.iter().enumerate() {
            let address = base + (i as crate::Address) * 0x10;
            let ins = Instruction::new(&cache, address, m, 0);
            vertices.push(VertexInfo {
                address,
                prime: ins.prime() as u64,
                instruction_start: i as u32,
                ..Default::default()
            });
            instructions.push(ins);
        }
        let edges: Vec<EdgeInfo> = (1..mnemonics.len())
            .map(|i| EdgeInfo {
                source: (i - 1) as Vertex,
                target: i as Vertex,
                flags: EDGE_UNCONDITIONAL,
                ..Default::default()
            })
            .collect();
        let mut graph = FlowGraph::new(
            base,
            vertices,
            edges,
            instructions,
            Vec::new(),
            Vec::new(),
            0,
            0,
        );
        graph.calculate_topology();
        graph
    }

    fn queue_of(step: Arc<dyn BasicBlockStep>) -> BasicBlockStepQueue {
        std::iter::once(step).collect()
    }

    #[test]
    fn edges_prime_product_commits_both_endpoints() {
        let mut primary = chain_graph(0x1000, &["push", "mov", "ret"]);
        let mut secondary = chain_graph(0x2000, &["push", "mov", "ret"]);
        let mut fixed_point = FixedPoint::new(0, 0, "test", 1.0);
        let index = FunctionMatchIndex::default();
        let step = BasicBlockStepEdgesPrimeProduct::new(1.0);

        let vertices: Vec<Vertex> = vec![0, 1, 2];
        let found = step.find_fixed_points(
            &mut primary,
            &mut secondary,
            &vertices,
            &vertices,
            &mut fixed_point,
            &index,
            &mut queue_of(Arc::new(BasicBlockStepEdgesPrimeProduct::new(1.0))),
        );
        assert!(found);
        assert_eq!(fixed_point.basic_block_count(), 3);
        for bb in fixed_point.basic_block_fixed_points() {
            assert_eq!(bb.primary_vertex, bb.secondary_vertex);
            assert_eq!(bb.step_name, BasicBlockStepEdgesPrimeProduct::NAME);
        }
    }

    #[test]
    fn propagation_matches_single_unmatched_neighbor() {
        let mut primary = chain_graph(0x1000, &["push", "mov"]);
        let mut secondary = chain_graph(0x2000, &["push", "xor"]);
        let mut fixed_point = FixedPoint::new(0, 0, "test", 1.0);
        let index = FunctionMatchIndex::default();
        fixed_point
            .add_basic_block_match(&primary, &secondary, 0, 0, "seed")
            .unwrap();

        let step = BasicBlockStepPropagation::new(1.0);
        let vertices: Vec<Vertex> = vec![0, 1];
        let found = step.find_fixed_points(
            &mut primary,
            &mut secondary,
            &vertices,
            &vertices,
            &mut fixed_point,
            &index,
            &mut queue_of(Arc::new(BasicBlockStepPropagation::new(1.0))),
        );
        assert!(found);
        let bb = fixed_point.primary_match(1).unwrap();
        assert_eq!(bb.secondary_vertex, 1);
        assert_eq!(bb.step_name, BasicBlockStepPropagation::NAME);
    }

    #[test]
    fn ambiguous_edge_groups_mark_cascade_depth() {
        // An alternating chain makes every edge carry the same prime
        // product, so the whole edge group is ambiguous on both sides.
        let mut primary = chain_graph(0x1000, &["push", "mov", "push", "mov"]);
        let mut secondary = chain_graph(0x2000, &["push", "mov", "push", "mov"]);
        let mut fixed_point = FixedPoint::new(0, 0, "test", 1.0);
        let index = FunctionMatchIndex::default();

        let step = BasicBlockStepEdgesPrimeProduct::new(1.0);
        let vertices: Vec<Vertex> = vec![0, 1, 2, 3];
        // A second queued step puts the cascade depth at 1, so the
        // diagnostic mark lands on a bit the unconditional kind leaves
        // clear.
        let mut queue: BasicBlockStepQueue = [
            Arc::new(BasicBlockStepEdgesPrimeProduct::new(1.0)) as Arc<dyn BasicBlockStep>,
            Arc::new(BasicBlockStepPropagation::new(1.0)) as Arc<dyn BasicBlockStep>,
        ]
        .into_iter()
        .collect();
        step.find_fixed_points(
            &mut primary,
            &mut secondary,
            &vertices,
            &vertices,
            &mut fixed_point,
            &index,
            &mut queue,
        );
        let marked = primary
            .edges()
            .iter()
            .filter(|e| e.flags & (1 << 1) != 0)
            .count();
        assert_eq!(marked, 3);
        assert_eq!(fixed_point.basic_block_count(), 0);
    }
}
