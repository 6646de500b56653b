//! Function-level matching steps.
//!
//! Each step keys the unmatched flow graphs of both sides by one
//! discriminator and feeds the result to the generic cascade. The default
//! catalog is ordered by decreasing confidence; that order is part of the
//! engine's output contract.

use std::sync::Arc;

use crate::context::{MatchingContext, Side};
use crate::fixed_points::FlowGraphId;
use crate::hashing::hash64;
use crate::matching::{
    cascade_function_candidates, FunctionStep, FunctionStepQueue, KeyedCandidates,
};

/// Scale used to bucket MD indices (doubles) into integer keys. The
/// saturating cast is deliberate and must not change: aliased buckets simply
/// cascade to later steps.
pub(crate) const MD_INDEX_SCALE: f64 = 1e18;

fn collect_candidates<F>(
    context: &mut MatchingContext,
    side: Side,
    candidates: &[FlowGraphId],
    key: &mut F,
) -> KeyedCandidates<FlowGraphId>
where
    F: FnMut(&mut MatchingContext, Side, FlowGraphId) -> Option<u64>,
{
    let mut map = KeyedCandidates::new();
    for &id in candidates {
        if context.is_function_matched(side, id) {
            continue;
        }
        if context.flow_graph(side, id).vertex_count() == 0 {
            continue;
        }
        if let Some(k) = key(context, side, id) {
            map.entry(k).or_default().push(id);
        }
    }
    map
}

fn find_with_key<F>(
    parents: Option<(FlowGraphId, FlowGraphId)>,
    candidates1: &[FlowGraphId],
    candidates2: &[FlowGraphId],
    context: &mut MatchingContext,
    remaining: &mut FunctionStepQueue,
    mut key: F,
) -> bool
where
    F: FnMut(&mut MatchingContext, Side, FlowGraphId) -> Option<u64>,
{
    let mut map1 = collect_candidates(context, Side::Primary, candidates1, &mut key);
    let mut map2 = collect_candidates(context, Side::Secondary, candidates2, &mut key);
    cascade_function_candidates(parents, &mut map1, &mut map2, context, remaining)
}

/// Matches functions by the 64-bit hash of their demangled (else raw) name.
/// Only functions with a real, non auto-generated name participate.
pub struct FunctionStepNameHash {
    confidence: f64,
}

impl FunctionStepNameHash {
    pub const NAME: &'static str = "function: name hash matching";
    pub const DEFAULT_CONFIDENCE: f64 = 1.0;

    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }
}

impl FunctionStep for FunctionStepNameHash {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn display_name(&self) -> &'static str {
        "Function: Name Hash Matching"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        parents: Option<(FlowGraphId, FlowGraphId)>,
        candidates1: &[FlowGraphId],
        candidates2: &[FlowGraphId],
        context: &mut MatchingContext,
        remaining: &mut FunctionStepQueue,
    ) -> bool {
        find_with_key(parents, candidates1, candidates2, context, remaining, |ctx, side, id| {
            let graphs = ctx.graphs(side);
            let vertex = graphs.flow_graph(id).call_graph_vertex()?;
            if !graphs.call_graph.has_real_name(vertex) {
                return None;
            }
            Some(hash64(graphs.call_graph.good_name(vertex).as_bytes()))
        })
    }
}

/// Matches functions by their byte hash; functions without raw bytes are
/// skipped.
pub struct FunctionStepHash {
    confidence: f64,
}

impl FunctionStepHash {
    pub const NAME: &'static str = "function: hash matching";
    pub const DEFAULT_CONFIDENCE: f64 = 1.0;

    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }
}

impl FunctionStep for FunctionStepHash {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn display_name(&self) -> &'static str {
        "Function: Hash Matching"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        parents: Option<(FlowGraphId, FlowGraphId)>,
        candidates1: &[FlowGraphId],
        candidates2: &[FlowGraphId],
        context: &mut MatchingContext,
        remaining: &mut FunctionStepQueue,
    ) -> bool {
        find_with_key(parents, candidates1, candidates2, context, remaining, |ctx, side, id| {
            match ctx.flow_graph(side, id).byte_hash() {
                0 => None,
                h => Some(h as u64),
            }
        })
    }
}

/// Matches functions by their instruction prime product.
pub struct FunctionStepPrimeSignature {
    confidence: f64,
}

impl FunctionStepPrimeSignature {
    pub const NAME: &'static str = "function: prime signature matching";
    pub const DEFAULT_CONFIDENCE: f64 = 1.0;

    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }
}

impl FunctionStep for FunctionStepPrimeSignature {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn display_name(&self) -> &'static str {
        "Function: Prime Signature Matching"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        parents: Option<(FlowGraphId, FlowGraphId)>,
        candidates1: &[FlowGraphId],
        candidates2: &[FlowGraphId],
        context: &mut MatchingContext,
        remaining: &mut FunctionStepQueue,
    ) -> bool {
        find_with_key(parents, candidates1, candidates2, context, remaining, |ctx, side, id| {
            Some(ctx.flow_graph(side, id).prime())
        })
    }
}

/// Matches functions by flow-graph MD index, bucketed into a u64.
pub struct FunctionStepMdIndex {
    name: &'static str,
    display_name: &'static str,
    confidence: f64,
    inverted: bool,
}

impl FunctionStepMdIndex {
    pub const NAME_TOP_DOWN: &'static str = "function: MD index matching (flow graph, top down)";
    pub const NAME_BOTTOM_UP: &'static str = "function: MD index matching (flow graph, bottom up)";
    pub const DEFAULT_CONFIDENCE: f64 = 0.9;

    pub fn top_down(confidence: f64) -> Self {
        Self {
            name: Self::NAME_TOP_DOWN,
            display_name: "Function: MD Index Matching (Flow Graph, Top Down)",
            confidence,
            inverted: false,
        }
    }

    pub fn bottom_up(confidence: f64) -> Self {
        Self {
            name: Self::NAME_BOTTOM_UP,
            display_name: "Function: MD Index Matching (Flow Graph, Bottom Up)",
            confidence,
            inverted: true,
        }
    }
}

impl FunctionStep for FunctionStepMdIndex {
    fn name(&self) -> &'static str {
        self.name
    }

    fn display_name(&self) -> &'static str {
        self.display_name
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        parents: Option<(FlowGraphId, FlowGraphId)>,
        candidates1: &[FlowGraphId],
        candidates2: &[FlowGraphId],
        context: &mut MatchingContext,
        remaining: &mut FunctionStepQueue,
    ) -> bool {
        let inverted = self.inverted;
        find_with_key(parents, candidates1, candidates2, context, remaining, move |ctx, side, id| {
            let graph = ctx.flow_graph(side, id);
            let md = if inverted {
                graph.md_index_inverted()
            } else {
                graph.md_index()
            };
            Some((md * MD_INDEX_SCALE) as u64)
        })
    }
}

/// Matches functions by their string-reference hash.
pub struct FunctionStepStringReferences {
    confidence: f64,
}

impl FunctionStepStringReferences {
    pub const NAME: &'static str = "function: string references matching";
    pub const DEFAULT_CONFIDENCE: f64 = 0.8;

    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }
}

impl FunctionStep for FunctionStepStringReferences {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn display_name(&self) -> &'static str {
        "Function: String References Matching"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        parents: Option<(FlowGraphId, FlowGraphId)>,
        candidates1: &[FlowGraphId],
        candidates2: &[FlowGraphId],
        context: &mut MatchingContext,
        remaining: &mut FunctionStepQueue,
    ) -> bool {
        find_with_key(parents, candidates1, candidates2, context, remaining, |ctx, side, id| {
            match ctx.flow_graph(side, id).string_hash() {
                0 => None,
                h => Some(h as u64),
            }
        })
    }
}

/// Matches functions by the hash of their address-ordered call-level
/// sequence. Functions without calls are skipped.
pub struct FunctionStepCallSequence {
    confidence: f64,
}

impl FunctionStepCallSequence {
    pub const NAME: &'static str = "function: call sequence matching";
    pub const DEFAULT_CONFIDENCE: f64 = 0.7;

    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }
}

impl FunctionStep for FunctionStepCallSequence {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn display_name(&self) -> &'static str {
        "Function: Call Sequence Matching"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        parents: Option<(FlowGraphId, FlowGraphId)>,
        candidates1: &[FlowGraphId],
        candidates2: &[FlowGraphId],
        context: &mut MatchingContext,
        remaining: &mut FunctionStepQueue,
    ) -> bool {
        find_with_key(parents, candidates1, candidates2, context, remaining, |ctx, side, id| {
            if ctx.flow_graph(side, id).call_levels().is_empty() {
                return None;
            }
            Some(ctx.call_sequence_hash(side, id))
        })
    }
}

/// Matches functions by the canonical ids of their already-matched call
/// graph neighbors. Pairs up the still-unmatched functions sitting between
/// matched ones.
pub struct FunctionStepCallReferences {
    confidence: f64,
}

impl FunctionStepCallReferences {
    pub const NAME: &'static str = "function: call reference matching";
    pub const DEFAULT_CONFIDENCE: f64 = 0.6;

    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }
}

impl FunctionStep for FunctionStepCallReferences {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn display_name(&self) -> &'static str {
        "Function: Call Reference Matching"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        parents: Option<(FlowGraphId, FlowGraphId)>,
        candidates1: &[FlowGraphId],
        candidates2: &[FlowGraphId],
        context: &mut MatchingContext,
        remaining: &mut FunctionStepQueue,
    ) -> bool {
        find_with_key(parents, candidates1, candidates2, context, remaining, |ctx, side, id| {
            ctx.matched_reference_key(side, id)
        })
    }
}

/// Matches functions by their (edge count, vertex count) pair.
pub struct FunctionStepEdgesVertices {
    confidence: f64,
}

impl FunctionStepEdgesVertices {
    pub const NAME: &'static str = "function: edges/vertices matching";
    pub const DEFAULT_CONFIDENCE: f64 = 0.5;

    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }
}

impl FunctionStep for FunctionStepEdgesVertices {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn display_name(&self) -> &'static str {
        "Function: Edges/Vertices Matching"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        parents: Option<(FlowGraphId, FlowGraphId)>,
        candidates1: &[FlowGraphId],
        candidates2: &[FlowGraphId],
        context: &mut MatchingContext,
        remaining: &mut FunctionStepQueue,
    ) -> bool {
        find_with_key(parents, candidates1, candidates2, context, remaining, |ctx, side, id| {
            let graph = ctx.flow_graph(side, id);
            Some(((graph.edge_count() as u64) << 32) | graph.vertex_count() as u64)
        })
    }
}

/// Matches functions by their loop count; loop-free functions are skipped.
pub struct FunctionStepLoopCount {
    confidence: f64,
}

impl FunctionStepLoopCount {
    pub const NAME: &'static str = "function: loop count matching";
    pub const DEFAULT_CONFIDENCE: f64 = 0.4;

    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }
}

impl FunctionStep for FunctionStepLoopCount {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn display_name(&self) -> &'static str {
        "Function: Loop Count Matching"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        parents: Option<(FlowGraphId, FlowGraphId)>,
        candidates1: &[FlowGraphId],
        candidates2: &[FlowGraphId],
        context: &mut MatchingContext,
        remaining: &mut FunctionStepQueue,
    ) -> bool {
        find_with_key(parents, candidates1, candidates2, context, remaining, |ctx, side, id| {
            match ctx.flow_graph(side, id).loop_count() {
                0 => None,
                n => Some(n as u64),
            }
        })
    }
}

/// Matches functions by total instruction count.
pub struct FunctionStepInstructionCount {
    confidence: f64,
}

impl FunctionStepInstructionCount {
    pub const NAME: &'static str = "function: instruction count matching";
    pub const DEFAULT_CONFIDENCE: f64 = 0.3;

    pub fn new(confidence: f64) -> Self {
        Self { confidence }
    }
}

impl FunctionStep for FunctionStepInstructionCount {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn display_name(&self) -> &'static str {
        "Function: Instruction Count Matching"
    }

    fn confidence(&self) -> f64 {
        self.confidence
    }

    fn find_fixed_points(
        &self,
        parents: Option<(FlowGraphId, FlowGraphId)>,
        candidates1: &[FlowGraphId],
        candidates2: &[FlowGraphId],
        context: &mut MatchingContext,
        remaining: &mut FunctionStepQueue,
    ) -> bool {
        find_with_key(parents, candidates1, candidates2, context, remaining, |ctx, side, id| {
            Some(ctx.flow_graph(side, id).instruction_count() as u64)
        })
    }
}

/// The default function pipeline, ordered by decreasing confidence.
pub fn default_function_steps() -> Vec<Arc<dyn FunctionStep>> {
    vec![
        Arc::new(FunctionStepNameHash::new(FunctionStepNameHash::DEFAULT_CONFIDENCE)),
        Arc::new(FunctionStepHash::new(FunctionStepHash::DEFAULT_CONFIDENCE)),
        Arc::new(FunctionStepPrimeSignature::new(
            FunctionStepPrimeSignature::DEFAULT_CONFIDENCE,
        )),
        Arc::new(FunctionStepMdIndex::top_down(FunctionStepMdIndex::DEFAULT_CONFIDENCE)),
        Arc::new(FunctionStepMdIndex::bottom_up(FunctionStepMdIndex::DEFAULT_CONFIDENCE)),
        Arc::new(FunctionStepStringReferences::new(
            FunctionStepStringReferences::DEFAULT_CONFIDENCE,
        )),
        Arc::new(FunctionStepCallSequence::new(
            FunctionStepCallSequence::DEFAULT_CONFIDENCE,
        )),
        Arc::new(FunctionStepCallReferences::new(
            FunctionStepCallReferences::DEFAULT_CONFIDENCE,
        )),
        Arc::new(FunctionStepEdgesVertices::new(
            FunctionStepEdgesVertices::DEFAULT_CONFIDENCE,
        )),
        Arc::new(FunctionStepLoopCount::new(FunctionStepLoopCount::DEFAULT_CONFIDENCE)),
        Arc::new(FunctionStepInstructionCount::new(
            FunctionStepInstructionCount::DEFAULT_CONFIDENCE,
        )),
    ]
}

/// Resolves a configured step by name, with an optional confidence override.
pub fn function_step_by_name(
    name: &str,
    confidence: Option<f64>,
) -> Option<Arc<dyn FunctionStep>> {
    let step: Arc<dyn FunctionStep> = match name {
        FunctionStepNameHash::NAME => Arc::new(FunctionStepNameHash::new(
            confidence.unwrap_or(FunctionStepNameHash::DEFAULT_CONFIDENCE),
        )),
        FunctionStepHash::NAME => Arc::new(FunctionStepHash::new(
            confidence.unwrap_or(FunctionStepHash::DEFAULT_CONFIDENCE),
        )),
        FunctionStepPrimeSignature::NAME => Arc::new(FunctionStepPrimeSignature::new(
            confidence.unwrap_or(FunctionStepPrimeSignature::DEFAULT_CONFIDENCE),
        )),
        FunctionStepMdIndex::NAME_TOP_DOWN => Arc::new(FunctionStepMdIndex::top_down(
            confidence.unwrap_or(FunctionStepMdIndex::DEFAULT_CONFIDENCE),
        )),
        FunctionStepMdIndex::NAME_BOTTOM_UP => Arc::new(FunctionStepMdIndex::bottom_up(
            confidence.unwrap_or(FunctionStepMdIndex::DEFAULT_CONFIDENCE),
        )),
        FunctionStepStringReferences::NAME => Arc::new(FunctionStepStringReferences::new(
            confidence.unwrap_or(FunctionStepStringReferences::DEFAULT_CONFIDENCE),
        )),
        FunctionStepCallSequence::NAME => Arc::new(FunctionStepCallSequence::new(
            confidence.unwrap_or(FunctionStepCallSequence::DEFAULT_CONFIDENCE),
        )),
        FunctionStepCallReferences::NAME => Arc::new(FunctionStepCallReferences::new(
            confidence.unwrap_or(FunctionStepCallReferences::DEFAULT_CONFIDENCE),
        )),
        FunctionStepEdgesVertices::NAME => Arc::new(FunctionStepEdgesVertices::new(
            confidence.unwrap_or(FunctionStepEdgesVertices::DEFAULT_CONFIDENCE),
        )),
        FunctionStepLoopCount::NAME => Arc::new(FunctionStepLoopCount::new(
            confidence.unwrap_or(FunctionStepLoopCount::DEFAULT_CONFIDENCE),
        )),
        FunctionStepInstructionCount::NAME => Arc::new(FunctionStepInstructionCount::new(
            confidence.unwrap_or(FunctionStepInstructionCount::DEFAULT_CONFIDENCE),
        )),
        _ => return None,
    };
    Some(step)
}
