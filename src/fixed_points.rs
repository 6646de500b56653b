//! Fixed points: committed matches between the two binaries.
//!
//! A [`FixedPoint`] pairs one primary flow graph with one secondary flow
//! graph and owns the basic-block matches found inside that pair, each of
//! which carries its instruction matches. The [`FixedPoints`] registry owns
//! all fixed points of a run and enforces that no flow graph is matched
//! twice on either side.

use std::collections::BTreeMap;

use crate::flow_graph::{FlowGraph, Vertex};
use crate::instruction::match_instructions;

/// Step name reserved for matches injected from outside the pipeline, e.g.
/// by an interactive frontend.
pub const MANUAL_STEP_NAME: &str = "basicblock: manual";

/// Index of a flow graph within its side's flow-graph vector.
pub type FlowGraphId = u32;

/// A matched instruction pair: global indices into the two sides'
/// instruction vectors. The primes of both instructions are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstructionMatch {
    pub primary: u32,
    pub secondary: u32,
}

/// A matched basic-block pair within one function pair.
#[derive(Debug, Clone)]
pub struct BasicBlockFixedPoint {
    pub primary_vertex: Vertex,
    pub secondary_vertex: Vertex,
    pub step_name: &'static str,
    pub instruction_matches: Vec<InstructionMatch>,
}

/// A matched function pair plus its basic-block matches.
#[derive(Debug, Clone, Default)]
pub struct FixedPoint {
    primary: FlowGraphId,
    secondary: FlowGraphId,
    step_name: &'static str,
    confidence: f64,
    /// Keyed by primary vertex, so iteration is ordered and a primary
    /// vertex can appear at most once.
    basic_blocks: BTreeMap<Vertex, BasicBlockFixedPoint>,
    /// Reverse index: secondary vertex -> primary vertex.
    secondary_to_primary: BTreeMap<Vertex, Vertex>,
}

impl FixedPoint {
    pub fn new(
        primary: FlowGraphId,
        secondary: FlowGraphId,
        step_name: &'static str,
        confidence: f64,
    ) -> Self {
        Self {
            primary,
            secondary,
            step_name,
            confidence,
            basic_blocks: BTreeMap::new(),
            secondary_to_primary: BTreeMap::new(),
        }
    }

    pub fn primary(&self) -> FlowGraphId {
        self.primary
    }

    pub fn secondary(&self) -> FlowGraphId {
        self.secondary
    }

    pub fn step_name(&self) -> &'static str {
        self.step_name
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Basic-block fixed points in ascending primary-vertex order.
    pub fn basic_block_fixed_points(&self) -> impl Iterator<Item = &BasicBlockFixedPoint> {
        self.basic_blocks.values()
    }

    pub fn basic_block_count(&self) -> usize {
        self.basic_blocks.len()
    }

    pub fn primary_match(&self, vertex: Vertex) -> Option<&BasicBlockFixedPoint> {
        self.basic_blocks.get(&vertex)
    }

    /// The primary counterpart of a matched secondary vertex.
    pub fn secondary_match(&self, vertex: Vertex) -> Option<Vertex> {
        self.secondary_to_primary.get(&vertex).copied()
    }

    pub fn is_primary_matched(&self, vertex: Vertex) -> bool {
        self.basic_blocks.contains_key(&vertex)
    }

    pub fn is_secondary_matched(&self, vertex: Vertex) -> bool {
        self.secondary_to_primary.contains_key(&vertex)
    }

    pub fn matched_instruction_count(&self) -> usize {
        self.basic_blocks
            .values()
            .map(|b| b.instruction_matches.len())
            .sum()
    }

    /// Commits a basic-block match and immediately computes its instruction
    /// matches by LCS over the two instruction slices.
    ///
    /// Returns `None` when either vertex is already matched within this
    /// fixed point; repeating an `add` for an existing pair is a no-op that
    /// also returns `None`.
    pub fn add_basic_block_match(
        &mut self,
        primary: &FlowGraph,
        secondary: &FlowGraph,
        primary_vertex: Vertex,
        secondary_vertex: Vertex,
        step_name: &'static str,
    ) -> Option<Vertex> {
        if self.is_primary_matched(primary_vertex) || self.is_secondary_matched(secondary_vertex) {
            return None;
        }

        let slice1 = primary.instructions_of(primary_vertex);
        let slice2 = secondary.instructions_of(secondary_vertex);
        let base1 = primary.instruction_start_of(primary_vertex) as u32;
        let base2 = secondary.instruction_start_of(secondary_vertex) as u32;
        let instruction_matches = match_instructions(slice1, slice2)
            .into_iter()
            .map(|(i, j)| InstructionMatch {
                primary: base1 + i as u32,
                secondary: base2 + j as u32,
            })
            .collect();

        self.basic_blocks.insert(
            primary_vertex,
            BasicBlockFixedPoint {
                primary_vertex,
                secondary_vertex,
                step_name,
                instruction_matches,
            },
        );
        self.secondary_to_primary
            .insert(secondary_vertex, primary_vertex);
        Some(primary_vertex)
    }

    /// Commits a match under the reserved manual step name.
    pub fn add_manual_match(
        &mut self,
        primary: &FlowGraph,
        secondary: &FlowGraph,
        primary_vertex: Vertex,
        secondary_vertex: Vertex,
    ) -> Option<Vertex> {
        self.add_basic_block_match(
            primary,
            secondary,
            primary_vertex,
            secondary_vertex,
            MANUAL_STEP_NAME,
        )
    }
}

/// The registry of all fixed points of one diff run.
#[derive(Debug, Default)]
pub struct FixedPoints {
    items: Vec<FixedPoint>,
    by_primary: BTreeMap<FlowGraphId, usize>,
    by_secondary: BTreeMap<FlowGraphId, usize>,
}

impl FixedPoints {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function-level fixed point. Returns its index, or `None`
    /// when either flow graph is already matched.
    pub fn add(
        &mut self,
        primary: FlowGraphId,
        secondary: FlowGraphId,
        step_name: &'static str,
        confidence: f64,
    ) -> Option<usize> {
        if self.by_primary.contains_key(&primary) || self.by_secondary.contains_key(&secondary) {
            return None;
        }
        let index = self.items.len();
        self.items
            .push(FixedPoint::new(primary, secondary, step_name, confidence));
        self.by_primary.insert(primary, index);
        self.by_secondary.insert(secondary, index);
        Some(index)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn get(&self, index: usize) -> &FixedPoint {
        &self.items[index]
    }

    pub fn get_mut(&mut self, index: usize) -> &mut FixedPoint {
        &mut self.items[index]
    }

    /// Fixed-point indices ordered by primary flow graph (= primary entry
    /// address, since flow graphs are address sorted).
    pub fn indices_in_primary_order(&self) -> Vec<usize> {
        self.by_primary.values().copied().collect()
    }

    /// Fixed points in primary order.
    pub fn iter(&self) -> impl Iterator<Item = &FixedPoint> {
        self.by_primary.values().map(move |&i| &self.items[i])
    }

    pub fn is_primary_matched(&self, id: FlowGraphId) -> bool {
        self.by_primary.contains_key(&id)
    }

    pub fn is_secondary_matched(&self, id: FlowGraphId) -> bool {
        self.by_secondary.contains_key(&id)
    }

    pub fn primary_fixed_point(&self, id: FlowGraphId) -> Option<&FixedPoint> {
        self.by_primary.get(&id).map(|&i| &self.items[i])
    }

    pub fn secondary_fixed_point(&self, id: FlowGraphId) -> Option<&FixedPoint> {
        self.by_secondary.get(&id).map(|&i| &self.items[i])
    }

    /// Drops all fixed points.
    pub fn clear(&mut self) {
        self.items.clear();
        self.by_primary.clear();
        self.by_secondary.clear();
    }

    /// Moves the fixed points out for the parallel basic-block phase. The
    /// caller must hand the same vector back via [`FixedPoints::restore`].
    pub(crate) fn detach(&mut self) -> Vec<FixedPoint> {
        std::mem::take(&mut self.items)
    }

    pub(crate) fn restore(&mut self, items: Vec<FixedPoint>) {
        debug_assert!(self.items.is_empty());
        debug_assert_eq!(items.len(), self.by_primary.len());
        self.items = items;
    }
}
