//! The matching-step framework.
//!
//! Matching runs in two cascading pipelines. Function-level steps partition
//! both sides' unmatched flow graphs by a 64-bit discriminator; groups that
//! are unique on both sides commit as fixed points, ambiguous groups recurse
//! into the remaining step tail and are then withdrawn from the current
//! step's maps. The driver runs every catalog step as the head of its tail,
//! then repeatedly drills down the call graph from existing fixed points
//! (unmatched callees, then unmatched callers) until no new pair appears.
//!
//! Basic-block matching then runs per function pair, parallel across pairs
//! and sequential within one; the basic-block cascade has the same shape,
//! plus an edge-keyed variant that recovers candidate vertices from edge
//! endpoints. Step ordering is a commitment contract: earlier steps are
//! higher confidence and their matches are never reconsidered.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use log::debug;
use rayon::prelude::*;

use crate::context::{MatchingContext, Side};
use crate::fixed_points::{FixedPoint, FlowGraphId};
use crate::flow_graph::{FlowGraph, Vertex};
use crate::{Address, CancelToken, DiffError};

/// Key → candidate multimap. `BTreeMap` keeps keys ascending, which the
/// deterministic-output guarantee relies on.
pub type KeyedCandidates<T> = BTreeMap<u64, Vec<T>>;

pub type FunctionStepQueue = VecDeque<Arc<dyn FunctionStep>>;
pub type BasicBlockStepQueue = VecDeque<Arc<dyn BasicBlockStep>>;

/// A function-level matching strategy.
pub trait FunctionStep: Send + Sync {
    fn name(&self) -> &'static str;
    fn display_name(&self) -> &'static str;
    fn confidence(&self) -> f64;

    /// Partitions the candidates by this step's discriminator and runs the
    /// cascade. `remaining` has this step at the front; implementations pass
    /// it to [`cascade_function_candidates`], which pops it.
    fn find_fixed_points(
        &self,
        parents: Option<(FlowGraphId, FlowGraphId)>,
        candidates1: &[FlowGraphId],
        candidates2: &[FlowGraphId],
        context: &mut MatchingContext,
        remaining: &mut FunctionStepQueue,
    ) -> bool;
}

/// A basic-block-level matching strategy within one function pair.
pub trait BasicBlockStep: Send + Sync {
    fn name(&self) -> &'static str;
    fn display_name(&self) -> &'static str;
    fn confidence(&self) -> f64;

    /// Whether this step keys on edges rather than vertices.
    fn is_edge_matching(&self) -> bool {
        false
    }

    #[allow(clippy::too_many_arguments)]
    fn find_fixed_points(
        &self,
        primary: &mut FlowGraph,
        secondary: &mut FlowGraph,
        vertices1: &[Vertex],
        vertices2: &[Vertex],
        fixed_point: &mut FixedPoint,
        matches: &FunctionMatchIndex,
        remaining: &mut BasicBlockStepQueue,
    ) -> bool;
}

/// Read-only snapshot of the function-level match state, handed to the
/// basic-block phase so call-reference discriminators can resolve call
/// targets to canonical ids while the registry itself is detached.
#[derive(Debug, Default)]
pub struct FunctionMatchIndex {
    primary: BTreeMap<Address, FlowGraphId>,
    secondary: BTreeMap<Address, FlowGraphId>,
}

impl FunctionMatchIndex {
    pub fn build(context: &MatchingContext) -> Self {
        let mut index = Self::default();
        for fixed_point in context.fixed_points.iter() {
            let primary_address = context
                .primary
                .flow_graph(fixed_point.primary())
                .entry_point_address();
            let secondary_address = context
                .secondary
                .flow_graph(fixed_point.secondary())
                .entry_point_address();
            index.primary.insert(primary_address, fixed_point.primary());
            index
                .secondary
                .insert(secondary_address, fixed_point.primary());
        }
        index
    }

    /// Canonical id of the matched function at `address` on `side`, if any.
    pub fn canonical_for_call_target(&self, side: Side, address: Address) -> Option<FlowGraphId> {
        match side {
            Side::Primary => self.primary.get(&address).copied(),
            Side::Secondary => self.secondary.get(&address).copied(),
        }
    }
}

/// The generic function-level candidate cascade.
pub fn cascade_function_candidates(
    parents: Option<(FlowGraphId, FlowGraphId)>,
    map1: &mut KeyedCandidates<FlowGraphId>,
    map2: &mut KeyedCandidates<FlowGraphId>,
    context: &mut MatchingContext,
    steps: &mut FunctionStepQueue,
) -> bool {
    let Some(current) = steps.pop_front() else {
        return false;
    };
    let name = current.name();
    let confidence = current.confidence();

    let mut found = false;
    let keys: Vec<u64> = map1.keys().copied().collect();
    for key in keys {
        let count1 = map1.get(&key).map_or(0, Vec::len);
        let count2 = map2.get(&key).map_or(0, Vec::len);
        if count1 == 0 || count2 == 0 {
            continue;
        }
        if count1 == 1 && count2 == 1 {
            let primary = map1[&key][0];
            let secondary = map2[&key][0];
            if context
                .add_function_fixed_point(primary, secondary, name, confidence)
                .is_some()
            {
                found = true;
            }
            continue;
        }

        // Ambiguous: hand the group to the next step, then withdraw it.
        if let Some(next) = steps.front().cloned() {
            let candidates1: Vec<FlowGraphId> = map1[&key]
                .iter()
                .copied()
                .filter(|&id| !context.is_function_matched(Side::Primary, id))
                .collect();
            let candidates2: Vec<FlowGraphId> = map2[&key]
                .iter()
                .copied()
                .filter(|&id| !context.is_function_matched(Side::Secondary, id))
                .collect();
            if !candidates1.is_empty() && !candidates2.is_empty() {
                found |=
                    next.find_fixed_points(parents, &candidates1, &candidates2, context, steps);
                steps.push_front(next);
            }
        }
        map1.remove(&key);
        map2.remove(&key);
    }
    found
}

/// The generic vertex-keyed basic-block cascade.
#[allow(clippy::too_many_arguments)]
pub fn cascade_basic_block_candidates(
    map1: &mut KeyedCandidates<Vertex>,
    map2: &mut KeyedCandidates<Vertex>,
    primary: &mut FlowGraph,
    secondary: &mut FlowGraph,
    fixed_point: &mut FixedPoint,
    matches: &FunctionMatchIndex,
    steps: &mut BasicBlockStepQueue,
) -> bool {
    let Some(current) = steps.pop_front() else {
        return false;
    };
    let name = current.name();
    let step_bit = 1u32 << (steps.len().min(30) as u32);

    let mut found = false;
    let keys: Vec<u64> = map1.keys().copied().collect();
    for key in keys {
        let count1 = map1.get(&key).map_or(0, Vec::len);
        let count2 = map2.get(&key).map_or(0, Vec::len);
        if count1 == 0 || count2 == 0 {
            continue;
        }
        if count1 == 1 && count2 == 1 {
            let v1 = map1[&key][0];
            let v2 = map2[&key][0];
            if fixed_point
                .add_basic_block_match(primary, secondary, v1, v2, name)
                .is_some()
            {
                primary.add_vertex_flag(v1, step_bit);
                secondary.add_vertex_flag(v2, step_bit);
                found = true;
            }
            continue;
        }

        if let Some(next) = steps.front().cloned() {
            let candidates1: Vec<Vertex> = map1[&key]
                .iter()
                .copied()
                .filter(|&v| !fixed_point.is_primary_matched(v))
                .collect();
            let candidates2: Vec<Vertex> = map2[&key]
                .iter()
                .copied()
                .filter(|&v| !fixed_point.is_secondary_matched(v))
                .collect();
            if !candidates1.is_empty() && !candidates2.is_empty() {
                found |= next.find_fixed_points(
                    primary,
                    secondary,
                    &candidates1,
                    &candidates2,
                    fixed_point,
                    matches,
                    steps,
                );
                steps.push_front(next);
            }
        }
        map1.remove(&key);
        map2.remove(&key);
    }
    found
}

/// The edge-keyed basic-block cascade. Unique edge pairs commit both their
/// endpoint pairs; ambiguous groups mark the cascade depth on the involved
/// edges (diagnostic), recover the unmatched endpoints and hand those to
/// the next step.
#[allow(clippy::too_many_arguments)]
pub fn cascade_basic_block_edge_candidates(
    map1: &mut KeyedCandidates<u32>,
    map2: &mut KeyedCandidates<u32>,
    primary: &mut FlowGraph,
    secondary: &mut FlowGraph,
    fixed_point: &mut FixedPoint,
    matches: &FunctionMatchIndex,
    steps: &mut BasicBlockStepQueue,
) -> bool {
    let Some(current) = steps.pop_front() else {
        return false;
    };
    let name = current.name();
    let step_index = steps.len();
    let step_bit = 1u32 << (step_index.min(30) as u32);

    let mut found = false;
    let keys: Vec<u64> = map1.keys().copied().collect();
    for key in keys {
        let count1 = map1.get(&key).map_or(0, Vec::len);
        let count2 = map2.get(&key).map_or(0, Vec::len);
        if count1 == 0 {
            continue;
        }
        if count1 != 1 || count2 != 1 {
            if count1 >= 1 && count2 >= 1 {
                if step_index < 8 {
                    let flag = 1u8 << step_index;
                    for &e in &map1[&key] {
                        primary.add_edge_flag(e as usize, flag);
                    }
                    for &e in &map2[&key] {
                        secondary.add_edge_flag(e as usize, flag);
                    }
                }
                if let Some(next) = steps.front().cloned() {
                    let candidates1 = unmatched_edge_endpoints(primary, &map1[&key], |v| {
                        fixed_point.is_primary_matched(v)
                    });
                    let candidates2 = unmatched_edge_endpoints(secondary, &map2[&key], |v| {
                        fixed_point.is_secondary_matched(v)
                    });
                    if !candidates1.is_empty() && !candidates2.is_empty() {
                        found |= next.find_fixed_points(
                            primary,
                            secondary,
                            &candidates1,
                            &candidates2,
                            fixed_point,
                            matches,
                            steps,
                        );
                        steps.push_front(next);
                    }
                }
            }
            map1.remove(&key);
            map2.remove(&key);
            continue;
        }

        let e1 = map1[&key][0] as usize;
        let e2 = map2[&key][0] as usize;
        let (s1, t1) = (primary.edge(e1).source, primary.edge(e1).target);
        let (s2, t2) = (secondary.edge(e2).source, secondary.edge(e2).target);
        if fixed_point
            .add_basic_block_match(primary, secondary, s1, s2, name)
            .is_some()
        {
            primary.add_vertex_flag(s1, step_bit);
            secondary.add_vertex_flag(s2, step_bit);
            found = true;
        }
        if fixed_point
            .add_basic_block_match(primary, secondary, t1, t2, name)
            .is_some()
        {
            primary.add_vertex_flag(t1, step_bit);
            secondary.add_vertex_flag(t2, step_bit);
            found = true;
        }
    }
    found
}

fn unmatched_edge_endpoints(
    graph: &FlowGraph,
    edges: &[u32],
    is_matched: impl Fn(Vertex) -> bool,
) -> Vec<Vertex> {
    let mut vertices = BTreeSet::new();
    for &e in edges {
        let edge = graph.edge(e as usize);
        if !is_matched(edge.source) {
            vertices.insert(edge.source);
        }
        if !is_matched(edge.target) {
            vertices.insert(edge.target);
        }
    }
    vertices.into_iter().collect()
}

/// Runs every catalog step as the head of its remaining tail over the given
/// candidate sets.
pub fn run_function_pipeline(
    parents: Option<(FlowGraphId, FlowGraphId)>,
    set1: &[FlowGraphId],
    set2: &[FlowGraphId],
    context: &mut MatchingContext,
    catalog: &[Arc<dyn FunctionStep>],
) -> bool {
    let mut found = false;
    for start in 0..catalog.len() {
        let mut queue: FunctionStepQueue = catalog[start..].iter().cloned().collect();
        let head = queue.front().expect("non-empty tail").clone();
        found |= head.find_fixed_points(parents, set1, set2, context, &mut queue);
    }
    found
}

/// Function-level matching: the initial pass over the full sets, then the
/// call-graph drill-down until quiescent. Cancellation is honored between
/// function pairs; already-committed fixed points are retained.
pub fn match_functions(
    context: &mut MatchingContext,
    catalog: &[Arc<dyn FunctionStep>],
    cancel: &CancelToken,
) -> Result<(), DiffError> {
    let all1: Vec<FlowGraphId> = (0..context.primary.flow_graphs.len() as u32).collect();
    let all2: Vec<FlowGraphId> = (0..context.secondary.flow_graphs.len() as u32).collect();
    run_function_pipeline(None, &all1, &all2, context, catalog);

    loop {
        if cancel.is_cancelled() {
            return Err(DiffError::Cancelled);
        }
        let mut more = false;
        for index in context.fixed_points.indices_in_primary_order() {
            if cancel.is_cancelled() {
                return Err(DiffError::Cancelled);
            }
            let (primary, secondary) = {
                let fixed_point = context.fixed_points.get(index);
                (fixed_point.primary(), fixed_point.secondary())
            };

            let children1 = context.unmatched_callees(Side::Primary, primary);
            let children2 = context.unmatched_callees(Side::Secondary, secondary);
            if !children1.is_empty() && !children2.is_empty() {
                more |= run_function_pipeline(
                    Some((primary, secondary)),
                    &children1,
                    &children2,
                    context,
                    catalog,
                );
            }

            let callers1 = context.unmatched_callers(Side::Primary, primary);
            let callers2 = context.unmatched_callers(Side::Secondary, secondary);
            if !callers1.is_empty() && !callers2.is_empty() {
                more |= run_function_pipeline(
                    Some((primary, secondary)),
                    &callers1,
                    &callers2,
                    context,
                    catalog,
                );
            }
        }
        if !more {
            break;
        }
    }
    debug!(
        "function matching done, {} fixed points",
        context.fixed_points.len()
    );
    Ok(())
}

/// Basic-block matching for one function pair: every catalog step as head
/// over the still-unmatched vertices.
pub fn match_basic_blocks_pair(
    primary: &mut FlowGraph,
    secondary: &mut FlowGraph,
    fixed_point: &mut FixedPoint,
    matches: &FunctionMatchIndex,
    catalog: &[Arc<dyn BasicBlockStep>],
) -> bool {
    let mut found = false;
    for start in 0..catalog.len() {
        let vertices1: Vec<Vertex> = (0..primary.vertex_count() as Vertex)
            .filter(|&v| !fixed_point.is_primary_matched(v))
            .collect();
        let vertices2: Vec<Vertex> = (0..secondary.vertex_count() as Vertex)
            .filter(|&v| !fixed_point.is_secondary_matched(v))
            .collect();
        if vertices1.is_empty() || vertices2.is_empty() {
            break;
        }
        let mut queue: BasicBlockStepQueue = catalog[start..].iter().cloned().collect();
        let head = queue.front().expect("non-empty tail").clone();
        found |= head.find_fixed_points(
            primary,
            secondary,
            &vertices1,
            &vertices2,
            fixed_point,
            matches,
            &mut queue,
        );
    }
    found
}

/// Basic-block matching for all function fixed points, parallel across
/// pairs. Each pair's graphs and fixed point are temporarily detached so a
/// worker has exclusive access; no two pairs share a flow graph.
pub fn match_basic_blocks(
    context: &mut MatchingContext,
    catalog: &[Arc<dyn BasicBlockStep>],
    cancel: &CancelToken,
) -> Result<(), DiffError> {
    let index = FunctionMatchIndex::build(context);
    let mut jobs = context.detach_matched_pairs();
    jobs.par_iter_mut().for_each(|job| {
        if cancel.is_cancelled() {
            return;
        }
        match_basic_blocks_pair(
            &mut job.primary,
            &mut job.secondary,
            &mut job.fixed_point,
            &index,
            catalog,
        );
    });
    context.restore_matched_pairs(jobs);
    if cancel.is_cancelled() {
        return Err(DiffError::Cancelled);
    }
    Ok(())
}
