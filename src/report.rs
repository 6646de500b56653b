//! Result materialization: similarity scoring and the serializable
//! [`DiffResult`] handed to writers.

use serde::{Deserialize, Serialize};

use crate::context::MatchingContext;
use crate::fixed_points::FixedPoint;
use crate::flow_graph::FlowGraph;
use crate::Address;

const WEIGHT_BASIC_BLOCKS: f64 = 0.55;
const WEIGHT_EDGES: f64 = 0.30;
const WEIGHT_INSTRUCTIONS: f64 = 0.15;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstructionMatchResult {
    pub primary_address: Address,
    pub secondary_address: Address,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicBlockMatchResult {
    pub primary_address: Address,
    pub secondary_address: Address,
    pub step_name: String,
    pub instruction_matches: Vec<InstructionMatchResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionMatchResult {
    pub primary_address: Address,
    pub secondary_address: Address,
    pub primary_name: String,
    pub secondary_name: String,
    pub primary_library: bool,
    pub secondary_library: bool,
    pub similarity: f64,
    pub confidence: f64,
    pub step_name: String,
    pub basic_blocks: Vec<BasicBlockMatchResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnmatchedFunction {
    pub address: Address,
    pub name: String,
    pub library: bool,
    pub basic_block_count: usize,
    pub instruction_count: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiffStatistics {
    pub total_matches: usize,
    pub matched_basic_blocks: usize,
    pub matched_instructions: usize,
    pub average_similarity: f64,
    pub average_confidence: f64,
    pub unmatched_primary: usize,
    pub unmatched_secondary: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffResult {
    pub primary_name: String,
    pub secondary_name: String,
    pub matches: Vec<FunctionMatchResult>,
    pub unmatched_primary: Vec<UnmatchedFunction>,
    pub unmatched_secondary: Vec<UnmatchedFunction>,
    pub similarity: f64,
    pub statistics: DiffStatistics,
}

/// Similarity of one matched function pair from its matched fractions:
/// basic blocks, edges with both endpoints matched consistently, and
/// instructions.
pub fn similarity_for_pair(
    primary: &FlowGraph,
    secondary: &FlowGraph,
    fixed_point: &FixedPoint,
) -> f64 {
    let blocks1 = primary.vertex_count();
    let blocks2 = secondary.vertex_count();
    let matched_blocks = fixed_point.basic_block_count();
    let block_fraction = if blocks1 + blocks2 == 0 {
        1.0
    } else {
        2.0 * matched_blocks as f64 / (blocks1 + blocks2) as f64
    };

    let edges1 = primary.edge_count();
    let edges2 = secondary.edge_count();
    let mut matched_edges = 0usize;
    for edge in primary.edges() {
        let Some(source_match) = fixed_point.primary_match(edge.source) else {
            continue;
        };
        let Some(target_match) = fixed_point.primary_match(edge.target) else {
            continue;
        };
        if secondary.has_edge(source_match.secondary_vertex, target_match.secondary_vertex) {
            matched_edges += 1;
        }
    }
    let edge_fraction = if edges1 + edges2 == 0 {
        1.0
    } else {
        2.0 * matched_edges as f64 / (edges1 + edges2) as f64
    };

    let instructions1 = primary.instruction_count();
    let instructions2 = secondary.instruction_count();
    let matched_instructions = fixed_point.matched_instruction_count();
    let instruction_fraction = if instructions1 + instructions2 == 0 {
        1.0
    } else {
        2.0 * matched_instructions as f64 / (instructions1 + instructions2) as f64
    };

    (WEIGHT_BASIC_BLOCKS * block_fraction
        + WEIGHT_EDGES * edge_fraction
        + WEIGHT_INSTRUCTIONS * instruction_fraction)
        .clamp(0.0, 1.0)
}

fn function_name(context: &MatchingContext, side: crate::context::Side, graph: &FlowGraph) -> (String, bool) {
    match graph.call_graph_vertex() {
        Some(vertex) => {
            let cg = &context.graphs(side).call_graph;
            (cg.vertex(vertex).name.clone(), cg.is_library(vertex))
        }
        None => (String::new(), false),
    }
}

/// Builds the serializable result: matches at or above the confidence
/// threshold, unmatched functions of both sides, and aggregate statistics.
pub fn build_result(context: &MatchingContext, min_confidence_to_report: f64) -> DiffResult {
    use crate::context::Side;

    let mut matches = Vec::new();
    let mut matched_basic_blocks = 0usize;
    let mut matched_instructions = 0usize;
    let mut similarity_sum = 0.0;
    let mut confidence_sum = 0.0;

    for fixed_point in context.fixed_points.iter() {
        if fixed_point.confidence() < min_confidence_to_report {
            continue;
        }
        let primary = context.primary.flow_graph(fixed_point.primary());
        let secondary = context.secondary.flow_graph(fixed_point.secondary());
        let similarity = similarity_for_pair(primary, secondary, fixed_point);
        let (primary_name, primary_library) = function_name(context, Side::Primary, primary);
        let (secondary_name, secondary_library) = function_name(context, Side::Secondary, secondary);

        let basic_blocks: Vec<BasicBlockMatchResult> = fixed_point
            .basic_block_fixed_points()
            .map(|bb| BasicBlockMatchResult {
                primary_address: primary.address_of(bb.primary_vertex),
                secondary_address: secondary.address_of(bb.secondary_vertex),
                step_name: bb.step_name.to_string(),
                instruction_matches: bb
                    .instruction_matches
                    .iter()
                    .map(|m| InstructionMatchResult {
                        primary_address: primary.instructions()[m.primary as usize].address(),
                        secondary_address: secondary.instructions()[m.secondary as usize]
                            .address(),
                    })
                    .collect(),
            })
            .collect();

        matched_basic_blocks += fixed_point.basic_block_count();
        matched_instructions += fixed_point.matched_instruction_count();
        similarity_sum += similarity;
        confidence_sum += fixed_point.confidence();

        matches.push(FunctionMatchResult {
            primary_address: primary.entry_point_address(),
            secondary_address: secondary.entry_point_address(),
            primary_name,
            secondary_name,
            primary_library,
            secondary_library,
            similarity,
            confidence: fixed_point.confidence(),
            step_name: fixed_point.step_name().to_string(),
            basic_blocks,
        });
    }

    let unmatched = |side: Side| -> Vec<UnmatchedFunction> {
        let graphs = context.graphs(side);
        (0..graphs.flow_graphs.len() as u32)
            .filter(|&id| !context.is_function_matched(side, id))
            .map(|id| {
                let graph = graphs.flow_graph(id);
                let (name, library) = function_name(context, side, graph);
                UnmatchedFunction {
                    address: graph.entry_point_address(),
                    name,
                    library,
                    basic_block_count: graph.vertex_count(),
                    instruction_count: graph.instruction_count(),
                }
            })
            .collect()
    };
    let unmatched_primary = unmatched(Side::Primary);
    let unmatched_secondary = unmatched(Side::Secondary);

    let total_matches = matches.len();
    let similarity = if total_matches > 0 {
        similarity_sum / total_matches as f64
    } else {
        0.0
    };
    let statistics = DiffStatistics {
        total_matches,
        matched_basic_blocks,
        matched_instructions,
        average_similarity: similarity,
        average_confidence: if total_matches > 0 {
            confidence_sum / total_matches as f64
        } else {
            0.0
        },
        unmatched_primary: unmatched_primary.len(),
        unmatched_secondary: unmatched_secondary.len(),
    };

    DiffResult {
        primary_name: context.primary.name.clone(),
        secondary_name: context.secondary.name.clone(),
        matches,
        unmatched_primary,
        unmatched_secondary,
        similarity,
        statistics,
    }
}
