//! Ingestion of decoded disassembly records.
//!
//! One [`BinaryRecord`] describes one binary: its function list and one flow
//! graph per function body. Records are validated on the way in; a malformed
//! or inconsistent flow graph is skipped and reported while the remaining
//! graphs proceed. Accepted graphs satisfy the sortedness invariants by
//! construction.

use log::warn;
use serde::{Deserialize, Serialize};

use crate::call_graph::{CallGraph, CallGraphVertex};
use crate::flow_graph::{
    EdgeInfo, FlowGraph, Vertex, VertexInfo, EDGE_FALSE, EDGE_SWITCH, EDGE_TRUE,
    EDGE_UNCONDITIONAL,
};
use crate::hashing::hash32_chunks;
use crate::instruction::{Instruction, InstructionCache};
use crate::{Address, DiffError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BinaryRecord {
    #[serde(default)]
    pub name: String,
    pub functions: Vec<FunctionRecord>,
    pub flow_graphs: Vec<FlowGraphRecord>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub address: Address,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub demangled_name: String,
    #[serde(default)]
    pub library: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowGraphRecord {
    pub function_address: Address,
    pub basic_blocks: Vec<BasicBlockRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicBlockRecord {
    pub address: Address,
    pub instructions: Vec<InstructionRecord>,
    #[serde(default)]
    pub outgoing_edges: Vec<EdgeRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstructionRecord {
    pub address: Address,
    pub mnemonic: String,
    #[serde(default)]
    pub operand_features: u32,
    #[serde(default)]
    pub call_targets: Vec<Address>,
    #[serde(default)]
    pub bytes: Vec<u8>,
    #[serde(default)]
    pub string_refs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeRecord {
    pub target_address: Address,
    pub kind: EdgeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    Unconditional,
    True,
    False,
    Switch,
}

impl EdgeKind {
    fn flag(self) -> u8 {
        match self {
            EdgeKind::Unconditional => EDGE_UNCONDITIONAL,
            EdgeKind::True => EDGE_TRUE,
            EdgeKind::False => EDGE_FALSE,
            EdgeKind::Switch => EDGE_SWITCH,
        }
    }
}

/// A flow graph that was rejected during ingestion. The rest of the binary
/// is unaffected.
#[derive(Debug, Clone)]
pub struct IngestIssue {
    pub function_address: Address,
    pub error: DiffError,
}

/// One side of a diff: call graph plus address-sorted flow graphs.
#[derive(Debug, Default)]
pub struct BuiltBinary {
    pub name: String,
    pub call_graph: CallGraph,
    pub flow_graphs: Vec<FlowGraph>,
    pub issues: Vec<IngestIssue>,
}

/// Validates and builds one binary. Graph-local failures are collected in
/// `issues`; only the affected function is dropped.
pub fn build_binary(record: &BinaryRecord, cache: &InstructionCache) -> BuiltBinary {
    let mut issues = Vec::new();

    // Function list: ascending addresses, no duplicates.
    let mut functions: Vec<&FunctionRecord> = Vec::with_capacity(record.functions.len());
    let mut prev: Option<Address> = None;
    for f in &record.functions {
        match prev {
            Some(p) if f.address == p => {
                issues.push(IngestIssue {
                    function_address: f.address,
                    error: DiffError::Inconsistent(format!(
                        "duplicate function address {:#x}",
                        f.address
                    )),
                });
                continue;
            }
            Some(p) if f.address < p => {
                issues.push(IngestIssue {
                    function_address: f.address,
                    error: DiffError::MalformedInput(format!(
                        "function addresses not ascending at {:#x}",
                        f.address
                    )),
                });
                continue;
            }
            _ => {}
        }
        prev = Some(f.address);
        functions.push(f);
    }

    // Flow graphs, processed in ascending function-address order.
    let mut graph_records: Vec<&FlowGraphRecord> = record.flow_graphs.iter().collect();
    graph_records.sort_by_key(|g| g.function_address);

    let mut flow_graphs: Vec<FlowGraph> = Vec::with_capacity(graph_records.len());
    let mut seen_entry: Option<Address> = None;
    for g in graph_records {
        if seen_entry == Some(g.function_address) {
            issues.push(IngestIssue {
                function_address: g.function_address,
                error: DiffError::Inconsistent(format!(
                    "duplicate flow graph for function {:#x}",
                    g.function_address
                )),
            });
            continue;
        }
        if functions
            .binary_search_by_key(&g.function_address, |f| f.address)
            .is_err()
        {
            issues.push(IngestIssue {
                function_address: g.function_address,
                error: DiffError::MalformedInput(format!(
                    "flow graph for unknown function {:#x}",
                    g.function_address
                )),
            });
            continue;
        }
        match build_flow_graph(g, cache) {
            Ok(graph) => {
                seen_entry = Some(g.function_address);
                flow_graphs.push(graph);
            }
            Err(error) => {
                warn!(
                    "skipping flow graph {:#x}: {error}",
                    g.function_address
                );
                issues.push(IngestIssue {
                    function_address: g.function_address,
                    error,
                });
            }
        }
    }

    // Call graph vertices from the accepted function list; back-link flow
    // graphs by position.
    let mut vertices: Vec<CallGraphVertex> = functions
        .iter()
        .map(|f| CallGraphVertex {
            address: f.address,
            name: f.name.clone(),
            demangled_name: f.demangled_name.clone(),
            library: f.library,
            flow_graph: None,
        })
        .collect();
    for (graph_id, graph) in flow_graphs.iter().enumerate() {
        if let Ok(i) =
            vertices.binary_search_by_key(&graph.entry_point_address(), |v| v.address)
        {
            vertices[i].flow_graph = Some(graph_id as u32);
        }
    }

    // Call edges from call targets that resolve to known functions.
    let mut edges: Vec<(u32, u32)> = Vec::new();
    for graph in &flow_graphs {
        let Some(caller) = vertices
            .binary_search_by_key(&graph.entry_point_address(), |v| v.address)
            .ok()
        else {
            continue;
        };
        for &target in graph.call_targets() {
            if let Ok(callee) = vertices.binary_search_by_key(&target, |v| v.address) {
                edges.push((caller as u32, callee as u32));
            }
        }
    }

    let call_graph = CallGraph::new(vertices, edges);
    for graph in &mut flow_graphs {
        if let Some(id) = call_graph.get_vertex(graph.entry_point_address()) {
            graph.set_call_graph_vertex(id);
        }
    }

    BuiltBinary {
        name: record.name.clone(),
        call_graph,
        flow_graphs,
        issues,
    }
}

fn build_flow_graph(
    record: &FlowGraphRecord,
    cache: &InstructionCache,
) -> Result<FlowGraph, DiffError> {
    let function = record.function_address;
    if record.basic_blocks.is_empty() {
        return Err(DiffError::MalformedInput(format!(
            "function {function:#x} has no basic blocks"
        )));
    }

    // Block addresses: ascending, no duplicates, entry block present.
    for w in record.basic_blocks.windows(2) {
        if w[1].address == w[0].address {
            return Err(DiffError::Inconsistent(format!(
                "duplicate basic block {:#x} in function {function:#x}",
                w[0].address
            )));
        }
        if w[1].address < w[0].address {
            return Err(DiffError::MalformedInput(format!(
                "basic block addresses not ascending in function {function:#x}"
            )));
        }
    }
    record
        .basic_blocks
        .binary_search_by_key(&function, |b| b.address)
        .map_err(|_| {
            DiffError::MalformedInput(format!(
                "no basic block at function entry {function:#x}"
            ))
        })?;

    let mut vertices = Vec::with_capacity(record.basic_blocks.len());
    let mut instructions = Vec::new();
    let mut call_targets = Vec::new();
    let mut call_sites: Vec<(Vertex, Address)> = Vec::new();

    for (block_index, block) in record.basic_blocks.iter().enumerate() {
        if block.instructions.is_empty() {
            return Err(DiffError::MalformedInput(format!(
                "basic block {:#x} in function {function:#x} has no instructions",
                block.address
            )));
        }
        for w in block.instructions.windows(2) {
            if w[1].address <= w[0].address {
                return Err(DiffError::MalformedInput(format!(
                    "instruction addresses not ascending in basic block {:#x}",
                    block.address
                )));
            }
        }

        let instruction_start = instructions.len() as u32;
        let call_target_start = call_targets.len() as u32;
        let mut prime = 1u64;
        for ins in &block.instructions {
            let instruction = Instruction::new(cache, ins.address, &ins.mnemonic, ins.operand_features);
            prime = prime.wrapping_mul(instruction.prime() as u64);
            instructions.push(instruction);
            if !ins.call_targets.is_empty() {
                call_sites.push((block_index as Vertex, ins.address));
                call_targets.extend_from_slice(&ins.call_targets);
            }
        }

        let basic_block_hash = if block.instructions.iter().any(|i| !i.bytes.is_empty()) {
            hash32_chunks(block.instructions.iter().map(|i| i.bytes.as_slice()))
        } else {
            0
        };
        let string_hash = if block.instructions.iter().any(|i| !i.string_refs.is_empty()) {
            hash32_chunks(
                block
                    .instructions
                    .iter()
                    .flat_map(|i| i.string_refs.iter().map(|s| s.as_bytes())),
            )
        } else {
            0
        };

        vertices.push(VertexInfo {
            address: block.address,
            prime,
            flags: 0,
            string_hash,
            basic_block_hash,
            instruction_start,
            call_target_start,
            bfs_top_down: 0,
            bfs_bottom_up: 0,
        });
    }

    let mut edges = Vec::new();
    for (block_index, block) in record.basic_blocks.iter().enumerate() {
        for edge in &block.outgoing_edges {
            let target = record
                .basic_blocks
                .binary_search_by_key(&edge.target_address, |b| b.address)
                .map_err(|_| {
                    DiffError::MalformedInput(format!(
                        "edge {:#x} -> {:#x} leaves function {function:#x}",
                        block.address, edge.target_address
                    ))
                })?;
            edges.push(EdgeInfo {
                source: block_index as Vertex,
                target: target as Vertex,
                md_index_top_down: 0.0,
                md_index_bottom_up: 0.0,
                flags: edge.kind.flag(),
            });
        }
    }

    let byte_hash = if record
        .basic_blocks
        .iter()
        .any(|b| b.instructions.iter().any(|i| !i.bytes.is_empty()))
    {
        hash32_chunks(
            record
                .basic_blocks
                .iter()
                .flat_map(|b| b.instructions.iter().map(|i| i.bytes.as_slice())),
        )
    } else {
        0
    };
    let string_hash = if record
        .basic_blocks
        .iter()
        .any(|b| b.instructions.iter().any(|i| !i.string_refs.is_empty()))
    {
        hash32_chunks(
            record
                .basic_blocks
                .iter()
                .flat_map(|b| b.instructions.iter().flat_map(|i| i.string_refs.iter()))
                .map(|s| s.as_bytes()),
        )
    } else {
        0
    };

    Ok(FlowGraph::new(
        function,
        vertices,
        edges,
        instructions,
        call_targets,
        call_sites,
        byte_hash,
        string_hash,
    ))
}
