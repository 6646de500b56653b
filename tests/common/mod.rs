//! Builders for disassembly records used by the integration tests.
#![allow(dead_code)]

use flowdiff::ingest::{
    BasicBlockRecord, BinaryRecord, EdgeKind, FlowGraphRecord, FunctionRecord, InstructionRecord,
};

pub fn ins(address: u64, mnemonic: &str) -> InstructionRecord {
    InstructionRecord {
        address,
        mnemonic: mnemonic.into(),
        operand_features: 0,
        call_targets: Vec::new(),
        bytes: Vec::new(),
        string_refs: Vec::new(),
    }
}

pub fn ins_with_bytes(address: u64, mnemonic: &str, bytes: &[u8]) -> InstructionRecord {
    InstructionRecord {
        bytes: bytes.to_vec(),
        ..ins(address, mnemonic)
    }
}

pub fn block(
    address: u64,
    instructions: Vec<InstructionRecord>,
    edges: Vec<(u64, EdgeKind)>,
) -> BasicBlockRecord {
    BasicBlockRecord {
        address,
        instructions,
        outgoing_edges: edges
            .into_iter()
            .map(|(target_address, kind)| flowdiff::ingest::EdgeRecord {
                target_address,
                kind,
            })
            .collect(),
    }
}

/// A basic block whose instructions are laid out one byte apart.
pub fn simple_block(address: u64, mnemonics: &[&str], edges: Vec<(u64, EdgeKind)>) -> BasicBlockRecord {
    block(
        address,
        mnemonics
            .iter()
            .enumerate()
            .map(|(i, m)| ins(address + i as u64, m))
            .collect(),
        edges,
    )
}

pub struct FunctionSpec {
    pub record: FunctionRecord,
    pub flow_graph: FlowGraphRecord,
}

pub fn function(address: u64, name: &str, basic_blocks: Vec<BasicBlockRecord>) -> FunctionSpec {
    FunctionSpec {
        record: FunctionRecord {
            address,
            name: name.into(),
            demangled_name: String::new(),
            library: false,
        },
        flow_graph: FlowGraphRecord {
            function_address: address,
            basic_blocks,
        },
    }
}

pub fn binary(name: &str, mut functions: Vec<FunctionSpec>) -> BinaryRecord {
    functions.sort_by_key(|f| f.record.address);
    BinaryRecord {
        name: name.into(),
        functions: functions.iter().map(|f| f.record.clone()).collect(),
        flow_graphs: functions.into_iter().map(|f| f.flow_graph).collect(),
    }
}

/// One function, three blocks, seven instructions; the workhorse graph of
/// the identity scenarios.
pub fn three_block_function(base: u64, name: &str) -> FunctionSpec {
    function(
        base,
        name,
        vec![
            simple_block(
                base,
                &["push", "mov", "cmp"],
                vec![
                    (base + 0x10, EdgeKind::True),
                    (base + 0x20, EdgeKind::False),
                ],
            ),
            simple_block(
                base + 0x10,
                &["add", "jmp"],
                vec![(base + 0x20, EdgeKind::Unconditional)],
            ),
            simple_block(base + 0x20, &["pop", "ret"], vec![]),
        ],
    )
}
