//! Quantified invariants checked through the public engine API.

mod common;

use common::*;
use flowdiff::ingest::EdgeKind;
use flowdiff::DiffEngine;

/// A binary with straight-line, branching, looping and self-looping
/// functions.
fn varied_binary(base: u64) -> flowdiff::ingest::BinaryRecord {
    binary(
        "varied",
        vec![
            three_block_function(base, ""),
            // while-loop shape: entry -> head -> body -> head, head -> exit
            function(
                base + 0x1000,
                "",
                vec![
                    simple_block(
                        base + 0x1000,
                        &["push", "mov"],
                        vec![(base + 0x1010, EdgeKind::Unconditional)],
                    ),
                    simple_block(
                        base + 0x1010,
                        &["cmp"],
                        vec![
                            (base + 0x1020, EdgeKind::True),
                            (base + 0x1030, EdgeKind::False),
                        ],
                    ),
                    simple_block(
                        base + 0x1020,
                        &["add", "jmp"],
                        vec![(base + 0x1010, EdgeKind::Unconditional)],
                    ),
                    simple_block(base + 0x1030, &["ret"], vec![]),
                ],
            ),
            // self loop
            function(
                base + 0x2000,
                "",
                vec![
                    simple_block(
                        base + 0x2000,
                        &["pause"],
                        vec![(base + 0x2000, EdgeKind::Unconditional)],
                    ),
                ],
            ),
            // trivial
            function(base + 0x3000, "", vec![simple_block(base + 0x3000, &["ret"], vec![])]),
        ],
    )
}

#[test]
fn addresses_are_sorted_after_construction() {
    let engine = DiffEngine::new();
    let diff = engine
        .prepare(&varied_binary(0x1000), &varied_binary(0x8000))
        .unwrap();
    for side in [&diff.context.primary, &diff.context.secondary] {
        let entries: Vec<u64> = side
            .flow_graphs
            .iter()
            .map(|g| g.entry_point_address())
            .collect();
        assert!(entries.windows(2).all(|w| w[0] < w[1]));
        for graph in &side.flow_graphs {
            let addresses: Vec<u64> = graph.vertices().iter().map(|v| v.address).collect();
            assert!(addresses.windows(2).all(|w| w[0] < w[1]));
        }
    }
}

#[test]
fn topology_levels_are_monotonic_along_edges() {
    let engine = DiffEngine::new();
    let diff = engine
        .prepare(&varied_binary(0x1000), &varied_binary(0x8000))
        .unwrap();
    for graph in &diff.context.primary.flow_graphs {
        for edge in graph.edges() {
            let src = graph.topology_level(edge.source);
            let dst = graph.topology_level(edge.target);
            assert!(src >= 1, "all vertices here are reachable");
            assert!(dst <= src + 1);
        }
    }
}

#[test]
fn md_index_is_consistent_with_edge_sums() {
    let engine = DiffEngine::new();
    let diff = engine
        .prepare(&varied_binary(0x1000), &varied_binary(0x8000))
        .unwrap();
    for graph in &diff.context.primary.flow_graphs {
        let sum: f64 = graph.edges().iter().map(|e| e.md_index_top_down).sum();
        assert!((graph.md_index() - sum).abs() < 1e-9);
        let sum_inverted: f64 = graph.edges().iter().map(|e| e.md_index_bottom_up).sum();
        assert!((graph.md_index_inverted() - sum_inverted).abs() < 1e-9);
    }
}

#[test]
fn trivial_and_circular_classification() {
    let engine = DiffEngine::new();
    let diff = engine
        .prepare(&varied_binary(0x1000), &varied_binary(0x8000))
        .unwrap();
    let graphs = &diff.context.primary.flow_graphs;

    let trivial = graphs
        .iter()
        .find(|g| g.entry_point_address() == 0x4000)
        .unwrap();
    assert!(trivial.is_trivial());
    assert_eq!(trivial.vertex_count(), 1);

    let self_loop = graphs
        .iter()
        .find(|g| g.entry_point_address() == 0x3000)
        .unwrap();
    assert!(self_loop.is_trivial());
    assert_eq!(self_loop.edge_count(), 1);
    assert!(self_loop.edges()[0].is_circular());
    assert!(self_loop.is_loop_entry(0));

    let looping = graphs
        .iter()
        .find(|g| g.entry_point_address() == 0x2000)
        .unwrap();
    assert_eq!(looping.loop_count(), 1);
    assert!(!looping.is_trivial());
    assert!(looping.edges().iter().all(|e| !e.is_circular()));
}

#[test]
fn loop_head_dominates_back_edge_source() {
    let engine = DiffEngine::new();
    let diff = engine
        .prepare(&varied_binary(0x1000), &varied_binary(0x8000))
        .unwrap();
    let looping = diff
        .context
        .primary
        .flow_graphs
        .iter()
        .find(|g| g.entry_point_address() == 0x2000)
        .unwrap();
    // The loop head (block 0x2010) is the unique loop entry, and every path
    // from the entry to the back-edge source goes through it, which the BFS
    // levels reflect.
    let head = looping.get_vertex(0x2010).unwrap();
    assert!(looping.is_loop_entry(head));
    for v in 0..looping.vertex_count() as u32 {
        if v != head {
            assert!(!looping.is_loop_entry(v));
        }
    }
}

#[test]
fn ingest_issues_do_not_block_other_functions() {
    let mut a = varied_binary(0x1000);
    // Corrupt one flow graph: empty basic block.
    a.flow_graphs[1].basic_blocks[0].instructions.clear();
    let engine = DiffEngine::new();
    let diff = engine.prepare(&a, &varied_binary(0x8000)).unwrap();
    assert_eq!(diff.primary_issues.len(), 1);
    assert_eq!(diff.context.primary.flow_graphs.len(), 3);
    assert_eq!(diff.context.secondary.flow_graphs.len(), 4);
}
