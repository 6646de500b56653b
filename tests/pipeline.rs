//! End-to-end matching scenarios.

mod common;

use common::*;
use flowdiff::config::{DiffConfig, StepConfig};
use flowdiff::ingest::EdgeKind;
use flowdiff::{CancelToken, DiffEngine, DiffError};

fn engine() -> DiffEngine {
    let _ = env_logger::builder().is_test(true).try_init();
    DiffEngine::new()
}

#[test]
fn s1_identity_diff() {
    let a = binary("a", vec![three_block_function(0x1000, "")]);
    let result = engine().diff(&a, &a).unwrap();

    assert_eq!(result.matches.len(), 1);
    let m = &result.matches[0];
    assert_eq!(m.step_name, "function: prime signature matching");
    assert_eq!(m.confidence, 1.0);
    assert_eq!(m.basic_blocks.len(), 3);

    let total_instruction_matches: usize = m
        .basic_blocks
        .iter()
        .map(|b| b.instruction_matches.len())
        .sum();
    assert_eq!(total_instruction_matches, 7);
    // Identity: every matched pair is the same location on both sides.
    for bb in &m.basic_blocks {
        assert_eq!(bb.primary_address, bb.secondary_address);
        for im in &bb.instruction_matches {
            assert_eq!(im.primary_address, im.secondary_address);
        }
    }
    assert!(result.unmatched_primary.is_empty());
    assert!(result.unmatched_secondary.is_empty());
    assert!(result.similarity > 0.99);
}

#[test]
fn s2_permuted_basic_block_layout() {
    // Identical function bodies; the two successor blocks swap their
    // address order in the secondary.
    let a = binary(
        "a",
        vec![function(
            0x1000,
            "",
            vec![
                simple_block(
                    0x1000,
                    &["push"],
                    vec![(0x1010, EdgeKind::True), (0x1020, EdgeKind::False)],
                ),
                simple_block(0x1010, &["add", "add"], vec![(0x1020, EdgeKind::Unconditional)]),
                simple_block(0x1020, &["xor", "ret"], vec![]),
            ],
        )],
    );
    let b = binary(
        "b",
        vec![function(
            0x2000,
            "",
            vec![
                simple_block(
                    0x2000,
                    &["push"],
                    vec![(0x2020, EdgeKind::True), (0x2010, EdgeKind::False)],
                ),
                simple_block(0x2010, &["xor", "ret"], vec![]),
                simple_block(0x2020, &["add", "add"], vec![(0x2010, EdgeKind::Unconditional)]),
            ],
        )],
    );

    let result = engine().diff(&a, &b).unwrap();
    assert_eq!(result.matches.len(), 1);
    let m = &result.matches[0];
    assert_eq!(m.basic_blocks.len(), 3);

    // Blocks pair by content, not by address order.
    let find = |primary: u64| {
        m.basic_blocks
            .iter()
            .find(|b| b.primary_address == primary)
            .unwrap()
    };
    assert_eq!(find(0x1000).secondary_address, 0x2000);
    assert_eq!(find(0x1010).secondary_address, 0x2020);
    assert_eq!(find(0x1020).secondary_address, 0x2010);

    let total: usize = m.basic_blocks.iter().map(|b| b.instruction_matches.len()).sum();
    assert_eq!(total, 5);
}

#[test]
fn s3_renamed_mnemonic() {
    // Both sides carry identical raw bytes; one middle instruction decodes
    // to a different mnemonic in the secondary.
    let build = |base: u64, middle: &str| {
        binary(
            "x",
            vec![function(
                base,
                "",
                vec![
                    block(
                        base,
                        vec![
                            ins_with_bytes(base, "push", &[0x55]),
                            ins_with_bytes(base + 1, "mov", &[0x89, 0xe5]),
                        ],
                        vec![(base + 0x10, EdgeKind::Unconditional)],
                    ),
                    block(
                        base + 0x10,
                        vec![
                            ins_with_bytes(base + 0x10, "add", &[0x01, 0xc0]),
                            ins_with_bytes(base + 0x11, middle, &[0x29, 0xc0]),
                            ins_with_bytes(base + 0x12, "or", &[0x09, 0xc0]),
                        ],
                        vec![(base + 0x20, EdgeKind::Unconditional)],
                    ),
                    block(
                        base + 0x20,
                        vec![ins_with_bytes(base + 0x20, "ret", &[0xc3])],
                        vec![],
                    ),
                ],
            )],
        )
    };
    let a = build(0x1000, "sub");
    let b = build(0x2000, "xor");

    let result = engine().diff(&a, &b).unwrap();
    assert_eq!(result.matches.len(), 1);
    let m = &result.matches[0];
    assert_eq!(m.basic_blocks.len(), 3);

    let changed = m
        .basic_blocks
        .iter()
        .find(|bb| bb.primary_address == 0x1010)
        .unwrap();
    // The block still matches via its byte hash, and the LCS drops exactly
    // the renamed instruction.
    assert_eq!(changed.step_name, "basicBlock: hash matching");
    assert_eq!(changed.instruction_matches.len(), 2);
    assert!(changed
        .instruction_matches
        .iter()
        .all(|im| im.primary_address != 0x1011));
}

#[test]
fn s4_split_basic_block() {
    let a = binary(
        "a",
        vec![function(
            0x1000,
            "",
            vec![
                simple_block(0x1000, &["push"], vec![(0x1010, EdgeKind::Unconditional)]),
                simple_block(
                    0x1010,
                    &["mov", "add", "sub"],
                    vec![(0x1020, EdgeKind::Unconditional)],
                ),
                simple_block(0x1020, &["ret"], vec![]),
            ],
        )],
    );
    // The middle block is split in two across an added unconditional edge.
    let b = binary(
        "b",
        vec![function(
            0x2000,
            "",
            vec![
                simple_block(0x2000, &["push"], vec![(0x2010, EdgeKind::Unconditional)]),
                simple_block(0x2010, &["mov"], vec![(0x2018, EdgeKind::Unconditional)]),
                simple_block(
                    0x2018,
                    &["add", "sub"],
                    vec![(0x2020, EdgeKind::Unconditional)],
                ),
                simple_block(0x2020, &["ret"], vec![]),
            ],
        )],
    );

    let result = engine().diff(&a, &b).unwrap();
    assert_eq!(result.matches.len(), 1);
    let m = &result.matches[0];
    // The prime product is layout independent, so the function pair commits
    // at the prime signature step despite the split.
    assert_eq!(m.step_name, "function: prime signature matching");

    let find = |primary: u64| {
        m.basic_blocks
            .iter()
            .find(|b| b.primary_address == primary)
            .unwrap()
    };
    assert_eq!(find(0x1000).secondary_address, 0x2000);
    assert_eq!(find(0x1020).secondary_address, 0x2020);

    // The split block matches the half containing its entry instruction,
    // with a prefix LCS; the other half stays unmatched.
    let split = find(0x1010);
    assert_eq!(split.secondary_address, 0x2010);
    assert_eq!(split.instruction_matches.len(), 1);
    assert_eq!(split.instruction_matches[0].primary_address, 0x1010);
    assert_eq!(split.instruction_matches[0].secondary_address, 0x2010);
    assert!(m
        .basic_blocks
        .iter()
        .all(|bb| bb.secondary_address != 0x2018));
}

#[test]
fn s5_library_flag_does_not_prevent_matching() {
    let a = binary("a", vec![three_block_function(0x1000, "helper")]);
    let mut b = binary("b", vec![three_block_function(0x4000, "helper")]);
    b.functions[0].library = true;

    let result = engine().diff(&a, &b).unwrap();
    assert_eq!(result.matches.len(), 1);
    let m = &result.matches[0];
    assert!(!m.primary_library);
    assert!(m.secondary_library);
    assert_eq!(m.primary_name, "helper");
}

#[test]
fn s6_ambiguous_primes_cascade_to_instruction_count() {
    // Two interior blocks share the same prime; only their topology levels
    // differ. With a prime + instruction-count pipeline, the prime step
    // registers the ambiguity and the MD-index-plus-count key resolves it.
    let build = |base: u64| {
        binary(
            "x",
            vec![function(
                base,
                "",
                vec![
                    simple_block(base, &["push"], vec![(base + 0x10, EdgeKind::Unconditional)]),
                    simple_block(
                        base + 0x10,
                        &["add", "sub"],
                        vec![(base + 0x20, EdgeKind::Unconditional)],
                    ),
                    simple_block(
                        base + 0x20,
                        &["add", "sub"],
                        vec![(base + 0x30, EdgeKind::Unconditional)],
                    ),
                    simple_block(base + 0x30, &["ret"], vec![]),
                ],
            )],
        )
    };
    let a = build(0x1000);
    let b = build(0x2000);

    let config = DiffConfig {
        basic_block_matching_steps: vec![
            StepConfig {
                name: "basicBlock: prime matching".into(),
                enabled: true,
                confidence: None,
            },
            StepConfig {
                name: "basicBlock: instruction count matching".into(),
                enabled: true,
                confidence: None,
            },
        ],
        ..Default::default()
    };
    let engine = DiffEngine::with_config(config).unwrap();
    let result = engine.diff(&a, &b).unwrap();

    assert_eq!(result.matches.len(), 1);
    let m = &result.matches[0];
    assert_eq!(m.basic_blocks.len(), 4);

    let find = |primary: u64| {
        m.basic_blocks
            .iter()
            .find(|b| b.primary_address == primary)
            .unwrap()
    };
    // The ambiguous blocks each match exactly once, in level order, and
    // carry the later step's name.
    assert_eq!(find(0x1010).secondary_address, 0x2010);
    assert_eq!(find(0x1020).secondary_address, 0x2020);
    assert_eq!(
        find(0x1010).step_name,
        "basicBlock: instruction count matching"
    );
    assert_eq!(
        find(0x1020).step_name,
        "basicBlock: instruction count matching"
    );
    assert_eq!(find(0x1000).step_name, "basicBlock: prime matching");
}

#[test]
fn matching_is_deterministic() {
    let a = binary(
        "a",
        vec![
            three_block_function(0x1000, "alpha"),
            three_block_function(0x2000, ""),
            function(
                0x3000,
                "",
                vec![
                    simple_block(
                        0x3000,
                        &["push", "cmp"],
                        vec![(0x3010, EdgeKind::True), (0x3020, EdgeKind::False)],
                    ),
                    simple_block(0x3010, &["call"], vec![(0x3000, EdgeKind::Unconditional)]),
                    simple_block(0x3020, &["ret"], vec![]),
                ],
            ),
        ],
    );
    let b = binary(
        "b",
        vec![
            three_block_function(0x5000, "alpha"),
            three_block_function(0x6000, ""),
            function(
                0x7000,
                "",
                vec![
                    simple_block(
                        0x7000,
                        &["push", "cmp"],
                        vec![(0x7010, EdgeKind::True), (0x7020, EdgeKind::False)],
                    ),
                    simple_block(0x7010, &["call"], vec![(0x7000, EdgeKind::Unconditional)]),
                    simple_block(0x7020, &["ret"], vec![]),
                ],
            ),
        ],
    );

    let engine = engine();
    let first = engine.diff(&a, &b).unwrap();
    let second = engine.diff(&a, &b).unwrap();
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
    assert_eq!(first.matches.len(), 3);
}

#[test]
fn no_entity_is_matched_twice() {
    let a = binary(
        "a",
        vec![
            three_block_function(0x1000, ""),
            function(
                0x2000,
                "",
                vec![
                    simple_block(0x2000, &["push", "test"], vec![(0x2010, EdgeKind::Unconditional)]),
                    simple_block(0x2010, &["leave", "ret"], vec![]),
                ],
            ),
        ],
    );
    let b = binary(
        "b",
        vec![
            three_block_function(0x5000, ""),
            function(
                0x6000,
                "",
                vec![
                    simple_block(0x6000, &["push", "test"], vec![(0x6010, EdgeKind::Unconditional)]),
                    simple_block(0x6010, &["leave", "ret"], vec![]),
                ],
            ),
        ],
    );
    let result = engine().diff(&a, &b).unwrap();
    assert_eq!(result.matches.len(), 2);

    let mut primaries: Vec<u64> = result.matches.iter().map(|m| m.primary_address).collect();
    let mut secondaries: Vec<u64> = result.matches.iter().map(|m| m.secondary_address).collect();
    primaries.dedup();
    secondaries.sort_unstable();
    secondaries.dedup();
    assert_eq!(primaries.len(), result.matches.len());
    assert_eq!(secondaries.len(), result.matches.len());

    for m in &result.matches {
        let mut bb_primary: Vec<u64> = m.basic_blocks.iter().map(|b| b.primary_address).collect();
        let mut bb_secondary: Vec<u64> =
            m.basic_blocks.iter().map(|b| b.secondary_address).collect();
        bb_primary.sort_unstable();
        bb_primary.dedup();
        bb_secondary.sort_unstable();
        bb_secondary.dedup();
        assert_eq!(bb_primary.len(), m.basic_blocks.len());
        assert_eq!(bb_secondary.len(), m.basic_blocks.len());
    }
}

#[test]
fn call_graph_drill_down_matches_callees() {
    // The two callees have identical bodies, so the global pass leaves them
    // ambiguous. Each caller only calls one of them; once the callers match
    // by name, the drill-down sees a single unmatched callee on each side
    // and pairs them up.
    let callee = |base: u64| {
        function(base, "", vec![simple_block(base, &["add", "ret"], vec![])])
    };
    let caller = |base: u64, name: &str, target: u64| {
        let mut entry = simple_block(base, &["call", "ret"], vec![]);
        entry.instructions[0].call_targets = vec![target];
        function(base, name, vec![entry])
    };
    let a = binary(
        "a",
        vec![
            caller(0x1000, "main", 0x3000),
            caller(0x2000, "init", 0x4000),
            callee(0x3000),
            callee(0x4000),
        ],
    );
    let b = binary(
        "b",
        vec![
            caller(0x5000, "main", 0x7000),
            caller(0x6000, "init", 0x8000),
            callee(0x7000),
            callee(0x8000),
        ],
    );

    let result = engine().diff(&a, &b).unwrap();
    assert_eq!(result.matches.len(), 4);
    let find = |primary: u64| {
        result
            .matches
            .iter()
            .find(|m| m.primary_address == primary)
            .unwrap()
    };
    assert_eq!(find(0x3000).secondary_address, 0x7000);
    assert_eq!(find(0x4000).secondary_address, 0x8000);
}

#[test]
fn cancellation_between_pairs() {
    let a = binary("a", vec![three_block_function(0x1000, "")]);
    let engine = engine();
    let mut diff = engine.prepare(&a, &a).unwrap();
    let cancel = CancelToken::new();
    cancel.cancel();
    match engine.run(&mut diff, &cancel) {
        Err(DiffError::Cancelled) => {}
        other => panic!("expected cancellation, got {other:?}"),
    }
}

#[test]
fn reset_matches_allows_rerun() {
    let a = binary("a", vec![three_block_function(0x1000, "")]);
    let engine = engine();
    let mut diff = engine.prepare(&a, &a).unwrap();
    engine.run(&mut diff, &CancelToken::new()).unwrap();
    let first = engine.result(&diff);
    assert_eq!(first.matches.len(), 1);

    diff.reset_matches();
    assert_eq!(engine.result(&diff).matches.len(), 0);

    engine.run(&mut diff, &CancelToken::new()).unwrap();
    let second = engine.result(&diff);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[test]
fn min_confidence_filters_report() {
    let a = binary("a", vec![three_block_function(0x1000, "")]);
    let config = DiffConfig {
        min_confidence_to_report: 0.99,
        ..Default::default()
    };
    let engine = DiffEngine::with_config(config).unwrap();
    // Prime signature matches at confidence 1.0, above the threshold.
    let result = engine.diff(&a, &a).unwrap();
    assert_eq!(result.matches.len(), 1);

    let config = DiffConfig {
        function_matching_steps: vec![StepConfig {
            name: "function: prime signature matching".into(),
            enabled: true,
            confidence: Some(0.5),
        }],
        min_confidence_to_report: 0.99,
        ..Default::default()
    };
    let engine = DiffEngine::with_config(config).unwrap();
    let result = engine.diff(&a, &a).unwrap();
    // The pair is in the registry but below the report threshold.
    assert_eq!(result.matches.len(), 0);
    assert!(result.unmatched_primary.is_empty());
}
