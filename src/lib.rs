//! flowdiff compares two disassembled binaries and establishes a
//! correspondence between their functions, the basic blocks inside matched
//! functions, and the instructions inside matched blocks.
//!
//! The pipeline: decoded disassembly records are validated and built into
//! call graphs plus per-function flow graphs, topology signatures (BFS
//! levels, MD indices, loop marks, prime products) are derived, then a
//! cascading catalog of function-level matching steps pairs up functions,
//! a second catalog pairs up basic blocks within each function pair, and a
//! longest-common-subsequence pass over instruction primes pairs up
//! instructions. The accumulated fixed points are materialized into a
//! [`report::DiffResult`] that writers persist.
//!
//! ```no_run
//! use flowdiff::{DiffEngine, ingest::BinaryRecord};
//!
//! # fn load(_: &str) -> BinaryRecord { unimplemented!() }
//! let engine = DiffEngine::new();
//! let primary = load("a.BinExport.json");
//! let secondary = load("b.BinExport.json");
//! let result = engine.diff(&primary, &secondary).unwrap();
//! println!("{} matches", result.matches.len());
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::info;
use rayon::prelude::*;
use thiserror::Error;

pub mod basic_block_steps;
pub mod call_graph;
pub mod config;
pub mod context;
pub mod fixed_points;
pub mod flow_graph;
pub mod function_steps;
mod hashing;
pub mod ingest;
pub mod instruction;
pub mod lcs;
pub mod matching;
pub mod prime;
pub mod report;
pub mod writer;

pub use config::DiffConfig;
pub use context::MatchingContext;
pub use report::DiffResult;

/// A code location.
pub type Address = u64;

/// Engine error kinds. Matching steps themselves never fail for expected
/// input shapes; errors surface from ingestion validation, configuration,
/// resource setup and cooperative cancellation.
#[derive(Debug, Clone, Error)]
pub enum DiffError {
    /// Structurally invalid input (non-monotonic addresses, empty basic
    /// blocks, edges leaving the function). Fatal for the affected flow
    /// graph only.
    #[error("malformed input: {0}")]
    MalformedInput(String),
    /// Contradictory input (duplicate function or basic-block addresses).
    /// Fatal for the affected function only.
    #[error("inconsistent input: {0}")]
    Inconsistent(String),
    /// Resource setup failed; aborts the run.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),
    /// The caller requested an abort between function pairs. Fixed points
    /// committed so far are retained.
    #[error("cancelled")]
    Cancelled,
    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, DiffError>;

/// Cooperative cancellation handle, checked between function pairs.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}

/// One prepared diff run: both sides built and signed, plus the ingestion
/// issues and the instruction cache, which outlives every instruction that
/// references it.
pub struct Diff {
    pub context: MatchingContext,
    pub primary_issues: Vec<ingest::IngestIssue>,
    pub secondary_issues: Vec<ingest::IngestIssue>,
    pub instruction_cache: instruction::InstructionCache,
}

impl Diff {
    /// Drops every match while keeping all derived signatures.
    pub fn reset_matches(&mut self) {
        self.context.reset_matches();
    }
}

/// The diff engine: configuration plus the three-phase driver.
pub struct DiffEngine {
    config: DiffConfig,
}

impl DiffEngine {
    pub fn new() -> Self {
        Self {
            config: DiffConfig::default(),
        }
    }

    pub fn with_config(config: DiffConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &DiffConfig {
        &self.config
    }

    fn thread_pool(&self) -> Result<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.parallelism)
            .build()
            .map_err(|e| DiffError::ResourceExhausted(e.to_string()))
    }

    /// Builds both sides and derives all topology signatures.
    pub fn prepare(
        &self,
        primary: &ingest::BinaryRecord,
        secondary: &ingest::BinaryRecord,
    ) -> Result<Diff> {
        let cache = instruction::InstructionCache::new();
        let pool = self.thread_pool()?;

        let (mut built_primary, mut built_secondary) = pool.install(|| {
            rayon::join(
                || ingest::build_binary(primary, &cache),
                || ingest::build_binary(secondary, &cache),
            )
        });
        let primary_issues = std::mem::take(&mut built_primary.issues);
        let secondary_issues = std::mem::take(&mut built_secondary.issues);

        let mut primary_graphs: context::BinaryGraphs = built_primary.into();
        let mut secondary_graphs: context::BinaryGraphs = built_secondary.into();
        pool.install(|| {
            primary_graphs
                .flow_graphs
                .par_iter_mut()
                .chain(secondary_graphs.flow_graphs.par_iter_mut())
                .for_each(|graph| graph.calculate_topology());
        });

        info!(
            "prepared diff: {} vs {} functions ({} ingest issues)",
            primary_graphs.flow_graphs.len(),
            secondary_graphs.flow_graphs.len(),
            primary_issues.len() + secondary_issues.len(),
        );
        Ok(Diff {
            context: MatchingContext::new(primary_graphs, secondary_graphs),
            primary_issues,
            secondary_issues,
            instruction_cache: cache,
        })
    }

    /// Runs both matching pipelines. On cancellation the fixed points
    /// committed so far stay in the context.
    pub fn run(&self, diff: &mut Diff, cancel: &CancelToken) -> Result<()> {
        let function_catalog = self.config.function_steps()?;
        let basic_block_catalog = self.config.basic_block_steps()?;
        let pool = self.thread_pool()?;
        pool.install(|| {
            matching::match_functions(&mut diff.context, &function_catalog, cancel)?;
            matching::match_basic_blocks(&mut diff.context, &basic_block_catalog, cancel)
        })?;
        info!(
            "matching finished: {} function fixed points",
            diff.context.fixed_points.len()
        );
        Ok(())
    }

    /// Materializes the result with the configured report threshold.
    pub fn result(&self, diff: &Diff) -> DiffResult {
        report::build_result(&diff.context, self.config.min_confidence_to_report)
    }

    /// Convenience wrapper: prepare, run to completion, materialize.
    pub fn diff(
        &self,
        primary: &ingest::BinaryRecord,
        secondary: &ingest::BinaryRecord,
    ) -> Result<DiffResult> {
        let mut diff = self.prepare(primary, secondary)?;
        self.run(&mut diff, &CancelToken::default())?;
        Ok(self.result(&diff))
    }
}

impl Default for DiffEngine {
    fn default() -> Self {
        Self::new()
    }
}
