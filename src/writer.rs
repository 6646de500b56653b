//! Result writers.
//!
//! Writers receive the full [`DiffResult`] after the registry is final.
//! [`ChainWriter`] invokes its writers in insertion order; the first failure
//! aborts the chain and its error is propagated to the caller.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Serialize;

use crate::report::DiffResult;

pub trait ResultsWriter: Send {
    fn write(&mut self, result: &DiffResult) -> Result<()>;
}

/// Invokes a list of writers in order, stopping at the first error.
#[derive(Default)]
pub struct ChainWriter {
    writers: Vec<Box<dyn ResultsWriter>>,
}

impl ChainWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, writer: Box<dyn ResultsWriter>) {
        self.writers.push(writer);
    }

    pub fn is_empty(&self) -> bool {
        self.writers.is_empty()
    }
}

impl ResultsWriter for ChainWriter {
    fn write(&mut self, result: &DiffResult) -> Result<()> {
        for writer in &mut self.writers {
            writer.write(result)?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
struct JsonDocument<'a> {
    created_at: String,
    engine_version: &'static str,
    #[serde(flatten)]
    result: &'a DiffResult,
}

/// Writes the full result as pretty-printed JSON.
pub struct JsonResultsWriter {
    path: PathBuf,
}

impl JsonResultsWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ResultsWriter for JsonResultsWriter {
    fn write(&mut self, result: &DiffResult) -> Result<()> {
        let document = JsonDocument {
            created_at: chrono::Utc::now().to_rfc3339(),
            engine_version: env!("CARGO_PKG_VERSION"),
            result,
        };
        let json = serde_json::to_string_pretty(&document)
            .context("failed to serialize diff result")?;
        fs::write(&self.path, json)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}

/// Writes one CSV row per function match.
pub struct CsvResultsWriter {
    path: PathBuf,
}

impl CsvResultsWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ResultsWriter for CsvResultsWriter {
    fn write(&mut self, result: &DiffResult) -> Result<()> {
        let mut csv = String::from(
            "primary_address,primary_name,secondary_address,secondary_name,\
             similarity,confidence,step,basic_block_matches,instruction_matches\n",
        );
        for m in &result.matches {
            let instruction_matches: usize =
                m.basic_blocks.iter().map(|b| b.instruction_matches.len()).sum();
            csv.push_str(&format!(
                "{:#x},{},{:#x},{},{:.4},{:.4},{},{},{}\n",
                m.primary_address,
                m.primary_name.replace(',', ";"),
                m.secondary_address,
                m.secondary_name.replace(',', ";"),
                m.similarity,
                m.confidence,
                m.step_name,
                m.basic_blocks.len(),
                instruction_matches,
            ));
        }
        fs::write(&self.path, csv)
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::DiffStatistics;

    fn empty_result() -> DiffResult {
        DiffResult {
            primary_name: "a".into(),
            secondary_name: "b".into(),
            matches: Vec::new(),
            unmatched_primary: Vec::new(),
            unmatched_secondary: Vec::new(),
            similarity: 0.0,
            statistics: DiffStatistics::default(),
        }
    }

    struct RecordingWriter {
        calls: std::sync::Arc<std::sync::atomic::AtomicUsize>,
        fail: bool,
    }

    impl ResultsWriter for RecordingWriter {
        fn write(&mut self, _result: &DiffResult) -> Result<()> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("writer failed");
            }
            Ok(())
        }
    }

    #[test]
    fn chain_stops_at_first_failure() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain = ChainWriter::new();
        chain.add(Box::new(RecordingWriter {
            calls: Arc::clone(&calls),
            fail: false,
        }));
        chain.add(Box::new(RecordingWriter {
            calls: Arc::clone(&calls),
            fail: true,
        }));
        chain.add(Box::new(RecordingWriter {
            calls: Arc::clone(&calls),
            fail: false,
        }));

        assert!(chain.write(&empty_result()).is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn chain_runs_all_writers_on_success() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let calls = Arc::new(AtomicUsize::new(0));
        let mut chain = ChainWriter::new();
        for _ in 0..3 {
            chain.add(Box::new(RecordingWriter {
                calls: Arc::clone(&calls),
                fail: false,
            }));
        }
        chain.write(&empty_result()).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn json_writer_produces_a_file() {
        let path = std::env::temp_dir().join("flowdiff_writer_test.json");
        let mut writer = JsonResultsWriter::new(&path);
        writer.write(&empty_result()).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.contains("\"primary_name\""));
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn csv_writer_produces_header() {
        let path = std::env::temp_dir().join("flowdiff_writer_test.csv");
        let mut writer = CsvResultsWriter::new(&path);
        writer.write(&empty_result()).unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("primary_address,"));
        let _ = fs::remove_file(&path);
    }
}
