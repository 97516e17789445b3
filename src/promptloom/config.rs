//! Configuration for a harness session.
//!
//! [`HarnessConfig`] is constructed manually — no config-file parsing
//! dependencies are introduced. The defaults give a disabled trace pair and
//! deterministic completion settings; front ends that want on-disk traces
//! flip the [`TraceMode`]s and point `log_dir` somewhere writable.

use std::path::PathBuf;

use crate::promptloom::error::HarnessError;
use crate::promptloom::lm_client::CompletionConfig;
use crate::promptloom::trace::Trace;

/// Where a session trace stream is multiplexed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceMode {
    /// Discard all entries.
    Disabled,
    /// Append to `{log_dir}/{instance_id}_{kind}.log`.
    File,
    /// Write to standard output only.
    Stdout,
    /// Append to the log file and copy every entry to standard output.
    FileAndStdout,
}

impl TraceMode {
    /// Build a [`Trace`] for this mode, `path` being the file target used by
    /// the file-backed modes.
    pub fn open(&self, path: &PathBuf) -> Result<Trace, HarnessError> {
        match self {
            TraceMode::Disabled => Ok(Trace::disabled()),
            TraceMode::File => Trace::to_file(path),
            TraceMode::Stdout => Ok(Trace::stdout()),
            TraceMode::FileAndStdout => Trace::file_and_stdout(path),
        }
    }
}

/// Session-level configuration for [`Harness`](crate::Harness).
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Directory receiving the compilation and execution log files.
    pub log_dir: PathBuf,
    /// Sink for the compilation trace (synthesis prompts and outcomes).
    pub compilation_trace: TraceMode,
    /// Sink for the execution trace (runtime progress).
    pub execution_trace: TraceMode,
    /// Defaults merged under every LM call's [`CompletionConfig`].
    pub completion_defaults: CompletionConfig,
    /// Upper bound on notifications pulled from one streaming routine,
    /// guarding against generators that never produce a `final` element.
    pub max_generator_steps: usize,
    /// API key seeded into the bootstrap web-search client, if any.
    pub search_api_key: Option<String>,
    /// Maximum characters of tiding content serialized into prompts; `None`
    /// serializes values in full.
    pub tiding_content_truncation: Option<usize>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        HarnessConfig {
            log_dir: PathBuf::from("logs"),
            compilation_trace: TraceMode::Disabled,
            execution_trace: TraceMode::Disabled,
            completion_defaults: CompletionConfig::deterministic(),
            max_generator_steps: 1024,
            search_api_key: None,
            tiding_content_truncation: None,
        }
    }
}

impl HarnessConfig {
    /// Path of the compilation log for a given session instance.
    pub fn compilation_log_path(&self, instance_id: &str) -> PathBuf {
        self.log_dir.join(format!("{}_compilation.log", instance_id))
    }

    /// Path of the execution log for a given session instance.
    pub fn execution_log_path(&self, instance_id: &str) -> PathBuf {
        self.log_dir.join(format!("{}_execution.log", instance_id))
    }
}
