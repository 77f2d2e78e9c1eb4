//! Per-epoch console report and JSON history
//!
//! The console lines are a stable, parseable contract:
//!
//! ```text
//! LOSS FORMAT: SEMANTIC_LOSS MEAN_IOU PIX_ACC | DEPTH_LOSS ABS_ERR REL_ERR | ...
//! [0.4931, 0.5069] [0.4966, 0.5034]
//! Epoch: 0000 | TRAIN: 2.5649 0.0210 0.1250 | ... ||TEST: ... || 0.1532
//! ```

use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::gate::{GateParameters, GateReading, GateVersion};
use crate::metrics::SplitSummary;
use crate::tasks::TaskSpec;

/// `LOSS FORMAT:` header naming every reported column
pub fn loss_format_header(tasks: &[TaskSpec]) -> String {
    let columns: Vec<String> = tasks
        .iter()
        .map(|task| {
            let mut column = format!("{}_LOSS", task.name.to_uppercase());
            for label in task.kind.metric_labels() {
                column.push(' ');
                column.push_str(label);
            }
            column
        })
        .collect();
    format!("LOSS FORMAT: {}", columns.join(" | "))
}

/// Loss and metrics of every task, 4 decimals, tasks separated by ` | `
pub fn format_split(summary: &SplitSummary) -> String {
    summary
        .tasks
        .iter()
        .map(|task| {
            task.fields()
                .iter()
                .map(|v| format!("{v:.4}"))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .collect::<Vec<_>>()
        .join(" | ")
}

/// Epoch summary line
pub fn format_epoch_line(
    epoch: usize,
    train: &SplitSummary,
    test: &SplitSummary,
    elapsed_secs: f64,
) -> String {
    format!(
        "Epoch: {:04} | TRAIN: {} ||TEST: {} || {:.4}",
        epoch,
        format_split(train),
        format_split(test),
        elapsed_secs
    )
}

/// One line per task describing its gate
pub fn gate_lines(gate: &GateParameters) -> Result<Vec<String>> {
    (0..gate.task_count()).map(|t| gate.describe(t)).collect()
}

/// Everything recorded about one epoch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochRecord {
    /// Zero-based epoch
    pub epoch: usize,
    /// Wall-clock time the epoch finished
    pub timestamp: DateTime<Utc>,
    /// Model learning rate used during the epoch
    pub learning_rate: f64,
    /// Averages over the training batches (outer-update predictions)
    pub train: SplitSummary,
    /// Averages over the test split
    pub test: SplitSummary,
    /// Gate parameterization
    pub gate_version: GateVersion,
    /// Gate state after the epoch
    pub gates: Vec<GateReading>,
    /// Gate report lines as printed
    pub gate_report: Vec<String>,
    /// Inner-step parameters skipped for lack of a gradient
    pub skipped_gradients: usize,
    /// Epoch duration in seconds
    pub elapsed_secs: f64,
}

impl EpochRecord {
    /// The `Epoch:` console line of this record
    pub fn epoch_line(&self) -> String {
        format_epoch_line(self.epoch, &self.train, &self.test, self.elapsed_secs)
    }
}

/// All epoch records of a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    /// Records in epoch order
    pub epochs: Vec<EpochRecord>,
}

impl TrainingHistory {
    /// Append a record
    pub fn push(&mut self, record: EpochRecord) {
        self.epochs.push(record);
    }

    /// Most recent record
    pub fn last(&self) -> Option<&EpochRecord> {
        self.epochs.last()
    }

    /// Number of epochs recorded
    pub fn len(&self) -> usize {
        self.epochs.len()
    }

    /// Whether no epoch has been recorded
    pub fn is_empty(&self) -> bool {
        self.epochs.is_empty()
    }

    /// Write as pretty JSON
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        crate::utils::write_file_atomic(path, json.as_bytes())
    }

    /// Read a history written by [`TrainingHistory::save_json`]
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Writes the report lines to any sink (stdout in the CLI)
pub struct ConsoleReport<W: Write> {
    out: W,
}

impl<W: Write> ConsoleReport<W> {
    /// Report writing to `out`
    pub fn new(out: W) -> Self {
        Self { out }
    }

    /// Print the `LOSS FORMAT:` header
    pub fn write_header(&mut self, tasks: &[TaskSpec]) -> Result<()> {
        writeln!(self.out, "{}", loss_format_header(tasks))?;
        Ok(())
    }

    /// Print the gate lines followed by the epoch line
    pub fn write_epoch(&mut self, record: &EpochRecord) -> Result<()> {
        for line in &record.gate_report {
            writeln!(self.out, "{line}")?;
        }
        writeln!(self.out, "{}", record.epoch_line())?;
        self.out.flush()?;
        Ok(())
    }

    /// Underlying sink
    pub fn into_inner(self) -> W {
        self.out
    }
}
