//! Ordered telemetry record of verified operations
//!
//! The sink owns the output file for one session: the header is written when
//! the session opens, one row is appended per recorded operation, and the
//! buffered output is flushed when the session closes. Dropping an unclosed
//! sink still flushes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{error, info};
use crate::error::TelemetryError;
use crate::types::{frac_to_f64, Asset, MarketState, OperationKind, Resource, ResourceState};

/// Summary of one verified operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryRow {
    pub line: usize,
    pub operation: OperationKind,
    /// Ledger head time after the operation
    pub timestamp: DateTime<Utc>,
    pub before_net_assumed_stake_weight: i64,
    pub before_net_weight_ratio: i64,
    pub before_net_weight: i64,
    pub before_receiver_net: i64,
    pub after_receiver_net: i64,
    pub requested_net_frac: i64,
    pub requested_cpu_frac: i64,
    pub receiver_net_delta: i64,
    pub receiver_cpu_delta: i64,
    /// Payer liquid balance before minus after
    pub payer_cost: Asset,
    pub before_reserve_net: i64,
    pub after_reserve_net: i64,
    pub before_reserve_cpu: i64,
    pub after_reserve_cpu: i64,
    pub after_market: MarketState,
}

const RESOURCE_COLUMNS: [&str; 14] = [
    "weight",
    "weight_ratio",
    "assumed_stake_weight",
    "initial_weight_ratio",
    "target_weight_ratio",
    "initial_timestamp",
    "target_timestamp",
    "exponent",
    "decay_secs",
    "min_price",
    "max_price",
    "utilization",
    "adjusted_utilization",
    "utilization_timestamp",
];

/// Column names, in output order
pub fn header() -> Vec<String> {
    let mut columns: Vec<String> = [
        "last_block_time",
        "before_state.net.assumed_stake_weight",
        "before_state.net.weight_ratio",
        "before_state.net.weight",
        "before_receiver.net",
        "after_receiver.net",
        "requested.net_frac",
        "requested.cpu_frac",
        "after_receiver.net-before_receiver.net",
        "after_receiver.cpu-before_receiver.cpu",
        "before_payer.liquid-after_payer.liquid",
        "before_reserve.net",
        "after_reserve.net",
        "before_reserve.cpu",
        "after_reserve.cpu",
    ]
    .iter()
    .map(|c| c.to_string())
    .collect();

    for resource in Resource::ALL {
        for column in RESOURCE_COLUMNS {
            columns.push(format!("{}.{}", resource, column));
        }
    }
    columns.push("operation".to_string());
    columns
}

fn write_header<W: Write>(writer: &mut W) -> io::Result<()> {
    writeln!(writer, "{}", header().join(","))
}

fn resource_fields(state: &ResourceState) -> [String; 14] {
    [
        state.weight.to_string(),
        state.weight_ratio.to_string(),
        state.assumed_stake_weight.to_string(),
        state.initial_weight_ratio.to_string(),
        state.target_weight_ratio.to_string(),
        state.initial_timestamp.timestamp().to_string(),
        state.target_timestamp.timestamp().to_string(),
        state.exponent.to_string(),
        state.decay_secs.to_string(),
        state.min_price.to_string(),
        state.max_price.to_string(),
        state.utilization.to_string(),
        state.adjusted_utilization.to_string(),
        state.utilization_timestamp.timestamp().to_string(),
    ]
}

fn write_row<W: Write>(writer: &mut W, row: &TelemetryRow) -> io::Result<()> {
    write!(
        writer,
        "{},{},{},{},{},{},{},{},{},{},{},{},{},{},{}",
        row.timestamp.format("%Y-%m-%dT%H:%M:%S%.3f"),
        row.before_net_assumed_stake_weight,
        frac_to_f64(row.before_net_weight_ratio),
        row.before_net_weight,
        row.before_receiver_net,
        row.after_receiver_net,
        frac_to_f64(row.requested_net_frac),
        frac_to_f64(row.requested_cpu_frac),
        row.receiver_net_delta as f64,
        row.receiver_cpu_delta as f64,
        row.payer_cost.decimal_string(),
        row.before_reserve_net as f64,
        row.after_reserve_net as f64,
        row.before_reserve_cpu as f64,
        row.after_reserve_cpu as f64,
    )?;
    for resource in Resource::ALL {
        for field in resource_fields(row.after_market.resource(resource)) {
            write!(writer, ",{}", field)?;
        }
    }
    writeln!(writer, ",{}", row.operation)
}

/// Append-only telemetry record for one session
pub struct TelemetrySink {
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    /// Only filled when there is no file behind the sink
    rows: Vec<TelemetryRow>,
    recorded: usize,
    closed: bool,
}

impl TelemetrySink {
    /// Create (or truncate) `path` and write the header
    pub fn open_session(path: impl AsRef<Path>) -> Result<Self, TelemetryError> {
        let path = path.as_ref().to_path_buf();
        let write_err = |e: io::Error| TelemetryError::Write {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        let file = File::create(&path).map_err(write_err)?;
        let mut writer = BufWriter::new(file);
        write_header(&mut writer).map_err(write_err)?;
        writer.flush().map_err(write_err)?;
        info!(path = %path.display(), "opened telemetry session");

        Ok(Self {
            path: Some(path),
            writer: Some(writer),
            rows: Vec::new(),
            recorded: 0,
            closed: false,
        })
    }

    /// Sink that only keeps rows in memory
    pub fn in_memory() -> Self {
        Self {
            path: None,
            writer: None,
            rows: Vec::new(),
            recorded: 0,
            closed: false,
        }
    }

    /// Append one row
    pub fn record(&mut self, row: TelemetryRow) -> Result<(), TelemetryError> {
        if self.closed {
            return Err(TelemetryError::Closed);
        }
        match self.writer.as_mut() {
            Some(writer) => write_row(writer, &row).map_err(|e| TelemetryError::Write {
                path: display_path(&self.path),
                reason: e.to_string(),
            })?,
            None => self.rows.push(row),
        }
        self.recorded += 1;
        Ok(())
    }

    /// Rows held by an in-memory sink, in order; empty when writing to a file
    pub fn rows(&self) -> &[TelemetryRow] {
        &self.rows
    }

    /// Rows recorded so far
    pub fn len(&self) -> usize {
        self.recorded
    }

    pub fn is_empty(&self) -> bool {
        self.recorded == 0
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Flush everything to disk; returns the number of rows recorded
    pub fn close_session(&mut self) -> Result<usize, TelemetryError> {
        if self.closed {
            return Err(TelemetryError::Closed);
        }
        self.closed = true;
        if let Some(mut writer) = self.writer.take() {
            writer.flush().map_err(|e| TelemetryError::Write {
                path: self.display_path(),
                reason: e.to_string(),
            })?;
            info!(path = %self.display_path(), rows = self.recorded, "closed telemetry session");
        }
        Ok(self.recorded)
    }

    fn display_path(&self) -> String {
        display_path(&self.path)
    }
}

fn display_path(path: &Option<PathBuf>) -> String {
    path.as_ref()
        .map(|p| p.display().to_string())
        .unwrap_or_else(|| "<memory>".to_string())
}

impl std::fmt::Debug for TelemetrySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetrySink")
            .field("path", &self.path)
            .field("recorded", &self.recorded)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for TelemetrySink {
    fn drop(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                error!(path = %self.display_path(), error = %e, "failed to flush telemetry on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let columns = header();
        assert_eq!(columns.len(), 15 + 2 * 14 + 1);
        assert_eq!(columns[0], "last_block_time");
        assert_eq!(columns[15], "net.weight");
        assert_eq!(columns[29], "cpu.weight");
        assert_eq!(columns.last().map(String::as_str), Some("operation"));
    }

    #[test]
    fn test_in_memory_sink_rejects_rows_after_close() {
        let mut sink = TelemetrySink::in_memory();
        assert_eq!(sink.close_session().unwrap(), 0);
        assert!(sink.is_closed());
        assert!(matches!(sink.close_session(), Err(TelemetryError::Closed)));
    }
}
