//! Consumer views over a [`Snapshot`].
//!
//! Every projection is computed from the snapshot's blocks on each call;
//! nothing is cached and the ring buffer is never touched.

use serde::Serialize;

use crate::error::{ErrorContext, Result, StreamError};
use crate::ring_buffer::Snapshot;

/// Header of the device-clock column.
pub const TIME_COLUMN: &str = "Time";
/// Header of the host-clock column.
pub const SYSTEM_TIME_COLUMN: &str = "System Time";

/// Which rows of a snapshot a view covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RowSelection {
    /// Every retained row
    #[default]
    All,
    /// The newest `n` rows
    Last(usize),
    /// Rows `start..end`
    Range {
        /// First row, inclusive
        start: usize,
        /// Last row, exclusive
        end: usize,
    },
}

impl Snapshot {
    /// Values in scan order, channels interleaved.
    pub fn to_sequence(&self) -> Vec<f64> {
        self.blocks()
            .iter()
            .flat_map(|b| b.values().iter().copied())
            .collect()
    }

    /// `[sample][channel]`.
    pub fn to_table(&self) -> Vec<Vec<f64>> {
        self.blocks().iter().map(|b| b.values().to_vec()).collect()
    }

    /// Channel columns followed by `Time` (device clock, seconds) and
    /// `System Time` (host seconds since stream start).
    pub fn to_labeled_table(&self) -> LabeledTable {
        let mut headers: Vec<String> = self.channels().to_vec();
        headers.push(TIME_COLUMN.to_string());
        headers.push(SYSTEM_TIME_COLUMN.to_string());

        let rows = self
            .blocks()
            .iter()
            .map(|b| {
                let mut row = Vec::with_capacity(b.n_channels() + 2);
                row.extend_from_slice(b.values());
                row.push(b.device_time());
                row.push(b.elapsed().as_secs_f64());
                row
            })
            .collect();

        LabeledTable { headers, rows }
    }

    /// Narrow the snapshot to a row selection.
    pub fn select(&self, selection: RowSelection) -> Result<Snapshot> {
        let rows = self.len();
        let range = match selection {
            RowSelection::All => 0..rows,
            RowSelection::Last(n) => {
                if n > rows {
                    return Err(StreamError::validation(
                        ErrorContext::new("select rows"),
                        format!("requested last {} rows, {} available", n, rows),
                    ));
                }
                rows - n..rows
            }
            RowSelection::Range { start, end } => {
                if start >= end {
                    return Err(StreamError::validation(
                        ErrorContext::new("select rows"),
                        format!("empty row range {}..{}", start, end),
                    ));
                }
                if end > rows {
                    return Err(StreamError::validation(
                        ErrorContext::new("select rows"),
                        format!("row range {}..{} exceeds {} rows", start, end, rows),
                    ));
                }
                start..end
            }
        };

        Ok(Snapshot::new(
            self.channel_list(),
            self.blocks()[range].to_vec(),
        ))
    }
}

/// Rows of channel values with time columns, addressable by header.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LabeledTable {
    headers: Vec<String>,
    rows: Vec<Vec<f64>>,
}

impl LabeledTable {
    /// Column names.
    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    /// Rows, oldest first.
    pub fn rows(&self) -> &[Vec<f64>] {
        &self.rows
    }

    /// Number of rows.
    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    /// Number of columns.
    pub fn n_columns(&self) -> usize {
        self.headers.len()
    }

    /// True if there are no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Row `index`, if present.
    pub fn row(&self, index: usize) -> Option<&[f64]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    /// All values under `name`, top to bottom.
    pub fn column(&self, name: &str) -> Option<Vec<f64>> {
        let index = self.headers.iter().position(|h| h == name)?;
        Some(self.rows.iter().map(|r| r[index]).collect())
    }
}
