//! Batch assembly and the streaming driver.
//!
//! Records are pulled one at a time, melted, buffered until `batch_size`
//! records have been consumed, then flushed to a [`Sink`]. Peak memory is one
//! batch of rows regardless of input size.

use serde_json::Value;

use crate::error::{MeltError, Result};
use crate::melt::extractor::JsonMelter;
use crate::melt::naming::Collisions;
use crate::melt::node::Document;
use crate::melt::recovery::Outcome;
use crate::melt::types::{FlatRow, TableSet};

/// A single-pass supply of records.
pub trait Source: Iterator<Item = Result<Value>> {
    /// Total number of records, when known up front.
    fn total(&self) -> Option<usize> {
        None
    }
}

/// Destination for melted rows.
///
/// Implementations must accept rows whose columns differ between calls, and
/// `close` must flush buffered output and be safe to call more than once.
pub trait Sink {
    fn write_main_records(&mut self, table: &str, rows: &[FlatRow]) -> Result<()>;
    fn write_child_records(&mut self, table: &str, rows: &[FlatRow]) -> Result<()>;
    fn close(&mut self) -> Result<()>;
}

/// Records held in memory; the total is known.
pub struct VecSource {
    records: std::vec::IntoIter<Result<Value>>,
    total: usize,
}

impl VecSource {
    pub fn new(records: Vec<Value>) -> Self {
        Self::from_results(records.into_iter().map(Ok).collect())
    }

    /// Records where some entries already failed to parse.
    pub fn from_results(records: Vec<Result<Value>>) -> Self {
        let total = records.len();
        VecSource {
            records: records.into_iter(),
            total,
        }
    }
}

impl Iterator for VecSource {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.records.next()
    }
}

impl Source for VecSource {
    fn total(&self) -> Option<usize> {
        Some(self.total)
    }
}

/// Adapts any fallible record iterator; the total is unknown.
pub struct IterSource<I>(pub I);

impl<I: Iterator<Item = Result<Value>>> Iterator for IterSource<I> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        self.0.next()
    }
}

impl<I: Iterator<Item = Result<Value>>> Source for IterSource<I> {}

/// Counts reported after a streaming run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamSummary {
    /// Records pulled from the source, including failed ones
    pub records: usize,
    pub main_rows: usize,
    pub child_rows: usize,
    pub batches: usize,
    /// Records dropped by skip recovery
    pub skipped: usize,
}

impl JsonMelter {
    /// Pull every record from `source`, flushing to `sink` every `batch_size`
    /// records and reporting `(processed, total)` after each flush.
    ///
    /// Under strict recovery the first failure is returned after the rows of
    /// the records before it have been flushed and reported. The sink is not
    /// closed.
    pub fn stream<S, K, P>(
        &self,
        source: S,
        entity_name: &str,
        sink: &mut K,
        batch_size: usize,
        mut progress: P,
    ) -> Result<StreamSummary>
    where
        S: Source,
        K: Sink + ?Sized,
        P: FnMut(usize, Option<usize>),
    {
        if batch_size == 0 {
            return Err(MeltError::config("batch_size must be positive"));
        }

        let total = source.total();
        let mut batch = TableSet::new(self.main_table_name(entity_name));
        let mut summary = StreamSummary::default();
        let mut pending = 0;
        let mut timestamp = self.timestamp();
        let mut collisions = Collisions::new();

        for (index, item) in source.enumerate() {
            let ts = timestamp.as_ref();
            let outcome = match item {
                Ok(value) => {
                    let doc = Document::from(value);
                    self.process_record(&doc, entity_name, index, ts, &mut collisions)
                }
                Err(err) => self.recover_record(Err(err.in_record(index)), entity_name, index, ts),
            };
            if let Outcome::Fatal(err) = outcome {
                if Self::flush(&mut batch, sink, &mut summary)? {
                    progress(summary.records, total);
                }
                return Err(err);
            }
            if matches!(outcome, Outcome::Skipped(_)) {
                summary.skipped += 1;
            }
            Self::collect(outcome, &mut batch)?;

            summary.records += 1;
            pending += 1;
            if pending == batch_size {
                Self::flush(&mut batch, sink, &mut summary)?;
                progress(summary.records, total);
                pending = 0;
                timestamp = self.timestamp();
            }
        }

        if pending > 0 {
            Self::flush(&mut batch, sink, &mut summary)?;
            progress(summary.records, total);
        }

        tracing::info!(
            records = summary.records,
            main_rows = summary.main_rows,
            child_rows = summary.child_rows,
            skipped = summary.skipped,
            "stream complete"
        );
        Ok(summary)
    }

    /// Write the batch's main rows, then each child table, then clear it.
    /// Returns whether anything was written.
    fn flush<K: Sink + ?Sized>(
        batch: &mut TableSet,
        sink: &mut K,
        summary: &mut StreamSummary,
    ) -> Result<bool> {
        let tables = batch.take();
        if tables.is_empty() {
            return Ok(false);
        }
        if !tables.main.is_empty() {
            sink.write_main_records(&tables.main.name, &tables.main.rows)?;
        }
        for table in tables.children.values() {
            sink.write_child_records(&table.name, &table.rows)?;
        }

        let child_rows = tables.row_count() - tables.main.len();
        summary.main_rows += tables.main.len();
        summary.child_rows += child_rows;
        summary.batches += 1;
        tracing::info!(
            batch = summary.batches,
            main_rows = tables.main.len(),
            child_rows,
            "flushed batch"
        );
        Ok(true)
    }
}
