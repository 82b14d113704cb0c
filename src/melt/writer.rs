use std::collections::HashMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{MeltError, Result};
use crate::melt::stream::Sink;
use crate::melt::types::{FlatRow, TableSet};

/// Collects everything written to it into one table set
#[derive(Debug, Default)]
pub struct MemorySink {
    tables: TableSet,
    closed: bool,
}

impl MemorySink {
    pub fn new() -> Self {
        MemorySink::default()
    }

    pub fn tables(&self) -> &TableSet {
        &self.tables
    }

    pub fn into_tables(self) -> TableSet {
        self.tables
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Sink for MemorySink {
    fn write_main_records(&mut self, table: &str, rows: &[FlatRow]) -> Result<()> {
        if self.tables.main.name.is_empty() {
            self.tables.main.name = table.to_string();
        }
        self.tables.main.rows.extend_from_slice(rows);
        Ok(())
    }

    fn write_child_records(&mut self, table: &str, rows: &[FlatRow]) -> Result<()> {
        let mut children = crate::melt::types::ChildTables::new();
        children.insert(table.to_string(), rows.to_vec());
        self.tables.extend_children(children);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

/// Writes rows to JSON Lines files, one `<table>.jsonl` per table
pub struct JsonLinesSink {
    dir: PathBuf,
    writers: HashMap<String, BufWriter<File>>,
    closed: bool,
}

impl JsonLinesSink {
    /// Create a sink that writes into `output_dir`, creating it if needed
    pub fn new<P: AsRef<Path>>(output_dir: P) -> Result<Self> {
        let dir = output_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(JsonLinesSink {
            dir,
            writers: HashMap::new(),
            closed: false,
        })
    }

    pub fn path_for(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}.jsonl"))
    }

    fn write_rows(&mut self, table: &str, rows: &[FlatRow]) -> Result<()> {
        if self.closed {
            return Err(MeltError::Sink {
                table: table.to_string(),
                source: std::io::Error::other("sink is closed"),
            });
        }
        if !self.writers.contains_key(table) {
            let path = self.path_for(table);
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|source| MeltError::Sink {
                    table: table.to_string(),
                    source,
                })?;
            self.writers.insert(table.to_string(), BufWriter::new(file));
        }

        let Some(writer) = self.writers.get_mut(table) else {
            return Ok(());
        };
        for row in rows {
            let line = serde_json::to_string(row).map_err(|e| MeltError::Sink {
                table: table.to_string(),
                source: e.into(),
            })?;
            writeln!(writer, "{line}").map_err(|source| MeltError::Sink {
                table: table.to_string(),
                source,
            })?;
        }
        Ok(())
    }
}

impl Sink for JsonLinesSink {
    fn write_main_records(&mut self, table: &str, rows: &[FlatRow]) -> Result<()> {
        self.write_rows(table, rows)
    }

    fn write_child_records(&mut self, table: &str, rows: &[FlatRow]) -> Result<()> {
        self.write_rows(table, rows)
    }

    /// Flush all writers
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        for (table, writer) in self.writers.iter_mut() {
            writer.flush().map_err(|source| MeltError::Sink {
                table: table.clone(),
                source,
            })?;
        }
        self.writers.clear();
        self.closed = true;
        Ok(())
    }
}

impl Drop for JsonLinesSink {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::warn!(error = %err, "failed to flush JSON Lines sink on drop");
        }
    }
}

/// Writes every row to a single stream, tagged with its table name
pub struct SingleStreamSink<W: Write> {
    writer: W,
    table_field: String,
    closed: bool,
}

impl<W: Write> SingleStreamSink<W> {
    pub fn new(writer: W) -> Self {
        SingleStreamSink {
            writer,
            table_field: String::from("_table"),
            closed: false,
        }
    }

    pub fn with_table_field(mut self, field: impl Into<String>) -> Self {
        self.table_field = field.into();
        self
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_rows(&mut self, table: &str, rows: &[FlatRow]) -> Result<()> {
        let sink_err = |source: std::io::Error| MeltError::Sink {
            table: table.to_string(),
            source,
        };
        for row in rows {
            let mut tagged = FlatRow::new();
            tagged.insert(self.table_field.clone(), Value::String(table.to_string()));
            tagged.extend(row.iter().map(|(k, v)| (k.clone(), v.clone())));

            let line = serde_json::to_string(&tagged).map_err(|e| sink_err(e.into()))?;
            writeln!(self.writer, "{line}").map_err(sink_err)?;
        }
        Ok(())
    }
}

impl<W: Write> Sink for SingleStreamSink<W> {
    fn write_main_records(&mut self, table: &str, rows: &[FlatRow]) -> Result<()> {
        self.write_rows(table, rows)
    }

    fn write_child_records(&mut self, table: &str, rows: &[FlatRow]) -> Result<()> {
        self.write_rows(table, rows)
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.writer.flush()?;
            self.closed = true;
        }
        Ok(())
    }
}
