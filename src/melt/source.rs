//! Record sources backed by JSON input.

use std::io::BufRead;

use serde_json::Value;

use crate::error::{MeltError, Result};
use crate::melt::stream::{Source, VecSource};

/// Streams newline-delimited JSON, one record per non-blank line.
///
/// A line that fails to parse yields a parsing error for that line only, so
/// the recovery policy decides whether the run continues.
pub struct JsonLinesSource<R> {
    reader: R,
    line: usize,
    buf: String,
}

impl<R: BufRead> JsonLinesSource<R> {
    pub fn new(reader: R) -> Self {
        JsonLinesSource {
            reader,
            line: 0,
            buf: String::new(),
        }
    }

    /// Number of lines consumed so far.
    pub fn lines_read(&self) -> usize {
        self.line
    }
}

impl<R: BufRead> Iterator for JsonLinesSource<R> {
    type Item = Result<Value>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(err) => return Some(Err(err.into())),
            }
            self.line += 1;

            let line = self.buf.trim();
            if line.is_empty() {
                continue;
            }
            return Some(serde_json::from_str(line).map_err(|e| MeltError::Parsing {
                line: Some(self.line),
                message: e.to_string(),
            }));
        }
    }
}

impl<R: BufRead> Source for JsonLinesSource<R> {}

/// Parse a whole input buffer into records.
///
/// A top-level array yields its elements and any other document yields
/// itself. Input that is not a single JSON document is read as NDJSON.
pub fn read_records(bytes: &[u8]) -> VecSource {
    // simd-json parses in place and leaves the buffer unusable on failure
    let mut scratch = bytes.to_vec();
    match simd_json::serde::from_slice::<Value>(&mut scratch) {
        Ok(Value::Array(items)) => VecSource::new(items),
        Ok(value) => VecSource::new(vec![value]),
        Err(err) => {
            tracing::debug!(error = %err, "input is not a single JSON document, reading as NDJSON");
            VecSource::from_results(parse_lines(bytes))
        }
    }
}

fn parse_lines(bytes: &[u8]) -> Vec<Result<Value>> {
    let content = String::from_utf8_lossy(bytes);
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str(line.trim()).map_err(|e| MeltError::Parsing {
                line: Some(index + 1),
                message: e.to_string(),
            })
        })
        .collect()
}
