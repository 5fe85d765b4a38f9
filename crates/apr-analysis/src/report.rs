//! CSV output: a `Date` column followed by one APR column per pool.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use eyre::{Context, Result};

use crate::history::{HistoryRow, RowSink};

/// Appends history rows to a CSV writer, flushing after every row.
#[derive(Debug)]
pub struct CsvReport<W: Write> {
    writer: W,
    columns: usize,
}

impl CsvReport<BufWriter<File>> {
    /// Creates (truncating) the file at `path` and writes the header.
    ///
    /// # Errors
    /// Returns error if the file cannot be created or written.
    pub fn create(path: &Path, labels: &[String]) -> Result<Self> {
        let file = File::create(path)
            .wrap_err_with(|| format!("failed to create output file {}", path.display()))?;
        Self::new(BufWriter::new(file), labels)
    }
}

impl<W: Write> CsvReport<W> {
    /// Writes the header line to `writer`.
    ///
    /// # Errors
    /// Returns error if writing fails.
    pub fn new(mut writer: W, labels: &[String]) -> Result<Self> {
        let mut header = String::from("Date");
        for label in labels {
            header.push(',');
            header.push_str(&escape(label));
        }
        writeln!(writer, "{header}").wrap_err("failed to write CSV header")?;
        writer.flush().wrap_err("failed to flush CSV header")?;

        Ok(Self {
            writer,
            columns: labels.len(),
        })
    }

    /// Writes one row. Values use the shortest form that round-trips, so
    /// a missing value prints as `0.0`.
    ///
    /// # Errors
    /// Returns error if the row width does not match the header or writing
    /// fails.
    pub fn append(&mut self, row: &HistoryRow) -> Result<()> {
        if row.values.len() != self.columns {
            eyre::bail!(
                "row for {} has {} values, header has {}",
                row.date,
                row.values.len(),
                self.columns
            );
        }

        let mut line = row.date.format("%Y-%m-%d").to_string();
        for value in &row.values {
            line.push_str(&format!(",{value:?}"));
        }
        writeln!(self.writer, "{line}").wrap_err("failed to write CSV row")?;
        self.writer.flush().wrap_err("failed to flush CSV row")?;
        Ok(())
    }

    /// Returns the underlying writer.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> RowSink for CsvReport<W> {
    fn write_row(&mut self, row: &HistoryRow) -> Result<()> {
        self.append(row)
    }
}

fn escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
