//! Report output: a pretty JSON array or CSV with a fixed column order.

use std::io::Write;

use anyhow::Result;
use clap::ValueEnum;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Csv,
}

pub fn write_rows<W: Write>(
    out: &mut W,
    format: OutputFormat,
    fields: &[&str],
    rows: &[Value],
) -> Result<()> {
    match format {
        OutputFormat::Json => write_json(out, rows),
        OutputFormat::Csv => write_csv(out, fields, rows),
    }
}

pub fn write_json<W: Write>(out: &mut W, rows: &[Value]) -> Result<()> {
    serde_json::to_writer_pretty(&mut *out, rows)?;
    writeln!(out)?;
    Ok(())
}

/// Header line, then one line per row. Fields missing from a row are left empty.
pub fn write_csv<W: Write>(out: &mut W, fields: &[&str], rows: &[Value]) -> Result<()> {
    let header: Vec<String> = fields.iter().map(|f| csv_escape(f)).collect();
    writeln!(out, "{}", header.join(","))?;
    for row in rows {
        let cells: Vec<String> = fields
            .iter()
            .map(|field| csv_escape(&cell(row.get(*field))))
            .collect();
        writeln!(out, "{}", cells.join(","))?;
    }
    Ok(())
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn csv_escape(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}
