//! Output formatters for simulation results, projection rows, and
//! validation summaries.

use serde_json::Value;
use tabled::{builder::Builder, Table};

use crate::OutputFormat;

/// Dispatch output to the appropriate formatter.
pub fn format_output(format: &OutputFormat, value: &Value) {
    match format {
        OutputFormat::Json => print_json(value),
        OutputFormat::Table => print_table(value),
        OutputFormat::Csv => print_csv(value),
        OutputFormat::Minimal => print_minimal(value),
    }
}

fn print_json(value: &Value) {
    match serde_json::to_string_pretty(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!("{}", value),
    }
}

// ---------------------------------------------------------------------------
// Table
// ---------------------------------------------------------------------------

fn print_table(value: &Value) {
    if let Some(report) = value.get("report") {
        print_report_table(report);
        if let Some(Value::Array(entries)) = value.get("reconciliation") {
            if !entries.is_empty() {
                println!("\nReconciliation:");
                print_array_table(entries);
            }
        }
        return;
    }

    match value {
        Value::Array(rows) => print_array_table(rows),
        Value::Object(map) => {
            let mut builder = Builder::default();
            builder.push_record(["Field", "Value"]);
            for (key, val) in map {
                builder.push_record([key.as_str(), &format_cell(Some(val))]);
            }
            println!("{}", Table::from(builder));
        }
        other => println!("{}", other),
    }
}

fn print_report_table(report: &Value) {
    let columns = report_columns(report);
    let rows = report_rows(report);
    if columns.is_empty() || rows.is_empty() {
        println!("(empty report)");
        return;
    }

    let mut builder = Builder::default();
    builder.push_record(columns.iter().map(String::as_str));
    for row in rows {
        builder.push_record(columns.iter().map(|c| format_cell(row.get(c))));
    }
    println!("{}", Table::from(builder));
}

fn print_array_table(rows: &[Value]) {
    let columns = union_columns(rows);
    if columns.is_empty() {
        println!("(no rows)");
        return;
    }

    let mut builder = Builder::default();
    builder.push_record(columns.iter().map(String::as_str));
    for row in rows {
        builder.push_record(
            columns
                .iter()
                .map(|c| format_cell(row.as_object().and_then(|o| o.get(c)))),
        );
    }
    println!("{}", Table::from(builder));
}

// ---------------------------------------------------------------------------
// CSV
// ---------------------------------------------------------------------------

fn print_csv(value: &Value) {
    if let Some(report) = value.get("report") {
        write_csv(&report_columns(report), &report_rows(report));
        return;
    }

    match value {
        Value::Array(rows) => {
            let columns = union_columns(rows);
            let row_maps: Vec<&serde_json::Map<String, Value>> =
                rows.iter().filter_map(Value::as_object).collect();
            write_csv(&columns, &row_maps);
        }
        Value::Object(map) => {
            let mut writer = csv::Writer::from_writer(std::io::stdout());
            let _ = writer.write_record(["Field", "Value"]);
            for (key, val) in map {
                let _ = writer.write_record([key.as_str(), &format_cell(Some(val))]);
            }
            let _ = writer.flush();
        }
        other => println!("{}", other),
    }
}

fn write_csv(columns: &[String], rows: &[&serde_json::Map<String, Value>]) {
    let mut writer = csv::Writer::from_writer(std::io::stdout());
    let _ = writer.write_record(columns);
    for row in rows {
        let _ = writer.write_record(columns.iter().map(|c| format_cell(row.get(c))));
    }
    let _ = writer.flush();
}

// ---------------------------------------------------------------------------
// Minimal
// ---------------------------------------------------------------------------

fn print_minimal(value: &Value) {
    if let Some(report) = value.get("report") {
        let rows = report_rows(report);
        if let Some(last) = rows.last() {
            println!(
                "periods: {}  final: {}",
                rows.len(),
                format_cell(last.get("Date"))
            );
            for (key, val) in last.iter() {
                if key.starts_with("Bond.") && key.ends_with(".Balance") {
                    println!("{} = {}", key, format_cell(Some(val)));
                }
            }
        } else {
            println!("periods: 0");
        }
        if let Some(Value::Array(entries)) = value.get("reconciliation") {
            println!("reconciliation entries: {}", entries.len());
        }
        return;
    }

    match value {
        Value::Array(rows) => println!("rows: {}", rows.len()),
        other => println!("{}", other),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn report_columns(report: &Value) -> Vec<String> {
    report
        .get("columns")
        .and_then(Value::as_array)
        .map(|cols| {
            cols.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn report_rows(report: &Value) -> Vec<&serde_json::Map<String, Value>> {
    report
        .get("rows")
        .and_then(Value::as_array)
        .map(|rows| rows.iter().filter_map(Value::as_object).collect())
        .unwrap_or_default()
}

fn union_columns(rows: &[Value]) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    let mut columns = Vec::new();
    for row in rows {
        if let Some(obj) = row.as_object() {
            for key in obj.keys() {
                if seen.insert(key.clone()) {
                    columns.push(key.clone());
                }
            }
        }
    }
    columns
}

fn format_cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => other.to_string(),
    }
}
