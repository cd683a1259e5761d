//! Output formatters for watched query results.

use clap::ValueEnum;
use comfy_table::{Cell, Table};
use regionwatch::rusqlite::types::Value;
use regionwatch::Db;

/// Output format for results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// ASCII table format
    Table,
    /// JSON format
    Json,
    /// CSV format
    Csv,
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputFormat::Table => write!(f, "table"),
            OutputFormat::Json => write!(f, "json"),
            OutputFormat::Csv => write!(f, "csv"),
        }
    }
}

/// The rows returned by one run of the watched query.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    /// Run a query and collect every row.
    pub fn query(db: &Db<'_>, sql: &str) -> regionwatch::Result<Self> {
        let mut stmt = db.prepare(sql)?;
        let columns: Vec<String> = stmt.column_names().into_iter().map(String::from).collect();
        let width = columns.len();

        let rows = stmt
            .query_map([], |row| {
                (0..width)
                    .map(|i| row.get::<_, Value>(i))
                    .collect::<Result<Vec<_>, _>>()
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { columns, rows })
    }
}

/// Trait for formatting output.
pub trait Formatter {
    /// Format the result of the watched query.
    fn format_result(&self, emission: usize, result: &ResultSet) -> String;

    /// Format the outcome of a write statement.
    fn format_write(&self, statement: &str, affected: usize) -> String;

    /// Format an error message.
    fn format_error(&self, error: &str) -> String;
}

/// Create a formatter for the given output format.
pub fn create_formatter(format: OutputFormat) -> Box<dyn Formatter> {
    match format {
        OutputFormat::Table => Box::new(TableFormatter),
        OutputFormat::Json => Box::new(JsonFormatter),
        OutputFormat::Csv => Box::new(CsvFormatter),
    }
}

/// Table formatter using comfy-table.
pub struct TableFormatter;

impl Formatter for TableFormatter {
    fn format_result(&self, emission: usize, result: &ResultSet) -> String {
        let mut table = Table::new();
        table.set_header(result.columns.iter().map(Cell::new).collect::<Vec<_>>());
        for row in &result.rows {
            table.add_row(row.iter().map(|v| Cell::new(format_value(v))).collect::<Vec<_>>());
        }
        format!("#{}\n{}\n{} row(s)", emission, table, result.rows.len())
    }

    fn format_write(&self, statement: &str, affected: usize) -> String {
        format!("{} row(s) affected: {}", affected, statement)
    }

    fn format_error(&self, error: &str) -> String {
        format!("Error: {}", error)
    }
}

/// JSON formatter, one document per line.
pub struct JsonFormatter;

impl Formatter for JsonFormatter {
    fn format_result(&self, emission: usize, result: &ResultSet) -> String {
        let rows: Vec<serde_json::Value> = result
            .rows
            .iter()
            .map(|row| {
                let mut obj = serde_json::Map::new();
                for (name, value) in result.columns.iter().zip(row) {
                    obj.insert(name.clone(), value_to_json(value));
                }
                serde_json::Value::Object(obj)
            })
            .collect();

        serde_json::json!({
            "emission": emission,
            "rows": rows,
        })
        .to_string()
    }

    fn format_write(&self, statement: &str, affected: usize) -> String {
        serde_json::json!({
            "statement": statement,
            "affected": affected,
        })
        .to_string()
    }

    fn format_error(&self, error: &str) -> String {
        serde_json::json!({
            "error": error
        })
        .to_string()
    }
}

/// CSV formatter. Each emission repeats the header.
pub struct CsvFormatter;

impl Formatter for CsvFormatter {
    fn format_result(&self, emission: usize, result: &ResultSet) -> String {
        let mut output = String::from("emission");
        for column in &result.columns {
            output.push(',');
            output.push_str(&format_text_csv(column));
        }

        for row in &result.rows {
            output.push('\n');
            output.push_str(&emission.to_string());
            for value in row {
                output.push(',');
                output.push_str(&format_value_csv(value));
            }
        }
        output
    }

    fn format_write(&self, statement: &str, affected: usize) -> String {
        format!("affected,statement\n{},{}", affected, format_text_csv(statement))
    }

    fn format_error(&self, error: &str) -> String {
        format!("error\n{}", format_text_csv(error))
    }
}

/// Format a Value as a display string.
fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => f.to_string(),
        Value::Text(s) => s.clone(),
        Value::Blob(b) => blob_literal(b),
    }
}

/// Format a Value for CSV output.
fn format_value_csv(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Text(s) => format_text_csv(s),
        _ => format_value(value),
    }
}

fn format_text_csv(s: &str) -> String {
    format!("\"{}\"", escape_csv(s))
}

/// Convert a Value to JSON.
fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Integer(i) => serde_json::Value::Number((*i).into()),
        Value::Real(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Blob(b) => serde_json::Value::String(blob_literal(b)),
    }
}

/// Escape a string for CSV.
fn escape_csv(s: &str) -> String {
    s.replace('"', "\"\"")
}

/// Render a blob the way SQLite quotes it, `X'0A1B'`.
fn blob_literal(data: &[u8]) -> String {
    format!("X'{}'", hex::encode_upper(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ResultSet {
        ResultSet {
            columns: vec!["name".to_string(), "score".to_string()],
            rows: vec![
                vec![Value::Text("ann".to_string()), Value::Integer(3)],
                vec![Value::Text("say \"hi\"".to_string()), Value::Null],
            ],
        }
    }

    #[test]
    fn test_escape_csv() {
        assert_eq!(escape_csv("hello"), "hello");
        assert_eq!(escape_csv("say \"hi\""), "say \"\"hi\"\"");
    }

    #[test]
    fn test_blob_literal() {
        assert_eq!(blob_literal(b"hi"), "X'6869'");
        assert_eq!(blob_literal(&[0x0a, 0xff]), "X'0AFF'");
        assert_eq!(blob_literal(&[]), "X''");

        let blob = Value::Blob(vec![1, 2]);
        assert_eq!(format_value_csv(&blob), "X'0102'");
        assert_eq!(value_to_json(&blob), serde_json::json!("X'0102'"));
    }

    #[test]
    fn test_csv_result() {
        let output = CsvFormatter.format_result(2, &sample());
        assert_eq!(
            output,
            "emission,\"name\",\"score\"\n2,\"ann\",3\n2,\"say \"\"hi\"\"\","
        );
    }

    #[test]
    fn test_json_result() {
        let output = JsonFormatter.format_result(1, &sample());
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed["emission"], 1);
        assert_eq!(parsed["rows"][0]["name"], "ann");
        assert_eq!(parsed["rows"][0]["score"], 3);
        assert!(parsed["rows"][1]["score"].is_null());
    }

    #[test]
    fn test_table_result_counts_rows() {
        let output = TableFormatter.format_result(1, &sample());
        assert!(output.starts_with("#1\n"));
        assert!(output.ends_with("2 row(s)"));
        assert!(output.contains("ann"));
    }

    #[test]
    fn test_query_result_set() {
        let writer = regionwatch::Writer::open_in_memory().unwrap();
        let result = writer
            .write(|db| {
                db.execute_batch(
                    "CREATE TABLE player (name TEXT, score REAL);
                     INSERT INTO player VALUES ('ann', 1.5);",
                )?;
                ResultSet::query(db, "SELECT name, score FROM player")
            })
            .unwrap();

        assert_eq!(result.columns, vec!["name", "score"]);
        assert_eq!(
            result.rows,
            vec![vec![Value::Text("ann".to_string()), Value::Real(1.5)]]
        );
    }
}
