//! Staged file formats and row parsing

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Layout of a staged data file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    /// One JSON document; a top-level array is unwrapped into its elements
    #[default]
    JsonArray,
    /// One JSON document per line
    Ndjson,
    /// Whole-document parse first, NDJSON when that fails
    Auto,
}

impl FileFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::JsonArray => "json_array",
            Self::Ndjson => "ndjson",
            Self::Auto => "auto",
        }
    }
}

impl std::fmt::Display for FileFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FileFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" | "json_array" => Ok(Self::JsonArray),
            "ndjson" | "jsonl" => Ok(Self::Ndjson),
            "auto" => Ok(Self::Auto),
            other => Err(format!("unknown file format '{}'", other)),
        }
    }
}

/// A row that parsed, with its 1-based position in the file
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedRecord {
    pub row_number: usize,
    pub value: Value,
}

/// A row the parser rejected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRejection {
    pub row_number: usize,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct ParsedRecords {
    pub rows: Vec<ParsedRecord>,
    pub rejected: Vec<RowRejection>,
}

impl ParsedRecords {
    /// Rows seen, accepted or not
    pub fn total(&self) -> usize {
        self.rows.len() + self.rejected.len()
    }

    pub fn first_error(&self) -> Option<String> {
        self.rejected
            .iter()
            .min_by_key(|r| r.row_number)
            .map(|r| format!("row {}: {}", r.row_number, r.reason))
    }
}

/// Split file contents into rows.
///
/// Returns `Err` when the file as a whole cannot be read in the requested
/// format. Per-row problems land in [`ParsedRecords::rejected`].
pub fn parse_records(text: &str, format: FileFormat) -> Result<ParsedRecords, String> {
    match format {
        FileFormat::JsonArray => parse_document(text),
        FileFormat::Ndjson => Ok(parse_lines(text)),
        FileFormat::Auto => parse_document(text).or_else(|_| Ok(parse_lines(text))),
    }
}

fn parse_document(text: &str) -> Result<ParsedRecords, String> {
    if text.trim().is_empty() {
        return Ok(ParsedRecords::default());
    }

    let document: Value =
        serde_json::from_str(text).map_err(|e| format!("not a JSON document: {}", e))?;

    let values = match document {
        Value::Array(values) => values,
        other => vec![other],
    };

    Ok(ParsedRecords {
        rows: values
            .into_iter()
            .enumerate()
            .map(|(i, value)| ParsedRecord {
                row_number: i + 1,
                value,
            })
            .collect(),
        rejected: Vec::new(),
    })
}

fn parse_lines(text: &str) -> ParsedRecords {
    let mut parsed = ParsedRecords::default();

    for (i, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(value) => parsed.rows.push(ParsedRecord {
                row_number: i + 1,
                value,
            }),
            Err(e) => parsed.rejected.push(RowRejection {
                row_number: i + 1,
                reason: e.to_string(),
            }),
        }
    }

    parsed
}

/// Ordered chunk of rows bound for one table
#[derive(Debug, Clone)]
pub struct LoadBatch {
    pub index: usize,
    pub rows: Vec<ParsedRecord>,
}

/// Chunk rows into batches of at most `batch_size`, keeping file order
pub fn into_batches(rows: Vec<ParsedRecord>, batch_size: usize) -> Vec<LoadBatch> {
    let size = batch_size.max(1);
    let mut batches = Vec::with_capacity(rows.len().div_ceil(size));
    let mut current = Vec::with_capacity(size.min(rows.len()));

    for row in rows {
        current.push(row);
        if current.len() == size {
            batches.push(LoadBatch {
                index: batches.len(),
                rows: std::mem::take(&mut current),
            });
        }
    }
    if !current.is_empty() {
        batches.push(LoadBatch {
            index: batches.len(),
            rows: current,
        });
    }

    batches
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_array_unwraps_elements() {
        let parsed = parse_records(r#"[{"a":1},{"a":2},3]"#, FileFormat::JsonArray).unwrap();
        assert_eq!(parsed.rows.len(), 3);
        assert_eq!(parsed.rows[2].row_number, 3);
        assert_eq!(parsed.rows[0].value, json!({"a": 1}));
    }

    #[test]
    fn test_json_bare_object_is_one_row() {
        let parsed = parse_records(r#"{"only": true}"#, FileFormat::JsonArray).unwrap();
        assert_eq!(parsed.rows.len(), 1);
    }

    #[test]
    fn test_json_array_rejects_garbage_whole_file() {
        let err = parse_records("this is not json", FileFormat::JsonArray).unwrap_err();
        assert!(err.contains("not a JSON document"));
    }

    #[test]
    fn test_ndjson_isolates_bad_lines() {
        let text = (1..=10)
            .map(|n| if n == 3 { "{broken".to_string() } else { format!(r#"{{"n":{n}}}"#) })
            .collect::<Vec<_>>()
            .join("\n");

        let parsed = parse_records(&text, FileFormat::Ndjson).unwrap();
        assert_eq!(parsed.rows.len(), 9);
        assert_eq!(parsed.rejected.len(), 1);
        assert_eq!(parsed.rejected[0].row_number, 3);
        assert_eq!(parsed.total(), 10);
        assert!(parsed.first_error().unwrap().starts_with("row 3"));
    }

    #[test]
    fn test_ndjson_skips_blank_lines() {
        let parsed = parse_records("{\"a\":1}\n\n   \n{\"a\":2}\n", FileFormat::Ndjson).unwrap();
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[1].row_number, 4);
    }

    #[test]
    fn test_auto_falls_back_to_lines() {
        let whole = parse_records(r#"[1,2]"#, FileFormat::Auto).unwrap();
        assert_eq!(whole.rows.len(), 2);

        let lines = parse_records("{\"a\":1}\n{\"a\":2}", FileFormat::Auto).unwrap();
        assert_eq!(lines.rows.len(), 2);
    }

    #[test]
    fn test_empty_file_has_no_rows() {
        assert_eq!(parse_records("  \n", FileFormat::JsonArray).unwrap().total(), 0);
    }

    #[test]
    fn test_batches_keep_order() {
        let rows: Vec<_> = (1..=7)
            .map(|n| ParsedRecord {
                row_number: n,
                value: json!(n),
            })
            .collect();

        let batches = into_batches(rows, 3);
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[2].rows.len(), 1);
        assert_eq!(batches[1].index, 1);
        assert_eq!(batches[1].rows[0].row_number, 4);

        assert!(into_batches(Vec::new(), 3).is_empty());
    }

    #[test]
    fn test_format_from_str() {
        assert_eq!("jsonl".parse::<FileFormat>().unwrap(), FileFormat::Ndjson);
        assert_eq!("JSON".parse::<FileFormat>().unwrap(), FileFormat::JsonArray);
        assert!("csv".parse::<FileFormat>().is_err());
    }
}
