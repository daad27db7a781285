use std::io::{BufRead, BufReader};
use std::path::Path;

use fedra_contracts::{Column, ColumnType};

/// Bool literals accepted by the inference chain, lowercase.
const BOOL_LITERALS: &[&str] = &["true", "false", "yes", "no", "0", "1"];

/// Reads the header row and up to `sample_rows` data rows from a delimited
/// text file. Fields may be double-quoted; a doubled quote inside a quoted
/// field is an escaped quote. Quoted fields do not span lines.
pub fn read_sample(
    path: &Path,
    delimiter: u8,
    sample_rows: usize,
) -> std::io::Result<(Vec<String>, Vec<Vec<String>>)> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);

    let mut header = Vec::new();
    let mut rows = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let fields = split_fields(&line, delimiter);
        if idx == 0 {
            header = fields;
            continue;
        }
        rows.push(fields);
        if rows.len() >= sample_rows {
            break;
        }
    }

    Ok((header, rows))
}

/// Data rows in a delimited file: non-empty lines minus the header.
pub fn count_data_rows(path: &Path) -> std::io::Result<u64> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);

    let mut lines = 0u64;
    for line in reader.lines() {
        if !line?.trim().is_empty() {
            lines += 1;
        }
    }

    Ok(lines.saturating_sub(1))
}

/// Classifies every column of a sample. Deterministic for a given sample.
pub fn infer_columns(header: &[String], rows: &[Vec<String>]) -> Vec<Column> {
    header
        .iter()
        .enumerate()
        .map(|(idx, name)| {
            let values = rows
                .iter()
                .filter_map(|row| row.get(idx))
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .collect::<Vec<_>>();

            Column {
                name: name.clone(),
                column_type: classify(&values),
                description: None,
            }
        })
        .collect()
}

/// First-match-wins rule chain over the non-blank sample values.
pub fn classify(values: &[&str]) -> ColumnType {
    if values.is_empty() {
        return ColumnType::Unknown;
    }
    if values.iter().all(|v| v.parse::<i64>().is_ok()) {
        return ColumnType::Int;
    }
    if values
        .iter()
        .all(|v| v.parse::<f64>().is_ok_and(|f| f.is_finite()))
    {
        return ColumnType::Float;
    }
    if values
        .iter()
        .all(|v| BOOL_LITERALS.contains(&v.to_ascii_lowercase().as_str()))
    {
        return ColumnType::Bool;
    }
    if values.iter().all(|v| parses_as_datetime(v)) {
        return ColumnType::Datetime;
    }
    ColumnType::String
}

fn parses_as_datetime(value: &str) -> bool {
    if chrono::NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok() {
        return true;
    }
    if chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S").is_ok()
        || chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f").is_ok()
        || chrono::NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").is_ok()
    {
        return true;
    }
    chrono::DateTime::parse_from_rfc3339(value).is_ok()
}

fn split_fields(line: &str, delimiter: u8) -> Vec<String> {
    let delimiter = delimiter as char;
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut chars = line.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            if c == '"' {
                if chars.peek() == Some(&'"') {
                    current.push('"');
                    chars.next();
                } else {
                    in_quotes = false;
                }
            } else {
                current.push(c);
            }
        } else if c == '"' && current.is_empty() {
            in_quotes = true;
        } else if c == delimiter {
            fields.push(std::mem::take(&mut current));
        } else {
            current.push(c);
        }
    }
    fields.push(current);

    fields
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_fixture(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().expect("create temp file");
        file.write_all(contents.as_bytes()).expect("write fixture");
        file
    }

    #[test]
    fn classify_applies_rules_in_order() {
        assert_eq!(classify(&[]), ColumnType::Unknown);
        assert_eq!(classify(&["1", "2", "-3"]), ColumnType::Int);
        assert_eq!(classify(&["1.5", "2", "-0.25"]), ColumnType::Float);
        // 0/1 columns hit the integer rule before the bool rule.
        assert_eq!(classify(&["0", "1", "0"]), ColumnType::Int);
        assert_eq!(classify(&["yes", "NO", "true"]), ColumnType::Bool);
        assert_eq!(
            classify(&["2024-01-31", "2024-02-01"]),
            ColumnType::Datetime
        );
        assert_eq!(
            classify(&["2024-01-31T10:00:00", "2024-02-01 09:30:00"]),
            ColumnType::Datetime
        );
        assert_eq!(classify(&["PD", "ET", "OCD"]), ColumnType::String);
        assert_eq!(classify(&["1", "x"]), ColumnType::String);
        assert_eq!(classify(&["inf", "1.0"]), ColumnType::String);
    }

    #[test]
    fn read_sample_honors_quotes_and_row_cap() {
        let file = write_fixture(
            "id,label,score\n1,\"alpha, with comma\",0.5\n2,\"she said \"\"hi\"\"\",0.7\n3,plain,0.9\n",
        );

        let (header, rows) = read_sample(file.path(), b',', 2).expect("read sample");
        assert_eq!(header, vec!["id", "label", "score"]);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][1], "alpha, with comma");
        assert_eq!(rows[1][1], "she said \"hi\"");
    }

    #[test]
    fn count_excludes_header_and_blank_lines() {
        let file = write_fixture("a,b\n1,2\n3,4\n\n5,6\n");
        assert_eq!(count_data_rows(file.path()).expect("count"), 3);

        let empty = write_fixture("");
        assert_eq!(count_data_rows(empty.path()).expect("count"), 0);
    }

    #[test]
    fn inference_is_deterministic_for_same_bytes() {
        let file = write_fixture("age,sex,enrolled\n61,F,2021-03-01\n54,M,2021-04-15\n");

        let (header, rows) = read_sample(file.path(), b',', 200).expect("read");
        let first = infer_columns(&header, &rows);
        let second = infer_columns(&header, &rows);
        assert_eq!(first, second);
        assert_eq!(first[0].column_type, ColumnType::Int);
        assert_eq!(first[1].column_type, ColumnType::String);
        assert_eq!(first[2].column_type, ColumnType::Datetime);
    }

    #[test]
    fn tsv_splits_on_tabs() {
        let file = write_fixture("a\tb\n1\tx\n");
        let (header, rows) = read_sample(file.path(), b'\t', 10).expect("read");
        assert_eq!(header, vec!["a", "b"]);
        assert_eq!(rows[0], vec!["1", "x"]);
    }
}
