use anyhow::Context;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::handler::TaskHandler;
use crate::handlers::{parse_payload, PARSE_CSV, PARSE_JSON};

#[derive(Debug, Deserialize)]
struct ParseJsonRequest {
    text: String,
}

pub struct ParseJsonHandler;

impl TaskHandler for ParseJsonHandler {
    fn handle(&self, payload: Value) -> anyhow::Result<Value> {
        let request: ParseJsonRequest = parse_payload(PARSE_JSON, payload)?;
        serde_json::from_str(&request.text).context("Input is not valid JSON")
    }
}

fn default_delimiter() -> char {
    ','
}

fn default_has_headers() -> bool {
    true
}

#[derive(Debug, Deserialize)]
struct ParseCsvRequest {
    text: String,
    #[serde(default = "default_delimiter")]
    delimiter: char,
    #[serde(default = "default_has_headers")]
    has_headers: bool,
}

/// Parses CSV text into an array of records: objects keyed by header when
/// `has_headers` is set, arrays of strings otherwise. Quoted fields may
/// contain delimiters, newlines and doubled quotes.
pub struct ParseCsvHandler;

impl TaskHandler for ParseCsvHandler {
    fn handle(&self, payload: Value) -> anyhow::Result<Value> {
        let request: ParseCsvRequest = parse_payload(PARSE_CSV, payload)?;
        if request.delimiter == '"' || request.delimiter == '\n' {
            anyhow::bail!("Delimiter {:?} is not allowed", request.delimiter);
        }

        let mut rows = split_records(&request.text, request.delimiter)?.into_iter();

        if !request.has_headers {
            return Ok(Value::Array(
                rows.map(|row| Value::Array(row.into_iter().map(Value::String).collect()))
                    .collect(),
            ));
        }

        let Some(headers) = rows.next() else {
            return Ok(Value::Array(Vec::new()));
        };

        let records = rows
            .enumerate()
            .map(|(index, row)| {
                if row.len() != headers.len() {
                    anyhow::bail!(
                        "Record {} has {} fields, expected {}",
                        index + 1,
                        row.len(),
                        headers.len()
                    );
                }
                let object = headers
                    .iter()
                    .cloned()
                    .zip(row.into_iter().map(Value::String))
                    .collect::<Map<_, _>>();
                Ok(Value::Object(object))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Value::Array(records))
    }
}

fn split_records(text: &str, delimiter: char) -> anyhow::Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    // A quoted field makes a record even when its content is empty
    let mut quoted = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if in_quotes {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => in_quotes = false,
                _ => field.push(c),
            }
            continue;
        }

        match c {
            '"' if field.is_empty() => {
                in_quotes = true;
                quoted = true;
            }
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {
                // blank line
                if record.is_empty() && field.is_empty() && !quoted {
                    continue;
                }
                record.push(std::mem::take(&mut field));
                records.push(std::mem::take(&mut record));
                quoted = false;
            }
            c if c == delimiter => record.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }

    if in_quotes {
        anyhow::bail!("Unterminated quoted field");
    }
    if !field.is_empty() || !record.is_empty() || quoted {
        record.push(field);
        records.push(record);
    }

    Ok(records)
}
