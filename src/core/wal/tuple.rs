// src/core/wal/tuple.rs

//! Tuple (row) decoding: pgoutput represents each column as a one-byte kind
//! tag followed by, for text-format columns, a four-byte length and the
//! column's text representation.

use super::oid::{is_json_array, is_json_scalar};
use crate::core::errors::PlaneError;
use bytes::Buf;
use serde_json::Value as JsonValue;
use tracing::warn;

/// A single column's changed value, as seen in an `Insert`/`Update`/`Delete`
/// tuple message.
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    Null,
    /// The column's value did not change and was not sent (oversized/TOASTed).
    UnchangedToast,
    /// Raw text-format value, as bytes (pgoutput always uses text format).
    Text(Vec<u8>),
}

impl Cell {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Cell::Text(bytes) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }
}

/// A decoded tuple: one `Cell` per column, in column order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Tuple {
    pub cells: Vec<Cell>,
}

/// Reads a tuple from a pgoutput buffer: `Int16 ncols` followed by `ncols`
/// column entries of `Byte1 kind [Int32 len, Byten data]`.
pub fn decode_tuple(buf: &mut &[u8]) -> Result<Tuple, PlaneError> {
    if buf.len() < 2 {
        return Err(PlaneError::MalformedTuple("truncated column count".into()));
    }
    let ncols = buf.get_i16() as usize;
    let mut cells = Vec::with_capacity(ncols);
    for _ in 0..ncols {
        if buf.is_empty() {
            return Err(PlaneError::MalformedTuple("truncated column kind".into()));
        }
        let kind = buf.get_u8();
        let cell = match kind {
            b'n' => Cell::Null,
            b'u' => Cell::UnchangedToast,
            b't' => {
                if buf.len() < 4 {
                    return Err(PlaneError::MalformedTuple("truncated column length".into()));
                }
                let len = buf.get_i32() as usize;
                if buf.len() < len {
                    return Err(PlaneError::MalformedTuple("truncated column data".into()));
                }
                let data = buf[..len].to_vec();
                buf.advance(len);
                Cell::Text(data)
            }
            other => {
                return Err(PlaneError::MalformedTuple(format!(
                    "unknown column kind byte {other:#x}"
                )));
            }
        };
        cells.push(cell);
    }
    Ok(Tuple { cells })
}

/// A tuple's cell paired with its column's declared type, ready to be
/// presented as JSON to downstream consumers. `None` means the column was
/// null or TOAST-unchanged and carries no decodable value this tuple.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedValue {
    Null,
    UnchangedToast,
    Raw(String),
    Json(JsonValue),
}

/// Decodes a single cell given its column's type oid, opportunistically
/// parsing JSON/JSONB scalars and arrays per the decoder's JSON handling
/// rules: scalar json/jsonb parses directly; json[]/jsonb[] splits the
/// Postgres array literal on top-level commas and double-decodes each
/// element, since Postgres double-encodes JSON nested in arrays. Invalid
/// JSON is logged and the raw text is retained rather than failing the tuple.
pub fn decode_cell(cell: &Cell, type_oid: u32) -> DecodedValue {
    match cell {
        Cell::Null => DecodedValue::Null,
        Cell::UnchangedToast => DecodedValue::UnchangedToast,
        Cell::Text(bytes) => {
            let text = match std::str::from_utf8(bytes) {
                Ok(s) => s,
                Err(_) => return DecodedValue::Raw(String::from_utf8_lossy(bytes).into_owned()),
            };
            if is_json_scalar(type_oid) {
                match serde_json::from_str::<JsonValue>(text) {
                    Ok(v) => DecodedValue::Json(v),
                    Err(e) => {
                        warn!(error = %e, "failed to decode json scalar cell; keeping raw text");
                        DecodedValue::Raw(text.to_string())
                    }
                }
            } else if is_json_array(type_oid) {
                match decode_json_array_literal(text) {
                    Ok(v) => DecodedValue::Json(v),
                    Err(e) => {
                        warn!(error = %e, "failed to decode json array cell; keeping raw text");
                        DecodedValue::Raw(text.to_string())
                    }
                }
            } else {
                DecodedValue::Raw(text.to_string())
            }
        }
    }
}

/// Splits a Postgres array literal (`{"...","..."}`) on top-level commas and
/// double-decodes each element, since Postgres double-encodes JSON values
/// nested inside arrays (the outer array-element quoting, then the JSON
/// itself).
fn decode_json_array_literal(text: &str) -> Result<JsonValue, serde_json::Error> {
    let inner = text.trim();
    let inner = inner
        .strip_prefix('{')
        .and_then(|s| s.strip_suffix('}'))
        .unwrap_or(inner);

    let mut elements = Vec::new();
    let mut depth = 0i32;
    let mut in_quotes = false;
    let mut current = String::new();
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if !in_quotes => in_quotes = true,
            '"' if in_quotes => {
                // Postgres escapes embedded quotes as \" inside array literals.
                in_quotes = false;
            }
            '\\' if in_quotes => {
                if let Some(&next) = chars.peek() {
                    current.push(next);
                    chars.next();
                    continue;
                }
            }
            '{' if !in_quotes => depth += 1,
            '}' if !in_quotes => depth -= 1,
            ',' if !in_quotes && depth == 0 => {
                elements.push(std::mem::take(&mut current));
                continue;
            }
            _ => {}
        }
        current.push(c);
    }
    if !current.is_empty() || !elements.is_empty() {
        elements.push(current);
    }

    let decoded: Result<Vec<JsonValue>, serde_json::Error> = elements
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| {
            if s.eq_ignore_ascii_case("null") {
                Ok(JsonValue::Null)
            } else {
                serde_json::from_str::<JsonValue>(s)
            }
        })
        .collect();
    Ok(JsonValue::Array(decoded?))
}
