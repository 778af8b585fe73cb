//! Cell value coercion.
//!
//! Sheet cells arrive as strings; each mapping declares the type its
//! system field should carry. Coercion failure is never fatal: the
//! original trimmed string is stored so no data is lost.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    String,
    Number,
    Integer,
    Date,
}

/// Coerce a raw cell string to the declared type. Returns the coerced
/// value, or the trimmed original string when coercion fails.
pub fn coerce_value(raw: &str, data_type: DataType) -> Value {
    let trimmed = raw.trim();
    match data_type {
        DataType::String => Value::String(trimmed.to_string()),
        DataType::Number => match parse_number(trimmed) {
            Some(n) => json!(n),
            None => Value::String(trimmed.to_string()),
        },
        DataType::Integer => match parse_number(trimmed) {
            Some(n) if n.fract() == 0.0 && n.abs() < 9e15 => json!(n as i64),
            _ => Value::String(trimmed.to_string()),
        },
        DataType::Date => match parse_date(trimmed) {
            Some(date) => Value::String(date.format("%Y-%m-%d").to_string()),
            None => Value::String(trimmed.to_string()),
        },
    }
}

/// Parse a number out of a sheet cell, tolerating currency adornments and
/// the thousands/decimal separator conventions sellers actually type
/// (`1.000.000`, `1,000,000.50`, `100.000,5 ₫`).
fn parse_number(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '₫' && *c != '$')
        .collect();
    let cleaned = cleaned
        .trim_end_matches("VND")
        .trim_end_matches("vnd")
        .trim_end_matches("đ")
        .to_string();
    if cleaned.is_empty() {
        return None;
    }

    if let Ok(n) = cleaned.parse::<f64>() {
        return Some(n);
    }

    let has_dot = cleaned.contains('.');
    let has_comma = cleaned.contains(',');
    let normalized = if has_dot && has_comma {
        // The later separator is the decimal point; the other groups thousands.
        let last_dot = cleaned.rfind('.').expect("has_dot");
        let last_comma = cleaned.rfind(',').expect("has_comma");
        if last_dot > last_comma {
            cleaned.replace(',', "")
        } else {
            cleaned.replace('.', "").replace(',', ".")
        }
    } else if has_comma {
        // A single trailing group of 1-2 digits reads as decimals;
        // otherwise commas group thousands.
        match cleaned.rsplit_once(',') {
            Some((_, tail)) if tail.len() <= 2 && cleaned.matches(',').count() == 1 => {
                cleaned.replace(',', ".")
            }
            _ => cleaned.replace(',', ""),
        }
    } else {
        // Dots only: `1.000.000` style grouping, unless it parses directly
        // (handled above), e.g. `100.5`.
        cleaned.replace('.', "")
    };

    normalized.parse::<f64>().ok()
}

/// Accepts `YYYY-MM-DD`, `DD/MM/YYYY`, `MM/DD/YYYY` and RFC 3339
/// timestamps. Day-first wins when a slash date is ambiguous.
fn parse_date(raw: &str) -> Option<NaiveDate> {
    if let Ok(d) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(d);
    }
    for format in ["%d/%m/%Y", "%m/%d/%Y"] {
        if let Ok(d) = NaiveDate::parse_from_str(raw, format) {
            return Some(d);
        }
    }
    // RFC 3339: the date prefix is enough.
    raw.get(..10)
        .and_then(|prefix| NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok())
        .filter(|_| raw.len() > 10)
}
