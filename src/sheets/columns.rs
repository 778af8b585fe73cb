//! Column reference resolution.
//!
//! A mapping's `sheet_column` is either a spreadsheet letter reference
//! (`A`, `C`, `AA`, bijective base-26) or a header-name string matched
//! against the header row. Short all-caps strings are parsed as letters;
//! everything else is a header name.

use super::coerce::DataType;
use crate::connections::ColumnMapping;
use crate::errors::{SheetmindError, codes};
use regex::Regex;
use std::sync::OnceLock;

/// A column mapping with its sheet column resolved to a 0-based index.
/// `index` is `None` when an optional header-name column is absent from
/// the sheet.
#[derive(Debug, Clone)]
pub struct ResolvedMapping {
    pub system_field: String,
    pub index: Option<usize>,
    pub data_type: DataType,
    pub required: bool,
}

fn letter_ref() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Z]{1,3}$").expect("static regex"))
}

/// `A` → 0, `Z` → 25, `AA` → 26, `AZ` → 51, `BA` → 52, …
pub fn column_index(reference: &str) -> Option<usize> {
    if !letter_ref().is_match(reference) {
        return None;
    }
    let mut index: usize = 0;
    for c in reference.bytes() {
        index = index * 26 + usize::from(c - b'A') + 1;
    }
    Some(index - 1)
}

/// Resolve every mapping against the sheet's header row.
///
/// Fails the sync when a header name is duplicated (ambiguous) or a
/// required header-name column is absent. Optional absent columns resolve
/// to `index: None` and are simply skipped during row mapping.
pub fn resolve_mappings(
    mappings: &[ColumnMapping],
    header_cells: Option<&[String]>,
) -> Result<Vec<ResolvedMapping>, SheetmindError> {
    let mut resolved = Vec::with_capacity(mappings.len());

    for mapping in mappings {
        let index = match column_index(&mapping.sheet_column) {
            Some(index) => Some(index),
            None => {
                let Some(headers) = header_cells else {
                    return Err(SheetmindError::validation(
                        codes::MAPPING_ERROR,
                        format!(
                            "column '{}' is a header reference but no header row is available",
                            mapping.sheet_column
                        ),
                    ));
                };
                let wanted = mapping.sheet_column.trim().to_lowercase();
                let matches: Vec<usize> = headers
                    .iter()
                    .enumerate()
                    .filter(|(_, h)| h.trim().to_lowercase() == wanted)
                    .map(|(i, _)| i)
                    .collect();
                match matches.as_slice() {
                    [] if mapping.required => {
                        return Err(SheetmindError::validation(
                            codes::MAPPING_ERROR,
                            format!("required column '{}' not found in header row", mapping.sheet_column),
                        ));
                    }
                    [] => None,
                    [index] => Some(*index),
                    _ => {
                        return Err(SheetmindError::validation(
                            codes::MAPPING_ERROR,
                            format!(
                                "header '{}' appears {} times; column reference is ambiguous",
                                mapping.sheet_column,
                                matches.len()
                            ),
                        ));
                    }
                }
            }
        };

        resolved.push(ResolvedMapping {
            system_field: mapping.system_field.clone(),
            index,
            data_type: mapping.data_type,
            required: mapping.required,
        });
    }

    Ok(resolved)
}
