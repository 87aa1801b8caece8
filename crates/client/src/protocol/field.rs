// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Update field-vector codec.
//!
//! The `<fields>` section of an update line is `|`-separated. Within
//! it `#` is a server null, `$` the empty string, `^<n>` compresses
//! `n` consecutive fields carried over unchanged from the previous
//! update, and `%XX` escapes arbitrary bytes (UTF-8 sequences arrive
//! as consecutive escapes).

use std::fmt;

/// One decoded slot of an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FieldValue {
    /// Carry the previous value forward.
    Unchanged,
    /// A fresh value; `None` is a server-side null.
    Changed(Option<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FieldDecodeError {
    pub reason: String,
}

impl fmt::Display for FieldDecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bad field vector: {}", self.reason)
    }
}

fn hex_val(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'A'..=b'F' => Some(b - b'A' + 10),
        b'a'..=b'f' => Some(b - b'a' + 10),
        _ => None,
    }
}

/// Decode one raw field token (no `|` inside).
fn decode_token(token: &str) -> Result<Vec<FieldValue>, FieldDecodeError> {
    match token.as_bytes() {
        b"" => {
            // An empty token would be ambiguous; the server always
            // sends `$` for the empty string.
            Err(FieldDecodeError { reason: "empty token".to_owned() })
        }
        b"#" => Ok(vec![FieldValue::Changed(None)]),
        b"$" => Ok(vec![FieldValue::Changed(Some(String::new()))]),
        [b'^', digits @ ..] => {
            let count: usize = std::str::from_utf8(digits)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| FieldDecodeError {
                    reason: format!("bad unchanged count: {token:?}"),
                })?;
            if count == 0 {
                return Err(FieldDecodeError { reason: "zero unchanged count".to_owned() });
            }
            Ok(vec![FieldValue::Unchanged; count])
        }
        bytes => {
            let mut out = Vec::with_capacity(bytes.len());
            let mut i = 0;
            while i < bytes.len() {
                if bytes[i] == b'%' {
                    let (hi, lo) = match (bytes.get(i + 1), bytes.get(i + 2)) {
                        (Some(h), Some(l)) => (hex_val(*h), hex_val(*l)),
                        _ => (None, None),
                    };
                    match (hi, lo) {
                        (Some(h), Some(l)) => {
                            out.push((h << 4) | l);
                            i += 3;
                        }
                        _ => {
                            return Err(FieldDecodeError {
                                reason: format!("bad escape in {token:?}"),
                            });
                        }
                    }
                } else {
                    out.push(bytes[i]);
                    i += 1;
                }
            }
            let value = String::from_utf8(out).map_err(|_| FieldDecodeError {
                reason: format!("escape sequence is not UTF-8 in {token:?}"),
            })?;
            Ok(vec![FieldValue::Changed(Some(value))])
        }
    }
}

/// Decode a full `|`-separated field section into one slot per field.
pub(crate) fn decode_fields(section: &str) -> Result<Vec<FieldValue>, FieldDecodeError> {
    let mut out = Vec::new();
    for token in section.split('|') {
        out.extend(decode_token(token)?);
    }
    Ok(out)
}

/// Inverse of [`decode_fields`]; consecutive `Unchanged` slots compress
/// to a single `^<n>`.
pub(crate) fn encode_fields(fields: &[FieldValue]) -> String {
    let mut tokens: Vec<String> = Vec::with_capacity(fields.len());
    let mut unchanged_run = 0usize;
    for field in fields {
        match field {
            FieldValue::Unchanged => unchanged_run += 1,
            FieldValue::Changed(value) => {
                if unchanged_run > 0 {
                    tokens.push(format!("^{unchanged_run}"));
                    unchanged_run = 0;
                }
                tokens.push(encode_value(value.as_deref()));
            }
        }
    }
    if unchanged_run > 0 {
        tokens.push(format!("^{unchanged_run}"));
    }
    tokens.join("|")
}

fn encode_value(value: Option<&str>) -> String {
    let Some(value) = value else {
        return "#".to_owned();
    };
    if value.is_empty() {
        return "$".to_owned();
    }
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = Vec::with_capacity(value.len());
    for (i, b) in value.bytes().enumerate() {
        let must_escape = matches!(b, b'|' | b'%' | b'\r' | b'\n')
            // A leading marker byte would be misread as #/$/^ syntax.
            || (i == 0 && matches!(b, b'#' | b'$' | b'^'));
        if must_escape {
            out.push(b'%');
            out.push(HEX[(b >> 4) as usize]);
            out.push(HEX[(b & 0x0F) as usize]);
        } else {
            out.push(b);
        }
    }
    // Only ASCII was escaped, so the byte stream is still valid UTF-8.
    String::from_utf8(out).unwrap_or_default()
}

/// Apply a decoded vector over the previous values of an item,
/// producing the new value vector and a changed mask.
///
/// `prev` is `None` for the first update of an item, in which case
/// every slot must be `Changed` (there is nothing to carry forward);
/// an `Unchanged` there decodes as null.
pub(crate) fn apply_update(
    prev: Option<&[Option<String>]>,
    decoded: &[FieldValue],
) -> (Vec<Option<String>>, Vec<bool>) {
    let mut values = Vec::with_capacity(decoded.len());
    let mut changed = Vec::with_capacity(decoded.len());
    for (i, field) in decoded.iter().enumerate() {
        match field {
            FieldValue::Unchanged => {
                values.push(prev.and_then(|p| p.get(i).cloned()).unwrap_or(None));
                changed.push(false);
            }
            FieldValue::Changed(v) => {
                values.push(v.clone());
                changed.push(true);
            }
        }
    }
    (values, changed)
}

#[cfg(test)]
#[path = "field_tests.rs"]
mod tests;
