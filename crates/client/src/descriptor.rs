// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Item-group and field-schema descriptors.
//!
//! A subscription addresses its items and fields either through an
//! explicit list of names (positions are then derivable both ways) or
//! through an opaque server-side group/schema name (only positions are
//! known client-side).

use std::collections::HashMap;

use crate::error::ClientError;

#[derive(Debug, Clone)]
pub(crate) enum Descriptor {
    /// Explicit names; positions are 1-based indexes into the list.
    List { names: Vec<String>, by_name: HashMap<String, usize> },
    /// Opaque server-side identifier.
    Name(String),
}

impl Descriptor {
    pub fn from_items(names: &[&str]) -> Result<Self, ClientError> {
        for name in names {
            validate_item_name(name)?;
        }
        Ok(Self::list(names))
    }

    pub fn from_fields(names: &[&str]) -> Result<Self, ClientError> {
        for name in names {
            validate_field_name(name)?;
        }
        Ok(Self::list(names))
    }

    fn list(names: &[&str]) -> Self {
        let names: Vec<String> = names.iter().map(|s| (*s).to_owned()).collect();
        let by_name = names.iter().enumerate().map(|(i, n)| (n.clone(), i + 1)).collect();
        Self::List { names, by_name }
    }

    pub fn from_name(name: &str) -> Result<Self, ClientError> {
        if name.is_empty() || name.contains(' ') {
            return Err(ClientError::argument(format!("invalid group/schema name: {name:?}")));
        }
        Ok(Self::Name(name.to_owned()))
    }

    /// Number of entries, known only for list descriptors.
    pub fn len(&self) -> Option<usize> {
        match self {
            Self::List { names, .. } => Some(names.len()),
            Self::Name(_) => None,
        }
    }

    /// 1-based position of `name`, when a list is in use.
    pub fn position_of(&self, name: &str) -> Option<usize> {
        match self {
            Self::List { by_name, .. } => by_name.get(name).copied(),
            Self::Name(_) => None,
        }
    }

    /// Name at 1-based `position`, when a list is in use.
    pub fn name_at(&self, position: usize) -> Option<&str> {
        match self {
            Self::List { names, .. } => {
                position.checked_sub(1).and_then(|i| names.get(i)).map(String::as_str)
            }
            Self::Name(_) => None,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Self::List { .. })
    }

    /// The form sent as `LS_group` / `LS_schema`: space-joined names or
    /// the opaque identifier.
    pub fn to_wire(&self) -> String {
        match self {
            Self::List { names, .. } => names.join(" "),
            Self::Name(name) => name.clone(),
        }
    }
}

/// Item names must be nonempty, contain no spaces, and must not be
/// purely numeric (a bare number denotes a position on the wire).
pub(crate) fn validate_item_name(name: &str) -> Result<(), ClientError> {
    if name.is_empty() {
        return Err(ClientError::argument("item name is empty"));
    }
    if name.contains(' ') {
        return Err(ClientError::argument(format!("item name contains spaces: {name:?}")));
    }
    if name.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ClientError::argument(format!("item name is purely numeric: {name:?}")));
    }
    Ok(())
}

/// Field names must be nonempty and contain no spaces.
pub(crate) fn validate_field_name(name: &str) -> Result<(), ClientError> {
    if name.is_empty() {
        return Err(ClientError::argument("field name is empty"));
    }
    if name.contains(' ') {
        return Err(ClientError::argument(format!("field name contains spaces: {name:?}")));
    }
    Ok(())
}

#[cfg(test)]
#[path = "descriptor_tests.rs"]
mod tests;
