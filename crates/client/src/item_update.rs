// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The value object handed to `onItemUpdate`.

use std::collections::HashMap;
use std::sync::Arc;

/// Field-name table for a subscription, shared by every update it
/// produces. Present only when the subscription uses a field list
/// (possibly extended with second-level fields for COMMAND).
#[derive(Debug)]
pub struct FieldNames {
    names: Vec<String>,
    by_name: HashMap<String, usize>,
}

impl FieldNames {
    pub(crate) fn new(names: Vec<String>) -> Self {
        let by_name = names.iter().enumerate().map(|(i, n)| (n.clone(), i + 1)).collect();
        Self { names, by_name }
    }

    /// 1-based position of `name`.
    pub fn position_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Name at 1-based `position`.
    pub fn name_at(&self, position: usize) -> Option<&str> {
        position.checked_sub(1).and_then(|i| self.names.get(i)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// One update for one item of a subscription.
///
/// Field values are addressable by 1-based position always, and by
/// name when the subscription was built from a field list. A `None`
/// value is a server-side null.
#[derive(Debug, Clone)]
pub struct ItemUpdate {
    item_name: Option<String>,
    item_pos: usize,
    is_snapshot: bool,
    values: Arc<Vec<Option<String>>>,
    changed: Arc<Vec<bool>>,
    fields: Option<Arc<FieldNames>>,
}

impl ItemUpdate {
    pub(crate) fn new(
        item_name: Option<String>,
        item_pos: usize,
        is_snapshot: bool,
        values: Vec<Option<String>>,
        changed: Vec<bool>,
        fields: Option<Arc<FieldNames>>,
    ) -> Self {
        Self {
            item_name,
            item_pos,
            is_snapshot,
            values: Arc::new(values),
            changed: Arc::new(changed),
            fields,
        }
    }

    pub fn item_name(&self) -> Option<&str> {
        self.item_name.as_deref()
    }

    /// 1-based position of the item within the subscription.
    pub fn item_pos(&self) -> usize {
        self.item_pos
    }

    /// Whether this update is part of the initial snapshot.
    pub fn is_snapshot(&self) -> bool {
        self.is_snapshot
    }

    pub fn num_fields(&self) -> usize {
        self.values.len()
    }

    /// Value at 1-based field `position`; `None` for a server null or
    /// an out-of-range position.
    pub fn value(&self, position: usize) -> Option<&str> {
        position
            .checked_sub(1)
            .and_then(|i| self.values.get(i))
            .and_then(|v| v.as_deref())
    }

    /// Value by field name; requires a field list.
    pub fn value_by_name(&self, name: &str) -> Option<&str> {
        let pos = self.fields.as_ref()?.position_of(name)?;
        self.value(pos)
    }

    /// Whether the field at 1-based `position` changed in this update.
    pub fn is_changed(&self, position: usize) -> bool {
        position.checked_sub(1).and_then(|i| self.changed.get(i)).copied().unwrap_or(false)
    }

    pub fn is_changed_by_name(&self, name: &str) -> bool {
        self.fields
            .as_ref()
            .and_then(|f| f.position_of(name))
            .is_some_and(|pos| self.is_changed(pos))
    }

    /// Iterate `(position, name, value)` over the changed fields, in
    /// position order. `name` is `None` without a field list.
    pub fn changed_fields(&self) -> impl Iterator<Item = (usize, Option<&str>, Option<&str>)> {
        let fields = self.fields.as_deref();
        self.changed.iter().enumerate().filter(|(_, c)| **c).map(move |(i, _)| {
            let pos = i + 1;
            (pos, fields.and_then(|f| f.name_at(pos)), self.value(pos))
        })
    }
}

#[cfg(test)]
#[path = "item_update_tests.rs"]
mod tests;
