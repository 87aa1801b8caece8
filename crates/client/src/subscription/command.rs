// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! COMMAND-mode update application: the per-key table and the optional
//! second-level child subscriptions.
//!
//! First-level updates carry a reserved key and command position. ADD
//! and UPDATE merge the decoded vector into the key's row; DELETE
//! drops the row (and the key's child subscription). With a
//! second-level field descriptor configured, every new key spawns an
//! internal MERGE subscription on the key itself; its updates are
//! projected into the parent row at positions past the first-level
//! field count.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::descriptor::{validate_item_name, Descriptor};
use crate::item_update::{FieldNames, ItemUpdate};

use super::{
    fire_listeners, next_sub_id, BufferSize, FrozenSettings, MaxFrequency, Mode, Outgoing,
    Relation, RuntimeSub, Snapshot, SubPhase, Subscription, SubscriptionManager,
};

/// Error code reported when a key value cannot serve as a second-level
/// item name.
const BAD_KEY_AS_ITEM: i32 = 14;

/// Combined field-name table: first-level names, then second-level
/// names for two-level COMMAND. Only field lists contribute names.
pub(super) fn build_field_names(frozen: &FrozenSettings) -> Option<Arc<FieldNames>> {
    if !frozen.fields.is_list() {
        return None;
    }
    let mut names: Vec<String> = Vec::new();
    if let Some(len) = frozen.fields.len() {
        for pos in 1..=len {
            if let Some(name) = frozen.fields.name_at(pos) {
                names.push(name.to_owned());
            }
        }
    }
    if let Some(ref second) = frozen.second_fields {
        if let Some(len) = second.len() {
            for pos in 1..=len {
                if let Some(name) = second.name_at(pos) {
                    names.push(name.to_owned());
                }
            }
        }
    }
    Some(Arc::new(FieldNames::new(names)))
}

impl SubscriptionManager {
    /// Apply a decoded first-level COMMAND update.
    pub(super) fn on_command_update(
        &mut self,
        sub_id: u64,
        item: usize,
        values: Vec<Option<String>>,
        mut changed: Vec<bool>,
        is_snapshot: bool,
    ) -> Vec<Outgoing> {
        let mut out = Vec::new();
        let (update, sub_handle) = {
            let Some(runtime) = self.subs.get_mut(&sub_id) else {
                return out;
            };
            let (key_pos, cmd_pos) = (runtime.key_pos, runtime.cmd_pos);
            let Some(key) = position_value(&values, key_pos) else {
                warn!(sub_id, item, "COMMAND update without key value");
                return out;
            };
            let command = position_value(&values, cmd_pos).unwrap_or_default().to_uppercase();
            let second_level = runtime.frozen.second_fields.is_some();

            let Some(state) = runtime.item_state(item) else {
                warn!(sub_id, item, "COMMAND update for out-of-range item");
                return out;
            };

            let row_exists = state.keys.contains_key(&key);
            // The server's command token is normalized against the
            // table: an ADD for a live key is an UPDATE, an UPDATE for
            // an unknown key is an ADD.
            let effective = match command.as_str() {
                "DELETE" => Command::Delete,
                "ADD" | "UPDATE" => {
                    if row_exists {
                        Command::Update
                    } else {
                        Command::Add
                    }
                }
                other => {
                    warn!(sub_id, item, command = other, "unknown COMMAND token");
                    return out;
                }
            };

            let row = match effective {
                Command::Delete => {
                    state.keys.remove(&key);
                    let mut row: Vec<Option<String>> = vec![None; values.len()];
                    set_position(&mut row, key_pos, Some(key.clone()));
                    set_position(&mut row, cmd_pos, Some("DELETE".to_owned()));
                    row
                }
                Command::Add | Command::Update => {
                    let row = state
                        .keys
                        .entry(key.clone())
                        .or_insert_with(|| vec![None; values.len()]);
                    if row.len() < values.len() {
                        row.resize(values.len(), None);
                    }
                    row[..values.len()].clone_from_slice(&values);
                    set_position(row, cmd_pos, Some(effective.as_str().to_owned()));
                    row.clone()
                }
            };

            if second_level {
                match effective {
                    Command::Add => {
                        out.extend(self.spawn_child(sub_id, item, &key));
                    }
                    Command::Delete => {
                        out.extend(self.drop_child(sub_id, item, &key));
                    }
                    Command::Update => {}
                }
            }

            // Re-borrow: spawning/dropping children touched the map.
            let Some(runtime) = self.subs.get_mut(&sub_id) else {
                return out;
            };
            changed.resize(row.len().max(changed.len()), false);
            set_flag(&mut changed, cmd_pos, true);
            let update = ItemUpdate::new(
                runtime.item_display_name(item),
                item,
                is_snapshot,
                row,
                changed,
                runtime.field_names.clone(),
            );
            (update, runtime.sub.clone())
        };
        fire_listeners(&self.events, &sub_handle, move |l| l.on_item_update(&update));
        out
    }

    /// Merge a second-level update into the parent's key row and
    /// deliver it as a parent update.
    pub(super) fn project_child_update(
        &mut self,
        parent_id: u64,
        item: usize,
        key: &str,
        child_values: Vec<Option<String>>,
        child_changed: Vec<bool>,
    ) -> Vec<Outgoing> {
        let (update, sub_handle) = {
            let Some(parent) = self.subs.get_mut(&parent_id) else {
                return Vec::new();
            };
            let num_fields = parent.num_fields;
            let cmd_pos = parent.cmd_pos;
            let name = parent.item_display_name(item);
            let field_names = parent.field_names.clone();
            let Some(state) = parent.item_state(item) else {
                return Vec::new();
            };
            let Some(row) = state.keys.get_mut(key) else {
                // Key deleted while the child update was in flight.
                debug!(parent_id, key, "second-level update for a dead key");
                return Vec::new();
            };
            let width = num_fields + child_values.len();
            if row.len() < width {
                row.resize(width, None);
            }
            for (i, value) in child_values.into_iter().enumerate() {
                row[num_fields + i] = value;
            }
            set_position(row, cmd_pos, Some("UPDATE".to_owned()));
            let mut changed = vec![false; row.len()];
            for (i, flag) in child_changed.into_iter().enumerate() {
                if num_fields + i < changed.len() {
                    changed[num_fields + i] = flag;
                }
            }
            set_flag(&mut changed, cmd_pos, true);
            let update =
                ItemUpdate::new(name, item, false, row.clone(), changed, field_names);
            (update, parent.sub.clone())
        };
        fire_listeners(&self.events, &sub_handle, move |l| l.on_item_update(&update));
        Vec::new()
    }

    /// Create the internal MERGE subscription for a new key.
    fn spawn_child(&mut self, parent_id: u64, item: usize, key: &str) -> Vec<Outgoing> {
        let frozen = {
            let Some(parent) = self.subs.get_mut(&parent_id) else {
                return Vec::new();
            };
            let Some(ref second_fields) = parent.frozen.second_fields else {
                return Vec::new();
            };
            let items = match validate_item_name(key)
                .and_then(|_| Descriptor::from_items(&[key]))
            {
                Ok(d) => d,
                Err(e) => {
                    let key = key.to_owned();
                    let message = e.message().to_owned();
                    fire_listeners(&self.events, &parent.sub, move |l| {
                        l.on_command_second_level_subscription_error(
                            BAD_KEY_AS_ITEM,
                            &message,
                            &key,
                        );
                    });
                    return Vec::new();
                }
            };
            let frequency = match parent.frozen.frequency {
                MaxFrequency::Unfiltered => MaxFrequency::Unset,
                f => f,
            };
            FrozenSettings {
                mode: Mode::Merge,
                items,
                fields: second_fields.clone(),
                data_adapter: parent.frozen.second_adapter.clone(),
                selector: None,
                snapshot: Snapshot::Yes,
                buffer_size: BufferSize::Unset,
                frequency,
                second_fields: None,
                second_adapter: None,
            }
        };

        let child_id = next_sub_id();
        let runtime = RuntimeSub {
            id: child_id,
            sub: Subscription::empty(Mode::Merge),
            phase: SubPhase::Waiting,
            frozen,
            num_items: 0,
            num_fields: 0,
            key_pos: 0,
            cmd_pos: 0,
            items: Vec::new(),
            field_names: None,
            reconf_next: 0,
            reconf_acked: 0,
            own_frequency: None,
            reported_frequency: None,
            relation: Relation::Child { parent_id, item, key: key.to_owned() },
        };
        self.subs.insert(child_id, runtime);
        if let Some(parent) = self.subs.get_mut(&parent_id) {
            if let Relation::Main { ref mut children } = parent.relation {
                children.insert((item, key.to_owned()), child_id);
            }
        }
        debug!(parent_id, child_id, key, "second-level subscription spawned");
        match self.send_add(child_id) {
            Some(outgoing) => vec![outgoing],
            None => Vec::new(),
        }
    }

    /// Tear down the child subscription for a deleted key.
    fn drop_child(&mut self, parent_id: u64, item: usize, key: &str) -> Vec<Outgoing> {
        let child_id = {
            let Some(parent) = self.subs.get_mut(&parent_id) else {
                return Vec::new();
            };
            match parent.relation {
                Relation::Main { ref mut children } => children.remove(&(item, key.to_owned())),
                Relation::Child { .. } => None,
            }
        };
        match child_id {
            Some(id) => self.remove_sub(id, true, false),
            None => Vec::new(),
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Command {
    Add,
    Update,
    Delete,
}

impl Command {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

fn position_value(values: &[Option<String>], pos: usize) -> Option<String> {
    pos.checked_sub(1).and_then(|i| values.get(i)).and_then(|v| v.clone())
}

fn set_position(row: &mut [Option<String>], pos: usize, value: Option<String>) {
    if let Some(i) = pos.checked_sub(1) {
        if let Some(slot) = row.get_mut(i) {
            *slot = value;
        }
    }
}

fn set_flag(mask: &mut [bool], pos: usize, value: bool) {
    if let Some(i) = pos.checked_sub(1) {
        if let Some(slot) = mask.get_mut(i) {
            *slot = value;
        }
    }
}
