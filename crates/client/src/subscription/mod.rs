// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Subscriptions: the user-facing value object and the engine-side
//! per-subscription state machines.
//!
//! A [`Subscription`] is built inactive, configured, then attached to
//! a client. While attached its descriptors are frozen; only the
//! requested max frequency may still change (producing a `reconf` on
//! the wire). The engine keeps a runtime record per subscription id:
//! lifecycle phase, per-item last-value vectors, snapshot tracking,
//! and — for COMMAND — the key table and optional second-level child
//! subscriptions.

mod command;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::descriptor::Descriptor;
use crate::error::ClientError;
use crate::executor::Executor;
use crate::item_update::{FieldNames, ItemUpdate};
use crate::listener::{ListenerSet, RealMaxFrequency, SubscriptionListener};
use crate::manager::ControlKind;
use crate::protocol::field::{self, FieldValue};
use crate::request::{control, Request};
use crate::tutor::TutorContext;

// -- Wire value grammars -----------------------------------------------------

/// Subscription delivery mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Merge,
    Distinct,
    Command,
    Raw,
}

impl Mode {
    pub fn parse(token: &str) -> Result<Self, ClientError> {
        match token {
            "MERGE" => Ok(Self::Merge),
            "DISTINCT" => Ok(Self::Distinct),
            "COMMAND" => Ok(Self::Command),
            "RAW" => Ok(Self::Raw),
            other => Err(ClientError::argument(format!("unknown mode: {other:?}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Merge => "MERGE",
            Self::Distinct => "DISTINCT",
            Self::Command => "COMMAND",
            Self::Raw => "RAW",
        }
    }
}

/// Requested snapshot: unset lets the server default apply; DISTINCT
/// additionally admits a bounded length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Snapshot {
    Unset,
    Yes,
    No,
    Length(u32),
}

impl Snapshot {
    pub(crate) fn to_wire(&self) -> Option<String> {
        match self {
            Self::Unset => None,
            Self::Yes => Some("true".to_owned()),
            Self::No => Some("false".to_owned()),
            Self::Length(n) => Some(n.to_string()),
        }
    }

    /// Whether the server will send an initial snapshot: only when
    /// explicitly asked (`LS_snapshot` defaults to off on the wire).
    fn wants_snapshot(&self, mode: Mode) -> bool {
        mode != Mode::Raw && matches!(self, Self::Yes | Self::Length(_))
    }
}

/// Requested per-item buffer size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferSize {
    Unset,
    Unlimited,
    Limited(u32),
}

impl BufferSize {
    pub fn parse(token: &str) -> Result<Self, ClientError> {
        if token.eq_ignore_ascii_case(crate::constants::UNLIMITED) {
            return Ok(Self::Unlimited);
        }
        match token.parse::<u32>() {
            Ok(n) if n > 0 => Ok(Self::Limited(n)),
            _ => Err(ClientError::argument(format!("invalid buffer size: {token:?}"))),
        }
    }

    pub(crate) fn to_wire(&self) -> Option<String> {
        match self {
            Self::Unset => None,
            Self::Unlimited => Some(crate::constants::UNLIMITED.to_owned()),
            Self::Limited(n) => Some(n.to_string()),
        }
    }
}

/// Requested max update frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MaxFrequency {
    Unset,
    Unlimited,
    Unfiltered,
    Limited(f64),
}

impl MaxFrequency {
    pub fn parse(token: &str) -> Result<Self, ClientError> {
        if token.eq_ignore_ascii_case(crate::constants::UNLIMITED) {
            return Ok(Self::Unlimited);
        }
        if token.eq_ignore_ascii_case("unfiltered") {
            return Ok(Self::Unfiltered);
        }
        match token.parse::<f64>() {
            Ok(n) if n > 0.0 => Ok(Self::Limited(n)),
            _ => Err(ClientError::argument(format!("invalid frequency: {token:?}"))),
        }
    }

    pub(crate) fn to_wire(&self) -> Option<String> {
        match self {
            Self::Unset => None,
            Self::Unlimited => Some(crate::constants::UNLIMITED.to_owned()),
            Self::Unfiltered => Some("unfiltered".to_owned()),
            Self::Limited(n) => Some(crate::config::format_float(*n)),
        }
    }
}

// -- User-facing subscription ------------------------------------------------

struct Settings {
    mode: Mode,
    items: Option<Descriptor>,
    fields: Option<Descriptor>,
    data_adapter: Option<String>,
    selector: Option<String>,
    snapshot: Snapshot,
    buffer_size: BufferSize,
    frequency: MaxFrequency,
    second_fields: Option<Descriptor>,
    second_adapter: Option<String>,
}

/// Engine attachment, present while the subscription is active.
struct Attachment {
    handle: crate::session::EngineHandle,
    sub_id: u64,
}

/// Server-confirmed dimensions, published for position queries.
#[derive(Debug, Clone, Copy, Default)]
struct ConfirmedShape {
    num_items: usize,
    num_fields: usize,
    key_pos: usize,
    cmd_pos: usize,
}

struct SubscriptionInner {
    settings: Mutex<Settings>,
    listeners: ListenerSet<dyn SubscriptionListener>,
    active: AtomicBool,
    attachment: Mutex<Option<Attachment>>,
    shape: Mutex<ConfirmedShape>,
}

/// A subscription to one or more items with a set of fields under a
/// delivery mode. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    /// Build an inactive subscription from item and field lists.
    pub fn new(mode: Mode, items: &[&str], fields: &[&str]) -> Result<Self, ClientError> {
        let sub = Self::empty(mode);
        sub.set_items(items)?;
        sub.set_fields(fields)?;
        Ok(sub)
    }

    /// Build an inactive subscription with no descriptors yet.
    pub fn empty(mode: Mode) -> Self {
        Self {
            inner: Arc::new(SubscriptionInner {
                settings: Mutex::new(Settings {
                    mode,
                    items: None,
                    fields: None,
                    data_adapter: None,
                    selector: None,
                    snapshot: Snapshot::Unset,
                    buffer_size: BufferSize::Unset,
                    frequency: MaxFrequency::Unset,
                    second_fields: None,
                    second_adapter: None,
                }),
                listeners: ListenerSet::default(),
                active: AtomicBool::new(false),
                attachment: Mutex::new(None),
                shape: Mutex::new(ConfirmedShape::default()),
            }),
        }
    }

    pub fn mode(&self) -> Mode {
        self.inner.settings.lock().mode
    }

    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    fn check_inactive(&self) -> Result<(), ClientError> {
        if self.is_active() {
            return Err(ClientError::state("subscription is active"));
        }
        Ok(())
    }

    pub fn set_items(&self, items: &[&str]) -> Result<(), ClientError> {
        self.check_inactive()?;
        self.inner.settings.lock().items = Some(Descriptor::from_items(items)?);
        Ok(())
    }

    pub fn set_item_group(&self, group: &str) -> Result<(), ClientError> {
        self.check_inactive()?;
        self.inner.settings.lock().items = Some(Descriptor::from_name(group)?);
        Ok(())
    }

    pub fn set_fields(&self, fields: &[&str]) -> Result<(), ClientError> {
        self.check_inactive()?;
        let descriptor = Descriptor::from_fields(fields)?;
        let mut settings = self.inner.settings.lock();
        if settings.mode == Mode::Command {
            check_command_fields(&descriptor)?;
        }
        settings.fields = Some(descriptor);
        Ok(())
    }

    pub fn set_field_schema(&self, schema: &str) -> Result<(), ClientError> {
        self.check_inactive()?;
        self.inner.settings.lock().fields = Some(Descriptor::from_name(schema)?);
        Ok(())
    }

    pub fn set_data_adapter(&self, adapter: Option<&str>) -> Result<(), ClientError> {
        self.check_inactive()?;
        self.inner.settings.lock().data_adapter = adapter.map(str::to_owned);
        Ok(())
    }

    pub fn set_selector(&self, selector: Option<&str>) -> Result<(), ClientError> {
        self.check_inactive()?;
        self.inner.settings.lock().selector = selector.map(str::to_owned);
        Ok(())
    }

    pub fn set_requested_snapshot(&self, snapshot: Snapshot) -> Result<(), ClientError> {
        self.check_inactive()?;
        let mut settings = self.inner.settings.lock();
        match (settings.mode, snapshot) {
            (Mode::Raw, Snapshot::Yes | Snapshot::Length(_)) => {
                Err(ClientError::argument("RAW subscriptions admit no snapshot"))
            }
            (m, Snapshot::Length(_)) if m != Mode::Distinct => {
                Err(ClientError::argument("snapshot length is only valid for DISTINCT"))
            }
            _ => {
                settings.snapshot = snapshot;
                Ok(())
            }
        }
    }

    pub fn set_requested_buffer_size(&self, size: BufferSize) -> Result<(), ClientError> {
        self.check_inactive()?;
        self.inner.settings.lock().buffer_size = size;
        Ok(())
    }

    /// The one option mutable while active: changing it on a live
    /// subscription issues a `reconf`. Switching to or from
    /// `unfiltered` (or unsetting) is only allowed while inactive.
    pub fn set_requested_max_frequency(&self, frequency: MaxFrequency) -> Result<(), ClientError> {
        let attachment = self.inner.attachment.lock();
        let mut settings = self.inner.settings.lock();
        if attachment.is_some() {
            if matches!(frequency, MaxFrequency::Unfiltered | MaxFrequency::Unset) {
                return Err(ClientError::state(
                    "cannot switch to unfiltered/unset while the subscription is active",
                ));
            }
            if matches!(settings.frequency, MaxFrequency::Unfiltered) {
                return Err(ClientError::state(
                    "cannot leave unfiltered while the subscription is active",
                ));
            }
        }
        if settings.frequency == frequency {
            // Same value: accepted, but nothing goes on the wire.
            return Ok(());
        }
        settings.frequency = frequency;
        if let Some(ref attachment) = *attachment {
            let sub_id = attachment.sub_id;
            attachment.handle.post(move |engine| engine.change_frequency(sub_id, frequency));
        }
        Ok(())
    }

    pub fn set_command_second_level_fields(&self, fields: &[&str]) -> Result<(), ClientError> {
        self.check_inactive()?;
        let mut settings = self.inner.settings.lock();
        if settings.mode != Mode::Command {
            return Err(ClientError::state("second-level fields require COMMAND mode"));
        }
        settings.second_fields = Some(Descriptor::from_fields(fields)?);
        Ok(())
    }

    pub fn set_command_second_level_field_schema(&self, schema: &str) -> Result<(), ClientError> {
        self.check_inactive()?;
        let mut settings = self.inner.settings.lock();
        if settings.mode != Mode::Command {
            return Err(ClientError::state("second-level schema requires COMMAND mode"));
        }
        settings.second_fields = Some(Descriptor::from_name(schema)?);
        Ok(())
    }

    pub fn set_command_second_level_data_adapter(
        &self,
        adapter: Option<&str>,
    ) -> Result<(), ClientError> {
        self.check_inactive()?;
        let mut settings = self.inner.settings.lock();
        if settings.mode != Mode::Command {
            return Err(ClientError::state("second-level adapter requires COMMAND mode"));
        }
        settings.second_adapter = adapter.map(str::to_owned);
        Ok(())
    }

    pub fn add_listener(&self, listener: Arc<dyn SubscriptionListener>) {
        if self.inner.listeners.add(Arc::clone(&listener)) {
            listener.on_listen_start();
        }
    }

    pub fn remove_listener(&self, listener: &Arc<dyn SubscriptionListener>) {
        if self.inner.listeners.remove(listener) {
            listener.on_listen_end();
        }
    }

    /// 1-based position of the key field (COMMAND): from the field
    /// list, or as confirmed by the server for schema subscriptions.
    pub fn key_position(&self) -> Option<usize> {
        let from_list =
            self.inner.settings.lock().fields.as_ref().and_then(|f| f.position_of("key"));
        from_list.or_else(|| {
            let shape = self.inner.shape.lock();
            (shape.key_pos > 0).then_some(shape.key_pos)
        })
    }

    /// 1-based position of the command field (COMMAND).
    pub fn command_position(&self) -> Option<usize> {
        let from_list =
            self.inner.settings.lock().fields.as_ref().and_then(|f| f.position_of("command"));
        from_list.or_else(|| {
            let shape = self.inner.shape.lock();
            (shape.cmd_pos > 0).then_some(shape.cmd_pos)
        })
    }

    pub fn item_name(&self, position: usize) -> Option<String> {
        self.inner
            .settings
            .lock()
            .items
            .as_ref()
            .and_then(|d| d.name_at(position))
            .map(str::to_owned)
    }

    pub fn field_position(&self, name: &str) -> Option<usize> {
        self.inner.settings.lock().fields.as_ref().and_then(|d| d.position_of(name))
    }

    pub(crate) fn attach(&self, handle: crate::session::EngineHandle, sub_id: u64) {
        *self.inner.attachment.lock() = Some(Attachment { handle, sub_id });
        self.inner.active.store(true, Ordering::Release);
    }

    pub(crate) fn detach(&self) {
        *self.inner.attachment.lock() = None;
        *self.inner.shape.lock() = ConfirmedShape::default();
        self.inner.active.store(false, Ordering::Release);
    }

    pub(crate) fn listeners(&self) -> Vec<Arc<dyn SubscriptionListener>> {
        self.inner.listeners.snapshot()
    }

    pub(crate) fn same_instance(&self, other: &Subscription) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// COMMAND with a field list must name both reserved fields.
fn check_command_fields(fields: &Descriptor) -> Result<(), ClientError> {
    if fields.is_list()
        && (fields.position_of("command").is_none() || fields.position_of("key").is_none())
    {
        return Err(ClientError::argument(
            "COMMAND field lists must contain 'key' and 'command'",
        ));
    }
    Ok(())
}

/// Dispatch one callback to a subscription's listeners on the events
/// thread. Free function so callers can hold engine borrows.
fn fire_listeners<F>(events: &Executor, sub: &Subscription, f: F)
where
    F: Fn(&dyn SubscriptionListener) + Send + 'static,
{
    let listeners = sub.listeners();
    if listeners.is_empty() {
        return;
    }
    events.queue(move || {
        for listener in &listeners {
            f(&**listener);
        }
    });
}

// -- Engine-side runtime -----------------------------------------------------

fn next_sub_id() -> u64 {
    static NEXT: AtomicU64 = AtomicU64::new(1);
    NEXT.fetch_add(1, Ordering::Relaxed)
}

/// Per-subscription lifecycle. `Off` is represented by absence
/// from the runtime map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SubPhase {
    Waiting,
    Subscribing,
    Pushing,
    Paused,
}

/// A control request the engine must put on the wire for us.
pub(crate) struct Outgoing {
    pub kind: ControlKind,
    pub request: Request,
    pub context: TutorContext,
    /// `Some` pins the tutor to a non-growing timeout.
    pub fixed_timeout: Option<Duration>,
}

/// Frozen copy of the user settings taken at attach time.
struct FrozenSettings {
    mode: Mode,
    items: Descriptor,
    fields: Descriptor,
    data_adapter: Option<String>,
    selector: Option<String>,
    snapshot: Snapshot,
    buffer_size: BufferSize,
    frequency: MaxFrequency,
    second_fields: Option<Descriptor>,
    second_adapter: Option<String>,
}

/// Per-item runtime data.
#[derive(Default)]
struct ItemState {
    /// Last decoded full vector, the carry base for `^n`.
    values: Option<Vec<Option<String>>>,
    /// Still inside the initial snapshot.
    snapshot_pending: bool,
    /// COMMAND key table for this item: key → row (first-level fields,
    /// then projected second-level fields).
    keys: HashMap<String, Vec<Option<String>>>,
}

/// Whether a runtime record backs a user subscription or an internal
/// second-level child.
enum Relation {
    Main {
        /// COMMAND two-level: (item, key) → child sub id.
        children: HashMap<(usize, String), u64>,
    },
    Child {
        parent_id: u64,
        item: usize,
        key: String,
    },
}

pub(crate) struct RuntimeSub {
    pub id: u64,
    sub: Subscription,
    pub phase: SubPhase,
    frozen: FrozenSettings,
    num_items: usize,
    num_fields: usize,
    key_pos: usize,
    cmd_pos: usize,
    items: Vec<ItemState>,
    field_names: Option<Arc<FieldNames>>,
    /// Monotonic reconf counter for stale-ack detection.
    reconf_next: u64,
    reconf_acked: u64,
    /// Own server-confirmed frequency (CONF).
    own_frequency: Option<RealMaxFrequency>,
    /// Last aggregate frequency reported to listeners.
    reported_frequency: Option<RealMaxFrequency>,
    relation: Relation,
}

impl RuntimeSub {
    fn item_state(&mut self, item: usize) -> Option<&mut ItemState> {
        item.checked_sub(1).and_then(|i| self.items.get_mut(i))
    }

    fn is_child(&self) -> bool {
        matches!(self.relation, Relation::Child { .. })
    }

    fn item_display_name(&self, item: usize) -> Option<String> {
        self.frozen.items.name_at(item).map(str::to_owned)
    }
}

/// All subscription state of one client.
pub(crate) struct SubscriptionManager {
    events: Executor,
    subs: HashMap<u64, RuntimeSub>,
    /// Unsubscribes sent and not yet settled, for tutor verification.
    pending_unsubs: HashSet<u64>,
}

impl SubscriptionManager {
    pub fn new(events: Executor) -> Self {
        Self { events, subs: HashMap::new(), pending_unsubs: HashSet::new() }
    }

    /// Attach a user subscription. Returns the requests to send when a
    /// session is open.
    pub fn subscribe(
        &mut self,
        sub: &Subscription,
        handle: crate::session::EngineHandle,
        session_open: bool,
    ) -> Result<Vec<Outgoing>, ClientError> {
        if sub.is_active() {
            return Err(ClientError::state("subscription already active"));
        }
        let frozen = {
            let settings = sub.inner.settings.lock();
            let items = settings
                .items
                .clone()
                .ok_or_else(|| ClientError::state("subscription has no items"))?;
            let fields = settings
                .fields
                .clone()
                .ok_or_else(|| ClientError::state("subscription has no fields"))?;
            if settings.mode == Mode::Command {
                check_command_fields(&fields)?;
                if settings.second_fields.is_some() && !fields.is_list() {
                    return Err(ClientError::state(
                        "two-level COMMAND requires a first-level field list",
                    ));
                }
            }
            FrozenSettings {
                mode: settings.mode,
                items,
                fields,
                data_adapter: settings.data_adapter.clone(),
                selector: settings.selector.clone(),
                snapshot: settings.snapshot,
                buffer_size: settings.buffer_size,
                frequency: settings.frequency,
                second_fields: settings.second_fields.clone(),
                second_adapter: settings.second_adapter.clone(),
            }
        };

        let id = next_sub_id();
        sub.attach(handle, id);
        let runtime = RuntimeSub {
            id,
            sub: sub.clone(),
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
            relation: Relation::Main { children: HashMap::new() },
        };
        self.subs.insert(id, runtime);
        debug!(sub_id = id, "subscription attached");

        if session_open {
            Ok(self.start_pending())
        } else {
            Ok(Vec::new())
        }
    }

    /// Detach a user subscription. Returns unsubscribe requests for it
    /// and any second-level children.
    pub fn unsubscribe(
        &mut self,
        sub: &Subscription,
        session_open: bool,
    ) -> Result<Vec<Outgoing>, ClientError> {
        let id = self
            .subs
            .values()
            .find(|r| !r.is_child() && r.sub.same_instance(sub))
            .map(|r| r.id)
            .ok_or_else(|| ClientError::state("subscription is not active"))?;
        Ok(self.remove_sub(id, session_open, true))
    }

    /// Tear down the runtime record `id`. When `notify`, fires
    /// `onUnsubscription` if the subscription had been established.
    fn remove_sub(&mut self, id: u64, session_open: bool, notify: bool) -> Vec<Outgoing> {
        let Some(runtime) = self.subs.remove(&id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        let was_up = matches!(runtime.phase, SubPhase::Pushing | SubPhase::Subscribing);
        if session_open && was_up {
            self.pending_unsubs.insert(id);
            out.push(Outgoing {
                kind: ControlKind::Unsubscribe(id),
                request: control::unsubscribe(id),
                context: TutorContext::Unsubscribe { sub_id: id },
                fixed_timeout: None,
            });
        }
        if let Relation::Main { ref children } = runtime.relation {
            for child_id in children.values().copied().collect::<Vec<_>>() {
                out.extend(self.remove_sub(child_id, session_open, false));
            }
        }
        if notify && runtime.phase == SubPhase::Pushing {
            fire_listeners(&self.events, &runtime.sub, |l| l.on_unsubscription());
        }
        runtime.sub.detach();
        out
    }

    /// A session became usable: push every waiting/paused add.
    pub fn on_session_start(&mut self) -> Vec<Outgoing> {
        self.start_pending()
    }

    fn start_pending(&mut self) -> Vec<Outgoing> {
        let ids: Vec<u64> = self
            .subs
            .values()
            .filter(|r| matches!(r.phase, SubPhase::Waiting | SubPhase::Paused))
            .map(|r| r.id)
            .collect();
        let mut out = Vec::new();
        for id in ids {
            if let Some(req) = self.send_add(id) {
                out.push(req);
            }
        }
        out
    }

    fn send_add(&mut self, id: u64) -> Option<Outgoing> {
        let runtime = self.subs.get_mut(&id)?;
        runtime.phase = SubPhase::Subscribing;
        let f = &runtime.frozen;
        let request = control::subscribe(
            id,
            f.mode,
            &f.items.to_wire(),
            &f.fields.to_wire(),
            f.data_adapter.as_deref(),
            f.selector.as_deref(),
            &f.snapshot,
            &f.buffer_size,
            &f.frequency,
        );
        Some(Outgoing {
            kind: ControlKind::Subscribe(id),
            request,
            context: TutorContext::Subscribe { sub_id: id },
            fixed_timeout: None,
        })
    }

    /// The session died. During recovery nothing changes; otherwise
    /// every established subscription pauses and its runtime data is
    /// dropped (the snapshot will be replayed on resubscribe).
    pub fn on_session_close(&mut self, recovering: bool) {
        if recovering {
            return;
        }
        self.pending_unsubs.clear();
        let child_ids: Vec<u64> =
            self.subs.values().filter(|r| r.is_child()).map(|r| r.id).collect();
        for id in child_ids {
            if let Some(child) = self.subs.remove(&id) {
                child.sub.detach();
            }
        }
        for runtime in self.subs.values_mut() {
            if runtime.phase == SubPhase::Pushing {
                fire_listeners(&self.events, &runtime.sub, |l| l.on_unsubscription());
            }
            if let Relation::Main { ref mut children } = runtime.relation {
                children.clear();
            }
            runtime.phase = SubPhase::Paused;
            runtime.items.clear();
            runtime.num_items = 0;
            runtime.num_fields = 0;
            runtime.own_frequency = None;
            runtime.reported_frequency = None;
        }
    }

    pub fn on_subok(&mut self, sub_id: u64, num_items: usize, num_fields: usize) {
        self.confirm(sub_id, num_items, num_fields, 0, 0);
    }

    pub fn on_subcmd(
        &mut self,
        sub_id: u64,
        num_items: usize,
        num_fields: usize,
        key_pos: usize,
        cmd_pos: usize,
    ) {
        self.confirm(sub_id, num_items, num_fields, key_pos, cmd_pos);
    }

    fn confirm(
        &mut self,
        sub_id: u64,
        num_items: usize,
        num_fields: usize,
        key_pos: usize,
        cmd_pos: usize,
    ) {
        let Some(runtime) = self.subs.get_mut(&sub_id) else {
            debug!(sub_id, "SUBOK for unknown subscription");
            return;
        };
        runtime.phase = SubPhase::Pushing;
        runtime.num_items = num_items;
        runtime.num_fields = num_fields;
        runtime.key_pos = key_pos;
        runtime.cmd_pos = cmd_pos;
        let wants = runtime.frozen.snapshot.wants_snapshot(runtime.frozen.mode);
        runtime.items = (0..num_items)
            .map(|_| ItemState { snapshot_pending: wants, ..ItemState::default() })
            .collect();
        if runtime.frozen.mode == Mode::Command && runtime.key_pos == 0 {
            // Field-list COMMAND: the reserved positions come from the
            // list rather than from SUBCMD.
            runtime.key_pos = runtime.frozen.fields.position_of("key").unwrap_or(0);
            runtime.cmd_pos = runtime.frozen.fields.position_of("command").unwrap_or(0);
        }
        runtime.field_names = command::build_field_names(&runtime.frozen);
        *runtime.sub.inner.shape.lock() =
            ConfirmedShape { num_items, num_fields, key_pos, cmd_pos };
        if !runtime.is_child() {
            fire_listeners(&self.events, &runtime.sub, |l| l.on_subscription());
        }
    }

    /// Server-side unsubscription. Established subscriptions pause
    /// (they resubscribe with the next session); a waiting one is left
    /// untouched — its add is still pending and will re-establish it.
    pub fn on_unsub(&mut self, sub_id: u64) -> Vec<Outgoing> {
        self.pending_unsubs.remove(&sub_id);
        let (is_child, phase) = match self.subs.get(&sub_id) {
            Some(r) => (r.is_child(), r.phase),
            None => return Vec::new(),
        };
        if is_child {
            return self.remove_sub(sub_id, true, false);
        }
        match phase {
            SubPhase::Pushing | SubPhase::Subscribing => {
                let child_ids: Vec<u64> = {
                    let Some(runtime) = self.subs.get_mut(&sub_id) else {
                        return Vec::new();
                    };
                    runtime.phase = SubPhase::Paused;
                    runtime.items.clear();
                    if phase == SubPhase::Pushing {
                        fire_listeners(&self.events, &runtime.sub, |l| l.on_unsubscription());
                    }
                    match runtime.relation {
                        Relation::Main { ref mut children } => {
                            let ids = children.values().copied().collect();
                            children.clear();
                            ids
                        }
                        Relation::Child { .. } => Vec::new(),
                    }
                };
                let mut out = Vec::new();
                for child_id in child_ids {
                    out.extend(self.remove_sub(child_id, true, false));
                }
                out
            }
            SubPhase::Waiting | SubPhase::Paused => Vec::new(),
        }
    }

    /// REQERR on a subscribe.
    pub fn on_subscription_error(&mut self, sub_id: u64, code: i32, message: &str) {
        let child_of = match self.subs.get(&sub_id) {
            Some(runtime) => match runtime.relation {
                Relation::Child { parent_id, item, ref key } => {
                    Some((parent_id, item, key.clone()))
                }
                Relation::Main { .. } => None,
            },
            None => return,
        };
        if let Some((parent_id, item, key)) = child_of {
            self.subs.remove(&sub_id);
            if let Some(parent) = self.subs.get_mut(&parent_id) {
                if let Relation::Main { ref mut children } = parent.relation {
                    children.remove(&(item, key.clone()));
                }
                let message = message.to_owned();
                fire_listeners(&self.events, &parent.sub, move |l| {
                    l.on_command_second_level_subscription_error(code, &message, &key);
                });
            }
            return;
        }
        if let Some(runtime) = self.subs.get_mut(&sub_id) {
            runtime.phase = SubPhase::Paused;
            let message = message.to_owned();
            fire_listeners(&self.events, &runtime.sub, move |l| {
                l.on_subscription_error(code, &message);
            });
        }
    }

    /// REQERR/REQOK bookkeeping for unsubscribes.
    pub fn on_unsubscribe_settled(&mut self, sub_id: u64) {
        self.pending_unsubs.remove(&sub_id);
    }

    /// User changed the requested frequency on a live subscription.
    pub fn change_frequency(&mut self, sub_id: u64, frequency: MaxFrequency) -> Vec<Outgoing> {
        let mut out = Vec::new();
        let child_ids: Vec<u64> = match self.subs.get_mut(&sub_id) {
            Some(runtime) => {
                runtime.frozen.frequency = frequency;
                if matches!(runtime.phase, SubPhase::Pushing | SubPhase::Subscribing) {
                    runtime.reconf_next += 1;
                    let reconf_id = runtime.reconf_next;
                    out.push(Outgoing {
                        kind: ControlKind::ChangeFrequency(sub_id),
                        request: control::change_frequency(sub_id, &frequency),
                        context: TutorContext::ChangeFrequency { sub_id, reconf_id, frequency },
                        fixed_timeout: Some(crate::constants::DEFAULT_RETRY_DELAY),
                    });
                }
                match runtime.relation {
                    Relation::Main { ref children } => children.values().copied().collect(),
                    Relation::Child { .. } => Vec::new(),
                }
            }
            None => Vec::new(),
        };
        // Children inherit the parent's requested frequency.
        for child_id in child_ids {
            out.extend(self.change_frequency(child_id, frequency));
        }
        out
    }

    /// A reconf was acknowledged; stale acks (lower reconf id) are
    /// ignored.
    pub fn on_reconf_ack(&mut self, sub_id: u64, reconf_id: u64) {
        if let Some(runtime) = self.subs.get_mut(&sub_id) {
            if reconf_id > runtime.reconf_acked {
                runtime.reconf_acked = reconf_id;
            }
        }
    }

    // -- Tutor verification ---------------------------------------------

    pub fn subscribe_succeeded(&self, sub_id: u64) -> bool {
        match self.subs.get(&sub_id) {
            Some(runtime) => runtime.phase == SubPhase::Pushing,
            None => true,
        }
    }

    pub fn unsubscribe_succeeded(&self, sub_id: u64) -> bool {
        !self.pending_unsubs.contains(&sub_id)
    }

    pub fn reconf_succeeded(&self, sub_id: u64, reconf_id: u64) -> bool {
        match self.subs.get(&sub_id) {
            Some(runtime) => runtime.reconf_acked >= reconf_id,
            None => true,
        }
    }

    /// A subscribe retransmission only makes sense while the
    /// subscription is still trying to establish itself.
    pub fn subscribe_still_wanted(&self, sub_id: u64) -> bool {
        matches!(self.subs.get(&sub_id), Some(r) if r.phase == SubPhase::Subscribing)
    }

    // -- Data events -----------------------------------------------------

    /// `U` line. May produce second-level subscribe/unsubscribe
    /// requests for COMMAND two-level parents.
    pub fn on_update(&mut self, sub_id: u64, item: usize, decoded: &[FieldValue]) -> Vec<Outgoing> {
        let Some(runtime) = self.subs.get_mut(&sub_id) else {
            debug!(sub_id, "update for unknown subscription");
            return Vec::new();
        };
        if runtime.phase != SubPhase::Pushing {
            debug!(sub_id, "update while not pushing");
            return Vec::new();
        }
        if let Relation::Child { parent_id, item: parent_item, ref key } = runtime.relation {
            let key = key.clone();
            let (values, changed) = {
                let state = runtime.items.first_mut();
                let prev = state.as_ref().and_then(|s| s.values.as_deref());
                field::apply_update(prev, decoded)
            };
            if let Some(state) = runtime.item_state(1) {
                state.values = Some(values.clone());
            }
            return self.project_child_update(parent_id, parent_item, &key, values, changed);
        }

        let mode = runtime.frozen.mode;
        let Some(state) = runtime.item_state(item) else {
            warn!(sub_id, item, "update for out-of-range item");
            return Vec::new();
        };
        let (values, changed) = field::apply_update(state.values.as_deref(), decoded);
        state.values = Some(values.clone());
        let is_snapshot = state.snapshot_pending;

        match mode {
            Mode::Command => self.on_command_update(sub_id, item, values, changed, is_snapshot),
            Mode::Merge | Mode::Raw | Mode::Distinct => {
                if mode == Mode::Merge {
                    // MERGE snapshots are a single update per item.
                    state.snapshot_pending = false;
                }
                let update = ItemUpdate::new(
                    runtime.item_display_name(item),
                    item,
                    is_snapshot,
                    values,
                    changed,
                    runtime.field_names.clone(),
                );
                fire_listeners(&self.events, &runtime.sub, move |l| l.on_item_update(&update));
                Vec::new()
            }
        }
    }

    pub fn on_end_of_snapshot(&mut self, sub_id: u64, item: usize) {
        let Some(runtime) = self.subs.get_mut(&sub_id) else {
            return;
        };
        let name = runtime.item_display_name(item);
        if let Some(state) = runtime.item_state(item) {
            state.snapshot_pending = false;
        }
        fire_listeners(&self.events, &runtime.sub, move |l| {
            l.on_end_of_snapshot(name.as_deref(), item);
        });
    }

    /// `CS`: snapshot state resets and the COMMAND key table for the
    /// item empties; second-level children for those keys go away.
    pub fn on_clear_snapshot(&mut self, sub_id: u64, item: usize) -> Vec<Outgoing> {
        let dead_children = {
            let Some(runtime) = self.subs.get_mut(&sub_id) else {
                return Vec::new();
            };
            let name = runtime.item_display_name(item);
            let wants = runtime.frozen.snapshot.wants_snapshot(runtime.frozen.mode);
            let mut dead_keys = Vec::new();
            if let Some(state) = runtime.item_state(item) {
                dead_keys = state.keys.keys().cloned().collect();
                state.keys.clear();
                state.values = None;
                state.snapshot_pending = wants;
            }
            let dead_children: Vec<u64> = match runtime.relation {
                Relation::Main { ref mut children } => dead_keys
                    .iter()
                    .filter_map(|k| children.remove(&(item, k.clone())))
                    .collect(),
                Relation::Child { .. } => Vec::new(),
            };
            fire_listeners(&self.events, &runtime.sub, move |l| {
                l.on_clear_snapshot(name.as_deref(), item);
            });
            dead_children
        };
        let mut out = Vec::new();
        for child_id in dead_children {
            out.extend(self.remove_sub(child_id, true, false));
        }
        out
    }

    pub fn on_lost_updates(&mut self, sub_id: u64, item: usize, lost: u32) {
        let Some(runtime) = self.subs.get(&sub_id) else {
            return;
        };
        if let Relation::Child { parent_id, ref key, .. } = runtime.relation {
            let key = key.clone();
            if let Some(parent) = self.subs.get(&parent_id) {
                fire_listeners(&self.events, &parent.sub, move |l| {
                    l.on_command_second_level_item_lost_updates(lost, &key);
                });
            }
            return;
        }
        let name = runtime.item_display_name(item);
        fire_listeners(&self.events, &runtime.sub, move |l| {
            l.on_item_lost_updates(name.as_deref(), item, lost);
        });
    }

    /// `CONF`: the server's effective frequency for one subscription.
    /// For two-level parents the exposed value aggregates the children.
    pub fn on_configuration(&mut self, sub_id: u64, frequency: Option<f64>) {
        let own = Some(match frequency {
            None => RealMaxFrequency::Unlimited,
            Some(n) => RealMaxFrequency::Limited(n),
        });
        let target = {
            let Some(runtime) = self.subs.get_mut(&sub_id) else {
                return;
            };
            runtime.own_frequency = own;
            match runtime.relation {
                Relation::Child { parent_id, .. } => parent_id,
                Relation::Main { .. } => sub_id,
            }
        };
        self.report_frequency(target);
    }

    fn report_frequency(&mut self, sub_id: u64) {
        let aggregate = {
            let Some(runtime) = self.subs.get(&sub_id) else {
                return;
            };
            let mut aggregate = runtime.own_frequency;
            if let Relation::Main { ref children } = runtime.relation {
                for child_id in children.values() {
                    if let Some(child) = self.subs.get(child_id) {
                        aggregate = max_frequency(aggregate, child.own_frequency);
                    }
                }
            }
            aggregate
        };
        let Some(runtime) = self.subs.get_mut(&sub_id) else {
            return;
        };
        if aggregate != runtime.reported_frequency {
            runtime.reported_frequency = aggregate;
            fire_listeners(&self.events, &runtime.sub, move |l| {
                l.on_real_max_frequency(aggregate);
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subs.is_empty()
    }
}

/// Aggregate two real frequencies: unlimited dominates, otherwise the
/// numeric max.
fn max_frequency(
    a: Option<RealMaxFrequency>,
    b: Option<RealMaxFrequency>,
) -> Option<RealMaxFrequency> {
    match (a, b) {
        (None, x) | (x, None) => x,
        (Some(RealMaxFrequency::Unlimited), _) | (_, Some(RealMaxFrequency::Unlimited)) => {
            Some(RealMaxFrequency::Unlimited)
        }
        (Some(RealMaxFrequency::Limited(x)), Some(RealMaxFrequency::Limited(y))) => {
            Some(RealMaxFrequency::Limited(x.max(y)))
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
