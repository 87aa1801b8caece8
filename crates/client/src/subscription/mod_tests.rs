// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use parking_lot::Mutex as PlMutex;

use crate::executor::Executor;
use crate::item_update::ItemUpdate;
use crate::protocol::field::decode_fields;
use crate::session::EngineHandle;

use super::*;

struct Recorder {
    log: Arc<PlMutex<Vec<String>>>,
}

impl Recorder {
    fn pair() -> (Arc<dyn SubscriptionListener>, Arc<PlMutex<Vec<String>>>) {
        let log = Arc::new(PlMutex::new(Vec::new()));
        (Arc::new(Recorder { log: Arc::clone(&log) }), log)
    }
}

fn fmt_update(update: &ItemUpdate) -> String {
    let values: Vec<String> = (1..=update.num_fields())
        .map(|pos| update.value(pos).unwrap_or("#").to_owned())
        .collect();
    let changed: Vec<String> =
        update.changed_fields().map(|(pos, _, _)| pos.to_string()).collect();
    format!(
        "update:{}:{}:[{}]:changed[{}]:snap={}",
        update.item_name().unwrap_or("?"),
        update.item_pos(),
        values.join(","),
        changed.join(","),
        update.is_snapshot(),
    )
}

impl SubscriptionListener for Recorder {
    fn on_subscription(&self) {
        self.log.lock().push("subscribed".to_owned());
    }
    fn on_unsubscription(&self) {
        self.log.lock().push("unsubscribed".to_owned());
    }
    fn on_subscription_error(&self, code: i32, message: &str) {
        self.log.lock().push(format!("error:{code}:{message}"));
    }
    fn on_item_update(&self, update: &ItemUpdate) {
        self.log.lock().push(fmt_update(update));
    }
    fn on_end_of_snapshot(&self, item_name: Option<&str>, item_pos: usize) {
        self.log.lock().push(format!("eos:{}:{item_pos}", item_name.unwrap_or("?")));
    }
    fn on_clear_snapshot(&self, item_name: Option<&str>, item_pos: usize) {
        self.log.lock().push(format!("cs:{}:{item_pos}", item_name.unwrap_or("?")));
    }
    fn on_real_max_frequency(&self, frequency: Option<RealMaxFrequency>) {
        self.log.lock().push(format!("freq:{frequency:?}"));
    }
    fn on_command_second_level_subscription_error(&self, code: i32, _message: &str, key: &str) {
        self.log.lock().push(format!("2l-error:{code}:{key}"));
    }
}

fn manager_and_events() -> (SubscriptionManager, Executor, EngineHandle) {
    let events = Executor::spawn("events", true);
    let session = Executor::spawn("session", false);
    let manager = SubscriptionManager::new(events.clone());
    (manager, events, EngineHandle::detached(session))
}

fn decoded(section: &str) -> Vec<crate::protocol::field::FieldValue> {
    match decode_fields(section) {
        Ok(d) => d,
        Err(e) => unreachable!("bad test vector: {e}"),
    }
}

fn merge_sub() -> (Subscription, Arc<PlMutex<Vec<String>>>) {
    let sub = match Subscription::new(Mode::Merge, &["item1"], &["a", "b"]) {
        Ok(s) => s,
        Err(e) => unreachable!("valid subscription rejected: {e}"),
    };
    let (listener, log) = Recorder::pair();
    sub.add_listener(listener);
    (sub, log)
}

// -- User object validation --------------------------------------------------

#[test]
fn command_field_list_must_name_key_and_command() {
    assert!(Subscription::new(Mode::Command, &["item1"], &["key", "command", "v"]).is_ok());
    assert!(Subscription::new(Mode::Command, &["item1"], &["a", "b"]).is_err());
}

#[test]
fn snapshot_rules_per_mode() {
    let raw = Subscription::empty(Mode::Raw);
    assert!(raw.set_requested_snapshot(Snapshot::Yes).is_err());
    assert!(raw.set_requested_snapshot(Snapshot::No).is_ok());

    let merge = Subscription::empty(Mode::Merge);
    assert!(merge.set_requested_snapshot(Snapshot::Yes).is_ok());
    assert!(merge.set_requested_snapshot(Snapshot::Length(10)).is_err());

    let distinct = Subscription::empty(Mode::Distinct);
    assert!(distinct.set_requested_snapshot(Snapshot::Length(10)).is_ok());
}

#[test]
fn second_level_requires_command_mode() {
    let merge = Subscription::empty(Mode::Merge);
    assert!(merge.set_command_second_level_fields(&["x"]).is_err());
    let command = Subscription::empty(Mode::Command);
    assert!(command.set_command_second_level_fields(&["x"]).is_ok());
}

#[tokio::test]
async fn active_subscription_rejects_mutation() {
    let (mut manager, _events, handle) = manager_and_events();
    let (sub, _log) = merge_sub();
    assert!(manager.subscribe(&sub, handle, false).is_ok());
    assert!(sub.is_active());
    assert!(sub.set_items(&["other"]).is_err());
    assert!(sub.set_fields(&["x"]).is_err());
    assert!(sub.set_data_adapter(Some("Q")).is_err());
    // Unfiltered is refused while active.
    assert!(sub.set_requested_max_frequency(MaxFrequency::Unfiltered).is_err());
    // A plain numeric change is allowed.
    assert!(sub.set_requested_max_frequency(MaxFrequency::Limited(2.0)).is_ok());
}

#[tokio::test]
async fn double_subscribe_is_an_error() {
    let (mut manager, _events, handle) = manager_and_events();
    let (sub, _log) = merge_sub();
    assert!(manager.subscribe(&sub, handle.clone(), false).is_ok());
    assert!(manager.subscribe(&sub, handle, false).is_err());
}

// -- Lifecycle ---------------------------------------------------------------

#[tokio::test]
async fn add_goes_out_when_session_opens() {
    let (mut manager, _events, handle) = manager_and_events();
    let (sub, _log) = merge_sub();
    let immediate = match manager.subscribe(&sub, handle, false) {
        Ok(o) => o,
        Err(e) => unreachable!("{e}"),
    };
    assert!(immediate.is_empty());

    let outgoing = manager.on_session_start();
    assert_eq!(outgoing.len(), 1);
    let body = outgoing[0].request.query_string(None);
    assert!(body.contains("LS_op=add"));
    assert!(body.contains("LS_mode=MERGE"));
    assert!(body.contains("LS_group=item1"));
    assert!(body.contains("LS_schema=a b"));
}

#[tokio::test]
async fn subok_establishes_and_updates_flow() {
    let (mut manager, events, handle) = manager_and_events();
    let (sub, log) = merge_sub();
    let outgoing = match manager.subscribe(&sub, handle, true) {
        Ok(o) => o,
        Err(e) => unreachable!("{e}"),
    };
    let sub_id = match outgoing[0].context {
        crate::tutor::TutorContext::Subscribe { sub_id } => sub_id,
        _ => unreachable!("subscribe context expected"),
    };

    manager.on_subok(sub_id, 1, 2);
    let out = manager.on_update(sub_id, 1, &decoded("x|y"));
    assert!(out.is_empty());
    let out = manager.on_update(sub_id, 1, &decoded("z|^1"));
    assert!(out.is_empty());
    events.drained().await;

    let log = log.lock();
    assert_eq!(log[0], "subscribed");
    // First update: both fields changed; snapshot was never requested.
    assert_eq!(log[1], "update:item1:1:[x,y]:changed[1,2]:snap=false");
    // UNCHANGED carry: b keeps its value, only a changes.
    assert_eq!(log[2], "update:item1:1:[z,y]:changed[1]:snap=false");
}

#[tokio::test]
async fn session_loss_pauses_and_resubscribes() {
    let (mut manager, events, handle) = manager_and_events();
    let (sub, log) = merge_sub();
    let outgoing = match manager.subscribe(&sub, handle, true) {
        Ok(o) => o,
        Err(e) => unreachable!("{e}"),
    };
    let sub_id = match outgoing[0].context {
        crate::tutor::TutorContext::Subscribe { sub_id } => sub_id,
        _ => unreachable!(),
    };
    manager.on_subok(sub_id, 1, 2);
    manager.on_session_close(false);
    events.drained().await;
    assert_eq!(*log.lock(), vec!["subscribed", "unsubscribed"]);
    assert!(sub.is_active());

    // The next session start re-issues the add.
    let outgoing = manager.on_session_start();
    assert_eq!(outgoing.len(), 1);
    assert!(outgoing[0].request.query_string(None).contains("LS_op=add"));
}

#[tokio::test]
async fn recovery_preserves_runtime_state() {
    let (mut manager, _events, handle) = manager_and_events();
    let (sub, _log) = merge_sub();
    let outgoing = match manager.subscribe(&sub, handle, true) {
        Ok(o) => o,
        Err(e) => unreachable!("{e}"),
    };
    let sub_id = match outgoing[0].context {
        crate::tutor::TutorContext::Subscribe { sub_id } => sub_id,
        _ => unreachable!(),
    };
    manager.on_subok(sub_id, 1, 2);
    manager.on_session_close(true);
    assert!(manager.on_session_start().is_empty(), "recovery must not resubscribe");
}

#[tokio::test]
async fn server_unsub_pauses_silently_when_waiting() {
    let (mut manager, events, handle) = manager_and_events();
    let (sub, log) = merge_sub();
    let _ = manager.subscribe(&sub, handle, false);
    // Still WAITING: a server UNSUB is silent and harmless.
    let out = manager.on_unsub(9999);
    assert!(out.is_empty());
    events.drained().await;
    assert!(log.lock().is_empty());
}

#[tokio::test]
async fn unsubscribe_emits_delete_and_detaches() {
    let (mut manager, events, handle) = manager_and_events();
    let (sub, log) = merge_sub();
    let outgoing = match manager.subscribe(&sub, handle, true) {
        Ok(o) => o,
        Err(e) => unreachable!("{e}"),
    };
    let sub_id = match outgoing[0].context {
        crate::tutor::TutorContext::Subscribe { sub_id } => sub_id,
        _ => unreachable!(),
    };
    manager.on_subok(sub_id, 1, 2);
    let outgoing = match manager.unsubscribe(&sub, true) {
        Ok(o) => o,
        Err(e) => unreachable!("{e}"),
    };
    assert_eq!(outgoing.len(), 1);
    assert!(outgoing[0].request.query_string(None).contains("LS_op=delete"));
    assert!(!sub.is_active());
    events.drained().await;
    assert!(log.lock().contains(&"unsubscribed".to_owned()));
}

#[tokio::test]
async fn subscription_error_reports_and_pauses() {
    let (mut manager, events, handle) = manager_and_events();
    let (sub, log) = merge_sub();
    let outgoing = match manager.subscribe(&sub, handle, true) {
        Ok(o) => o,
        Err(e) => unreachable!("{e}"),
    };
    let sub_id = match outgoing[0].context {
        crate::tutor::TutorContext::Subscribe { sub_id } => sub_id,
        _ => unreachable!(),
    };
    manager.on_subscription_error(sub_id, 19, "bad adapter");
    events.drained().await;
    assert_eq!(*log.lock(), vec!["error:19:bad adapter"]);
}

// -- Snapshot tracking -------------------------------------------------------

#[tokio::test]
async fn distinct_snapshot_runs_until_eos() {
    let (mut manager, events, handle) = manager_and_events();
    let sub = match Subscription::new(Mode::Distinct, &["item1"], &["a"]) {
        Ok(s) => s,
        Err(e) => unreachable!("{e}"),
    };
    let _ = sub.set_requested_snapshot(Snapshot::Yes);
    let (listener, log) = Recorder::pair();
    sub.add_listener(listener);

    let outgoing = match manager.subscribe(&sub, handle, true) {
        Ok(o) => o,
        Err(e) => unreachable!("{e}"),
    };
    let sub_id = match outgoing[0].context {
        crate::tutor::TutorContext::Subscribe { sub_id } => sub_id,
        _ => unreachable!(),
    };
    manager.on_subok(sub_id, 1, 1);
    let _ = manager.on_update(sub_id, 1, &decoded("s1"));
    let _ = manager.on_update(sub_id, 1, &decoded("s2"));
    manager.on_end_of_snapshot(sub_id, 1);
    let _ = manager.on_update(sub_id, 1, &decoded("live"));
    events.drained().await;

    let log = log.lock();
    assert_eq!(
        *log,
        vec![
            "subscribed",
            "update:item1:1:[s1]:changed[1]:snap=true",
            "update:item1:1:[s2]:changed[1]:snap=true",
            "eos:item1:1",
            "update:item1:1:[live]:changed[1]:snap=false",
        ]
    );
}

#[tokio::test]
async fn clear_snapshot_resets_item_state() {
    let (mut manager, events, handle) = manager_and_events();
    let (sub, log) = merge_sub();
    let outgoing = match manager.subscribe(&sub, handle, true) {
        Ok(o) => o,
        Err(e) => unreachable!("{e}"),
    };
    let sub_id = match outgoing[0].context {
        crate::tutor::TutorContext::Subscribe { sub_id } => sub_id,
        _ => unreachable!(),
    };
    manager.on_subok(sub_id, 1, 2);
    let _ = manager.on_update(sub_id, 1, &decoded("x|y"));
    let _ = manager.on_clear_snapshot(sub_id, 1);
    // After CS the carry base is gone: UNCHANGED would be a protocol
    // violation, so the server resends full values.
    let _ = manager.on_update(sub_id, 1, &decoded("p|q"));
    events.drained().await;

    let log = log.lock();
    assert_eq!(log[2], "cs:item1:1");
    assert_eq!(log[3], "update:item1:1:[p,q]:changed[1,2]:snap=false");
}

// -- COMMAND -----------------------------------------------------------------

fn command_sub() -> (Subscription, Arc<PlMutex<Vec<String>>>) {
    let sub = match Subscription::new(Mode::Command, &["item1"], &["key", "command", "v"]) {
        Ok(s) => s,
        Err(e) => unreachable!("{e}"),
    };
    let (listener, log) = Recorder::pair();
    sub.add_listener(listener);
    (sub, log)
}

#[tokio::test]
async fn command_add_then_delete_maintains_key_table() {
    let (mut manager, events, handle) = manager_and_events();
    let (sub, log) = command_sub();
    let outgoing = match manager.subscribe(&sub, handle, true) {
        Ok(o) => o,
        Err(e) => unreachable!("{e}"),
    };
    let sub_id = match outgoing[0].context {
        crate::tutor::TutorContext::Subscribe { sub_id } => sub_id,
        _ => unreachable!(),
    };
    manager.on_subcmd(sub_id, 1, 3, 1, 2);

    let out = manager.on_update(sub_id, 1, &decoded("k1|ADD|10"));
    assert!(out.is_empty(), "no second level configured");
    manager.on_end_of_snapshot(sub_id, 1);
    // DELETE carries the value slot unchanged from the stream.
    let out = manager.on_update(sub_id, 1, &decoded("k1|DELETE|^1"));
    assert!(out.is_empty());
    events.drained().await;

    let log = log.lock();
    assert_eq!(log[1], "update:item1:1:[k1,ADD,10]:changed[1,2,3]:snap=false");
    assert_eq!(log[2], "eos:item1:1");
    // The delivered DELETE zeroes everything but key and command.
    assert_eq!(log[3], "update:item1:1:[k1,DELETE,#]:changed[1,2]:snap=false");
}

#[tokio::test]
async fn command_normalizes_add_update_against_table() {
    let (mut manager, events, handle) = manager_and_events();
    let (sub, log) = command_sub();
    let outgoing = match manager.subscribe(&sub, handle, true) {
        Ok(o) => o,
        Err(e) => unreachable!("{e}"),
    };
    let sub_id = match outgoing[0].context {
        crate::tutor::TutorContext::Subscribe { sub_id } => sub_id,
        _ => unreachable!(),
    };
    manager.on_subcmd(sub_id, 1, 3, 1, 2);
    let _ = manager.on_update(sub_id, 1, &decoded("k1|ADD|10"));
    // A second ADD for a live key is delivered as UPDATE.
    let _ = manager.on_update(sub_id, 1, &decoded("k1|ADD|11"));
    events.drained().await;
    let log = log.lock();
    assert!(log[2].contains("[k1,UPDATE,11]"));
}

#[tokio::test]
async fn two_level_spawns_and_projects_children() {
    let (mut manager, events, handle) = manager_and_events();
    let sub = match Subscription::new(Mode::Command, &["item1"], &["key", "command"]) {
        Ok(s) => s,
        Err(e) => unreachable!("{e}"),
    };
    let _ = sub.set_command_second_level_fields(&["bid", "ask"]);
    let (listener, log) = Recorder::pair();
    sub.add_listener(listener);

    let outgoing = match manager.subscribe(&sub, handle, true) {
        Ok(o) => o,
        Err(e) => unreachable!("{e}"),
    };
    let parent_id = match outgoing[0].context {
        crate::tutor::TutorContext::Subscribe { sub_id } => sub_id,
        _ => unreachable!(),
    };
    manager.on_subcmd(parent_id, 1, 2, 1, 2);

    // ADD for key k1 spawns a MERGE child on item "k1".
    let out = manager.on_update(parent_id, 1, &decoded("k1|ADD"));
    assert_eq!(out.len(), 1);
    let child_id = match out[0].context {
        crate::tutor::TutorContext::Subscribe { sub_id } => sub_id,
        _ => unreachable!("child subscribe expected"),
    };
    let body = out[0].request.query_string(None);
    assert!(body.contains("LS_mode=MERGE"));
    assert!(body.contains("LS_group=k1"));
    assert!(body.contains("LS_schema=bid ask"));
    assert!(body.contains("LS_snapshot=true"));

    // Child updates project past the first-level fields.
    manager.on_subok(child_id, 1, 2);
    let out = manager.on_update(child_id, 1, &decoded("7|9"));
    assert!(out.is_empty());
    events.drained().await;
    {
        let log = log.lock();
        assert!(
            log.iter().any(|e| e.contains("[k1,UPDATE,7,9]:changed[2,3,4]")),
            "projected update missing: {log:?}"
        );
    }

    // DELETE tears the child down.
    let out = manager.on_update(parent_id, 1, &decoded("k1|DELETE"));
    assert_eq!(out.len(), 1);
    assert!(out[0].request.query_string(None).contains("LS_op=delete"));
}

#[tokio::test]
async fn numeric_key_cannot_become_child_item() {
    let (mut manager, events, handle) = manager_and_events();
    let sub = match Subscription::new(Mode::Command, &["item1"], &["key", "command"]) {
        Ok(s) => s,
        Err(e) => unreachable!("{e}"),
    };
    let _ = sub.set_command_second_level_fields(&["bid"]);
    let (listener, log) = Recorder::pair();
    sub.add_listener(listener);

    let outgoing = match manager.subscribe(&sub, handle, true) {
        Ok(o) => o,
        Err(e) => unreachable!("{e}"),
    };
    let parent_id = match outgoing[0].context {
        crate::tutor::TutorContext::Subscribe { sub_id } => sub_id,
        _ => unreachable!(),
    };
    manager.on_subcmd(parent_id, 1, 2, 1, 2);
    let out = manager.on_update(parent_id, 1, &decoded("12345|ADD"));
    assert!(out.is_empty(), "no child for a numeric key");
    events.drained().await;
    assert!(log.lock().iter().any(|e| e.starts_with("2l-error:14:12345")));
}

// -- Frequency ---------------------------------------------------------------

#[tokio::test]
async fn reconf_carries_monotonic_ids() {
    let (mut manager, _events, handle) = manager_and_events();
    let (sub, _log) = merge_sub();
    let outgoing = match manager.subscribe(&sub, handle, true) {
        Ok(o) => o,
        Err(e) => unreachable!("{e}"),
    };
    let sub_id = match outgoing[0].context {
        crate::tutor::TutorContext::Subscribe { sub_id } => sub_id,
        _ => unreachable!(),
    };
    manager.on_subok(sub_id, 1, 2);

    let first = manager.change_frequency(sub_id, MaxFrequency::Limited(1.0));
    let second = manager.change_frequency(sub_id, MaxFrequency::Limited(2.0));
    let id = |o: &Outgoing| match o.context {
        crate::tutor::TutorContext::ChangeFrequency { reconf_id, .. } => reconf_id,
        _ => unreachable!(),
    };
    assert_eq!(id(&first[0]), 1);
    assert_eq!(id(&second[0]), 2);
    assert!(second[0].request.query_string(None).contains("LS_requested_max_frequency=2"));

    // Stale ack does not regress the watermark.
    manager.on_reconf_ack(sub_id, 2);
    manager.on_reconf_ack(sub_id, 1);
    assert!(manager.reconf_succeeded(sub_id, 2));
}

#[tokio::test]
async fn real_frequency_aggregates_children() {
    let (mut manager, events, handle) = manager_and_events();
    let sub = match Subscription::new(Mode::Command, &["item1"], &["key", "command"]) {
        Ok(s) => s,
        Err(e) => unreachable!("{e}"),
    };
    let _ = sub.set_command_second_level_fields(&["bid"]);
    let (listener, log) = Recorder::pair();
    sub.add_listener(listener);

    let outgoing = match manager.subscribe(&sub, handle, true) {
        Ok(o) => o,
        Err(e) => unreachable!("{e}"),
    };
    let parent_id = match outgoing[0].context {
        crate::tutor::TutorContext::Subscribe { sub_id } => sub_id,
        _ => unreachable!(),
    };
    manager.on_subcmd(parent_id, 1, 2, 1, 2);
    let out = manager.on_update(parent_id, 1, &decoded("k1|ADD"));
    let child_id = match out[0].context {
        crate::tutor::TutorContext::Subscribe { sub_id } => sub_id,
        _ => unreachable!(),
    };

    manager.on_configuration(parent_id, Some(2.0));
    manager.on_configuration(child_id, Some(5.0));
    events.drained().await;
    let log = log.lock();
    let freqs: Vec<&String> = log.iter().filter(|e| e.starts_with("freq:")).collect();
    assert_eq!(freqs.len(), 2);
    assert!(freqs[0].contains("Limited(2.0)"));
    assert!(freqs[1].contains("Limited(5.0)"));
}
