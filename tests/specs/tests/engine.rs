// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end engine specs over the scripted in-memory server: session
//! establishment on both transports, subscription data flow, message
//! outcome ordering, recovery after a broken stream, and the
//! slowing-induced switch to polling.

use std::sync::Arc;
use std::time::Duration;

use tlcp_specs::{
    body_param, init_tracing, wait_for, FakeServer, MsgRecorder, StatusRecorder, SubRecorder,
};

use tlcp_client::{ClientListener, Mode, Snapshot, Subscription, TlcpClient};

const CONOK: &str = "CONOK,s123,5000,50000000,*";

fn client_over(server: &FakeServer) -> anyhow::Result<TlcpClient> {
    init_tracing();
    let client = TlcpClient::with_transports(
        Some("http://push.example:80/"),
        Some("DEFAULT"),
        server.factory(),
    )?;
    Ok(client)
}

/// Establish a WS-STREAMING session: create, first LOOP, bind.
async fn establish_ws(
    server: &FakeServer,
    client: &TlcpClient,
    conok: &str,
) -> anyhow::Result<Arc<tlcp_specs::FakeWsConn>> {
    client.connect()?;
    let conn = server.wait_ws(0).await?;
    conn.wait_frame("create_session frame", |f| f.starts_with("create_session")).await?;
    conn.push(conok);
    conn.push("LOOP,0");
    conn.wait_frame("bind frame", |f| f.starts_with("bind_session")).await?;
    conn.push(conok);
    wait_for("streaming status", || {
        (client.status() == "CONNECTED:WS-STREAMING").then_some(())
    })
    .await?;
    Ok(conn)
}

#[tokio::test]
async fn ws_happy_path_subscribe_and_update() -> anyhow::Result<()> {
    let server = FakeServer::new();
    let client = client_over(&server)?;
    let status = StatusRecorder::new();
    client.add_listener(Arc::clone(&status) as Arc<dyn ClientListener>);

    let sub = Subscription::new(Mode::Merge, &["item1"], &["a", "b"])?;
    let recorder = SubRecorder::new();
    sub.add_listener(Arc::clone(&recorder) as _);
    client.subscribe(&sub)?;

    let conn = establish_ws(&server, &client, CONOK).await?;

    let add = conn
        .wait_frame("subscribe frame", |f| f.contains("LS_op=add"))
        .await?;
    assert!(add.starts_with("control\r\n"));
    assert!(add.contains("LS_mode=MERGE"));
    assert!(add.contains("LS_group=item1"));
    assert!(add.contains("LS_schema=a b"));
    let sub_id = body_param(&add, "LS_subId").unwrap_or_default();
    let req_id = body_param(&add, "LS_reqId").unwrap_or_default();

    conn.push(&format!("REQOK,{req_id}"));
    conn.push(&format!("SUBOK,{sub_id},1,2"));
    conn.push(&format!("U,{sub_id},1,x|y"));
    // Field delta with UNCHANGED: only the first field moves.
    conn.push(&format!("U,{sub_id},1,z|^1"));

    wait_for("updates delivered", || (recorder.trace().len() >= 3).then_some(())).await?;
    let trace = recorder.trace();
    assert_eq!(trace[0], "subscribed");
    assert_eq!(trace[1], "update:item1:[x,y]:changed[1,2]:snap=false");
    assert_eq!(trace[2], "update:item1:[z,y]:changed[1]:snap=false");

    assert!(status.saw_status("CONNECTING"));
    assert!(status.saw_status("CONNECTED:STREAM-SENSING"));
    assert!(status.saw_status("CONNECTED:WS-STREAMING"));

    client.disconnect_future().await;
    Ok(())
}

#[tokio::test]
async fn http_streaming_uses_batched_control_channel() -> anyhow::Result<()> {
    let server = FakeServer::new();
    let client = client_over(&server)?;
    client.connection_options().set_forced_transport(Some("HTTP-STREAMING"))?;

    let sub = Subscription::new(Mode::Merge, &["item1"], &["a", "b"])?;
    sub.set_requested_snapshot(Snapshot::Yes)?;
    let recorder = SubRecorder::new();
    sub.add_listener(Arc::clone(&recorder) as _);

    client.connect()?;
    let create = server
        .wait_http("create exchange", 0, |e| e.endpoint_is("create_session.txt"))
        .await?;
    assert!(create.body.contains("LS_cid="));
    assert!(create.body.contains("LS_adapter_set=DEFAULT"));
    create.push(CONOK);

    client.subscribe(&sub)?;
    let control = server
        .wait_http("control batch", 0, |e| {
            e.endpoint_is("control.txt") && e.body.contains("LS_op=add")
        })
        .await?;
    assert!(control.url.contains("LS_protocol=TLCP-2.1.0"));
    let sub_id = body_param(&control.body, "LS_subId").unwrap_or_default();
    let req_id = body_param(&control.body, "LS_reqId").unwrap_or_default();
    control.respond(&[&format!("REQOK,{req_id}")]);

    create.push(&format!("SUBOK,{sub_id},1,2"));
    create.push(&format!("U,{sub_id},1,x|y"));

    wait_for("update delivered", || (recorder.trace().len() >= 2).then_some(())).await?;
    let trace = recorder.trace();
    assert_eq!(trace[0], "subscribed");
    assert_eq!(trace[1], "update:item1:[x,y]:changed[1,2]:snap=true");

    client.disconnect_future().await;
    Ok(())
}

#[tokio::test]
async fn command_add_and_delete_over_the_wire() -> anyhow::Result<()> {
    let server = FakeServer::new();
    let client = client_over(&server)?;
    let sub = Subscription::new(Mode::Command, &["orders"], &["key", "command", "v"])?;
    let recorder = SubRecorder::new();
    sub.add_listener(Arc::clone(&recorder) as _);
    client.subscribe(&sub)?;

    let conn = establish_ws(&server, &client, CONOK).await?;
    let add = conn.wait_frame("subscribe frame", |f| f.contains("LS_op=add")).await?;
    assert!(add.contains("LS_mode=COMMAND"));
    let sub_id = body_param(&add, "LS_subId").unwrap_or_default();

    conn.push(&format!("SUBCMD,{sub_id},1,3,1,2"));
    conn.push(&format!("U,{sub_id},1,k1|ADD|10"));
    conn.push(&format!("U,{sub_id},1,k1|DELETE|^1"));

    wait_for("command updates", || (recorder.trace().len() >= 3).then_some(())).await?;
    let trace = recorder.trace();
    assert_eq!(trace[1], "update:orders:[k1,ADD,10]:changed[1,2,3]:snap=false");
    assert_eq!(trace[2], "update:orders:[k1,DELETE,#]:changed[1,2]:snap=false");

    client.disconnect_future().await;
    Ok(())
}

#[tokio::test]
async fn message_error_aborts_the_rest_of_the_sequence() -> anyhow::Result<()> {
    let server = FakeServer::new();
    let client = client_over(&server)?;
    let conn = establish_ws(&server, &client, CONOK).await?;

    let m1 = MsgRecorder::new();
    let m2 = MsgRecorder::new();
    let m3 = MsgRecorder::new();
    client.send_message("m1", "s1", -1, Some(Arc::clone(&m1) as _), false)?;
    client.send_message("m2", "s1", -1, Some(Arc::clone(&m2) as _), false)?;
    client.send_message("m3", "s1", -1, Some(Arc::clone(&m3) as _), false)?;

    conn.wait_frame("third message", |f| f.contains("LS_msg_prog=3")).await?;
    conn.push("MSG,s1,1,MSGOK");
    conn.push("MSGERR,s1,2,7,\"bad\"");

    wait_for("outcomes", || {
        (!m1.trace().is_empty() && !m2.trace().is_empty() && !m3.trace().is_empty()).then_some(())
    })
    .await?;
    assert_eq!(m1.trace(), vec!["processed:m1"]);
    assert_eq!(m2.trace(), vec!["error:m2"]);
    assert_eq!(m3.trace(), vec!["abort:m3:true"]);

    client.disconnect_future().await;
    Ok(())
}

#[tokio::test]
async fn broken_stream_recovers_without_duplicates() -> anyhow::Result<()> {
    let server = FakeServer::new();
    let client = client_over(&server)?;
    let status = StatusRecorder::new();
    client.add_listener(Arc::clone(&status) as Arc<dyn ClientListener>);

    let sub = Subscription::new(Mode::Merge, &["item1"], &["a"])?;
    let recorder = SubRecorder::new();
    sub.add_listener(Arc::clone(&recorder) as _);
    client.subscribe(&sub)?;

    let conn = establish_ws(&server, &client, CONOK).await?;
    let add = conn.wait_frame("subscribe frame", |f| f.contains("LS_op=add")).await?;
    let sub_id = body_param(&add, "LS_subId").unwrap_or_default();

    // Two data notifications: SUBOK and one update.
    conn.push(&format!("SUBOK,{sub_id},1,1"));
    conn.push(&format!("U,{sub_id},1,v1"));
    wait_for("first update", || (recorder.trace().len() >= 2).then_some(())).await?;

    conn.break_conn();
    wait_for("recovery status", || {
        (client.status() == "DISCONNECTED:TRYING-RECOVERY").then_some(())
    })
    .await?;

    // The recovery bind declares how far the client got.
    let conn2 = server.wait_ws(1).await?;
    let bind = conn2.wait_frame("recovery bind", |f| f.starts_with("bind_session")).await?;
    assert_eq!(body_param(&bind, "LS_recovery_from").as_deref(), Some("2"));
    assert_eq!(body_param(&bind, "LS_session").as_deref(), Some("s123"));

    // Server resumes from notification 2 and replays nothing.
    conn2.push(CONOK);
    conn2.push("PROG,2");
    conn2.push(&format!("U,{sub_id},1,v2"));

    wait_for("post-recovery update", || (recorder.trace().len() >= 3).then_some(())).await?;
    let trace = recorder.trace();
    assert_eq!(trace[1], "update:item1:[v1]:changed[1]:snap=false");
    assert_eq!(trace[2], "update:item1:[v2]:changed[1]:snap=false");
    assert_eq!(client.status(), "CONNECTED:WS-STREAMING");
    // No unsubscription was ever surfaced: the session survived.
    assert!(!trace.contains(&"unsubscribed".to_owned()));

    client.disconnect_future().await;
    Ok(())
}

#[tokio::test]
async fn recovery_replay_window_drops_duplicates() -> anyhow::Result<()> {
    let server = FakeServer::new();
    let client = client_over(&server)?;
    let sub = Subscription::new(Mode::Merge, &["item1"], &["a"])?;
    let recorder = SubRecorder::new();
    sub.add_listener(Arc::clone(&recorder) as _);
    client.subscribe(&sub)?;

    let conn = establish_ws(&server, &client, CONOK).await?;
    let add = conn.wait_frame("subscribe frame", |f| f.contains("LS_op=add")).await?;
    let sub_id = body_param(&add, "LS_subId").unwrap_or_default();
    conn.push(&format!("SUBOK,{sub_id},1,1"));
    conn.push(&format!("U,{sub_id},1,v1"));
    wait_for("first update", || (recorder.trace().len() >= 2).then_some(())).await?;

    conn.break_conn();
    let conn2 = server.wait_ws(1).await?;
    conn2.wait_frame("recovery bind", |f| f.starts_with("bind_session")).await?;

    // Server only got notification 1, so it replays the update.
    conn2.push(CONOK);
    conn2.push("PROG,1");
    conn2.push(&format!("U,{sub_id},1,v1"));
    conn2.push(&format!("U,{sub_id},1,v2"));

    wait_for("fresh update", || (recorder.trace().len() >= 3).then_some(())).await?;
    let trace = recorder.trace();
    // The replayed v1 was dropped; only the genuinely new v2 arrived.
    assert_eq!(trace[1], "update:item1:[v1]:changed[1]:snap=false");
    assert_eq!(trace[2], "update:item1:[v2]:changed[1]:snap=false");

    client.disconnect_future().await;
    Ok(())
}

#[tokio::test]
async fn conerr_surfaces_server_error() -> anyhow::Result<()> {
    let server = FakeServer::new();
    let client = client_over(&server)?;
    let status = StatusRecorder::new();
    client.add_listener(Arc::clone(&status) as Arc<dyn ClientListener>);

    client.connect()?;
    let conn = server.wait_ws(0).await?;
    conn.wait_frame("create frame", |f| f.starts_with("create_session")).await?;
    conn.push("CONERR,1,user not authorized");

    wait_for("server error", || {
        status.errors.lock().first().cloned()
    })
    .await
    .map(|(code, message)| {
        assert_eq!(code, 1);
        assert_eq!(message, "user not authorized");
    })?;
    wait_for("disconnected", || (client.status() == "DISCONNECTED").then_some(())).await?;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn sustained_sync_lag_switches_to_polling() -> anyhow::Result<()> {
    let server = FakeServer::new();
    let client = client_over(&server)?;
    let status = StatusRecorder::new();
    client.add_listener(Arc::clone(&status) as Arc<dyn ClientListener>);
    client.connection_options().set_slowing_enabled(true);

    // Huge keepalive so stall timers stay out of the advanced window.
    let conok = "CONOK,s123,600000,50000000,*";
    let conn = establish_ws(&server, &client, conok).await?;

    // Client drains ~9 s of wall clock per server second: the smoothed
    // drift crosses the threshold on the second SYNC.
    tokio::time::advance(Duration::from_secs(9)).await;
    conn.push("SYNC,1");
    tokio::time::advance(Duration::from_secs(9)).await;
    conn.push("SYNC,2");

    let rebind = conn
        .wait_frame("force rebind", |f| f.contains("LS_op=force_rebind"))
        .await?;
    if let Some(req_id) = body_param(&rebind, "LS_reqId") {
        conn.push(&format!("REQOK,{req_id}"));
    }
    conn.push("LOOP,0");
    let bind = conn
        .wait_frame("polling bind", |f| {
            f.starts_with("bind_session") && f.contains("LS_polling=true")
        })
        .await?;
    assert!(body_param(&bind, "LS_polling_millis").is_some());
    conn.push("CONOK,s123,600000,50000000,*");

    wait_for("polling status", || {
        (client.status() == "CONNECTED:WS-POLLING").then_some(())
    })
    .await?;
    // The switch is internal: forcedTransport never changed.
    assert!(!status.saw_property("forcedTransport"));

    client.disconnect_future().await;
    Ok(())
}

#[tokio::test]
async fn unsubscribe_sends_delete_and_stops_flow() -> anyhow::Result<()> {
    let server = FakeServer::new();
    let client = client_over(&server)?;
    let sub = Subscription::new(Mode::Merge, &["item1"], &["a"])?;
    let recorder = SubRecorder::new();
    sub.add_listener(Arc::clone(&recorder) as _);
    client.subscribe(&sub)?;

    let conn = establish_ws(&server, &client, CONOK).await?;
    let add = conn.wait_frame("subscribe frame", |f| f.contains("LS_op=add")).await?;
    let sub_id = body_param(&add, "LS_subId").unwrap_or_default();
    conn.push(&format!("SUBOK,{sub_id},1,1"));

    wait_for("subscribed", || (!recorder.trace().is_empty()).then_some(())).await?;
    client.unsubscribe(&sub)?;
    let delete = conn.wait_frame("delete frame", |f| f.contains("LS_op=delete")).await?;
    assert_eq!(body_param(&delete, "LS_subId").as_deref(), Some(sub_id.as_str()));
    assert!(!sub.is_active());

    client.disconnect_future().await;
    Ok(())
}

#[tokio::test]
async fn disconnect_destroys_the_session() -> anyhow::Result<()> {
    let server = FakeServer::new();
    let client = client_over(&server)?;
    let _conn = establish_ws(&server, &client, CONOK).await?;

    let before = server.http_count();
    client.disconnect();
    // The destroy goes over HTTP so it can outlive the socket.
    let destroy = server
        .wait_http("destroy request", before, |e| e.body.contains("LS_op=destroy"))
        .await?;
    assert!(destroy.body.contains("LS_close_socket=true"));
    assert!(destroy.body.contains("LS_session=s123"));
    wait_for("disconnected", || (client.status() == "DISCONNECTED").then_some(())).await?;
    Ok(())
}
