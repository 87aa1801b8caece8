// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use crate::request::control;

use super::field::FieldValue;
use super::*;

fn parsed(line: &str) -> ProtocolEvent {
    match parse_line(line) {
        Ok(ev) => ev,
        Err(e) => unreachable!("line should parse: {e}"),
    }
}

#[test]
fn conok_with_and_without_control_link() {
    assert_eq!(
        parsed("CONOK,s123,5000,50000000,*"),
        ProtocolEvent::Conok {
            session_id: "s123".to_owned(),
            keepalive_ms: 5000,
            request_limit: 50_000_000,
            control_link: None,
        }
    );
    assert_eq!(
        parsed("CONOK,s123,5000,0,push2.example.com"),
        ProtocolEvent::Conok {
            session_id: "s123".to_owned(),
            keepalive_ms: 5000,
            request_limit: 0,
            control_link: Some("push2.example.com".to_owned()),
        }
    );
}

#[test]
fn lifecycle_lines() {
    assert_eq!(parsed("PROBE"), ProtocolEvent::Probe);
    assert_eq!(parsed("LOOP,200"), ProtocolEvent::Loop { pause_ms: 200 });
    assert_eq!(
        parsed("END,31,session closed"),
        ProtocolEvent::End { code: 31, message: "session closed".to_owned() }
    );
    assert_eq!(
        parsed("CONERR,5,cannot bind"),
        ProtocolEvent::Conerr { code: 5, message: "cannot bind".to_owned() }
    );
    assert_eq!(parsed("SYNC,17"), ProtocolEvent::Sync { seconds: 17 });
    assert_eq!(parsed("PROG,42"), ProtocolEvent::Prog { prog: 42 });
    assert_eq!(parsed("NOOP,whatever padding"), ProtocolEvent::Noop);
    assert_eq!(parsed("SERVNAME,push lane 3"), ProtocolEvent::ServerName("push lane 3".to_owned()));
    assert_eq!(parsed("CLIENTIP,10.0.0.9"), ProtocolEvent::ClientIp("10.0.0.9".to_owned()));
}

#[test]
fn crlf_terminator_tolerated() {
    assert_eq!(parsed("PROBE\r"), ProtocolEvent::Probe);
}

#[test]
fn update_line_keeps_commas_in_values() {
    assert_eq!(
        parsed("U,1,2,a,b|c"),
        ProtocolEvent::Update {
            sub_id: 1,
            item: 2,
            fields: vec![
                FieldValue::Changed(Some("a,b".to_owned())),
                FieldValue::Changed(Some("c".to_owned())),
            ],
        }
    );
}

#[test]
fn subscription_lines() {
    assert_eq!(
        parsed("SUBOK,1,1,2"),
        ProtocolEvent::Subok { sub_id: 1, num_items: 1, num_fields: 2 }
    );
    assert_eq!(
        parsed("SUBCMD,2,3,4,1,2"),
        ProtocolEvent::Subcmd { sub_id: 2, num_items: 3, num_fields: 4, key_pos: 1, cmd_pos: 2 }
    );
    assert_eq!(parsed("UNSUB,7"), ProtocolEvent::Unsub { sub_id: 7 });
    assert_eq!(parsed("EOS,1,1"), ProtocolEvent::EndOfSnapshot { sub_id: 1, item: 1 });
    assert_eq!(parsed("CS,1,2"), ProtocolEvent::ClearSnapshot { sub_id: 1, item: 2 });
    assert_eq!(parsed("OV,1,2,5"), ProtocolEvent::Overflow { sub_id: 1, item: 2, lost: 5 });
    assert_eq!(
        parsed("CONF,3,4.5,filtered"),
        ProtocolEvent::Configuration { sub_id: 3, frequency: Some(4.5) }
    );
    assert_eq!(
        parsed("CONF,3,unlimited,unfiltered"),
        ProtocolEvent::Configuration { sub_id: 3, frequency: None }
    );
}

#[test]
fn request_acknowledgements() {
    assert_eq!(parsed("REQOK,15"), ProtocolEvent::Reqok { req_id: Some(15) });
    assert_eq!(parsed("REQOK"), ProtocolEvent::Reqok { req_id: None });
    assert_eq!(
        parsed("REQERR,15,19,bad subscription"),
        ProtocolEvent::Reqerr { req_id: 15, code: 19, message: "bad subscription".to_owned() }
    );
}

#[test]
fn message_outcomes_both_forms() {
    assert_eq!(
        parsed("MSG,s1,2,MSGOK"),
        ProtocolEvent::Msg { sequence: "s1".to_owned(), prog: 2, outcome: MsgOutcome::Processed }
    );
    assert_eq!(
        parsed("MSGERR,s1,2,7,\"bad\""),
        ProtocolEvent::Msg {
            sequence: "s1".to_owned(),
            prog: 2,
            outcome: MsgOutcome::Error { code: 7, message: "bad".to_owned() },
        }
    );
    assert_eq!(
        parsed("MSG,s1,3,MSGDENY,4,denied"),
        ProtocolEvent::Msg {
            sequence: "s1".to_owned(),
            prog: 3,
            outcome: MsgOutcome::Deny { code: 4, message: "denied".to_owned() },
        }
    );
    assert_eq!(
        parsed("MSGDISCARD,s1,4"),
        ProtocolEvent::Msg { sequence: "s1".to_owned(), prog: 4, outcome: MsgOutcome::Discarded }
    );
}

#[test]
fn constrain_values() {
    assert_eq!(
        parsed("CONS,40"),
        ProtocolEvent::Constrain { bandwidth: Some(Bandwidth::Limited(40.0)) }
    );
    assert_eq!(
        parsed("CONS,unlimited"),
        ProtocolEvent::Constrain { bandwidth: Some(Bandwidth::Unlimited) }
    );
    assert_eq!(parsed("CONS,unmanaged"), ProtocolEvent::Constrain { bandwidth: None });
}

#[test]
fn malformed_lines_fail() {
    assert!(parse_line("CONOK,s123").is_err());
    assert!(parse_line("LOOP,abc").is_err());
    assert!(parse_line("FROB,1,2").is_err());
    assert!(parse_line("U,1,x,f").is_err());
    assert!(parse_line("MSG,s1,1,MSGWHAT").is_err());
}

#[test]
fn data_notification_classification() {
    assert!(parsed("U,1,1,x").is_data_notification());
    assert!(parsed("SUBOK,1,1,2").is_data_notification());
    assert!(parsed("EOS,1,1").is_data_notification());
    assert!(parsed("MSG,s1,1,MSGOK").is_data_notification());
    assert!(!parsed("PROBE").is_data_notification());
    assert!(!parsed("SYNC,1").is_data_notification());
    assert!(!parsed("REQOK,1").is_data_notification());
    assert!(!parsed("PROG,9").is_data_notification());
}

#[test]
fn ws_frame_and_batch_body_formatting() {
    let mut codec = Codec::default();
    codec.set_default_session(Some("s1".to_owned()));

    let mut req = control::unsubscribe(4);
    req.set_req_id(8);
    req.set_session("s1");
    assert_eq!(codec.ws_frame(&req), "control\r\nLS_reqId=8&LS_op=delete&LS_subId=4");

    // HTTP bodies always spell the session out.
    let mut other = control::unsubscribe(5);
    other.set_req_id(9);
    assert_eq!(
        codec.batch_body([&req, &other]),
        "LS_reqId=8&LS_op=delete&LS_subId=4&LS_session=s1\r\nLS_reqId=9&LS_op=delete&LS_subId=5"
    );
}

#[test]
fn session_requests_always_carry_ls_session() {
    let mut codec = Codec::default();
    codec.set_default_session(Some("s1".to_owned()));
    let options = crate::config::ConnectionOptions::default();
    let bind = crate::request::session::bind_session("s1", false, None, &options, 0, false, 0);
    assert!(codec.ws_frame(&bind).contains("LS_session=s1"));
}

#[test]
fn request_limit_zero_means_unlimited() {
    let mut codec = Codec::default();
    codec.set_request_limit(0);
    assert_eq!(codec.request_limit(), None);
    codec.set_request_limit(1000);
    assert_eq!(codec.request_limit(), Some(1000));
}
