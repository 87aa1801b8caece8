// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use proptest::prelude::*;

use super::*;

fn changed(value: &str) -> FieldValue {
    FieldValue::Changed(Some(value.to_owned()))
}

#[test]
fn plain_values() {
    assert_eq!(decode_fields("x|y"), Ok(vec![changed("x"), changed("y")]));
}

#[test]
fn null_empty_and_unchanged_markers() {
    assert_eq!(
        decode_fields("#|$|^3|v"),
        Ok(vec![
            FieldValue::Changed(None),
            FieldValue::Changed(Some(String::new())),
            FieldValue::Unchanged,
            FieldValue::Unchanged,
            FieldValue::Unchanged,
            changed("v"),
        ])
    );
}

#[test]
fn percent_escapes_decode_as_utf8() {
    assert_eq!(decode_fields("a%C3%A8"), Ok(vec![changed("aè")]));
    assert_eq!(decode_fields("a%7Cb"), Ok(vec![changed("a|b")]));
    assert_eq!(decode_fields("%23"), Ok(vec![changed("#")]));
}

#[test]
fn malformed_tokens_are_errors() {
    assert!(decode_fields("^x").is_err());
    assert!(decode_fields("^0").is_err());
    assert!(decode_fields("a|%G1").is_err());
    assert!(decode_fields("a%2").is_err());
    assert!(decode_fields("a||b").is_err());
}

#[test]
fn encode_compresses_unchanged_runs() {
    let fields = vec![
        changed("z"),
        FieldValue::Unchanged,
        FieldValue::Unchanged,
        FieldValue::Changed(None),
        FieldValue::Unchanged,
    ];
    assert_eq!(encode_fields(&fields), "z|^2|#|^1");
}

#[test]
fn apply_update_carries_previous_values() {
    let decoded = match decode_fields("z|^1") {
        Ok(d) => d,
        Err(e) => unreachable!("decode failed: {e}"),
    };
    let prev = vec![Some("x".to_owned()), Some("y".to_owned())];
    let (values, changed_mask) = apply_update(Some(&prev), &decoded);
    assert_eq!(values, vec![Some("z".to_owned()), Some("y".to_owned())]);
    assert_eq!(changed_mask, vec![true, false]);
}

#[test]
fn first_update_without_previous_values() {
    let decoded = match decode_fields("x|y") {
        Ok(d) => d,
        Err(e) => unreachable!("decode failed: {e}"),
    };
    let (values, changed_mask) = apply_update(None, &decoded);
    assert_eq!(values, vec![Some("x".to_owned()), Some("y".to_owned())]);
    assert_eq!(changed_mask, vec![true, true]);
}

fn arb_field() -> impl Strategy<Value = FieldValue> {
    prop_oneof![
        Just(FieldValue::Unchanged),
        Just(FieldValue::Changed(None)),
        Just(FieldValue::Changed(Some(String::new()))),
        "[ -~]{1,12}".prop_map(|s| FieldValue::Changed(Some(s))),
        "\\PC{1,8}".prop_map(|s| FieldValue::Changed(Some(s))),
    ]
}

proptest! {
    #[test]
    fn encode_decode_round_trip(fields in prop::collection::vec(arb_field(), 1..24)) {
        let encoded = encode_fields(&fields);
        prop_assert_eq!(decode_fields(&encoded), Ok(fields));
    }
}
