// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn budget_is_full_while_idle() {
    let bean = RecoveryBean::new();
    let max = Duration::from_millis(15_000);
    assert!(!bean.recovering());
    assert_eq!(bean.time_left(max, Instant::now()), max);
}

#[test]
fn clock_starts_at_first_failure_only() {
    let mut bean = RecoveryBean::new();
    let max = Duration::from_millis(15_000);
    let t0 = Instant::now();
    bean.start(t0);

    // A nested failure 10 s in does not restart the clock.
    let t1 = t0 + Duration::from_secs(10);
    bean.start(t1);
    assert_eq!(bean.time_left(max, t1), Duration::from_millis(5000));

    let t2 = t0 + Duration::from_secs(20);
    assert_eq!(bean.time_left(max, t2), Duration::ZERO);
}

#[test]
fn restore_resets_budget() {
    let mut bean = RecoveryBean::new();
    let max = Duration::from_millis(15_000);
    let t0 = Instant::now();
    bean.start(t0);
    bean.restore();
    assert!(!bean.recovering());
    assert_eq!(bean.time_left(max, t0 + Duration::from_secs(60)), max);
}
