// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

#[test]
fn flat_until_growth_threshold() {
    let mut counter = RetryDelayCounter::new(Duration::from_millis(4000));
    for _ in 0..9 {
        counter.increase();
        assert_eq!(counter.current(), Duration::from_millis(4000));
    }
    counter.increase(); // 10th attempt doubles
    assert_eq!(counter.current(), Duration::from_millis(8000));
}

#[test]
fn caps_at_sixty_seconds() {
    let mut counter = RetryDelayCounter::new(Duration::from_millis(4000));
    for _ in 0..40 {
        counter.increase();
    }
    assert_eq!(counter.current(), Duration::from_secs(60));
}

#[test]
fn reset_restores_base() {
    let mut counter = RetryDelayCounter::new(Duration::from_millis(4000));
    for _ in 0..20 {
        counter.increase();
    }
    counter.reset(Duration::from_millis(4000));
    assert_eq!(counter.current(), Duration::from_millis(4000));
    assert_eq!(counter.attempt(), 0);
}

#[test]
fn large_base_raises_cap() {
    let mut counter = RetryDelayCounter::new(Duration::from_secs(90));
    for _ in 0..20 {
        counter.increase();
    }
    assert_eq!(counter.current(), Duration::from_secs(90));
}
