// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

#![allow(clippy::missing_panics_doc)] // Tests panic on failure

//! Pool ceilings: exhaustion surfaces `OutOfResources`, release makes room
//! again. Lives in its own test binary because the limits are
//! process-global.

use xdds_cache::pool::{self, PoolClass, PoolConfig, PoolLimits};
use xdds_cache::{ChangeKind, Error, Payload, Sample, Timestamp};

#[test]
fn change_pool_ceiling_is_enforced() {
    let config = PoolConfig::default().with(PoolClass::Change, PoolLimits::bounded(2, 1, 3));
    pool::init(&config);

    let s1 = Sample::new(ChangeKind::Alive, 1, Timestamp::new(1, 0), Payload::None)
        .expect("first");
    let s2 = Sample::new(ChangeKind::Alive, 1, Timestamp::new(2, 0), Payload::None)
        .expect("second");
    let s3 = Sample::new(ChangeKind::Alive, 1, Timestamp::new(3, 0), Payload::None)
        .expect("third");
    assert_eq!(pool::in_use(PoolClass::Change), 3);

    let err = Sample::new(ChangeKind::Alive, 1, Timestamp::new(4, 0), Payload::None);
    assert!(matches!(err, Err(Error::OutOfResources)));

    // Dropping a sample frees its slot.
    drop(s2);
    let s4 = Sample::new(ChangeKind::Alive, 1, Timestamp::new(5, 0), Payload::None)
        .expect("slot freed");
    assert_eq!(pool::in_use(PoolClass::Change), 3);

    drop(s1);
    drop(s3);
    drop(s4);
    assert_eq!(pool::in_use(PoolClass::Change), 0);
}
