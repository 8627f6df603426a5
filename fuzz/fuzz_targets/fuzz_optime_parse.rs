//! Fuzz target for op time parsing.
//!
//! Parsing must never panic, and anything that parses must render back to a
//! string that parses to the same position.

#![no_main]

use libfuzzer_sys::fuzz_target;
use oplog_replication::OpTime;

fuzz_target!(|data: &str| {
    let Ok(op_time) = data.parse::<OpTime>() else {
        return;
    };
    let rendered = op_time.to_string();
    assert_eq!(rendered.parse::<OpTime>().ok(), Some(op_time));

    // Lag is saturating in both directions
    let _ = op_time.lag_secs(&OpTime::ZERO);
    let _ = OpTime::ZERO.lag_secs(&op_time);
});
