//! Fuzz target for raw oplog document parsing.
//!
//! Arbitrary bytes that happen to be JSON are fed to the document parser,
//! which must reject garbage with an error instead of panicking.

#![no_main]

use libfuzzer_sys::fuzz_target;
use oplog_replication::OplogOperation;

fuzz_target!(|data: &[u8]| {
    let Ok(doc) = serde_json::from_slice::<serde_json::Value>(data) else {
        return;
    };
    if let Ok(op) = OplogOperation::from_document(&doc) {
        // Accepted documents survive a render/parse cycle
        let again = OplogOperation::from_document(&op.to_document()).expect("rendered document parses");
        assert_eq!(again.op_time, op.op_time);
        assert_eq!(again.hash, op.hash);
        assert_eq!(again.kind, op.kind);
        let _ = op.target_namespace();
    }
});
