#![no_main]

use libfuzzer_sys::fuzz_target;
use critrace::trace_session::decode_trace;

fuzz_target!(|data: &[u8]| {
    // Must reject malformed buffers without panicking
    if let Ok(packets) = decode_trace(data) {
        for packet in &packets {
            let _ = packet.encode();
        }
    }
});
