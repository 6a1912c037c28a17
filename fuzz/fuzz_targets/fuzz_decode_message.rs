#![no_main]

use libfuzzer_sys::fuzz_target;
use pgpump::protocol::{decode_message, Decoded};

fuzz_target!(|data: &[u8]| {
    // several messages arriving in one read
    let mut pos = 0;
    while pos < data.len() {
        match decode_message(&data[pos..]) {
            Ok(Decoded::Message(_, len)) => {
                assert!(len >= 5 && pos + len <= data.len());
                pos += len;
            }
            Ok(Decoded::Needs(needs)) => {
                assert!(needs > 0);
                break;
            }
            Err(_) => break,
        }
    }
});
