#![no_main]
use libfuzzer_sys::fuzz_target;
use gosh_utp::{Header, Packet};

fuzz_target!(|data: &[u8]| {
    // decode() should never panic on arbitrary datagrams
    if let Ok((header, offset)) = Header::decode(data) {
        assert!(offset <= data.len());
        // Whatever decodes must decode again after re-encoding
        let encoded = header.encode();
        assert!(Header::decode(&encoded).is_ok());
    }
    let _ = Packet::decode(data);
});
