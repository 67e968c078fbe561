#![no_main]

use guardport::wire::{Body, ClientHello, Confirm, Envelope, ServerHello};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok((envelope, offset)) = Envelope::decode(data) {
        if let Ok(body) = Body::decode(&data[offset..], envelope.fragmented) {
            let _ = ClientHello::decode(body.payload);
            let _ = ServerHello::decode(body.payload);
            let _ = Confirm::decode(body.payload);
        }
    }
});
