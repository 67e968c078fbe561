#![no_main]

use guardport::codec;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok((value, used)) = codec::decode(data) {
        assert!(used <= data.len());
        let mut out = Vec::new();
        codec::encode(value, &mut out);
        assert!(out.len() <= used);
    }
});
