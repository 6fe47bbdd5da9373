#![no_main]

use keel_proto::mqtt::{topic_matches, Packet};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Decode packets back to back, the way the protocol layer walks a receive buffer
    let mut rest = data;
    while let Ok((packet, used)) = Packet::decode(rest) {
        // whatever decodes must re-encode and decode to the same packet
        if let Ok(frame) = packet.to_vec() {
            let (again, _) = Packet::decode(&frame).expect("re-encoded packet decodes");
            assert_eq!(again, packet);
        }
        if let Packet::Subscribe(sub) = &packet {
            for (filter, _) in &sub.filters {
                let _ = topic_matches(filter, "a/b/c");
            }
        }
        rest = &rest[used..];
    }
});
