#![no_main]

use keel_proto::dns::DnsMessage;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // Responses come straight off the network: parsing must never panic or loop
    if let Ok(msg) = DnsMessage::parse(data) {
        let _ = msg.first_addr();
        let _ = msg.encode();
    }
});
