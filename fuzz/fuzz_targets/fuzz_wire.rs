#![no_main]

use libfuzzer_sys::fuzz_target;
use tandem::sync::SyncMessage;

fuzz_target!(|data: &[u8]| {
    let Ok(frame) = std::str::from_utf8(data) else {
        return;
    };

    // Decoding arbitrary frames must not panic.
    let Ok(message) = SyncMessage::decode(frame) else {
        return;
    };

    // Anything accepted must survive a re-encode unchanged.
    let encoded = message.encode().expect("decoded message must encode");
    let again = SyncMessage::decode(&encoded).expect("re-encoded frame must decode");
    assert_eq!(message, again);
});
