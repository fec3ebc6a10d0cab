#![no_main]

use libfuzzer_sys::fuzz_target;
use signal_hub_client::protocol::ClientMessage;

fuzz_target!(|data: &[u8]| {
    // Anything that decodes must survive a re-encode and decode to the same frame.
    if let Ok(message) = serde_json::from_slice::<ClientMessage>(data) {
        let encoded = serde_json::to_string(&message).unwrap();
        let decoded: ClientMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, message);
    }
});
