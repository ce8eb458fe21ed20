//! Fuzz target: `DeviceCommand::decode`
//!
//! cargo fuzz run fuzz_command_decode

#![no_main]

use libfuzzer_sys::fuzz_target;
use wearevent::DeviceCommand;

fuzz_target!(|data: &[u8]| {
    if let Ok(command) = DeviceCommand::decode(data) {
        let bytes = command.encode().expect("decoded command re-encodes");
        let again = DeviceCommand::decode(&bytes).expect("re-encoded command decodes");
        assert_eq!(again.encode().ok(), Some(bytes));
    }
});
